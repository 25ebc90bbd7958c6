use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use coi_assist::channels::{GmailClient, MailSender, SmtpSender, TelegramNotifier};
use coi_assist::config::ServiceConfig;
use coi_assist::documents::{
    CertificateGenerator, DirectorySource, LocalObjectStore, PdftoppmRasterizer,
};
use coi_assist::llm::create_provider;
use coi_assist::pipeline::{Pipeline, PipelineDeps, PipelineIdentity, spawn_watch_renewal};
use coi_assist::routes::{AppState, app_routes};
use coi_assist::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    // Held for the process lifetime so buffered file logs are flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("📄 COI Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}", config.gmail.user);
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Listening: http://{}", config.bind_addr);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;

    let gmail = Arc::new(GmailClient::new(
        config.gmail.api_base.clone(),
        config.gmail.access_token.clone(),
    ));
    let sender: Arc<dyn MailSender> = match &config.smtp {
        Some(smtp) => {
            eprintln!("   Delivery: SMTP via {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpSender::new(smtp.clone()))
        }
        None => {
            eprintln!("   Delivery: Gmail API");
            gmail.clone()
        }
    };

    let notifier = Arc::new(TelegramNotifier::new(
        config.telegram.bot_token.clone(),
        config.telegram.api_base.clone(),
        config.telegram.allowed_users.clone(),
    ));

    let generator = Arc::new(CertificateGenerator::new(
        Arc::new(DirectorySource::new(config.documents.source_dir.clone())),
        Arc::new(LocalObjectStore::new(config.documents.storage_dir.clone())),
        Arc::new(PdftoppmRasterizer::new(config.documents.pdftoppm.clone())),
        &config.documents,
    ));
    eprintln!("   Certificates: {}", config.documents.source_dir.display());

    let pipeline = Pipeline::new(
        PipelineDeps {
            db,
            mailbox: gmail,
            sender,
            notifier,
            llm,
            generator,
        },
        PipelineIdentity {
            mailbox_user: config.gmail.user.clone(),
            approval_chat_id: config.telegram.chat_id.clone(),
            watch_topic: config.gmail.watch_topic.clone(),
        },
        &config.pipeline,
    );

    // ── Watch renewal ────────────────────────────────────────────────────
    match (&pipeline.watch, &config.gmail.watch_cron) {
        (Some(renewer), Some(schedule)) => {
            spawn_watch_renewal(Arc::clone(renewer), schedule)
                .map_err(|e| anyhow::anyhow!("GMAIL_WATCH_CRON: {e}"))?;
            eprintln!("   Watch renewal: cron '{schedule}'");
        }
        (Some(_), None) => eprintln!("   Watch renewal: on demand (POST /watch/renew)"),
        (None, _) => eprintln!("   Watch renewal: disabled"),
    }

    // ── Server ───────────────────────────────────────────────────────────
    let app = app_routes(AppState { pipeline });
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "COI Assist server started");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "coi-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry().with(stderr).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr).init();
            None
        }
    }
}
