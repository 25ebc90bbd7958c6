//! COI orchestration pipeline.
//!
//! ```text
//! push notification → IngestHandler (watermark, thread lock)
//!   → CoiService::analyze → CoiClassifier (classify, extract)
//!   → ApprovalGate::open (pending record, prompt)
//!   ... human presses a button ...
//!   → ApprovalGate::resolve (conditional pending → sent | skipped)
//!   → CoiDispatcher (CertificateGenerator, CoiMailer)
//! ```
//!
//! Every stage shares one `Database`. Nothing is held in memory between
//! requests.

pub mod approval;
pub mod classifier;
pub mod delivery;
pub mod dispatcher;
pub mod flow;
pub mod ingest;
pub mod lock;
pub mod recipients;
pub mod service;
pub mod types;
pub mod watch;

pub use approval::{ApprovalGate, CallbackOutcome, CoiFulfillment, Decision, OpenOutcome, ResolveOutcome};
pub use classifier::CoiClassifier;
pub use delivery::{CoiMailer, DeliveryJob, DeliveryReceipt};
pub use dispatcher::CoiDispatcher;
pub use flow::FlowLog;
pub use ingest::{IngestHandler, IngestOutcome, MailboxNotification, decode_envelope};
pub use lock::ThreadLocks;
pub use service::CoiService;
pub use types::{AnalyzeRequest, ApprovalRequest, CoiAction, CoiAnalysis, ExtractedFields, GenerateRequest};
pub use watch::{WatchRenewer, spawn_watch_renewal};

use std::sync::Arc;

use crate::channels::{ApprovalNotifier, MailSender, Mailbox};
use crate::config::PipelineConfig;
use crate::documents::CertificateGenerator;
use crate::llm::LlmProvider;
use crate::store::Database;

/// Externally constructed collaborators, built once at startup.
#[derive(Clone)]
pub struct PipelineDeps {
    pub db: Arc<dyn Database>,
    pub mailbox: Arc<dyn Mailbox>,
    pub sender: Arc<dyn MailSender>,
    pub notifier: Arc<dyn ApprovalNotifier>,
    pub llm: Arc<dyn LlmProvider>,
    pub generator: Arc<CertificateGenerator>,
}

/// Mailbox identity and approval chat the pipeline serves.
#[derive(Debug, Clone)]
pub struct PipelineIdentity {
    /// Watched mailbox, also the From address of replies.
    pub mailbox_user: String,
    pub approval_chat_id: String,
    /// Push topic for watch renewal; `None` disables renewal.
    pub watch_topic: Option<String>,
}

/// The wired pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pub ingest: Arc<IngestHandler>,
    pub service: Arc<CoiService>,
    pub gate: Arc<ApprovalGate>,
    pub watch: Option<Arc<WatchRenewer>>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, identity: PipelineIdentity, config: &PipelineConfig) -> Self {
        let flow = FlowLog::new(Arc::clone(&deps.db));

        let mailer = CoiMailer::new(
            Arc::clone(&deps.sender),
            Arc::clone(deps.generator.store()),
            identity.mailbox_user.clone(),
            config.delivery_mode,
        );
        let dispatcher = Arc::new(CoiDispatcher::new(
            Arc::clone(&deps.generator),
            mailer,
            flow.clone(),
        ));

        let gate = Arc::new(ApprovalGate::new(
            Arc::clone(&deps.db),
            Arc::clone(&deps.notifier),
            dispatcher.clone(),
            identity.approval_chat_id.clone(),
            config.notify_timeout,
        ));

        let service = Arc::new(CoiService::new(
            CoiClassifier::new(Arc::clone(&deps.llm), Arc::clone(&deps.db)),
            Arc::clone(&gate),
            dispatcher,
            flow,
        ));

        let ingest = Arc::new(IngestHandler::new(
            Arc::clone(&deps.mailbox),
            Arc::clone(&deps.db),
            Arc::clone(&service),
            identity.mailbox_user.clone(),
            config.thread_scan_window,
            config.classifier_timeout,
            config.lock_lease,
        ));

        let watch = identity.watch_topic.map(|topic| {
            Arc::new(WatchRenewer::new(
                Arc::clone(&deps.mailbox),
                Arc::clone(&deps.db),
                identity.mailbox_user.clone(),
                topic,
            ))
        });

        Self {
            ingest,
            service,
            gate,
            watch,
        }
    }
}
