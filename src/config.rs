//! Configuration types.
//!
//! Everything is read from environment variables at startup. Tests build
//! configs through [`ServiceConfig::from_lookup`] with an in-memory map.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default Gmail REST endpoint.
pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com";

/// Default Telegram Bot API endpoint.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Whether approved certificates are sent straight away or left as drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Send,
    Draft,
}

/// Gmail mailbox settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// The single watched mailbox, also used as the From address.
    pub user: String,
    pub access_token: SecretString,
    pub api_base: String,
    /// Pub/Sub topic for `users.watch`; renewal is disabled without it.
    pub watch_topic: Option<String>,
    /// Cron schedule for in-process watch renewal.
    pub watch_cron: Option<String>,
}

/// Telegram approval bot settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
    pub allowed_users: Vec<String>,
    pub api_base: String,
}

/// Optional SMTP relay used instead of Gmail for outbound mail.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// Document generator settings.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub source_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub prefix: String,
    pub signature_key: String,
    pub pdftoppm: PathBuf,
    pub flatten_scale: f32,
}

/// Pipeline timing and scan settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub thread_scan_window: usize,
    pub classifier_timeout: Duration,
    pub notify_timeout: Duration,
    pub lock_lease: Option<Duration>,
    pub delivery_mode: DeliveryMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thread_scan_window: 10,
            classifier_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(10),
            lock_lease: None,
            delivery_mode: DeliveryMode::Send,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub gmail: GmailConfig,
    pub telegram: TelegramConfig,
    pub smtp: Option<SmtpConfig>,
    pub llm: LlmConfig,
    pub documents: DocumentConfig,
    pub pipeline: PipelineConfig,
}

impl ServiceConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let gmail = GmailConfig {
            user: env.required("COI_MAILBOX_USER")?,
            access_token: SecretString::from(env.required("GMAIL_ACCESS_TOKEN")?),
            api_base: env.or("GMAIL_API_BASE", DEFAULT_GMAIL_API_BASE),
            watch_topic: env.get("GMAIL_WATCH_TOPIC"),
            watch_cron: env.get("GMAIL_WATCH_CRON"),
        };

        let telegram = TelegramConfig {
            bot_token: SecretString::from(env.required("TELEGRAM_BOT_TOKEN")?),
            chat_id: env.required("TELEGRAM_CHAT_ID")?,
            allowed_users: env
                .or("TELEGRAM_ALLOWED_USERS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            api_base: env.or("TELEGRAM_API_BASE", DEFAULT_TELEGRAM_API_BASE),
        };

        let smtp = match env.get("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: env.parse("SMTP_PORT", 587)?,
                username: env.or("SMTP_USERNAME", ""),
                password: SecretString::from(env.or("SMTP_PASSWORD", "")),
            }),
            None => None,
        };

        let backend = match env.or("COI_LLM_BACKEND", "openai").to_lowercase().as_str() {
            "openai" => LlmBackend::OpenAi,
            "anthropic" => LlmBackend::Anthropic,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "COI_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected openai or anthropic)"),
                });
            }
        };
        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(env.required("COI_LLM_API_KEY")?),
            model: env.or("COI_LLM_MODEL", "gpt-4o-mini"),
        };

        let documents = DocumentConfig {
            source_dir: PathBuf::from(env.or("COI_SOURCE_DIR", "./certificates-source")),
            storage_dir: PathBuf::from(env.or("COI_STORAGE_DIR", "./data/objects")),
            prefix: env.or("COI_CERT_PREFIX", "certificates"),
            signature_key: env.or("COI_SIGNATURE_KEY", "certificates/signature.png"),
            pdftoppm: PathBuf::from(env.or("COI_PDFTOPPM", "pdftoppm")),
            flatten_scale: env.parse("COI_FLATTEN_SCALE", 2.0)?,
        };
        if documents.flatten_scale <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "COI_FLATTEN_SCALE".into(),
                message: "must be positive".into(),
            });
        }

        let delivery_mode = match env.or("COI_DELIVERY_MODE", "send").to_lowercase().as_str() {
            "send" => DeliveryMode::Send,
            "draft" => DeliveryMode::Draft,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "COI_DELIVERY_MODE".into(),
                    message: format!("unknown mode '{other}' (expected send or draft)"),
                });
            }
        };

        let pipeline = PipelineConfig {
            thread_scan_window: env.parse("COI_THREAD_SCAN_WINDOW", 10)?,
            classifier_timeout: Duration::from_secs(env.parse("COI_CLASSIFIER_TIMEOUT_SECS", 30)?),
            notify_timeout: Duration::from_secs(env.parse("COI_NOTIFY_TIMEOUT_SECS", 10)?),
            lock_lease: match env.get("COI_LOCK_LEASE_SECS") {
                Some(_) => Some(Duration::from_secs(env.parse("COI_LOCK_LEASE_SECS", 0)?)),
                None => None,
            },
            delivery_mode,
        };

        Ok(Self {
            bind_addr: env.parse("COI_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            db_path: PathBuf::from(env.or("COI_DB_PATH", "./data/coi-assist.db")),
            log_dir: env.get("COI_LOG_DIR").map(PathBuf::from),
            gmail,
            telegram,
            smtp,
            llm,
            documents,
            pipeline,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("COI_MAILBOX_USER", "agent@example.com"),
            ("GMAIL_ACCESS_TOKEN", "ya29.token"),
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("TELEGRAM_CHAT_ID", "828259521"),
            ("COI_LLM_API_KEY", "sk-test"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_fill_optional_values() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.gmail.api_base, DEFAULT_GMAIL_API_BASE);
        assert_eq!(config.gmail.access_token.expose_secret(), "ya29.token");
        assert_eq!(config.telegram.allowed_users, vec!["*"]);
        assert_eq!(config.llm.backend, LlmBackend::OpenAi);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.documents.prefix, "certificates");
        assert_eq!(config.documents.signature_key, "certificates/signature.png");
        assert!((config.documents.flatten_scale - 2.0).abs() < f32::EPSILON);
        assert_eq!(config.pipeline.thread_scan_window, 10);
        assert_eq!(config.pipeline.notify_timeout, Duration::from_secs(10));
        assert!(config.pipeline.lock_lease.is_none());
        assert_eq!(config.pipeline.delivery_mode, DeliveryMode::Send);
        assert!(config.smtp.is_none());
        assert!(config.gmail.watch_topic.is_none());
    }

    #[test]
    fn missing_required_var_is_reported() {
        let mut env = base_env();
        env.remove("TELEGRAM_CHAT_ID");
        match load(&env) {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "TELEGRAM_CHAT_ID"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn blank_required_var_counts_as_missing() {
        let mut env = base_env();
        env.insert("COI_MAILBOX_USER", "   ");
        assert!(matches!(load(&env), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut env = base_env();
        env.insert("COI_THREAD_SCAN_WINDOW", "ten");
        match load(&env) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "COI_THREAD_SCAN_WINDOW"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn overrides_are_applied() {
        let mut env = base_env();
        env.insert("COI_BIND_ADDR", "127.0.0.1:9000");
        env.insert("COI_LLM_BACKEND", "Anthropic");
        env.insert("COI_DELIVERY_MODE", "draft");
        env.insert("COI_LOCK_LEASE_SECS", "600");
        env.insert("TELEGRAM_ALLOWED_USERS", "alice, 12345 ,");
        env.insert("SMTP_HOST", "smtp.example.com");
        env.insert("GMAIL_WATCH_TOPIC", "projects/p/topics/gmail");
        let config = load(&env).unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(config.pipeline.delivery_mode, DeliveryMode::Draft);
        assert_eq!(config.pipeline.lock_lease, Some(Duration::from_secs(600)));
        assert_eq!(config.telegram.allowed_users, vec!["alice", "12345"]);
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 587);
        assert_eq!(config.gmail.watch_topic.as_deref(), Some("projects/p/topics/gmail"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut env = base_env();
        env.insert("COI_LLM_BACKEND", "gemini");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn non_positive_scale_is_rejected() {
        let mut env = base_env();
        env.insert("COI_FLATTEN_SCALE", "0");
        assert!(matches!(load(&env), Err(ConfigError::InvalidValue { .. })));
    }
}
