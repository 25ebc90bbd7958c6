//! Inbox push-notification watch renewal.
//!
//! A mailbox watch lapses after about a week, so it is renewed on a cron
//! schedule and on demand through `/watch/renew`.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::channels::{Mailbox, WatchRegistration};
use crate::error::PipelineError;
use crate::store::Database;

pub struct WatchRenewer {
    mailbox: Arc<dyn Mailbox>,
    db: Arc<dyn Database>,
    user: String,
    topic: String,
}

impl WatchRenewer {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        db: Arc<dyn Database>,
        user: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            mailbox,
            db,
            user: user.into(),
            topic: topic.into(),
        }
    }

    /// Re-register the watch and record its expiration and history id.
    pub async fn renew(&self) -> Result<WatchRegistration, PipelineError> {
        let registration = self.mailbox.watch(&self.topic).await?;
        self.db
            .save_watch_state(&self.user, registration.expiration, &registration.history_id)
            .await?;
        info!(
            user = %self.user,
            history_id = %registration.history_id,
            expiration = registration.expiration,
            "Mailbox watch renewed"
        );
        Ok(registration)
    }
}

/// Next fire time for a cron expression.
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(schedule.upcoming(Utc).next())
}

/// Renew the watch every time `schedule` fires. Returns `Err` for an
/// invalid expression instead of spawning.
pub fn spawn_watch_renewal(
    renewer: Arc<WatchRenewer>,
    schedule: &str,
) -> Result<tokio::task::JoinHandle<()>, String> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                info!("Watch renewal schedule has no further fire times");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = renewer.renew().await {
                error!(error = %e, "Scheduled watch renewal failed");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingest::testing::FakeMailbox;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn renew_records_state() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let mailbox = Arc::new(FakeMailbox::default());
        let renewer = WatchRenewer::new(
            mailbox.clone(),
            Arc::clone(&db),
            "certs@agency.example",
            "projects/p/topics/inbox",
        );

        let registration = renewer.renew().await.unwrap();
        assert_eq!(registration.history_id, "9001");
        assert_eq!(
            *mailbox.watch_calls.lock().unwrap(),
            vec!["projects/p/topics/inbox"]
        );

        let state = db.get_watch_state("certs@agency.example").await.unwrap().unwrap();
        assert_eq!(state.history_id, "9001");
        assert_eq!(state.expiration, 1_900_000_000_000);
    }

    #[test]
    fn cron_parsing() {
        assert!(next_cron_fire("0 0 6 * * *").unwrap().is_some());
        assert!(next_cron_fire("not a cron").is_err());
    }

    #[tokio::test]
    async fn invalid_schedule_is_not_spawned() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let renewer = Arc::new(WatchRenewer::new(
            Arc::new(FakeMailbox::default()),
            db,
            "u",
            "t",
        ));
        assert!(spawn_watch_renewal(renewer, "every tuesday").is_err());
    }
}
