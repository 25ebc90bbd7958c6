//! Per-thread processing locks.
//!
//! A lock is a row keyed `thread_<id>`. Acquisition is a single atomic
//! insert, release an unconditional delete. Without a lease a holder that
//! dies leaves the thread locked until someone deletes the row.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;

use crate::error::PipelineError;
use crate::store::{Database, thread_key};

pub struct ThreadLocks {
    db: Arc<dyn Database>,
    lease: Option<Duration>,
}

impl ThreadLocks {
    pub fn new(db: Arc<dyn Database>, lease: Option<Duration>) -> Self {
        Self { db, lease }
    }

    /// Returns `true` only if this call created the lock.
    pub async fn acquire(&self, thread_id: &str) -> Result<bool, PipelineError> {
        let now = Utc::now();
        let stale_before = self
            .lease
            .and_then(|lease| chrono::Duration::from_std(lease).ok())
            .map(|lease| now - lease);
        Ok(self
            .db
            .try_create_lock(&thread_key(thread_id), now, stale_before)
            .await?)
    }

    /// Idempotent.
    pub async fn release(&self, thread_id: &str) -> Result<(), PipelineError> {
        Ok(self.db.delete_lock(&thread_key(thread_id)).await?)
    }

    /// Run `work` while holding the thread's lock.
    ///
    /// `Ok(None)` means another handler holds the lock and `work` never ran.
    /// The lock is released on every exit, including a panic inside `work`,
    /// which is reported as [`PipelineError::Panicked`].
    pub async fn with_lock<F, T>(&self, thread_id: &str, work: F) -> Result<Option<T>, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        if !self.acquire(thread_id).await? {
            return Ok(None);
        }

        let result = AssertUnwindSafe(work).catch_unwind().await;

        if let Err(e) = self.release(thread_id).await {
            tracing::error!(thread_id, error = %e, "Failed to release thread lock");
        }

        match result {
            Ok(outcome) => outcome.map(Some),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(PipelineError::Panicked(message))
            }
        }
    }
}
