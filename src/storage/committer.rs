//! Batched commits of federation data
//!
//! Writers mark changes pending; a background task commits them once the
//! configured interval has elapsed. With a zero interval every write
//! triggers its own commit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::metrics::STORAGE_COMMITS_TOTAL;

use super::DATA_DIR;
use super::git::GitBacking;

/// Longest sleep between checks of the pending flag
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Committer {
    backing: Option<GitBacking>,
    interval: Duration,
    pending: AtomicBool,
    last_commit: std::sync::Mutex<Instant>,
    /// Serializes git invocations
    commit_lock: tokio::sync::Mutex<()>,
}

impl Committer {
    pub fn new(backing: Option<GitBacking>, interval: Duration) -> Self {
        Self {
            backing,
            interval,
            pending: AtomicBool::new(false),
            last_commit: std::sync::Mutex::new(Instant::now()),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backing(&self) -> Option<&GitBacking> {
        self.backing.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn last_commit(&self) -> Instant {
        *self
            .last_commit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn touch_last_commit(&self) {
        *self
            .last_commit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    /// Record that federation data changed
    pub fn mark_pending(self: &Arc<Self>) {
        self.pending.store(true, Ordering::SeqCst);

        if self.interval.is_zero() {
            let committer = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = committer.commit_now().await {
                    tracing::error!(%error, "Immediate federation data commit failed");
                }
            });
        }
    }

    fn is_due(&self) -> bool {
        self.has_pending() && self.last_commit().elapsed() >= self.interval
    }

    /// Commit pending changes now
    ///
    /// Returns true when a commit was created. In local mode there is
    /// nothing to commit to, and the pending flag is simply cleared.
    pub async fn commit_now(&self) -> Result<bool, AppError> {
        let _guard = self.commit_lock.lock().await;

        if !self.pending.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let Some(backing) = &self.backing else {
            self.touch_last_commit();
            return Ok(false);
        };

        let message = format!(
            "Update federation data - {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        match backing.commit(DATA_DIR, &message).await {
            Ok(committed) => {
                self.touch_last_commit();
                if committed {
                    STORAGE_COMMITS_TOTAL.with_label_values(&["success"]).inc();
                    tracing::info!("Committed federation data");
                }
                Ok(committed)
            }
            Err(error) => {
                self.pending.store(true, Ordering::SeqCst);
                STORAGE_COMMITS_TOTAL.with_label_values(&["failure"]).inc();
                Err(error)
            }
        }
    }

    /// Background loop committing pending changes on the configured interval
    pub async fn run(self: Arc<Self>) {
        let poll = self
            .interval
            .clamp(Duration::from_secs(1), MAX_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(poll);

        // Consume the immediate first tick.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !self.is_due() {
                continue;
            }

            if let Err(error) = self.commit_now().await {
                tracing::error!(%error, "Scheduled federation data commit failed");
            }
        }
    }
}
