//! Concurrent job registry: the single source of truth for job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

/// Error kind recorded when a job is terminated by request rather than by
/// an encoder failure.
pub const CANCELLED_KIND: &str = "CancelledError";

// ---------------------------------------------------------------------------
// JobState / Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    /// Completion percentage in `[0, 100]`.
    pub progress: u32,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub workdir: PathBuf,
}

struct JobRecord {
    job: Job,
    /// Dropped with the record; the supervisor observes both the signal and
    /// the drop.
    cancel_tx: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// JobRegistry
// ---------------------------------------------------------------------------

/// Arena of job records behind a reader/writer lock. All mutation goes
/// through this registry; pipeline stages never hold a job reference across
/// a blocking operation.
#[derive(Clone, Default)]
pub struct JobRegistry(Arc<RwLock<HashMap<Uuid, JobRecord>>>);

impl JobRegistry {
    /// Create a `PENDING` job whose workspace lives under `root`.
    pub async fn create(&self, root: &Path) -> Job {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            state: JobState::Pending,
            progress: 0,
            output_path: None,
            error: None,
            created_at: Utc::now(),
            workdir: root.join(id.to_string()),
        };
        let (cancel_tx, _) = watch::channel(false);
        self.0.write().await.insert(
            id,
            JobRecord {
                job: job.clone(),
                cancel_tx,
            },
        );
        job
    }

    /// A consistent snapshot of the job, if known.
    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.0.read().await.get(&id).map(|r| r.job.clone())
    }

    pub async fn update<F: FnOnce(&mut Job)>(&self, id: Uuid, f: F) {
        if let Some(record) = self.0.write().await.get_mut(&id) {
            f(&mut record.job);
        }
    }

    /// Compare-and-set state transition. Succeeds only when the current
    /// state equals `from`; terminal states are never left.
    pub async fn transition(&self, id: Uuid, from: JobState, to: JobState) -> bool {
        match self.0.write().await.get_mut(&id) {
            Some(record) if record.job.state == from && !from.is_terminal() => {
                record.job.state = to;
                true
            }
            _ => false,
        }
    }

    /// Record a fatal error (kind + message) and move to `FAILED`.
    /// No-op once the job is terminal.
    pub async fn fail(&self, id: Uuid, kind: &str, message: &str) {
        if let Some(record) = self.0.write().await.get_mut(&id) {
            if record.job.state.is_terminal() {
                return;
            }
            record.job.state = JobState::Failed;
            record.job.error = Some(format!("{kind}: {message}"));
        }
    }

    pub async fn fail_with(&self, id: Uuid, err: &crate::error::RenderError) {
        self.fail(id, err.kind(), &err.to_string()).await;
    }

    /// Store a progress value, clamped to `[0, 100]` and never regressing.
    pub async fn set_progress(&self, id: Uuid, pct: u32) {
        if let Some(record) = self.0.write().await.get_mut(&id) {
            if record.job.state.is_terminal() {
                return;
            }
            let pct = pct.min(100);
            if pct > record.job.progress {
                record.job.progress = pct;
            }
        }
    }

    /// Signal cancellation to the job's supervisor. Idempotent; a terminal
    /// job is a no-op. Returns whether a signal was delivered.
    ///
    /// The value is latched in the channel even when no supervisor has
    /// subscribed yet, so a cancel that races the supervisor startup is
    /// still observed.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.0.read().await.get(&id) {
            Some(record) if !record.job.state.is_terminal() => {
                record.cancel_tx.send_replace(true);
                true
            }
            _ => false,
        }
    }

    /// The cancellation signal the supervisor selects on.
    pub async fn cancel_rx(&self, id: Uuid) -> Option<watch::Receiver<bool>> {
        self.0.read().await.get(&id).map(|r| r.cancel_tx.subscribe())
    }

    /// Drop the record entirely. Any live supervisor sees the channel close.
    pub async fn remove(&self, id: Uuid) -> Option<Job> {
        self.0.write().await.remove(&id).map(|r| r.job)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
