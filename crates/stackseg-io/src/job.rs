//! Job status reporting.
//!
//! A workflow run reports its progress as a sequence of [`JobUpdate`]s.
//! [`LogReporter`] emits them through `tracing`; callers that publish
//! status elsewhere implement [`JobReporter`] themselves.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Work is in progress.
    #[default]
    Running,
    /// Finished successfully.
    Terminated,
    /// Stopped on an error.
    Failed,
}

/// Progress milestones, in percent.
pub mod progress {
    /// Job started.
    pub const INIT: u8 = 0;
    /// Data staged, processing begins.
    pub const LAUNCH: u8 = 25;
    /// Per-image processing.
    pub const PROCESSING: u8 = 30;
    /// Results are being published.
    pub const UPLOAD_START: u8 = 60;
    /// Results published, metrics next.
    pub const UPLOAD_END: u8 = 90;
    /// Job finished.
    pub const DONE: u8 = 100;

    /// Interpolate between two milestones for `done` of `total` steps.
    #[must_use]
    pub fn between(start: u8, end: u8, done: usize, total: usize) -> u8 {
        if total == 0 || end <= start {
            return end.max(start);
        }
        let span = usize::from(end - start);
        let step = span * done.min(total) / total;
        start + u8::try_from(step).unwrap_or(end - start)
    }
}

/// One status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Lifecycle state.
    pub status: JobStatus,
    /// Percent complete, `0..=100`.
    pub progress: u8,
    /// Human-readable status line.
    pub comment: String,
}

impl JobUpdate {
    /// A [`JobStatus::Running`] update.
    #[must_use]
    pub fn running(progress: u8, comment: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Running,
            progress,
            comment: comment.into(),
        }
    }
}

/// Receiver of job status updates.
pub trait JobReporter {
    /// Record one update.
    fn update(&mut self, update: JobUpdate);
}

/// Reports through `tracing` and remembers every update.
#[derive(Debug, Default)]
pub struct LogReporter {
    history: Vec<JobUpdate>,
}

impl LogReporter {
    /// Every update so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[JobUpdate] {
        &self.history
    }

    /// The most recent update.
    #[must_use]
    pub fn last(&self) -> Option<&JobUpdate> {
        self.history.last()
    }
}

impl JobReporter for LogReporter {
    fn update(&mut self, update: JobUpdate) {
        match update.status {
            JobStatus::Failed => {
                error!(progress = update.progress, status = ?update.status, "{}", update.comment);
            }
            JobStatus::Running | JobStatus::Terminated => {
                info!(progress = update.progress, status = ?update.status, "{}", update.comment);
            }
        }
        self.history.push(update);
    }
}
