//! Downstream work queue contract.
//!
//! The engine only enqueues; executing module code is somebody else's job.
//! Implementations must make repeat-key registration idempotent (a second
//! registration under the same key replaces the first) and honour per-job
//! delay.
//!
//! ## Implementations
//!
//! - [`MemoryWorkQueue`]: in-process, used by tests and embedded setups
//! - [`RedisWorkQueue`]: Redis streams + sorted sets, shared by workers

pub mod memory;
pub mod redis;

use crate::error::QueueError;
use crate::model::ExecutionJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use memory::MemoryWorkQueue;
pub use redis::RedisWorkQueue;

/// Build the full key under which a repeating schedule is stored.
///
/// The same repeat key with a different pattern yields a different full key,
/// which is why removal goes through [`WorkQueue::list_repeating`] first.
pub fn full_repeat_key(key: &str, pattern: &str) -> String {
    format!("{key}::{pattern}")
}

/// Register the job as a repeating schedule instead of running it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub key: String,
    pub pattern: String,
}

/// Options for [`WorkQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,

    pub repeat: Option<RepeatSpec>,

    /// Explicit deduplication id. Jobs sharing an id while one is still
    /// pending are coalesced.
    pub dedup_id: Option<String>,

    /// Never coalesce this job with another one, even if the job would
    /// otherwise get a default dedup id (cron jobs default to their repeat
    /// key). Used for manual triggers.
    pub bypass_dedup: bool,
}

impl EnqueueOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Delay in seconds; zero means immediate.
    pub fn delayed(seconds: u64) -> Self {
        Self {
            delay: (seconds > 0).then(|| Duration::from_secs(seconds)),
            ..Self::default()
        }
    }

    pub fn repeating(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            repeat: Some(RepeatSpec {
                key: key.into(),
                pattern: pattern.into(),
            }),
            ..Self::default()
        }
    }

    pub fn bypass_dedup(mut self) -> Self {
        self.bypass_dedup = true;
        self
    }

    /// Dedup id this job is filed under, if any.
    pub fn effective_dedup_id(&self, job: &ExecutionJob) -> Option<String> {
        if self.bypass_dedup {
            return None;
        }
        self.dedup_id.clone().or_else(|| job.default_dedup_id())
    }
}

/// A repeating schedule as reported by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatingSchedule {
    /// Repeat key the schedule was registered under
    pub key: String,
    pub full_key: String,
    pub pattern: String,
    pub job: ExecutionJob,
}

/// What happened to an enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued { job_id: String },
    /// Coalesced with a pending job carrying the same dedup id
    Deduplicated { job_id: String },
    Scheduled { full_key: String },
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(
        &self,
        job: ExecutionJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    async fn list_repeating(&self) -> Result<Vec<RepeatingSchedule>, QueueError>;

    /// Remove a repeating schedule by its full key. Returns whether anything
    /// was removed.
    async fn remove_repeating_by_full_key(&self, full_key: &str) -> Result<bool, QueueError>;
}
