//! In-process work queue.
//!
//! Keeps jobs and repeating schedules in memory. Jobs stay "pending" until
//! drained with [`MemoryWorkQueue::drain`], which also releases their dedup
//! ids.

use super::{
    full_repeat_key, EnqueueOptions, EnqueueOutcome, RepeatingSchedule, WorkQueue,
};
use crate::error::QueueError;
use crate::model::ExecutionJob;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// A job waiting in the memory queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub id: String,
    pub job: ExecutionJob,
    pub delay: Option<Duration>,
    pub dedup_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<PendingJob>,
    /// dedup id -> job id
    dedup: HashMap<String, String>,
    /// repeat key -> schedule
    repeating: BTreeMap<String, RepeatingSchedule>,
}

#[derive(Default)]
pub struct MemoryWorkQueue {
    inner: Mutex<Inner>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Connection("memory queue lock poisoned".to_string()))
    }

    /// Snapshot of pending jobs in enqueue order.
    pub fn pending(&self) -> Vec<PendingJob> {
        self.lock().map(|inner| inner.pending.clone()).unwrap_or_default()
    }

    /// Remove and return all pending jobs, releasing their dedup ids.
    pub fn drain(&self) -> Vec<PendingJob> {
        match self.lock() {
            Ok(mut inner) => {
                inner.dedup.clear();
                std::mem::take(&mut inner.pending)
            }
            Err(_) => Vec::new(),
        }
    }

    /// Repeating schedules currently registered under `key`.
    pub fn schedules_for_key(&self, key: &str) -> Vec<RepeatingSchedule> {
        self.lock()
            .map(|inner| inner.repeating.get(key).cloned().into_iter().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        job: ExecutionJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.lock()?;

        if let Some(repeat) = &opts.repeat {
            let full_key = full_repeat_key(&repeat.key, &repeat.pattern);
            debug!(key = %repeat.key, full_key = %full_key, "Registering repeating schedule");
            inner.repeating.insert(
                repeat.key.clone(),
                RepeatingSchedule {
                    key: repeat.key.clone(),
                    full_key: full_key.clone(),
                    pattern: repeat.pattern.clone(),
                    job,
                },
            );
            return Ok(EnqueueOutcome::Scheduled { full_key });
        }

        let dedup_id = opts.effective_dedup_id(&job);
        if let Some(existing) = dedup_id.as_ref().and_then(|id| inner.dedup.get(id)) {
            return Ok(EnqueueOutcome::Deduplicated {
                job_id: existing.clone(),
            });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        if let Some(id) = &dedup_id {
            inner.dedup.insert(id.clone(), job_id.clone());
        }
        inner.pending.push(PendingJob {
            id: job_id.clone(),
            job,
            delay: opts.delay,
            dedup_id,
        });

        Ok(EnqueueOutcome::Queued { job_id })
    }

    async fn list_repeating(&self) -> Result<Vec<RepeatingSchedule>, QueueError> {
        Ok(self.lock()?.repeating.values().cloned().collect())
    }

    async fn remove_repeating_by_full_key(&self, full_key: &str) -> Result<bool, QueueError> {
        let mut inner = self.lock()?;
        let key = inner
            .repeating
            .iter()
            .find(|(_, schedule)| schedule.full_key == full_key)
            .map(|(key, _)| key.clone());

        Ok(match key {
            Some(key) => inner.repeating.remove(&key).is_some(),
            None => false,
        })
    }
}
