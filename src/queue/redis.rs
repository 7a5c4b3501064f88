//! Redis-backed work queue.
//!
//! Layout:
//!
//! ```text
//! hookline:jobs:{hook|command|cronjob}   stream   ready jobs (XADD)
//! hookline:jobs:delayed                  zset     delayed jobs, score = due unix ms
//! hookline:jobs:repeat                   hash     repeat key -> stored schedule
//! hookline:jobs:dedup:{id}               string   pending dedup marker (SET NX EX)
//! ```
//!
//! [`RedisWorkQueue::tick`] moves due delayed jobs onto their stream and
//! fires due repeating schedules. Several workers may tick concurrently: a
//! delayed job is only promoted by whoever wins the `ZREM`, and each repeat
//! firing carries a dedup id derived from its due time.
//!
//! Stored schedules are only ever advanced or removed with a compare-and-set
//! on the exact value that was read, so a tick racing an uninstall or a
//! re-registration never writes back a stale schedule.

use super::{
    full_repeat_key, EnqueueOptions, EnqueueOutcome, RepeatingSchedule, WorkQueue,
};
use crate::cronjobs::parse_temporal_value;
use crate::error::QueueError;
use crate::model::ExecutionJob;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Prefix of every key the queue owns
pub const JOB_KEY_PREFIX: &str = "hookline:jobs";

/// How long a dedup marker survives if the executor never clears it
const DEDUP_TTL_SECS: u64 = 3600;

/// Maximum delayed jobs promoted per tick
const PROMOTE_BATCH: usize = 100;

/// Replace a hash field only if it still holds the value the caller read.
/// KEYS[1] hash, ARGV[1] field, ARGV[2] expected, ARGV[3] replacement.
const HASH_CAS_SET: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  return 1
end
return 0
"#;

/// Delete a hash field only if it still holds the value the caller read.
/// KEYS[1] hash, ARGV[1] field, ARGV[2] expected.
const HASH_CAS_DEL: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

/// Attempts at removing a schedule that keeps changing underneath us
const REMOVE_ATTEMPTS: usize = 3;

/// Stream that ready jobs of this kind are appended to.
pub fn job_stream_name(kind: &str) -> String {
    format!("{JOB_KEY_PREFIX}:{kind}")
}

fn delayed_key() -> String {
    format!("{JOB_KEY_PREFIX}:delayed")
}

fn repeat_key() -> String {
    format!("{JOB_KEY_PREFIX}:repeat")
}

fn dedup_key(id: &str) -> String {
    format!("{JOB_KEY_PREFIX}:dedup:{id}")
}

/// A job parked in the delayed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayedEntry {
    job_id: String,
    job: ExecutionJob,
}

/// A repeating schedule plus its next due time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSchedule {
    schedule: RepeatingSchedule,
    next_run_ms: i64,
}

/// A stored schedule together with the exact hash value it was read from.
#[derive(Debug, Clone)]
struct LoadedSchedule {
    raw: String,
    stored: StoredSchedule,
}

/// Where a stored schedule stands at a given instant.
#[derive(Debug, Clone, PartialEq)]
enum ScheduleTurn {
    NotDue,
    /// Due, but the pattern has no run left after now
    Exhausted,
    Due {
        due_ms: i64,
        advanced: StoredSchedule,
    },
}

/// First run of `pattern` strictly after `after`, in unix ms.
fn next_run_ms(pattern: &str, after: &DateTime<Utc>) -> Result<Option<i64>, QueueError> {
    let schedule = parse_temporal_value(pattern)
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
    Ok(schedule.after(after).next().map(|t| t.timestamp_millis()))
}

/// Decide whether a schedule fires at `now`. Missed runs are not caught
/// up: a due schedule fires once and moves to its first run after `now`.
fn schedule_turn(stored: &StoredSchedule, now: &DateTime<Utc>) -> ScheduleTurn {
    if stored.next_run_ms > now.timestamp_millis() {
        return ScheduleTurn::NotDue;
    }

    match next_run_ms(&stored.schedule.pattern, now).ok().flatten() {
        Some(next) => ScheduleTurn::Due {
            due_ms: stored.next_run_ms,
            advanced: StoredSchedule {
                next_run_ms: next,
                ..stored.clone()
            },
        },
        None => ScheduleTurn::Exhausted,
    }
}

/// Dedup id of one firing, shared by every worker that sees it due.
fn firing_dedup_id(key: &str, due_ms: i64) -> String {
    format!("{key}:{due_ms}")
}

fn delayed_due_ms(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Await `write`; when it fails, await `release` before handing back the
/// error.
async fn release_on_error<T>(
    write: impl Future<Output = Result<T, QueueError>>,
    release: impl Future<Output = ()>,
) -> Result<T, QueueError> {
    match write.await {
        Ok(value) => Ok(value),
        Err(e) => {
            release.await;
            Err(e)
        }
    }
}

/// Counts from one [`RedisWorkQueue::tick`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub fired: usize,
}

#[derive(Clone)]
pub struct RedisWorkQueue {
    pool: Pool,
}

impl RedisWorkQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for work queue");
            QueueError::Connection(e.to_string())
        })
    }

    /// Claim a dedup id. Returns false if a pending job already holds it.
    async fn claim_dedup(
        &self,
        conn: &mut deadpool_redis::Connection,
        dedup_id: &str,
        job_id: &str,
    ) -> Result<bool, QueueError> {
        let reply: Option<String> = cmd("SET")
            .arg(dedup_key(dedup_id))
            .arg(job_id)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        Ok(reply.is_some())
    }

    async fn append_ready(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        job: &ExecutionJob,
    ) -> Result<String, QueueError> {
        let job_json = serde_json::to_string(job)?;

        let stream_id: String = cmd("XADD")
            .arg(job_stream_name(job.kind()))
            .arg("*")
            .arg("jobId")
            .arg(job_id)
            .arg("tenantId")
            .arg(&job.tenant_id)
            .arg("job")
            .arg(&job_json)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        Ok(stream_id)
    }

    /// Drop a dedup marker, but only while it still belongs to `job_id`.
    async fn release_dedup(&self, dedup_id: Option<&str>, job_id: &str) {
        let Some(dedup_id) = dedup_id else {
            return;
        };
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        let result: Result<(), _> = cmd("EVAL")
            .arg("if redis.call('GET', KEYS[1]) == ARGV[1] then redis.call('DEL', KEYS[1]) end")
            .arg(1)
            .arg(dedup_key(dedup_id))
            .arg(job_id)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => debug!(dedup_id = %dedup_id, "Released dedup marker of failed job"),
            Err(e) => warn!(dedup_id = %dedup_id, error = %e, "Failed to release dedup marker"),
        }
    }

    async fn load_schedules(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<Vec<LoadedSchedule>, QueueError> {
        let raw: HashMap<String, String> = cmd("HGETALL")
            .arg(repeat_key())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        let mut schedules = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_str::<StoredSchedule>(&value) {
                Ok(stored) => schedules.push(LoadedSchedule { raw: value, stored }),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable repeating schedule"),
            }
        }
        Ok(schedules)
    }

    /// Overwrite (or delete, when `replacement` is `None`) a schedule only if
    /// it still holds `expected`. Returns whether the write happened.
    async fn swap_schedule(
        &self,
        conn: &mut deadpool_redis::Connection,
        key: &str,
        expected: &str,
        replacement: Option<&str>,
    ) -> Result<bool, QueueError> {
        let mut eval = cmd("EVAL");
        match replacement {
            Some(replacement) => eval
                .arg(HASH_CAS_SET)
                .arg(1)
                .arg(repeat_key())
                .arg(key)
                .arg(expected)
                .arg(replacement),
            None => eval
                .arg(HASH_CAS_DEL)
                .arg(1)
                .arg(repeat_key())
                .arg(key)
                .arg(expected),
        };

        let swapped: i64 = eval
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;
        Ok(swapped > 0)
    }

    /// Promote due delayed jobs and fire due repeating schedules.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, QueueError> {
        let mut conn = self.conn().await?;
        let now_ms = now.timestamp_millis();
        let mut report = TickReport::default();

        let due: Vec<String> = cmd("ZRANGEBYSCORE")
            .arg(delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        for member in due {
            let removed: u64 = cmd("ZREM")
                .arg(delayed_key())
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Redis(e.to_string()))?;

            // Another worker promoted it first.
            if removed == 0 {
                continue;
            }

            match serde_json::from_str::<DelayedEntry>(&member) {
                Ok(entry) => {
                    self.append_ready(&mut conn, &entry.job_id, &entry.job).await?;
                    report.promoted += 1;
                }
                Err(e) => error!(error = %e, "Dropping unreadable delayed job"),
            }
        }

        for loaded in self.load_schedules(&mut conn).await? {
            let key = loaded.stored.schedule.key.clone();
            let (due_ms, advanced) = match schedule_turn(&loaded.stored, &now) {
                ScheduleTurn::NotDue => continue,
                ScheduleTurn::Exhausted => {
                    warn!(
                        key = %key,
                        pattern = %loaded.stored.schedule.pattern,
                        "Repeating schedule has no future run, leaving it idle"
                    );
                    continue;
                }
                ScheduleTurn::Due { due_ms, advanced } => (due_ms, advanced),
            };

            let replacement = serde_json::to_string(&advanced)?;
            if !self
                .swap_schedule(&mut conn, &key, &loaded.raw, Some(&replacement))
                .await?
            {
                debug!(key = %key, "Schedule changed since it was read, not firing");
                continue;
            }

            let opts = EnqueueOptions {
                dedup_id: Some(firing_dedup_id(&key, due_ms)),
                ..EnqueueOptions::default()
            };
            if let EnqueueOutcome::Queued { .. } =
                self.enqueue(advanced.schedule.job, opts).await?
            {
                report.fired += 1;
            }
        }

        if report.promoted > 0 || report.fired > 0 {
            debug!(
                promoted = report.promoted,
                fired = report.fired,
                "Work queue tick"
            );
        }

        Ok(report)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(
        &self,
        job: ExecutionJob,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.conn().await?;

        if let Some(repeat) = &opts.repeat {
            let next_run_ms =
                next_run_ms(&repeat.pattern, &Utc::now())?.unwrap_or(i64::MAX);

            let full_key = full_repeat_key(&repeat.key, &repeat.pattern);
            let stored = StoredSchedule {
                schedule: RepeatingSchedule {
                    key: repeat.key.clone(),
                    full_key: full_key.clone(),
                    pattern: repeat.pattern.clone(),
                    job,
                },
                next_run_ms,
            };

            // HSET on the repeat key replaces any earlier registration.
            let _: () = cmd("HSET")
                .arg(repeat_key())
                .arg(&repeat.key)
                .arg(serde_json::to_string(&stored)?)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Redis(e.to_string()))?;

            info!(
                key = %repeat.key,
                pattern = %repeat.pattern,
                next_run = ?Utc.timestamp_millis_opt(next_run_ms).single(),
                "Registered repeating schedule"
            );
            return Ok(EnqueueOutcome::Scheduled { full_key });
        }

        let job_id = uuid::Uuid::new_v4().to_string();

        let claimed = opts.effective_dedup_id(&job);
        if let Some(dedup_id) = &claimed {
            if !self.claim_dedup(&mut conn, dedup_id, &job_id).await? {
                debug!(dedup_id = %dedup_id, "Job coalesced with pending duplicate");
                return Ok(EnqueueOutcome::Deduplicated {
                    job_id: dedup_id.clone(),
                });
            }
        }

        // A job that never made it into Redis must not keep its dedup id.
        let release = self.release_dedup(claimed.as_deref(), &job_id);
        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let due_ms = delayed_due_ms(Utc::now().timestamp_millis(), delay);
                let write = async {
                    let member = serde_json::to_string(&DelayedEntry {
                        job_id: job_id.clone(),
                        job,
                    })?;
                    let _: u64 = cmd("ZADD")
                        .arg(delayed_key())
                        .arg(due_ms)
                        .arg(&member)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| QueueError::Redis(e.to_string()))?;
                    Ok::<(), QueueError>(())
                };
                release_on_error(write, release).await?;

                debug!(job_id = %job_id, delay_ms = delay.as_millis(), "Job delayed");
            }
            _ => {
                let stream_id =
                    release_on_error(self.append_ready(&mut conn, &job_id, &job), release).await?;
                debug!(job_id = %job_id, stream_id = %stream_id, kind = job.kind(), "Job queued");
            }
        }

        Ok(EnqueueOutcome::Queued { job_id })
    }

    async fn list_repeating(&self) -> Result<Vec<RepeatingSchedule>, QueueError> {
        let mut conn = self.conn().await?;
        Ok(self
            .load_schedules(&mut conn)
            .await?
            .into_iter()
            .map(|loaded| loaded.stored.schedule)
            .collect())
    }

    async fn remove_repeating_by_full_key(&self, full_key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;

        for _ in 0..REMOVE_ATTEMPTS {
            let Some(loaded) = self
                .load_schedules(&mut conn)
                .await?
                .into_iter()
                .find(|loaded| loaded.stored.schedule.full_key == full_key)
            else {
                debug!(full_key = %full_key, "Repeating schedule not found");
                return Ok(false);
            };

            // A tick may have advanced the schedule since it was read.
            if self
                .swap_schedule(&mut conn, &loaded.stored.schedule.key, &loaded.raw, None)
                .await?
            {
                info!(full_key = %full_key, "Removed repeating schedule");
                return Ok(true);
            }
        }

        Err(QueueError::Redis(format!(
            "repeating schedule {full_key} kept changing during removal"
        )))
    }
}
