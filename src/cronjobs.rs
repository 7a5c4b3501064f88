//! Cron job scheduling.
//!
//! The scheduler keeps the work queue's repeating schedules in line with
//! module installations. Every schedule is registered under the stable key
//! `{gameServerId}-{cronJobId}`, so installing twice replaces instead of
//! duplicating, and uninstalling finds exactly what install created.
//!
//! Fan-out operations (`sync`, `rename`) reconcile installations
//! concurrently with a bounded width and report per installation.

use crate::error::EngineError;
use crate::model::{cron_job_key, CronJob, ExecutionJob, JobData, ModuleInstallation};
use crate::queue::{EnqueueOptions, EnqueueOutcome, RepeatingSchedule, WorkQueue};
use crate::repository::Repository;
use cron::Schedule;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of installations reconciled at once
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Parse a cron temporal value.
///
/// Accepts classic 5-field patterns (`min hour dom month dow`), which get a
/// leading seconds field, as well as 6/7-field patterns and `@` shortcuts.
///
/// ```
/// use hookline::cronjobs::parse_temporal_value;
///
/// assert!(parse_temporal_value("0 0 * * *").is_ok());
/// assert!(parse_temporal_value("*/30 * * * * *").is_ok());
/// assert!(parse_temporal_value("every day").is_err());
/// ```
pub fn parse_temporal_value(value: &str) -> Result<Schedule, EngineError> {
    let trimmed = value.trim();
    let expression = match trimmed.split_whitespace().count() {
        1 if trimmed.starts_with('@') => trimmed.to_string(),
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(EngineError::InvalidTrigger(format!(
                "cron pattern '{value}' must have 5 to 7 fields"
            )))
        }
    };

    Schedule::from_str(&expression).map_err(|e| {
        EngineError::InvalidTrigger(format!("invalid cron pattern '{value}': {e}"))
    })
}

/// One cron job that could not be reconciled.
#[derive(Debug)]
pub struct ScheduleFailure {
    /// Cron job name, or `*` when the whole installation failed
    pub cron_job: String,
    pub error: EngineError,
}

/// Outcome of reconciling one installation (or one cleanup scope).
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Installation id, server id or module id the report covers
    pub scope: String,

    /// Full keys of schedules registered
    pub registered: Vec<String>,

    /// Full keys of schedules removed
    pub removed: Vec<String>,

    pub errors: Vec<ScheduleFailure>,
}

impl ScheduleReport {
    fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }

    fn fail(&mut self, cron_job: impl Into<String>, error: EngineError) {
        self.errors.push(ScheduleFailure {
            cron_job: cron_job.into(),
            error,
        });
    }

    fn merge(&mut self, other: ScheduleReport) {
        self.registered.extend(other.registered);
        self.removed.extend(other.removed);
        self.errors.extend(other.errors);
    }
}

pub struct CronJobScheduler {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn WorkQueue>,
    concurrency: usize,
}

impl CronJobScheduler {
    pub fn new(repo: Arc<dyn Repository>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            repo,
            queue,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn build_job(installation: &ModuleInstallation, cron_job: &CronJob) -> ExecutionJob {
        ExecutionJob {
            tenant_id: installation.tenant_id.clone(),
            game_server_id: installation.game_server_id.clone(),
            item_id: cron_job.id.clone(),
            function_id: cron_job.function.id.clone(),
            installation: installation.clone(),
            data: JobData::CronJob {
                cron_job_name: cron_job.name.clone(),
            },
        }
    }

    /// Register a repeating schedule for every enabled cron job of the
    /// installation. Jobs that are disabled (or whose module is disabled)
    /// have any existing schedule removed instead.
    pub async fn install(
        &self,
        installation: &ModuleInstallation,
    ) -> Result<ScheduleReport, EngineError> {
        let cron_jobs = self.repo.find_cron_jobs_for_installation(installation).await?;
        let config = &installation.system_config;
        let mut report = ScheduleReport::new(&installation.id);

        let mut disabled_keys = HashSet::new();
        for cron_job in &cron_jobs {
            let key = cron_job_key(&installation.game_server_id, &cron_job.id);
            let job_config = config.cron_job(&cron_job.name);

            if !config.enabled || !job_config.enabled {
                debug!(
                    installation_id = %installation.id,
                    cron_job = %cron_job.name,
                    "Cron job disabled, not scheduling"
                );
                disabled_keys.insert(key);
                continue;
            }

            let pattern = job_config
                .temporal_value
                .unwrap_or_else(|| cron_job.temporal_value.clone());

            if let Err(e) = parse_temporal_value(&pattern) {
                warn!(
                    installation_id = %installation.id,
                    cron_job = %cron_job.name,
                    pattern = %pattern,
                    error = %e,
                    "Refusing to schedule cron job"
                );
                report.fail(&cron_job.name, e);
                continue;
            }

            let job = Self::build_job(installation, cron_job);
            match self
                .queue
                .enqueue(job, EnqueueOptions::repeating(&key, &pattern))
                .await
            {
                Ok(EnqueueOutcome::Scheduled { full_key }) => report.registered.push(full_key),
                Ok(other) => report.fail(
                    &cron_job.name,
                    EngineError::Conflict(format!(
                        "repeating registration for {key} was not scheduled: {other:?}"
                    )),
                ),
                Err(e) => {
                    warn!(
                        installation_id = %installation.id,
                        cron_job = %cron_job.name,
                        error = %e,
                        "Failed to register repeating schedule"
                    );
                    report.fail(&cron_job.name, e.into());
                }
            }
        }

        if !disabled_keys.is_empty() {
            let removed = self
                .remove_matching(&mut report, |s| disabled_keys.contains(&s.key))
                .await;
            report.removed.extend(removed);
        }

        info!(
            installation_id = %installation.id,
            game_server_id = %installation.game_server_id,
            registered = report.registered.len(),
            removed = report.removed.len(),
            failed = report.failure_count(),
            "Cron jobs installed"
        );
        Ok(report)
    }

    /// Remove every schedule belonging to the installation. Removing
    /// something that is not scheduled is not an error.
    pub async fn uninstall(
        &self,
        installation: &ModuleInstallation,
    ) -> Result<ScheduleReport, EngineError> {
        let cron_jobs = self.repo.find_cron_jobs_for_installation(installation).await?;
        let keys: HashSet<String> = cron_jobs
            .iter()
            .map(|c| cron_job_key(&installation.game_server_id, &c.id))
            .collect();

        let mut report = ScheduleReport::new(&installation.id);
        // Schedules of cron jobs no longer in the module version still carry
        // the installation they were registered for.
        let removed = self
            .remove_matching(&mut report, |s| {
                keys.contains(&s.key) || s.job.installation.id == installation.id
            })
            .await;
        report.removed = removed;

        debug!(
            installation_id = %installation.id,
            removed = report.removed.len(),
            "Cron jobs uninstalled"
        );
        Ok(report)
    }

    async fn remove_matching<F>(&self, report: &mut ScheduleReport, matches: F) -> Vec<String>
    where
        F: Fn(&RepeatingSchedule) -> bool,
    {
        let schedules = match self.queue.list_repeating().await {
            Ok(schedules) => schedules,
            Err(e) => {
                report.fail("*", e.into());
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for schedule in schedules.iter().filter(|s| matches(s)) {
            match self.queue.remove_repeating_by_full_key(&schedule.full_key).await {
                Ok(true) => removed.push(schedule.full_key.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(full_key = %schedule.full_key, error = %e, "Failed to remove schedule");
                    report.fail(schedule.key.clone(), e.into());
                }
            }
        }
        removed
    }

    async fn resync(&self, installation: &ModuleInstallation) -> ScheduleReport {
        let mut report = ScheduleReport::new(&installation.id);

        match self.uninstall(installation).await {
            Ok(r) => report.merge(r),
            Err(e) => report.fail("*", e),
        }
        match self.install(installation).await {
            Ok(r) => report.merge(r),
            Err(e) => report.fail("*", e),
        }
        report
    }

    /// Uninstall then reinstall every installation of a module, so schedules
    /// reflect the latest cron job definitions.
    pub async fn sync(
        &self,
        tenant_id: &str,
        module_id: &str,
    ) -> Result<Vec<ScheduleReport>, EngineError> {
        let installations = self
            .repo
            .find_installations_for_module(tenant_id, module_id)
            .await?;

        let reports: Vec<ScheduleReport> = stream::iter(installations)
            .map(|installation| async move { self.resync(&installation).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(
            tenant_id = %tenant_id,
            module_id = %module_id,
            installations = reports.len(),
            failed,
            "Cron jobs synced"
        );
        Ok(reports)
    }

    /// Move the system-config entry of a renamed cron job to its new name on
    /// every installation, then resync. Without the move an operator's
    /// override would silently fall back to defaults.
    pub async fn rename(
        &self,
        tenant_id: &str,
        module_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<Vec<ScheduleReport>, EngineError> {
        let installations = self
            .repo
            .find_installations_for_module(tenant_id, module_id)
            .await?;

        let reports: Vec<ScheduleReport> = stream::iter(installations)
            .map(|mut installation| async move {
                if let Some(entry) = installation.system_config.cron_jobs.remove(old_name) {
                    installation
                        .system_config
                        .cron_jobs
                        .insert(new_name.to_string(), entry);

                    if let Err(e) = self.repo.save_installation(&installation).await {
                        warn!(
                            installation_id = %installation.id,
                            error = %e,
                            "Failed to migrate cron job config"
                        );
                        let mut report = ScheduleReport::new(&installation.id);
                        report.fail(old_name, e);
                        return report;
                    }
                }
                self.resync(&installation).await
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        info!(
            tenant_id = %tenant_id,
            module_id = %module_id,
            old_name = %old_name,
            new_name = %new_name,
            installations = reports.len(),
            "Cron job renamed"
        );
        Ok(reports)
    }

    /// Run a cron job once, now, outside its schedule. The job bypasses
    /// deduplication so it never coalesces with a pending scheduled run.
    pub async fn trigger(
        &self,
        tenant_id: &str,
        cron_job_id: &str,
        game_server_id: &str,
        module_id: &str,
    ) -> Result<EnqueueOutcome, EngineError> {
        let cron_job = self
            .repo
            .find_cron_job(tenant_id, cron_job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cron job", cron_job_id))?;

        if cron_job.module_id != module_id {
            return Err(EngineError::not_found("cron job", cron_job_id));
        }

        let installation = self
            .repo
            .resolve_installation(tenant_id, game_server_id, module_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("module installation", format!("{game_server_id}/{module_id}"))
            })?;

        let job = Self::build_job(&installation, &cron_job);
        let outcome = self
            .queue
            .enqueue(job, EnqueueOptions::immediate().bypass_dedup())
            .await?;

        info!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            cron_job = %cron_job.name,
            "Cron job triggered manually"
        );
        Ok(outcome)
    }

    /// Drop every schedule registered for a game server, e.g. when it is
    /// deleted.
    pub async fn remove_for_server(&self, tenant_id: &str, game_server_id: &str) -> ScheduleReport {
        let mut report = ScheduleReport::new(game_server_id);
        let removed = self
            .remove_matching(&mut report, |s| {
                s.job.tenant_id == tenant_id && s.job.game_server_id == game_server_id
            })
            .await;
        report.removed = removed;
        report
    }

    /// Drop every schedule registered for a module, on any server.
    pub async fn remove_for_module(&self, tenant_id: &str, module_id: &str) -> ScheduleReport {
        let mut report = ScheduleReport::new(module_id);
        let removed = self
            .remove_matching(&mut report, |s| {
                s.job.tenant_id == tenant_id && s.job.installation.module_id == module_id
            })
            .await;
        report.removed = removed;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::model::{CronJobConfig, FunctionRef, SystemConfig};
    use crate::queue::MemoryWorkQueue;
    use crate::storage::MemoryRepository;
    use async_trait::async_trait;
    use serde_json::json;

    fn installation(id: &str, server: &str) -> ModuleInstallation {
        ModuleInstallation {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            game_server_id: server.to_string(),
            module_id: "m1".to_string(),
            version_id: "v1".to_string(),
            system_config: SystemConfig::default(),
            user_config: json!({}),
        }
    }

    fn cron_job(id: &str, pattern: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            name: id.to_string(),
            temporal_value: pattern.to_string(),
            module_id: "m1".to_string(),
            function: FunctionRef::create(None),
        }
    }

    fn setup() -> (Arc<MemoryRepository>, Arc<MemoryWorkQueue>, CronJobScheduler) {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let scheduler = CronJobScheduler::new(repo.clone(), queue.clone());
        (repo, queue, scheduler)
    }

    #[test]
    fn test_parse_temporal_value() {
        assert!(parse_temporal_value("0 0 * * *").is_ok());
        assert!(parse_temporal_value("  */5 * * * *  ").is_ok());
        assert!(parse_temporal_value("0 0 0 * * * *").is_ok());
        assert!(parse_temporal_value("@daily").is_ok());

        assert!(matches!(
            parse_temporal_value("* *"),
            Err(EngineError::InvalidTrigger(_))
        ));
        assert!(matches!(
            parse_temporal_value("0 0 * * xyz"),
            Err(EngineError::InvalidTrigger(_))
        ));
    }

    #[tokio::test]
    async fn test_install_twice_is_idempotent() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        let inst = installation("i1", "s1");
        repo.add_installation(inst.clone());

        scheduler.install(&inst).await.unwrap();
        let report = scheduler.install(&inst).await.unwrap();

        assert!(report.is_success());
        assert_eq!(queue.schedules_for_key("s1-c1").len(), 1);
        assert_eq!(queue.list_repeating().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_uses_override_pattern() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        let mut inst = installation("i1", "s1");
        inst.system_config.cron_jobs.insert(
            "c1".to_string(),
            CronJobConfig {
                enabled: true,
                temporal_value: Some("*/10 * * * *".to_string()),
            },
        );

        let report = scheduler.install(&inst).await.unwrap();

        assert_eq!(report.registered, vec!["s1-c1::*/10 * * * *".to_string()]);
        assert_eq!(queue.schedules_for_key("s1-c1")[0].pattern, "*/10 * * * *");
    }

    #[tokio::test]
    async fn test_disabling_removes_existing_schedule() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        let mut inst = installation("i1", "s1");
        scheduler.install(&inst).await.unwrap();

        inst.system_config.enabled = false;
        let report = scheduler.install(&inst).await.unwrap();

        assert_eq!(report.removed.len(), 1);
        assert!(queue.list_repeating().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_reported_per_job() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("good", "0 0 * * *"));
        repo.add_cron_job(cron_job("bad", "whenever"));
        let inst = installation("i1", "s1");

        let report = scheduler.install(&inst).await.unwrap();

        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.errors[0].cron_job, "bad");
        assert_eq!(queue.list_repeating().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_is_idempotent() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        let inst = installation("i1", "s1");
        scheduler.install(&inst).await.unwrap();

        let first = scheduler.uninstall(&inst).await.unwrap();
        let second = scheduler.uninstall(&inst).await.unwrap();

        assert_eq!(first.removed.len(), 1);
        assert!(second.removed.is_empty());
        assert!(second.is_success());
        assert!(queue.list_repeating().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_migrates_config_and_resyncs() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("daily-reward", "0 0 * * *"));
        let mut inst = installation("i1", "S");
        inst.system_config.cron_jobs.insert(
            "daily-reward".to_string(),
            CronJobConfig {
                enabled: true,
                temporal_value: Some("0 0 * * *".to_string()),
            },
        );
        repo.add_installation(inst.clone());
        scheduler.install(&inst).await.unwrap();
        assert_eq!(queue.schedules_for_key("S-daily-reward").len(), 1);

        // New module version ships the job under its new identity.
        repo.remove_cron_job("t1", "daily-reward");
        repo.add_cron_job(cron_job("daily-bonus", "0 12 * * *"));

        let reports = scheduler
            .rename("t1", "m1", "daily-reward", "daily-bonus")
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_success());
        assert!(queue.schedules_for_key("S-daily-reward").is_empty());
        let bonus = queue.schedules_for_key("S-daily-bonus");
        assert_eq!(bonus.len(), 1);
        assert_eq!(bonus[0].pattern, "0 0 * * *");

        let saved = repo.resolve_installation("t1", "S", "m1").await.unwrap().unwrap();
        assert!(saved.system_config.cron_jobs.contains_key("daily-bonus"));
        assert!(!saved.system_config.cron_jobs.contains_key("daily-reward"));
    }

    #[tokio::test]
    async fn test_trigger_bypasses_dedup() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        repo.add_installation(installation("i1", "s1"));

        let scheduled_run = ExecutionJob {
            tenant_id: "t1".to_string(),
            game_server_id: "s1".to_string(),
            item_id: "c1".to_string(),
            function_id: "f".to_string(),
            installation: installation("i1", "s1"),
            data: JobData::CronJob {
                cron_job_name: "c1".to_string(),
            },
        };
        queue
            .enqueue(scheduled_run, EnqueueOptions::immediate())
            .await
            .unwrap();

        let outcome = scheduler.trigger("t1", "c1", "s1", "m1").await.unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Queued { .. }));
        assert_eq!(queue.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_trigger_not_installed() {
        let (repo, _queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));

        let result = scheduler.trigger("t1", "c1", "s1", "m1").await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_remove_for_server_and_module() {
        let (repo, queue, scheduler) = setup();
        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        scheduler.install(&installation("i1", "s1")).await.unwrap();
        scheduler.install(&installation("i2", "s2")).await.unwrap();

        let report = scheduler.remove_for_server("t1", "s1").await;
        assert_eq!(report.removed, vec!["s1-c1::0 0 * * *".to_string()]);
        assert_eq!(queue.list_repeating().await.unwrap().len(), 1);

        assert!(scheduler.remove_for_module("t2", "m1").await.removed.is_empty());
        assert_eq!(scheduler.remove_for_module("t1", "m1").await.removed.len(), 1);
        assert!(queue.list_repeating().await.unwrap().is_empty());
    }

    /// Queue that refuses repeating registrations for one server.
    struct FailingQueue {
        inner: MemoryWorkQueue,
        broken_server: String,
    }

    #[async_trait]
    impl WorkQueue for FailingQueue {
        async fn enqueue(
            &self,
            job: ExecutionJob,
            opts: EnqueueOptions,
        ) -> Result<EnqueueOutcome, QueueError> {
            if job.game_server_id == self.broken_server {
                return Err(QueueError::Connection("queue unavailable".to_string()));
            }
            self.inner.enqueue(job, opts).await
        }

        async fn list_repeating(&self) -> Result<Vec<RepeatingSchedule>, QueueError> {
            self.inner.list_repeating().await
        }

        async fn remove_repeating_by_full_key(&self, full_key: &str) -> Result<bool, QueueError> {
            self.inner.remove_repeating_by_full_key(full_key).await
        }
    }

    #[tokio::test]
    async fn test_sync_isolates_failures() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(FailingQueue {
            inner: MemoryWorkQueue::new(),
            broken_server: "s2".to_string(),
        });
        let scheduler = CronJobScheduler::new(repo.clone(), queue.clone()).with_concurrency(2);

        repo.add_cron_job(cron_job("c1", "0 0 * * *"));
        for (id, server) in [("i1", "s1"), ("i2", "s2"), ("i3", "s3")] {
            repo.add_installation(installation(id, server));
        }

        let reports = scheduler.sync("t1", "m1").await.unwrap();

        assert_eq!(reports.len(), 3);
        let failed: Vec<_> = reports.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].scope, "i2");
        assert_eq!(queue.inner.list_repeating().await.unwrap().len(), 2);
    }
}
