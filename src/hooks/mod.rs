//! Hook matching and dispatch.
//!
//! The [`HookMatcher`] narrows a server's hooks down to those whose event
//! type equals the event's, then applies each hook's regex to the event text.
//! Patterns were checked by [`safety::check_pattern`] when the hook was
//! written, so matching trusts them and applies no timeout.
//!
//! The [`HookDispatcher`] turns every match into one execution job,
//! collecting per-hook failures instead of aborting on the first one.

pub mod safety;

use crate::error::EngineError;
use crate::event::{EventType, GameEvent};
use crate::model::{ExecutionJob, Hook, JobData};
use crate::queue::{EnqueueOptions, WorkQueue};
use crate::repository::Repository;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Finds the hooks an event triggers.
pub struct HookMatcher {
    repo: Arc<dyn Repository>,
    /// pattern -> compiled regex
    compiled: DashMap<String, Regex>,
}

impl HookMatcher {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            compiled: DashMap::new(),
        }
    }

    fn is_match(&self, hook: &Hook, text: &str) -> bool {
        if let Some(re) = self.compiled.get(&hook.regex) {
            return re.is_match(text);
        }

        match Regex::new(&hook.regex) {
            Ok(re) => {
                let matched = re.is_match(text);
                self.compiled.insert(hook.regex.clone(), re);
                matched
            }
            Err(e) => {
                // Only reachable if storage was written around the catalog.
                warn!(hook_id = %hook.id, error = %e, "Stored hook pattern does not compile");
                false
            }
        }
    }

    /// Hooks on the server that `event` triggers.
    pub async fn match_event(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        event: &GameEvent,
    ) -> Result<Vec<Hook>, EngineError> {
        let event_type = event.event_type();
        let hooks = self
            .repo
            .find_hooks_for_server(tenant_id, game_server_id)
            .await?;

        let matched: Vec<Hook> = hooks
            .into_iter()
            .filter(|hook| hook.event_type == event_type)
            .filter(|hook| match event.match_text() {
                Some(text) => self.is_match(hook, text),
                None => true,
            })
            .collect();

        Ok(matched)
    }
}

/// A hook whose job could not be enqueued.
#[derive(Debug)]
pub struct HookFailure {
    pub hook: String,
    pub error: EngineError,
}

/// Result of dispatching one event to hooks.
#[derive(Debug)]
pub struct HookDispatchResult {
    pub event_type: EventType,

    /// Names of hooks that matched the event
    pub matched: Vec<String>,

    /// Jobs handed to the queue
    pub enqueued: usize,

    /// Matches skipped because the module is not installed or is disabled
    pub skipped: usize,

    pub errors: Vec<HookFailure>,
}

impl HookDispatchResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }
}

pub struct HookDispatcher {
    matcher: HookMatcher,
    repo: Arc<dyn Repository>,
    queue: Arc<dyn WorkQueue>,
}

impl HookDispatcher {
    pub fn new(repo: Arc<dyn Repository>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            matcher: HookMatcher::new(repo.clone()),
            repo,
            queue,
        }
    }

    pub fn matcher(&self) -> &HookMatcher {
        &self.matcher
    }

    async fn dispatch_one(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        hook: &Hook,
        event: &GameEvent,
    ) -> Result<bool, EngineError> {
        let Some(installation) = self
            .repo
            .resolve_installation(tenant_id, game_server_id, &hook.module_id)
            .await?
        else {
            debug!(
                hook = %hook.name,
                module_id = %hook.module_id,
                "Module not installed on server, skipping hook"
            );
            return Ok(false);
        };

        let config = installation.system_config.hook(&hook.name);
        if !installation.system_config.enabled || !config.enabled {
            debug!(hook = %hook.name, "Hook disabled for installation");
            return Ok(false);
        }

        let job = ExecutionJob {
            tenant_id: tenant_id.to_string(),
            game_server_id: game_server_id.to_string(),
            item_id: hook.id.clone(),
            function_id: hook.function.id.clone(),
            installation,
            data: JobData::Hook {
                event_type: event.event_type(),
                event: event.clone(),
            },
        };

        self.queue
            .enqueue(job, EnqueueOptions::delayed(config.delay))
            .await?;
        Ok(true)
    }

    /// Enqueue one job per hook the event triggers.
    pub async fn handle_event(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        event: &GameEvent,
    ) -> Result<HookDispatchResult, EngineError> {
        let hooks = self
            .matcher
            .match_event(tenant_id, game_server_id, event)
            .await?;

        let mut result = HookDispatchResult {
            event_type: event.event_type(),
            matched: hooks.iter().map(|h| h.name.clone()).collect(),
            enqueued: 0,
            skipped: 0,
            errors: Vec::new(),
        };

        if hooks.is_empty() {
            return Ok(result);
        }

        for hook in &hooks {
            match self
                .dispatch_one(tenant_id, game_server_id, hook, event)
                .await
            {
                Ok(true) => result.enqueued += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        game_server_id = %game_server_id,
                        hook = %hook.name,
                        error = %e,
                        "Failed to dispatch hook"
                    );
                    result.errors.push(HookFailure {
                        hook: hook.name.clone(),
                        error: e,
                    });
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            event_type = %result.event_type,
            matched = result.matched.len(),
            enqueued = result.enqueued,
            failed = result.failure_count(),
            "Hooks dispatched"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::event::{EventLogLine, EventChatMessage, EventPlayerPresence, PlayerRef};
    use crate::model::{FunctionRef, HookConfig, ModuleInstallation, SystemConfig};
    use crate::queue::{EnqueueOutcome, MemoryWorkQueue, RepeatingSchedule};
    use crate::storage::MemoryRepository;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn hook(id: &str, module: &str, event_type: EventType, regex: &str) -> Hook {
        Hook {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            name: id.to_string(),
            event_type,
            regex: regex.to_string(),
            module_id: module.to_string(),
            function: FunctionRef::create(None),
        }
    }

    fn installation(module: &str) -> ModuleInstallation {
        ModuleInstallation {
            id: format!("inst-{module}"),
            tenant_id: "t1".to_string(),
            game_server_id: "s1".to_string(),
            module_id: module.to_string(),
            version_id: "v1".to_string(),
            system_config: SystemConfig::default(),
            user_config: json!({}),
        }
    }

    fn chat(msg: &str) -> GameEvent {
        GameEvent::ChatMessage(EventChatMessage::new(PlayerRef::new("1", "Steve"), msg))
    }

    #[tokio::test]
    async fn test_event_type_isolation() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_hook(hook("h-log", "m1", EventType::LogLine, ".*"));
        repo.add_hook(hook("h-chat", "m1", EventType::ChatMessage, ".*"));
        let matcher = HookMatcher::new(repo);

        let matched = matcher.match_event("t1", "s1", &chat("hello")).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "h-chat");
    }

    #[tokio::test]
    async fn test_regex_applied_to_text() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_hook(hook("h-gg", "m1", EventType::ChatMessage, "^gg$"));
        repo.add_hook(hook("h-error", "m1", EventType::LogLine, "(?i)error"));
        let matcher = HookMatcher::new(repo);

        assert_eq!(matcher.match_event("t1", "s1", &chat("gg")).await.unwrap().len(), 1);
        assert!(matcher.match_event("t1", "s1", &chat("good game")).await.unwrap().is_empty());

        let log = GameEvent::LogLine(EventLogLine {
            msg: "ERROR: disk full".to_string(),
        });
        assert_eq!(matcher.match_event("t1", "s1", &log).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_textless_event_matches_on_type() {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_hook(hook("h-join", "m1", EventType::PlayerConnected, "^never$"));
        let matcher = HookMatcher::new(repo);

        let joined = GameEvent::PlayerConnected(EventPlayerPresence {
            player: PlayerRef::new("1", "Steve"),
            msg: None,
        });
        assert_eq!(matcher.match_event("t1", "s1", &joined).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_skips_uninstalled_and_disabled() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        repo.add_hook(hook("active", "m1", EventType::ChatMessage, ""));
        repo.add_hook(hook("elsewhere", "m2", EventType::ChatMessage, ""));
        repo.add_hook(hook("switched-off", "m3", EventType::ChatMessage, ""));
        repo.add_installation(installation("m1"));
        let mut off = installation("m3");
        off.system_config.hooks.insert(
            "switched-off".to_string(),
            HookConfig {
                enabled: false,
                delay: 0,
            },
        );
        repo.add_installation(off);

        let dispatcher = HookDispatcher::new(repo, queue.clone());
        let result = dispatcher.handle_event("t1", "s1", &chat("hi")).await.unwrap();

        assert_eq!(result.matched.len(), 3);
        assert_eq!(result.enqueued, 1);
        assert_eq!(result.skipped, 2);
        assert!(result.is_success());

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job.item_id, "active");
        assert_eq!(pending[0].job.installation.module_id, "m1");
    }

    #[tokio::test]
    async fn test_hook_delay_applied() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        repo.add_hook(hook("slow", "m1", EventType::ChatMessage, ""));
        let mut inst = installation("m1");
        inst.system_config.hooks.insert(
            "slow".to_string(),
            HookConfig {
                enabled: true,
                delay: 30,
            },
        );
        repo.add_installation(inst);

        let dispatcher = HookDispatcher::new(repo, queue.clone());
        dispatcher.handle_event("t1", "s1", &chat("hi")).await.unwrap();

        assert_eq!(queue.pending()[0].delay, Some(Duration::from_secs(30)));
    }

    /// Queue that rejects jobs for one function.
    struct RejectingQueue {
        inner: MemoryWorkQueue,
        rejected_item: String,
    }

    #[async_trait]
    impl WorkQueue for RejectingQueue {
        async fn enqueue(
            &self,
            job: ExecutionJob,
            opts: EnqueueOptions,
        ) -> Result<EnqueueOutcome, QueueError> {
            if job.item_id == self.rejected_item {
                return Err(QueueError::Redis("OOM".to_string()));
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
    async fn test_one_failing_hook_does_not_abort_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(RejectingQueue {
            inner: MemoryWorkQueue::new(),
            rejected_item: "first".to_string(),
        });
        repo.add_hook(hook("first", "m1", EventType::ChatMessage, ""));
        repo.add_hook(hook("second", "m1", EventType::ChatMessage, ""));
        repo.add_installation(installation("m1"));

        let dispatcher = HookDispatcher::new(repo, queue.clone());
        let result = dispatcher.handle_event("t1", "s1", &chat("hi")).await.unwrap();

        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.errors[0].hook, "first");
        assert_eq!(result.enqueued, 1);
        assert_eq!(queue.inner.pending().len(), 1);
    }
}
