//! Chat command dispatch.
//!
//! A chat message is a command when it starts with the server's command
//! prefix. The word after the prefix selects candidate commands by trigger
//! (or installation-configured alias); each candidate parses the rest of the
//! message independently. A candidate that fails to parse tells the player
//! why and is skipped, the others still run.

pub mod args;

use crate::connection::{ConnectionRegistry, GameConnection, MessageOptions};
use crate::error::EngineError;
use crate::event::{EventChatMessage, PlayerRef};
use crate::model::{Command, ExecutionJob, JobData, ModuleInstallation};
use crate::queue::{EnqueueOptions, WorkQueue};
use crate::repository::{Repository, SETTING_COMMAND_PREFIX};
use args::{needs_players, parse_arguments};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix used when the server has no `commandPrefix` setting
pub const DEFAULT_COMMAND_PREFIX: &str = "/";

/// A candidate command whose arguments did not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRejection {
    pub command: String,
    /// Text that was sent to the player
    pub reason: String,
}

/// A candidate command that failed for a reason other than bad input.
#[derive(Debug)]
pub struct CommandFailure {
    pub command: String,
    pub error: EngineError,
}

/// Result of handling one chat message.
#[derive(Debug, Default)]
pub struct CommandDispatchResult {
    /// Command word after the prefix, `None` if the message is not a command
    pub command_name: Option<String>,

    /// Names of candidate commands
    pub matched: Vec<String>,

    pub enqueued: usize,

    pub rejected: Vec<CommandRejection>,

    pub errors: Vec<CommandFailure>,
}

impl CommandDispatchResult {
    pub fn is_command(&self) -> bool {
        self.command_name.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Split a message into command name and argument text, if it carries the
/// prefix.
fn split_command<'a>(msg: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = msg.strip_prefix(prefix)?;
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let (name, args) = rest.split_at(end);
    (!name.is_empty()).then_some((name, args))
}

struct Candidate {
    command: Command,
    installation: ModuleInstallation,
}

/// Lazily acquired connection and online player list, shared by all
/// candidates of one message.
struct ReplyContext<'a> {
    registry: &'a ConnectionRegistry,
    tenant_id: &'a str,
    game_server_id: &'a str,
    player: &'a PlayerRef,
    conn: Option<Arc<dyn GameConnection>>,
    players: Option<Vec<PlayerRef>>,
}

impl ReplyContext<'_> {
    async fn connection(&mut self) -> Result<Arc<dyn GameConnection>, EngineError> {
        if let Some(conn) = &self.conn {
            return Ok(conn.clone());
        }
        let conn = self
            .registry
            .get_connection(self.tenant_id, self.game_server_id)
            .await?;
        self.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn online_players(&mut self) -> Result<&[PlayerRef], EngineError> {
        if self.players.is_none() {
            let players = self.connection().await?.list_players().await?;
            self.players = Some(players);
        }
        Ok(self.players.as_deref().unwrap_or_default())
    }

    /// Whisper to the invoking player. Delivery failures are logged only.
    async fn tell(&mut self, message: &str) {
        let result = match self.connection().await {
            Ok(conn) => {
                conn.send_message(message, &MessageOptions::to_player(self.player))
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(
                game_server_id = %self.game_server_id,
                player = %self.player.name,
                error = %e,
                "Failed to message player"
            );
        }
    }
}

pub struct CommandDispatcher {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn WorkQueue>,
    connections: Arc<ConnectionRegistry>,
    default_prefix: String,
}

impl CommandDispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<dyn WorkQueue>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            repo,
            queue,
            connections,
            default_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
        }
    }

    pub fn with_default_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.default_prefix = prefix.into();
        self
    }

    async fn candidates(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        name: &str,
    ) -> Result<Vec<Candidate>, EngineError> {
        let commands = self
            .repo
            .find_commands_for_server(tenant_id, game_server_id)
            .await?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        // One lookup for the whole server; aliases live in the installations.
        let installations: HashMap<String, ModuleInstallation> = self
            .repo
            .find_installations_for_server(tenant_id, game_server_id)
            .await?
            .into_iter()
            .map(|i| (i.module_id.clone(), i))
            .collect();

        let mut candidates = Vec::new();
        for command in commands {
            let Some(installation) = installations.get(&command.module_id) else {
                continue;
            };

            let config = installation.system_config.command(&command.name);
            let triggered = command.trigger.eq_ignore_ascii_case(name)
                || config.aliases.iter().any(|a| a.eq_ignore_ascii_case(name));
            if !triggered {
                continue;
            }

            if !installation.system_config.enabled || !config.enabled {
                debug!(command = %command.name, "Command disabled for installation");
                continue;
            }

            candidates.push(Candidate {
                command,
                installation: installation.clone(),
            });
        }
        Ok(candidates)
    }

    /// Run a chat message through prefix check, trigger resolution,
    /// argument parsing and enqueue.
    pub async fn handle_chat_message(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        chat: &EventChatMessage,
    ) -> Result<CommandDispatchResult, EngineError> {
        let mut result = CommandDispatchResult::default();

        // Server broadcasts have no one to run the command as.
        let Some(player) = &chat.player else {
            return Ok(result);
        };

        let settings = self
            .repo
            .find_settings_for_server(tenant_id, game_server_id)
            .await?;
        let prefix = settings
            .get(SETTING_COMMAND_PREFIX)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.default_prefix);

        let Some((name, arg_text)) = split_command(&chat.msg, prefix) else {
            return Ok(result);
        };
        result.command_name = Some(name.to_string());

        let candidates = self.candidates(tenant_id, game_server_id, name).await?;
        if candidates.is_empty() {
            debug!(command = %name, "No command with this trigger");
            return Ok(result);
        }
        result.matched = candidates.iter().map(|c| c.command.name.clone()).collect();

        let mut reply = ReplyContext {
            registry: &self.connections,
            tenant_id,
            game_server_id,
            player,
            conn: None,
            players: None,
        };

        for Candidate {
            command,
            installation,
        } in candidates
        {
            let players = if needs_players(&command.arguments) {
                match reply.online_players().await {
                    Ok(players) => players.to_vec(),
                    Err(e) => {
                        result.errors.push(CommandFailure {
                            command: command.name.clone(),
                            error: e,
                        });
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            let arguments = match parse_arguments(&command.arguments, arg_text, &players) {
                Ok(arguments) => arguments,
                Err(e) => {
                    let reason = e.to_string();
                    debug!(command = %command.name, reason = %reason, "Command arguments rejected");
                    reply.tell(&reason).await;
                    result.rejected.push(CommandRejection {
                        command: command.name.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let config = installation.system_config.command(&command.name);
            if config.delay > 0 && config.announce_delay {
                reply
                    .tell(&format!(
                        "Your command will be executed in {} seconds.",
                        config.delay
                    ))
                    .await;
            }

            let job = ExecutionJob {
                tenant_id: tenant_id.to_string(),
                game_server_id: game_server_id.to_string(),
                item_id: command.id.clone(),
                function_id: command.function.id.clone(),
                installation,
                data: JobData::Command {
                    trigger: name.to_string(),
                    player: player.clone(),
                    chat_message: chat.clone(),
                    arguments,
                },
            };

            match self
                .queue
                .enqueue(job, EnqueueOptions::delayed(config.delay))
                .await
            {
                Ok(_) => result.enqueued += 1,
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        game_server_id = %game_server_id,
                        command = %command.name,
                        error = %e,
                        "Failed to enqueue command"
                    );
                    result.errors.push(CommandFailure {
                        command: command.name.clone(),
                        error: e.into(),
                    });
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            command = %name,
            matched = result.matched.len(),
            enqueued = result.enqueued,
            rejected = result.rejected.len(),
            failed = result.errors.len(),
            "Command handled"
        );
        Ok(result)
    }

    /// Run `raw_message` as if an online player had typed it.
    pub async fn trigger(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player_id: &str,
        raw_message: &str,
    ) -> Result<CommandDispatchResult, EngineError> {
        let player = self
            .repo
            .find_online_player(tenant_id, game_server_id, player_id)
            .await?
            .ok_or_else(|| EngineError::not_found("online player", player_id))?;

        let chat = EventChatMessage::new(player, raw_message);
        self.handle_chat_message(tenant_id, game_server_id, &chat)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnectionFactory;
    use crate::model::{
        ArgumentType, ArgumentValue, CommandArgument, CommandConfig, FunctionRef, GameServer,
        GameType, SystemConfig,
    };
    use crate::queue::MemoryWorkQueue;
    use crate::model::{CronJob, Hook};
    use crate::storage::MemoryRepository;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        repo: Arc<MemoryRepository>,
        queue: Arc<MemoryWorkQueue>,
        factory: Arc<MockConnectionFactory>,
        dispatcher: CommandDispatcher,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let factory = Arc::new(MockConnectionFactory::new());
        let registry = Arc::new(ConnectionRegistry::new(repo.clone(), factory.clone()));

        repo.add_game_server(GameServer {
            id: "s1".to_string(),
            tenant_id: "t1".to_string(),
            name: "Survival".to_string(),
            game_type: GameType::Mock,
            connection_info: json!({
                "players": [
                    {"gameId": "1", "name": "Steve"},
                    {"gameId": "2", "name": "Alex"}
                ]
            }),
            reachable: true,
            enabled: true,
        });

        let dispatcher = CommandDispatcher::new(repo.clone(), queue.clone(), registry);
        Fixture {
            repo,
            queue,
            factory,
            dispatcher,
        }
    }

    fn command(id: &str, module: &str, trigger: &str, arguments: Vec<CommandArgument>) -> Command {
        Command {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            name: id.to_string(),
            trigger: trigger.to_string(),
            help_text: None,
            arguments,
            module_id: module.to_string(),
            function: FunctionRef::create(None),
        }
    }

    fn number_arg(name: &str) -> CommandArgument {
        CommandArgument {
            name: name.to_string(),
            arg_type: ArgumentType::Number,
            default_value: None,
            position: 0,
            help_text: None,
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

    fn steve_says(msg: &str) -> EventChatMessage {
        EventChatMessage::new(PlayerRef::new("1", "Steve"), msg)
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("/tp home", "/"), Some(("tp", " home")));
        assert_eq!(split_command("/help", "/"), Some(("help", "")));
        assert_eq!(split_command("!!ping x", "!!"), Some(("ping", " x")));
        assert_eq!(split_command("hello", "/"), None);
        assert_eq!(split_command("/ tp", "/"), None);
    }

    #[tokio::test]
    async fn test_not_a_command() {
        let f = fixture();
        f.repo.add_command(command("ping", "m1", "ping", vec![]));
        f.repo.add_installation(installation("m1"));

        let result = f
            .dispatcher
            .handle_chat_message("t1", "s1", &steve_says("ping"))
            .await
            .unwrap();

        assert!(!result.is_command());
        assert!(f.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_prefix_setting_respected() {
        let f = fixture();
        f.repo.set_setting("t1", "s1", SETTING_COMMAND_PREFIX, "!");
        f.repo.add_command(command("ping", "m1", "ping", vec![]));
        f.repo.add_installation(installation("m1"));

        let slash = f
            .dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/ping"))
            .await
            .unwrap();
        let bang = f
            .dispatcher
            .handle_chat_message("t1", "s1", &steve_says("!ping"))
            .await
            .unwrap();

        assert_eq!(slash.enqueued, 0);
        assert_eq!(bang.enqueued, 1);
    }

    #[tokio::test]
    async fn test_parse_failure_isolated_per_candidate() {
        let f = fixture();
        f.repo
            .add_command(command("give", "m1", "give", vec![number_arg("amount")]));
        f.repo.add_command(command(
            "give-text",
            "m2",
            "give",
            vec![CommandArgument {
                arg_type: ArgumentType::String,
                ..number_arg("what")
            }],
        ));
        f.repo.add_installation(installation("m1"));
        f.repo.add_installation(installation("m2"));

        let result = f
            .dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/give diamonds"))
            .await
            .unwrap();

        assert_eq!(result.matched.len(), 2);
        assert_eq!(result.enqueued, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].command, "give");

        let pending = f.queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job.item_id, "give-text");

        let mock = f.factory.connection("s1").unwrap();
        assert_eq!(
            mock.messages_to("1"),
            vec!["The value for \"amount\" should be a number. Please correct it and try again."
                .to_string()]
        );
    }

    #[tokio::test]
    async fn test_delay_notice_and_aliases() {
        let f = fixture();
        f.repo.add_command(command("teleport", "m1", "tp", vec![]));
        let mut inst = installation("m1");
        inst.system_config.commands.insert(
            "teleport".to_string(),
            CommandConfig {
                delay: 5,
                aliases: vec!["warp".to_string()],
                ..CommandConfig::default()
            },
        );
        f.repo.add_installation(inst);

        let result = f
            .dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/warp"))
            .await
            .unwrap();

        assert_eq!(result.enqueued, 1);
        let pending = f.queue.pending();
        assert_eq!(pending[0].delay, Some(std::time::Duration::from_secs(5)));

        let mock = f.factory.connection("s1").unwrap();
        assert_eq!(
            mock.messages_to("1"),
            vec!["Your command will be executed in 5 seconds.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_silent_delay() {
        let f = fixture();
        f.repo.add_command(command("teleport", "m1", "tp", vec![]));
        let mut inst = installation("m1");
        inst.system_config.commands.insert(
            "teleport".to_string(),
            CommandConfig {
                delay: 5,
                announce_delay: false,
                ..CommandConfig::default()
            },
        );
        f.repo.add_installation(inst);

        f.dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/tp"))
            .await
            .unwrap();

        assert_eq!(f.queue.pending().len(), 1);
        // No message was needed, so no connection was opened.
        assert_eq!(f.factory.constructed(), 0);
    }

    #[tokio::test]
    async fn test_player_argument_resolved() {
        let f = fixture();
        f.repo.add_command(command(
            "slap",
            "m1",
            "slap",
            vec![CommandArgument {
                arg_type: ArgumentType::Player,
                ..number_arg("target")
            }],
        ));
        f.repo.add_installation(installation("m1"));

        f.dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/slap ALEX"))
            .await
            .unwrap();

        let pending = f.queue.pending();
        let JobData::Command { arguments, .. } = &pending[0].job.data else {
            panic!("expected command job");
        };
        assert_eq!(
            arguments["target"],
            ArgumentValue::Player(PlayerRef::new("2", "Alex"))
        );
    }

    #[tokio::test]
    async fn test_manual_trigger_uses_same_pipeline() {
        let f = fixture();
        f.repo
            .add_command(command("give", "m1", "give", vec![number_arg("amount")]));
        f.repo.add_installation(installation("m1"));
        let player_id = f.repo.set_player_online("t1", "s1", PlayerRef::new("1", "Steve")).unwrap();

        let ok = f
            .dispatcher
            .trigger("t1", "s1", &player_id, "/give 10")
            .await
            .unwrap();
        let bad = f
            .dispatcher
            .trigger("t1", "s1", &player_id, "/give lots")
            .await
            .unwrap();

        assert_eq!(ok.enqueued, 1);
        assert_eq!(bad.rejected.len(), 1);

        let offline = f.dispatcher.trigger("t1", "s1", "nobody", "/give 1").await;
        assert!(matches!(offline, Err(EngineError::NotFound { .. })));
    }

    /// Repository that counts installation lookups.
    struct CountingRepository {
        inner: Arc<MemoryRepository>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Repository for CountingRepository {
        async fn find_game_server(
            &self,
            tenant_id: &str,
            game_server_id: &str,
        ) -> Result<Option<GameServer>, EngineError> {
            self.inner.find_game_server(tenant_id, game_server_id).await
        }

        async fn find_settings_for_server(
            &self,
            tenant_id: &str,
            game_server_id: &str,
        ) -> Result<HashMap<String, String>, EngineError> {
            self.inner.find_settings_for_server(tenant_id, game_server_id).await
        }

        async fn find_hooks_for_server(
            &self,
            tenant_id: &str,
            game_server_id: &str,
        ) -> Result<Vec<Hook>, EngineError> {
            self.inner.find_hooks_for_server(tenant_id, game_server_id).await
        }

        async fn find_commands_for_server(
            &self,
            tenant_id: &str,
            game_server_id: &str,
        ) -> Result<Vec<Command>, EngineError> {
            self.inner.find_commands_for_server(tenant_id, game_server_id).await
        }

        async fn find_cron_job(
            &self,
            tenant_id: &str,
            cron_job_id: &str,
        ) -> Result<Option<CronJob>, EngineError> {
            self.inner.find_cron_job(tenant_id, cron_job_id).await
        }

        async fn find_cron_jobs_for_installation(
            &self,
            installation: &ModuleInstallation,
        ) -> Result<Vec<CronJob>, EngineError> {
            self.inner.find_cron_jobs_for_installation(installation).await
        }

        async fn resolve_installation(
            &self,
            tenant_id: &str,
            game_server_id: &str,
            module_id: &str,
        ) -> Result<Option<ModuleInstallation>, EngineError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner
                .resolve_installation(tenant_id, game_server_id, module_id)
                .await
        }

        async fn find_installations_for_module(
            &self,
            tenant_id: &str,
            module_id: &str,
        ) -> Result<Vec<ModuleInstallation>, EngineError> {
            self.inner.find_installations_for_module(tenant_id, module_id).await
        }

        async fn find_installations_for_server(
            &self,
            tenant_id: &str,
            game_server_id: &str,
        ) -> Result<Vec<ModuleInstallation>, EngineError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner
                .find_installations_for_server(tenant_id, game_server_id)
                .await
        }

        async fn save_installation(
            &self,
            installation: &ModuleInstallation,
        ) -> Result<(), EngineError> {
            self.inner.save_installation(installation).await
        }

        async fn sync_player_presence(
            &self,
            tenant_id: &str,
            game_server_id: &str,
            player: &PlayerRef,
            online: bool,
        ) -> Result<String, EngineError> {
            self.inner
                .sync_player_presence(tenant_id, game_server_id, player, online)
                .await
        }

        async fn find_online_player(
            &self,
            tenant_id: &str,
            game_server_id: &str,
            player_id: &str,
        ) -> Result<Option<PlayerRef>, EngineError> {
            self.inner
                .find_online_player(tenant_id, game_server_id, player_id)
                .await
        }
    }

    #[tokio::test]
    async fn test_installations_looked_up_once_per_message() {
        let f = fixture();
        for i in 0..20 {
            let module = format!("m{i}");
            f.repo
                .add_command(command(&format!("cmd{i}"), &module, &format!("cmd{i}"), vec![]));
            f.repo.add_installation(installation(&module));
        }
        let counting = Arc::new(CountingRepository {
            inner: f.repo.clone(),
            lookups: AtomicUsize::new(0),
        });
        let registry = Arc::new(ConnectionRegistry::new(counting.clone(), f.factory.clone()));
        let dispatcher = CommandDispatcher::new(counting.clone(), f.queue.clone(), registry);

        let result = dispatcher
            .handle_chat_message("t1", "s1", &steve_says("/cmd7"))
            .await
            .unwrap();

        assert_eq!(result.matched, vec!["cmd7".to_string()]);
        assert_eq!(result.enqueued, 1);
        assert_eq!(counting.lookups.load(Ordering::SeqCst), 1);
    }
}
