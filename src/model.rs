//! Tenant-scoped entities the engine reads and the jobs it produces.
//!
//! These mirror what the persistence collaborator stores. The engine never
//! mutates them except for [`ModuleInstallation::system_config`] during cron
//! job rename reconciliation.

use crate::event::{EventChatMessage, EventType, GameEvent, PlayerRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Closed set of supported game server protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    /// JSON-over-HTTP bridge speaking the generic operation protocol
    Generic,
    /// In-process fake server, used for testing modules
    Mock,
    SevenDaysToDie,
    Rust,
    Minecraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServer {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub game_type: GameType,
    /// Adapter-specific connection parameters, decrypted by the repository
    #[serde(default)]
    pub connection_info: Value,
    #[serde(default = "default_true")]
    pub reachable: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Executable code backing a hook, command or cron job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub id: String,
    #[serde(default)]
    pub code: String,
}

impl FunctionRef {
    /// Create a fresh function, empty when no code is supplied.
    pub fn create(code: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub event_type: EventType,
    pub regex: String,
    pub module_id: String,
    pub function: FunctionRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
    Boolean,
    Player,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    /// Sorted by `position`
    #[serde(default)]
    pub arguments: Vec<CommandArgument>,
    pub module_id: String,
    pub function: FunctionRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub temporal_value: String,
    pub module_id: String,
    pub function: FunctionRef,
}

/// Operator-tunable behaviour of one module installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub hooks: HashMap<String, HookConfig>,

    #[serde(default)]
    pub commands: HashMap<String, CommandConfig>,

    /// Keyed by cron job name
    #[serde(default)]
    pub cron_jobs: HashMap<String, CronJobConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hooks: HashMap::new(),
            commands: HashMap::new(),
            cron_jobs: HashMap::new(),
        }
    }
}

impl SystemConfig {
    pub fn hook(&self, name: &str) -> HookConfig {
        self.hooks.get(name).cloned().unwrap_or_default()
    }

    pub fn command(&self, name: &str) -> CommandConfig {
        self.commands.get(name).cloned().unwrap_or_default()
    }

    pub fn cron_job(&self, name: &str) -> CronJobConfig {
        self.cron_jobs.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds
    #[serde(default)]
    pub delay: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds
    #[serde(default)]
    pub delay: u64,
    #[serde(default = "default_true")]
    pub announce_delay: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: 0,
            announce_delay: true,
            aliases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_value: Option<String>,
}

impl Default for CronJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temporal_value: None,
        }
    }
}

/// One module version activated on one game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInstallation {
    pub id: String,
    pub tenant_id: String,
    pub game_server_id: String,
    pub module_id: String,
    pub version_id: String,
    #[serde(default)]
    pub system_config: SystemConfig,
    /// Module-author-defined parameters, passed through untouched
    #[serde(default)]
    pub user_config: Value,
}

/// A typed, parsed command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Player(PlayerRef),
}

/// Kind-specific part of an [`ExecutionJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobData {
    #[serde(rename_all = "camelCase")]
    Hook {
        event_type: EventType,
        event: GameEvent,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        trigger: String,
        player: PlayerRef,
        chat_message: EventChatMessage,
        arguments: BTreeMap<String, ArgumentValue>,
    },
    #[serde(rename_all = "camelCase")]
    CronJob { cron_job_name: String },
}

/// Self-contained unit of work handed to the sandboxed executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub tenant_id: String,
    pub game_server_id: String,
    /// Id of the hook, command or cron job that produced this job
    pub item_id: String,
    pub function_id: String,
    pub installation: ModuleInstallation,
    pub data: JobData,
}

impl ExecutionJob {
    pub fn kind(&self) -> &'static str {
        match self.data {
            JobData::Hook { .. } => "hook",
            JobData::Command { .. } => "command",
            JobData::CronJob { .. } => "cronjob",
        }
    }

    /// Cron jobs are coalesced per repeat key unless the caller opts out.
    pub fn default_dedup_id(&self) -> Option<String> {
        match self.data {
            JobData::CronJob { .. } => Some(cron_job_key(&self.game_server_id, &self.item_id)),
            _ => None,
        }
    }
}

/// Repeat key for a cron job on a game server. Stable across reinstalls.
pub fn cron_job_key(game_server_id: &str, cron_job_id: &str) -> String {
    format!("{game_server_id}-{cron_job_id}")
}
