//! Write-side definitions and the seed catalog.
//!
//! Hooks, commands and cron jobs enter the system through the definitions
//! in this module. Validation happens here, once: hook patterns go through
//! the safety gate, temporal values must parse, and a function is created
//! when the author did not supply one. Everything downstream trusts what
//! was stored.
//!
//! A [`Catalog`] is a TOML or JSON file describing tenants, their servers,
//! installations and module items. The worker binary uses it to seed a
//! [`crate::storage::MemoryRepository`].

use crate::cronjobs::parse_temporal_value;
use crate::error::EngineError;
use crate::event::EventType;
use crate::hooks::safety::check_pattern;
use crate::model::{
    Command, CommandArgument, CronJob, FunctionRef, GameServer, GameType, Hook,
    ModuleInstallation, SystemConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML catalog: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid catalog entry: {0}")]
    Invalid(#[from] EngineError),
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub module_id: String,
    pub event_type: EventType,
    /// Empty matches everything
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub function: Option<String>,
}

impl HookDefinition {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidTrigger("hook name is empty".to_string()));
        }
        check_pattern(&self.regex)
    }

    pub fn into_hook(self, tenant_id: &str) -> Result<Hook, EngineError> {
        self.validate()?;
        Ok(Hook {
            id: self.id.unwrap_or_else(new_id),
            tenant_id: tenant_id.to_string(),
            name: self.name,
            event_type: self.event_type,
            regex: self.regex,
            module_id: self.module_id,
            function: FunctionRef::create(self.function),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub module_id: String,
    pub trigger: String,
    #[serde(default)]
    pub help_text: Option<String>,
    #[serde(default)]
    pub arguments: Vec<CommandArgument>,
    #[serde(default)]
    pub function: Option<String>,
}

impl CommandDefinition {
    pub fn validate(&self) -> Result<(), EngineError> {
        let trigger = self.trigger.trim();
        if trigger.is_empty() || trigger.contains(char::is_whitespace) {
            return Err(EngineError::InvalidTrigger(format!(
                "command trigger '{}' must be a single non-empty word",
                self.trigger
            )));
        }

        let mut names = HashSet::new();
        let mut positions = HashSet::new();
        for arg in &self.arguments {
            if arg.name.trim().is_empty() {
                return Err(EngineError::InvalidTrigger(format!(
                    "command '{}' declares an argument without a name",
                    self.name
                )));
            }
            if !names.insert(arg.name.as_str()) {
                return Err(EngineError::InvalidTrigger(format!(
                    "command '{}' declares argument '{}' twice",
                    self.name, arg.name
                )));
            }
            if !positions.insert(arg.position) {
                return Err(EngineError::InvalidTrigger(format!(
                    "command '{}' declares two arguments at position {}",
                    self.name, arg.position
                )));
            }
        }
        Ok(())
    }

    pub fn into_command(self, tenant_id: &str) -> Result<Command, EngineError> {
        self.validate()?;
        let mut arguments = self.arguments;
        arguments.sort_by_key(|a| a.position);

        Ok(Command {
            id: self.id.unwrap_or_else(new_id),
            tenant_id: tenant_id.to_string(),
            name: self.name,
            trigger: self.trigger.trim().to_string(),
            help_text: self.help_text,
            arguments,
            module_id: self.module_id,
            function: FunctionRef::create(self.function),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub module_id: String,
    pub temporal_value: String,
    #[serde(default)]
    pub function: Option<String>,
}

impl CronJobDefinition {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidTrigger(
                "cron job name is empty".to_string(),
            ));
        }
        parse_temporal_value(&self.temporal_value).map(|_| ())
    }

    pub fn into_cron_job(self, tenant_id: &str) -> Result<CronJob, EngineError> {
        self.validate()?;
        Ok(CronJob {
            id: self.id.unwrap_or_else(new_id),
            tenant_id: tenant_id.to_string(),
            name: self.name,
            temporal_value: self.temporal_value,
            module_id: self.module_id,
            function: FunctionRef::create(self.function),
        })
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSeed {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub game_type: GameType,
    #[serde(default)]
    pub connection_info: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl ServerSeed {
    pub fn to_game_server(&self, tenant_id: &str) -> GameServer {
        GameServer {
            id: self.id.clone(),
            tenant_id: tenant_id.to_string(),
            name: self.name.clone(),
            game_type: self.game_type,
            connection_info: self.connection_info.clone(),
            reachable: true,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSeed {
    #[serde(default)]
    pub id: Option<String>,
    pub game_server_id: String,
    pub module_id: String,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub system_config: SystemConfig,
    #[serde(default)]
    pub user_config: Value,
}

impl InstallationSeed {
    pub fn into_installation(self, tenant_id: &str) -> ModuleInstallation {
        ModuleInstallation {
            id: self.id.unwrap_or_else(new_id),
            tenant_id: tenant_id.to_string(),
            game_server_id: self.game_server_id,
            module_id: self.module_id,
            version_id: self.version_id.unwrap_or_else(|| "latest".to_string()),
            system_config: self.system_config,
            user_config: self.user_config,
        }
    }
}

/// Everything one tenant owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSeed {
    pub id: String,
    /// Tenant-wide settings; server settings override them
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
    #[serde(default)]
    pub installations: Vec<InstallationSeed>,
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
    #[serde(default)]
    pub cron_jobs: Vec<CronJobDefinition>,
}

/// Seed data for an in-process repository.
///
/// # Example
///
/// ```toml
/// [[tenants]]
/// id = "t1"
///
/// [[tenants.servers]]
/// id = "s1"
/// name = "Survival"
/// type = "MOCK"
///
/// [[tenants.hooks]]
/// name = "greet"
/// moduleId = "welcome"
/// eventType = "player-connected"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tenants: Vec<TenantSeed>,
}

impl Catalog {
    /// Load a catalog, picking the format from the file extension
    /// (`.json` is JSON, anything else TOML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Run every definition through its write-side checks.
    pub fn validate(&self) -> Result<(), EngineError> {
        for tenant in &self.tenants {
            for hook in &tenant.hooks {
                hook.validate()?;
            }
            for command in &tenant.commands {
                command.validate()?;
            }
            for cron_job in &tenant.cron_jobs {
                cron_job.validate()?;
            }
            for installation in &tenant.installations {
                if !tenant
                    .servers
                    .iter()
                    .any(|s| s.id == installation.game_server_id)
                {
                    return Err(EngineError::not_found(
                        "game server",
                        installation.game_server_id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArgumentType;

    fn argument(name: &str, position: u32) -> CommandArgument {
        CommandArgument {
            name: name.to_string(),
            arg_type: ArgumentType::String,
            default_value: None,
            position,
            help_text: None,
        }
    }

    #[test]
    fn test_hook_rejects_unsafe_pattern() {
        let def = HookDefinition {
            id: None,
            name: "spam".to_string(),
            module_id: "m1".to_string(),
            event_type: EventType::ChatMessage,
            regex: "(a+)+$".to_string(),
            function: None,
        };

        assert!(matches!(
            def.into_hook("t1"),
            Err(EngineError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn test_hook_creates_function() {
        let hook = HookDefinition {
            id: Some("h1".to_string()),
            name: "greet".to_string(),
            module_id: "m1".to_string(),
            event_type: EventType::PlayerConnected,
            regex: String::new(),
            function: None,
        }
        .into_hook("t1")
        .unwrap();

        assert_eq!(hook.id, "h1");
        assert_eq!(hook.tenant_id, "t1");
        assert!(hook.function.code.is_empty());
        assert!(!hook.function.id.is_empty());
    }

    #[test]
    fn test_command_arguments_sorted_by_position() {
        let command = CommandDefinition {
            id: None,
            name: "give".to_string(),
            module_id: "m1".to_string(),
            trigger: "give".to_string(),
            help_text: None,
            arguments: vec![argument("amount", 1), argument("item", 0)],
            function: Some("await give()".to_string()),
        }
        .into_command("t1")
        .unwrap();

        let names: Vec<&str> = command.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["item", "amount"]);
        assert_eq!(command.function.code, "await give()");
    }

    #[test]
    fn test_command_rejects_duplicate_positions() {
        let def = CommandDefinition {
            id: None,
            name: "give".to_string(),
            module_id: "m1".to_string(),
            trigger: "give".to_string(),
            help_text: None,
            arguments: vec![argument("item", 0), argument("amount", 0)],
            function: None,
        };
        assert!(def.validate().is_err());

        let def = CommandDefinition {
            trigger: "give me".to_string(),
            arguments: vec![],
            ..def
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_cron_job_pattern_checked() {
        let def = CronJobDefinition {
            id: None,
            name: "cleanup".to_string(),
            module_id: "m1".to_string(),
            temporal_value: "* *".to_string(),
            function: None,
        };
        assert!(matches!(
            def.clone().into_cron_job("t1"),
            Err(EngineError::InvalidTrigger(_))
        ));

        let def = CronJobDefinition {
            temporal_value: "@daily".to_string(),
            ..def
        };
        assert!(def.into_cron_job("t1").is_ok());
    }

    #[test]
    fn test_catalog_from_toml() {
        let catalog = Catalog::from_toml(
            r#"
            [[tenants]]
            id = "t1"
            settings = { commandPrefix = "!" }

            [[tenants.servers]]
            id = "s1"
            name = "Survival"
            type = "MOCK"
            connectionInfo = { players = [] }

            [[tenants.installations]]
            gameServerId = "s1"
            moduleId = "welcome"

            [[tenants.hooks]]
            name = "greet"
            moduleId = "welcome"
            eventType = "player-connected"

            [[tenants.cronJobs]]
            name = "daily-reward"
            moduleId = "welcome"
            temporalValue = "0 0 * * *"
            "#,
        )
        .unwrap();

        let tenant = &catalog.tenants[0];
        assert_eq!(tenant.settings["commandPrefix"], "!");
        assert_eq!(tenant.servers[0].game_type, GameType::Mock);
        assert_eq!(tenant.hooks[0].event_type, EventType::PlayerConnected);
        assert_eq!(tenant.cron_jobs.len(), 1);
    }

    #[test]
    fn test_catalog_rejects_installation_on_unknown_server() {
        let result = Catalog::from_json(
            r#"{"tenants": [{"id": "t1", "installations": [{"gameServerId": "nope", "moduleId": "m1"}]}]}"#,
        );
        assert!(matches!(result, Err(CatalogError::Invalid(_))));
    }
}
