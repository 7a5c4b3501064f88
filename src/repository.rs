//! Persistence collaborator contract.
//!
//! Every method is tenant-scoped: implementations must never return rows
//! belonging to another tenant. The engine only reads through this trait,
//! except for presence updates and the system-config migration performed
//! when a cron job is renamed.

use crate::error::EngineError;
use crate::event::PlayerRef;
use crate::model::{Command, CronJob, GameServer, Hook, ModuleInstallation};
use async_trait::async_trait;
use std::collections::HashMap;

/// Settings key holding the chat command prefix.
pub const SETTING_COMMAND_PREFIX: &str = "commandPrefix";

#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_game_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Option<GameServer>, EngineError>;

    /// Stored key/value settings for a server, already merged with the
    /// tenant-wide values.
    async fn find_settings_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<HashMap<String, String>, EngineError>;

    async fn find_hooks_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Vec<Hook>, EngineError>;

    async fn find_commands_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Vec<Command>, EngineError>;

    async fn find_cron_job(
        &self,
        tenant_id: &str,
        cron_job_id: &str,
    ) -> Result<Option<CronJob>, EngineError>;

    /// Cron jobs defined by the module version an installation points at.
    async fn find_cron_jobs_for_installation(
        &self,
        installation: &ModuleInstallation,
    ) -> Result<Vec<CronJob>, EngineError>;

    /// Go from (server, module) to the active installation. `None` means the
    /// module is not installed there.
    async fn resolve_installation(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        module_id: &str,
    ) -> Result<Option<ModuleInstallation>, EngineError>;

    async fn find_installations_for_module(
        &self,
        tenant_id: &str,
        module_id: &str,
    ) -> Result<Vec<ModuleInstallation>, EngineError>;

    /// Every installation on a server. Command dispatch reads these once per
    /// message instead of resolving module by module.
    async fn find_installations_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Vec<ModuleInstallation>, EngineError>;

    async fn save_installation(&self, installation: &ModuleInstallation)
        -> Result<(), EngineError>;

    /// Create or update the cross-server player record for `player` and its
    /// per-server presence. Returns the platform player id.
    async fn sync_player_presence(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player: &PlayerRef,
        online: bool,
    ) -> Result<String, EngineError>;

    /// Look up a player by platform id, only if currently online on the server.
    async fn find_online_player(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player_id: &str,
    ) -> Result<Option<PlayerRef>, EngineError>;
}
