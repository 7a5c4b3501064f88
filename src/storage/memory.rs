//! In-process [`Repository`].
//!
//! State lives behind one `RwLock`; no method holds it across an await.
//! Rows keep insertion order so lookups are deterministic.

use crate::catalog::{Catalog, CommandDefinition, CronJobDefinition, HookDefinition};
use crate::error::EngineError;
use crate::event::PlayerRef;
use crate::model::{Command, CronJob, GameServer, Hook, ModuleInstallation};
use crate::repository::Repository;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Cross-server identity of a player within a tenant.
#[derive(Debug, Clone)]
struct PlayerRecord {
    id: String,
    tenant_id: String,
    name: String,
    steam_id: Option<String>,
    epic_online_services_id: Option<String>,
    xbox_live_id: Option<String>,
}

impl PlayerRecord {
    fn shares_platform_id(&self, player: &PlayerRef) -> bool {
        fn same(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }
        same(&self.steam_id, &player.steam_id)
            || same(&self.epic_online_services_id, &player.epic_online_services_id)
            || same(&self.xbox_live_id, &player.xbox_live_id)
    }

    fn absorb(&mut self, player: &PlayerRef) {
        self.name = player.name.clone();
        if player.steam_id.is_some() {
            self.steam_id = player.steam_id.clone();
        }
        if player.epic_online_services_id.is_some() {
            self.epic_online_services_id = player.epic_online_services_id.clone();
        }
        if player.xbox_live_id.is_some() {
            self.xbox_live_id = player.xbox_live_id.clone();
        }
    }
}

#[derive(Debug, Clone)]
struct Presence {
    player_id: String,
    player: PlayerRef,
    online: bool,
}

/// (tenant, server, game id)
type PresenceKey = (String, String, String);

#[derive(Default)]
struct State {
    servers: Vec<GameServer>,
    tenant_settings: HashMap<String, HashMap<String, String>>,
    server_settings: HashMap<(String, String), HashMap<String, String>>,
    hooks: Vec<Hook>,
    commands: Vec<Command>,
    cron_jobs: Vec<CronJob>,
    installations: Vec<ModuleInstallation>,
    players: Vec<PlayerRecord>,
    presence: HashMap<PresenceKey, Presence>,
}

impl State {
    fn sync_presence(
        &mut self,
        tenant_id: &str,
        game_server_id: &str,
        player: &PlayerRef,
        online: bool,
    ) -> Result<String, EngineError> {
        if player.game_id.trim().is_empty() {
            return Err(EngineError::Internal(format!(
                "player '{}' has no game id",
                player.name
            )));
        }

        let key = (
            tenant_id.to_string(),
            game_server_id.to_string(),
            player.game_id.clone(),
        );
        let player_id = match self.presence.get(&key) {
            Some(existing) => existing.player_id.clone(),
            None => self.find_or_create_player(tenant_id, player),
        };

        if let Some(record) = self.players.iter_mut().find(|r| r.id == player_id) {
            record.absorb(player);
        }
        self.presence.insert(
            key,
            Presence {
                player_id: player_id.clone(),
                player: player.clone(),
                online,
            },
        );
        Ok(player_id)
    }

    fn find_or_create_player(&mut self, tenant_id: &str, player: &PlayerRef) -> String {
        if let Some(record) = self
            .players
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.shares_platform_id(player))
        {
            return record.id.clone();
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.players.push(PlayerRecord {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            name: player.name.clone(),
            steam_id: player.steam_id.clone(),
            epic_online_services_id: player.epic_online_services_id.clone(),
            xbox_live_id: player.xbox_live_id.clone(),
        });
        id
    }
}

/// Repository backed by process memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository holding everything a catalog describes.
    pub fn from_catalog(catalog: &Catalog) -> Result<Self, EngineError> {
        let repo = Self::new();
        for tenant in &catalog.tenants {
            for (key, value) in &tenant.settings {
                repo.set_tenant_setting(&tenant.id, key, value);
            }
            for server in &tenant.servers {
                repo.add_game_server(server.to_game_server(&tenant.id));
                for (key, value) in &server.settings {
                    repo.set_setting(&tenant.id, &server.id, key, value);
                }
            }
            for installation in &tenant.installations {
                repo.add_installation(installation.clone().into_installation(&tenant.id));
            }
            for hook in &tenant.hooks {
                repo.create_hook(&tenant.id, hook.clone())?;
            }
            for command in &tenant.commands {
                repo.create_command(&tenant.id, command.clone())?;
            }
            for cron_job in &tenant.cron_jobs {
                repo.create_cron_job(&tenant.id, cron_job.clone())?;
            }
            debug!(
                tenant_id = %tenant.id,
                servers = tenant.servers.len(),
                installations = tenant.installations.len(),
                "Seeded tenant from catalog"
            );
        }
        Ok(repo)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_game_server(&self, server: GameServer) {
        let mut state = self.write();
        state
            .servers
            .retain(|s| !(s.tenant_id == server.tenant_id && s.id == server.id));
        state.servers.push(server);
    }

    /// Drop a server together with its settings and installations.
    pub fn remove_game_server(&self, tenant_id: &str, game_server_id: &str) {
        let mut state = self.write();
        state
            .servers
            .retain(|s| !(s.tenant_id == tenant_id && s.id == game_server_id));
        state
            .installations
            .retain(|i| !(i.tenant_id == tenant_id && i.game_server_id == game_server_id));
        state
            .server_settings
            .remove(&(tenant_id.to_string(), game_server_id.to_string()));
    }

    /// Overwrite the stored reachable flag of a server.
    pub fn set_reachable(&self, tenant_id: &str, game_server_id: &str, reachable: bool) {
        let mut state = self.write();
        if let Some(server) = state
            .servers
            .iter_mut()
            .find(|s| s.tenant_id == tenant_id && s.id == game_server_id)
        {
            server.reachable = reachable;
        }
    }

    pub fn set_tenant_setting(&self, tenant_id: &str, key: &str, value: &str) {
        self.write()
            .tenant_settings
            .entry(tenant_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_setting(&self, tenant_id: &str, game_server_id: &str, key: &str, value: &str) {
        self.write()
            .server_settings
            .entry((tenant_id.to_string(), game_server_id.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Store a hook as is. Use [`Self::create_hook`] for validated writes.
    pub fn add_hook(&self, hook: Hook) {
        let mut state = self.write();
        state
            .hooks
            .retain(|h| !(h.tenant_id == hook.tenant_id && h.id == hook.id));
        state.hooks.push(hook);
    }

    pub fn add_command(&self, command: Command) {
        let mut state = self.write();
        state
            .commands
            .retain(|c| !(c.tenant_id == command.tenant_id && c.id == command.id));
        state.commands.push(command);
    }

    pub fn add_cron_job(&self, cron_job: CronJob) {
        let mut state = self.write();
        state
            .cron_jobs
            .retain(|c| !(c.tenant_id == cron_job.tenant_id && c.id == cron_job.id));
        state.cron_jobs.push(cron_job);
    }

    pub fn remove_cron_job(&self, tenant_id: &str, cron_job_id: &str) {
        self.write()
            .cron_jobs
            .retain(|c| !(c.tenant_id == tenant_id && c.id == cron_job_id));
    }

    pub fn add_installation(&self, installation: ModuleInstallation) {
        let mut state = self.write();
        state
            .installations
            .retain(|i| !(i.tenant_id == installation.tenant_id && i.id == installation.id));
        state.installations.push(installation);
    }

    pub fn remove_installation(&self, tenant_id: &str, installation_id: &str) {
        self.write()
            .installations
            .retain(|i| !(i.tenant_id == tenant_id && i.id == installation_id));
    }

    pub fn create_hook(&self, tenant_id: &str, def: HookDefinition) -> Result<Hook, EngineError> {
        let hook = def.into_hook(tenant_id)?;
        self.add_hook(hook.clone());
        Ok(hook)
    }

    pub fn create_command(
        &self,
        tenant_id: &str,
        def: CommandDefinition,
    ) -> Result<Command, EngineError> {
        let command = def.into_command(tenant_id)?;
        self.add_command(command.clone());
        Ok(command)
    }

    pub fn create_cron_job(
        &self,
        tenant_id: &str,
        def: CronJobDefinition,
    ) -> Result<CronJob, EngineError> {
        let cron_job = def.into_cron_job(tenant_id)?;
        self.add_cron_job(cron_job.clone());
        Ok(cron_job)
    }

    /// Mark a player online and return its platform id.
    pub fn set_player_online(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player: PlayerRef,
    ) -> Result<String, EngineError> {
        self.write()
            .sync_presence(tenant_id, game_server_id, &player, true)
    }

    /// Whether the player with this game id is online on the server.
    pub fn is_online(&self, tenant_id: &str, game_server_id: &str, game_id: &str) -> bool {
        let key = (
            tenant_id.to_string(),
            game_server_id.to_string(),
            game_id.to_string(),
        );
        self.read().presence.get(&key).is_some_and(|p| p.online)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_game_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Option<GameServer>, EngineError> {
        Ok(self
            .read()
            .servers
            .iter()
            .find(|s| s.tenant_id == tenant_id && s.id == game_server_id)
            .cloned())
    }

    async fn find_settings_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        let state = self.read();
        let mut settings = state
            .tenant_settings
            .get(tenant_id)
            .cloned()
            .unwrap_or_default();
        if let Some(overrides) = state
            .server_settings
            .get(&(tenant_id.to_string(), game_server_id.to_string()))
        {
            settings.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(settings)
    }

    // Installation state is checked by the dispatchers, so every hook and
    // command of the tenant is a candidate.
    async fn find_hooks_for_server(
        &self,
        tenant_id: &str,
        _game_server_id: &str,
    ) -> Result<Vec<Hook>, EngineError> {
        Ok(self
            .read()
            .hooks
            .iter()
            .filter(|h| h.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_commands_for_server(
        &self,
        tenant_id: &str,
        _game_server_id: &str,
    ) -> Result<Vec<Command>, EngineError> {
        Ok(self
            .read()
            .commands
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_cron_job(
        &self,
        tenant_id: &str,
        cron_job_id: &str,
    ) -> Result<Option<CronJob>, EngineError> {
        Ok(self
            .read()
            .cron_jobs
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.id == cron_job_id)
            .cloned())
    }

    async fn find_cron_jobs_for_installation(
        &self,
        installation: &ModuleInstallation,
    ) -> Result<Vec<CronJob>, EngineError> {
        Ok(self
            .read()
            .cron_jobs
            .iter()
            .filter(|c| {
                c.tenant_id == installation.tenant_id && c.module_id == installation.module_id
            })
            .cloned()
            .collect())
    }

    async fn resolve_installation(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        module_id: &str,
    ) -> Result<Option<ModuleInstallation>, EngineError> {
        Ok(self
            .read()
            .installations
            .iter()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.game_server_id == game_server_id
                    && i.module_id == module_id
            })
            .cloned())
    }

    async fn find_installations_for_module(
        &self,
        tenant_id: &str,
        module_id: &str,
    ) -> Result<Vec<ModuleInstallation>, EngineError> {
        Ok(self
            .read()
            .installations
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.module_id == module_id)
            .cloned()
            .collect())
    }

    async fn find_installations_for_server(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Vec<ModuleInstallation>, EngineError> {
        Ok(self
            .read()
            .installations
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.game_server_id == game_server_id)
            .cloned()
            .collect())
    }

    async fn save_installation(
        &self,
        installation: &ModuleInstallation,
    ) -> Result<(), EngineError> {
        let mut state = self.write();
        match state
            .installations
            .iter_mut()
            .find(|i| i.tenant_id == installation.tenant_id && i.id == installation.id)
        {
            Some(existing) => *existing = installation.clone(),
            None => state.installations.push(installation.clone()),
        }
        Ok(())
    }

    async fn sync_player_presence(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player: &PlayerRef,
        online: bool,
    ) -> Result<String, EngineError> {
        self.write()
            .sync_presence(tenant_id, game_server_id, player, online)
    }

    async fn find_online_player(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        player_id: &str,
    ) -> Result<Option<PlayerRef>, EngineError> {
        Ok(self
            .read()
            .presence
            .iter()
            .find(|((tenant, server, _), presence)| {
                tenant == tenant_id
                    && server == game_server_id
                    && presence.player_id == player_id
                    && presence.online
            })
            .map(|(_, presence)| presence.player.clone()))
    }
}
