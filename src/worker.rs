//! The single funnel for inbound game events.
//!
//! [`EventWorker::process`] runs the stages in a fixed order:
//!
//! 1. presence sync (connect/disconnect only)
//! 2. command dispatch (chat only)
//! 3. hook dispatch
//! 4. outward mirror
//!
//! A failing stage is recorded and the next stage still runs.
//!
//! [`EventLanes`] gives every (tenant, game server) pair its own ordered
//! lane, so events of one server are processed in arrival order while
//! different servers proceed in parallel.

use crate::commands::{CommandDispatchResult, CommandDispatcher};
use crate::error::EngineError;
use crate::event::{GameEvent, IngressEvent};
use crate::hooks::{HookDispatchResult, HookDispatcher};
use crate::mirror::{MirrorSet, MirroredEvent};
use crate::repository::Repository;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default number of events buffered per lane
pub const DEFAULT_LANE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PresenceSync,
    Commands,
    Hooks,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::PresenceSync => "presence-sync",
            Stage::Commands => "commands",
            Stage::Hooks => "hooks",
        })
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: EngineError,
}

/// Everything that happened to one event.
#[derive(Debug, Default)]
pub struct ProcessReport {
    /// Platform player id, when presence was synced
    pub player_id: Option<String>,
    pub commands: Option<CommandDispatchResult>,
    pub hooks: Option<HookDispatchResult>,
    pub mirror_failures: usize,
    pub stage_errors: Vec<StageFailure>,
}

impl ProcessReport {
    /// True when no stage failed and no item inside a stage failed.
    pub fn is_success(&self) -> bool {
        self.stage_errors.is_empty()
            && self.mirror_failures == 0
            && self.commands.as_ref().map_or(true, |c| c.is_success())
            && self.hooks.as_ref().map_or(true, |h| h.is_success())
    }

    fn fail(&mut self, stage: Stage, error: EngineError) {
        self.stage_errors.push(StageFailure { stage, error });
    }
}

pub struct EventWorker {
    repo: Arc<dyn Repository>,
    commands: CommandDispatcher,
    hooks: HookDispatcher,
    mirrors: MirrorSet,
}

impl EventWorker {
    pub fn new(
        repo: Arc<dyn Repository>,
        commands: CommandDispatcher,
        hooks: HookDispatcher,
        mirrors: MirrorSet,
    ) -> Self {
        Self {
            repo,
            commands,
            hooks,
            mirrors,
        }
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    pub async fn process(
        &self,
        tenant_id: &str,
        game_server_id: &str,
        event: &GameEvent,
    ) -> ProcessReport {
        let mut report = ProcessReport::default();

        let presence = match event {
            GameEvent::PlayerConnected(e) => Some((&e.player, true)),
            GameEvent::PlayerDisconnected(e) => Some((&e.player, false)),
            _ => None,
        };
        if let Some((player, online)) = presence {
            match self
                .repo
                .sync_player_presence(tenant_id, game_server_id, player, online)
                .await
            {
                Ok(player_id) => report.player_id = Some(player_id),
                Err(e) => report.fail(Stage::PresenceSync, e),
            }
        }

        if let GameEvent::ChatMessage(chat) = event {
            match self
                .commands
                .handle_chat_message(tenant_id, game_server_id, chat)
                .await
            {
                Ok(result) => report.commands = Some(result),
                Err(e) => report.fail(Stage::Commands, e),
            }
        }

        match self.hooks.handle_event(tenant_id, game_server_id, event).await {
            Ok(result) => report.hooks = Some(result),
            Err(e) => report.fail(Stage::Hooks, e),
        }

        report.mirror_failures = self
            .mirrors
            .publish(&MirroredEvent::new(tenant_id, game_server_id, event))
            .await;

        for failure in &report.stage_errors {
            warn!(
                tenant_id = %tenant_id,
                game_server_id = %game_server_id,
                event_type = %event.event_type(),
                stage = %failure.stage,
                error = %failure.error,
                "Event stage failed"
            );
        }

        report
    }
}

struct LaneItem {
    event: IngressEvent,
    done: Option<oneshot::Sender<ProcessReport>>,
}

struct Lane {
    sender: mpsc::Sender<LaneItem>,
    /// Events that found the channel full, in arrival order. Non-empty
    /// exactly while a feeder task is draining it.
    backlog: Arc<Mutex<VecDeque<LaneItem>>>,
    handle: JoinHandle<()>,
}

/// Ordered per-server processing lanes in front of an [`EventWorker`].
///
/// Submitting never waits on a busy lane: when a lane's channel is full the
/// event is parked in that lane's backlog and fed in order as room frees up,
/// so a slow server cannot hold up routing for the others.
pub struct EventLanes {
    worker: Arc<EventWorker>,
    lanes: DashMap<(String, String), Lane>,
    capacity: usize,
}

fn lock_backlog(backlog: &Mutex<VecDeque<LaneItem>>) -> MutexGuard<'_, VecDeque<LaneItem>> {
    backlog.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventLanes {
    pub fn new(worker: Arc<EventWorker>) -> Self {
        Self::with_capacity(worker, DEFAULT_LANE_CAPACITY)
    }

    pub fn with_capacity(worker: Arc<EventWorker>, capacity: usize) -> Self {
        Self {
            worker,
            lanes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of open lanes.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Events parked behind full lanes.
    pub fn backlog(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| lock_backlog(&lane.backlog).len())
            .sum()
    }

    fn spawn_lane(&self, tenant_id: &str, game_server_id: &str) -> Lane {
        let (sender, mut receiver) = mpsc::channel::<LaneItem>(self.capacity);
        let worker = self.worker.clone();
        let tenant_id = tenant_id.to_string();
        let game_server_id = game_server_id.to_string();

        let handle = tokio::spawn(async move {
            debug!(tenant_id = %tenant_id, game_server_id = %game_server_id, "Lane opened");
            while let Some(item) = receiver.recv().await {
                let report = worker
                    .process(
                        &item.event.tenant_id,
                        &item.event.game_server_id,
                        &item.event.event,
                    )
                    .await;
                if let Some(done) = item.done {
                    let _ = done.send(report);
                }
            }
            debug!(tenant_id = %tenant_id, game_server_id = %game_server_id, "Lane closed");
        });

        Lane {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            handle,
        }
    }

    /// Move parked events into the lane as permits become available.
    fn spawn_feeder(sender: mpsc::Sender<LaneItem>, backlog: Arc<Mutex<VecDeque<LaneItem>>>) {
        tokio::spawn(async move {
            loop {
                let permit = match sender.reserve().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Dropping the items drops their report senders, so
                        // tracked submitters see the event as not processed.
                        let dropped = std::mem::take(&mut *lock_backlog(&backlog));
                        warn!(dropped = dropped.len(), "Event lane closed with a backlog");
                        return;
                    }
                };

                let mut parked = lock_backlog(&backlog);
                match parked.pop_front() {
                    Some(item) => permit.send(item),
                    None => return,
                }
                if parked.is_empty() {
                    return;
                }
            }
        });
    }

    fn push(&self, item: LaneItem) -> Result<(), EngineError> {
        let key = (item.event.tenant_id.clone(), item.event.game_server_id.clone());
        let mut item = item;

        // The lane task is only ever gone by accident; reopen it once.
        for attempt in 0..2 {
            let lane = self
                .lanes
                .entry(key.clone())
                .or_insert_with(|| self.spawn_lane(&key.0, &key.1));

            let mut parked = lock_backlog(&lane.backlog);
            if !parked.is_empty() {
                parked.push_back(item);
                return Ok(());
            }

            match lane.sender.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(rejected)) => {
                    debug!(
                        tenant_id = %key.0,
                        game_server_id = %key.1,
                        "Event lane full, parking event"
                    );
                    parked.push_back(rejected);
                    Self::spawn_feeder(lane.sender.clone(), lane.backlog.clone());
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(rejected)) => {
                    item = rejected;
                }
            }

            drop(parked);
            drop(lane);
            if attempt == 0 {
                error!(
                    tenant_id = %key.0,
                    game_server_id = %key.1,
                    "Event lane closed unexpectedly, reopening"
                );
                self.lanes.remove(&key);
            }
        }

        Err(EngineError::Internal("event lane unavailable".to_string()))
    }

    /// Queue an event on its server's lane.
    pub async fn submit(&self, event: IngressEvent) -> Result<(), EngineError> {
        self.push(LaneItem { event, done: None })
    }

    /// Queue an event and get notified with its report once processed.
    pub async fn submit_tracked(
        &self,
        event: IngressEvent,
    ) -> Result<oneshot::Receiver<ProcessReport>, EngineError> {
        let (done, receiver) = oneshot::channel();
        self.push(LaneItem {
            event,
            done: Some(done),
        })?;
        Ok(receiver)
    }

    /// Close every lane and wait for queued events to finish.
    pub async fn shutdown(&self) {
        let keys: Vec<(String, String)> = self.lanes.iter().map(|l| l.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, lane)) = self.lanes.remove(&key) {
                drop(lane.sender);
                handles.push(lane.handle);
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Event lane task failed");
            }
        }
    }
}
