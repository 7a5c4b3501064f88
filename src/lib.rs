//! # hookline
//!
//! Event dispatch and action scheduling for multi-tenant game server
//! modules.
//!
//! ## Architecture
//!
//! ```text
//! Game server -> HTTP ingress -> Redis stream -> worker lanes
//!     -> presence sync -> commands -> hooks -> mirror
//!                            \          /
//!                             work queue  <- cron scheduler
//! ```
//!
//! Every hook match, parsed command and cron firing becomes an
//! [`model::ExecutionJob`] on the [`queue::WorkQueue`]; running the module
//! code is the job of an external sandboxed executor.
//!
//! ## Modules
//!
//! - [`event`]: game events and the ingress envelope
//! - [`model`]: tenant entities and execution jobs
//! - [`catalog`]: validated write-side definitions and seed files
//! - [`repository`] / [`storage`]: persistence contract and in-memory store
//! - [`connection`]: game connections and the single-flight registry
//! - [`hooks`]: regex hooks and their safety gate
//! - [`commands`]: chat command parsing and dispatch
//! - [`cronjobs`]: repeating schedules per installation
//! - [`worker`]: per-server ordered event processing
//! - [`mirror`]: outward real-time event mirroring

pub mod catalog;
pub mod commands;
pub mod config;
pub mod connection;
pub mod cronjobs;
pub mod error;
pub mod event;
pub mod hooks;
pub mod mirror;
pub mod model;
pub mod queue;
pub mod repository;
pub mod shutdown;
pub mod storage;
pub mod worker;

pub use error::{EngineError, QueueError};
pub use event::{EventType, GameEvent, IngressEvent, PlayerRef};
pub use repository::Repository;
pub use worker::{EventLanes, EventWorker};

/// Redis stream the ingress server appends events to
pub const EVENT_STREAM_NAME: &str = "hookline:events";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "hookline_workers";
