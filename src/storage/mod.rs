//! Repository implementations shipped with the engine.
//!
//! Production deployments put the platform database behind
//! [`crate::repository::Repository`]; the in-memory implementation here
//! backs tests and single-process setups seeded from a
//! [`crate::catalog::Catalog`].

pub mod memory;

pub use memory::MemoryRepository;
