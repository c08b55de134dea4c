#![forbid(unsafe_code)]

//! `moltd`: supervisor for a self-modifying autonomous agent.
//!
//! Schedules tasks over a pool of OS-isolated worker processes,
//! tracks spend against a budget ceiling, serializes repository
//! mutations behind a cross-process lock, and replaces its own process
//! image in place to load freshly-pushed code.

pub mod budget;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gitops;
pub mod lock;
pub mod logs;
pub mod mind;
pub mod models;
pub mod pool;
pub mod queue;
pub mod restart;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
