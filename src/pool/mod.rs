//! Worker-pool subsystem: spawning, liveness policy, stdio framing.

pub mod codec;
pub mod health;
pub mod spawner;
pub mod worker_pool;

pub use health::{classify_timeout, CrashWindow, StormVerdict, TimeoutAction};
pub use worker_pool::{DeadWorker, WorkerPool};
