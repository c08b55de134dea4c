//! Worker-process runtime (the `worker` subcommand).

pub mod runtime;

pub use runtime::run_worker;
