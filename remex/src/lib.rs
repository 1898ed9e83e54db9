#![deny(rust_2018_idioms)]

//! Remote-execution framework.
//!
//! A driver process submits units of work (a function reference plus its
//! arguments) to a [`Cluster`], which dispatches each unit to an agent
//! process running on a remote host. The agent executes the call in an
//! isolated child process and sends the result back over the same
//! connection. A layered directory-synchronization protocol keeps every
//! worker's code snapshot in step with the driver before tasks run on it.
//!
//! The driver side is a single-threaded cooperative scheduler: all of
//! [`Cluster`], [`Worker`] and [`Task`] must run inside a
//! `tokio::task::LocalSet`.

// This module contains the definition of `Config`.
pub mod config;

// This module contains the definition of `Value`, `Kwargs` and `Remotable`.
pub mod value;

// This module contains the wire messages exchanged with agents.
pub mod protocol;

// This module contains the framed object transport.
pub mod port;

// This module contains the wrapper around the external delta tool.
pub mod rdiff;

// This module contains the agent server and its admin surface.
pub mod agent;

// This module contains the definition of `Task` and `FuncRef`.
pub mod task;

// This module contains the definition of `Worker`.
pub mod worker;

// This module contains the definition of `SyncStack`.
pub mod sync;

// This module contains the definition of `Cluster` and its scheduler.
pub mod cluster;

// This module contains the definition of `Platform` and `Service`.
pub mod platform;

// Re-exports.
pub use cluster::Cluster;
pub use config::Config;
pub use task::{FuncRef, Task, TaskError, TaskState};
pub use value::{Kwargs, Remotable, Value};
pub use worker::Worker;

pub use hashbrown::{HashMap, HashSet};

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        ::tracing::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        ::tracing::trace!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        ::tracing::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        ::tracing::warn!($($arg)*)
    };
}
