//! Node Manager - local development process supervisor
//!
//! Runs the apps of filesystem-resident projects, streams their output to
//! subscribers and reports their resource usage.
//!
//! # Architecture
//!
//! - `launch` - resolves what to run for a project and app name
//! - `runtime` - process registry, OS primitives, supervisor and stats
//! - `events` - per-channel publish/subscribe for output and lifecycle events
//! - `project` - project records and their persisted status
//! - `api` - HTTP commands and WebSocket subscriptions
//! - `config` - daemon configuration

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod launch;
pub mod project;
pub mod runtime;

pub use error::{Result, SupervisorError};
pub use runtime::{RestartMode, Supervisor};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
