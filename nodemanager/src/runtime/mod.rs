//! Process runtime
//!
//! Everything that touches child processes:
//!
//! - **Registry**: which apps are running, keyed by `(project id, app name)`
//! - **Process primitives**: spawning, tree termination, resource usage
//! - **Supervisor**: start/stop/kill/restart orchestration and the output pipeline
//! - **StatsCollector**: on-demand CPU and memory per app
//!
//! # Usage
//!
//! ```rust,no_run
//! use nodemanager::config::SupervisorConfig;
//! use nodemanager::events::EventBroadcaster;
//! use nodemanager::project::JsonProjectStore;
//! use nodemanager::runtime::Supervisor;
//! use std::sync::Arc;
//!
//! # async fn example() -> nodemanager::error::Result<()> {
//! let store = Arc::new(JsonProjectStore::new("projects.json"));
//! let supervisor = Supervisor::builder(store, EventBroadcaster::default())
//!     .config(SupervisorConfig::default())
//!     .build();
//!
//! supervisor.start("42", "default").await?;
//! let stats = supervisor.stats_collector().stats("42").await;
//! println!("running: {}", stats.running);
//!
//! supervisor.stop("42", "default").await?;
//! # Ok(())
//! # }
//! ```

pub mod process;
pub mod registry;
pub mod stats;
pub mod supervisor;

pub use process::{
    AppProcess,
    ExitInfo,
    NativeProcessControl,
    ProcessControl,
    ResourceUsage,
    TreeSignal,
    spawn_app,
};

pub use registry::{AppKey, Registry, RunningApp};
pub use stats::{AppStats, ProjectStats, StatsCollector};
pub use supervisor::{RestartMode, Supervisor, SupervisorBuilder};
