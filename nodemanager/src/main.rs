//! Node Manager CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the supervisor daemon
//! nodemanager serve --port 3000 --projects ./projects.json
//!
//! # Show what `start` would run for a project directory
//! nodemanager resolve ./my-app --app web
//!
//! # Inspect or change the configuration file
//! nodemanager config get server.port
//! nodemanager config set supervisor.restart_grace_ms 2000
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};

use nodemanager::config::{CONFIG_FILE_NAME, NodeManagerConfig};
use nodemanager::events::EventBroadcaster;
use nodemanager::launch::{DEFAULT_APP, LaunchResolver};
use nodemanager::project::{JsonProjectStore, Project};
use nodemanager::runtime::Supervisor;

#[derive(Parser)]
#[command(name = "nodemanager")]
#[command(about = "Node Manager - local development process supervisor", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./nodemanager.toml when present)
    #[arg(short, long, global = true, env = "NODEMANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor with its HTTP and WebSocket API
    Serve {
        /// Host to bind
        #[arg(long, env = "NODEMANAGER_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "NODEMANAGER_PORT")]
        port: Option<u16>,

        /// Project records file
        #[arg(long, env = "NODEMANAGER_PROJECTS")]
        projects: Option<PathBuf>,
    },

    /// Print the launch spec of an app as JSON
    Resolve {
        /// Project root directory
        root: PathBuf,

        /// App name
        #[arg(short, long, default_value = DEFAULT_APP)]
        app: String,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Configuration value
        value: String,
    },

    /// Print the effective configuration
    List,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone();
    let mut config = NodeManagerConfig::load(config_path.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            projects,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(projects) = projects {
                config.store.projects_file = projects;
            }
            serve(config).await?;
        }

        Commands::Resolve { root, app } => {
            let root = root
                .canonicalize()
                .with_context(|| format!("Project root {} not found", root.display()))?;
            let project = Project::new("local", root);
            let spec = LaunchResolver::default().resolve(&project, &app).await;
            println!("{}", serde_json::to_string_pretty(&spec)?);
        }

        Commands::Config(config_cmd) => {
            let path = config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            match config_cmd {
                ConfigCommands::Get { key } => {
                    println!("{}", config.get(&key)?);
                }
                ConfigCommands::Set { key, value } => {
                    config.set(&key, &value)?;
                    config.save_to_path(&path)?;
                    println!("Set {} = {} in {}", key, value, path.display());
                }
                ConfigCommands::List => {
                    print!(
                        "{}",
                        toml::to_string_pretty(&config).context("Failed to serialize configuration")?
                    );
                }
            }
        }
    }

    Ok(())
}

async fn serve(config: NodeManagerConfig) -> Result<()> {
    let store = Arc::new(JsonProjectStore::new(&config.store.projects_file));
    info!("Using project records from {}", store.path().display());

    // Nothing survives a daemon restart, so recorded statuses are stale
    match store.reset_statuses().await {
        Ok(0) => {}
        Ok(n) => info!("Reset {} stale project statuses to stopped", n),
        Err(e) => warn!("Failed to reset project statuses: {}", e),
    }

    let events = EventBroadcaster::new(config.supervisor.channel_capacity);
    let supervisor = Supervisor::builder(store, events)
        .config(config.supervisor.clone())
        .build();

    nodemanager::api::start_server(supervisor, &config.server.host, config.server.port, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("nodemanager=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nodemanager=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
