//! Process supervisor
//!
//! Orchestrates the lifecycle of every app: claims registry keys, resolves and
//! spawns launch specs, pumps child output into the broadcaster and releases
//! the key once the child has exited. Stop, kill and restart return as soon as
//! the signal is sent; the `lifecycle:<project>` channel confirms what the OS
//! did afterwards.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::process::{
    AppProcess,
    NativeProcessControl,
    OutputStream,
    ProcessControl,
    TreeSignal,
    spawn_app,
};
use super::registry::{AppKey, Registry};
use super::stats::StatsCollector;
use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventBroadcaster, LifecycleEvent, LogRoute};
use crate::launch::LaunchResolver;
use crate::project::{ProjectStatus, ProjectStore};

/// What a restart request turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// The app was running; a fresh start follows after the grace delay
    Restarting,
    /// The app was not running and has been started directly
    Started,
}

impl RestartMode {
    pub fn message(&self) -> &'static str {
        match self {
            RestartMode::Restarting => "Restarting...",
            RestartMode::Started => "Started",
        }
    }
}

struct Inner {
    registry: Arc<Registry>,
    resolver: LaunchResolver,
    store: Arc<dyn ProjectStore>,
    control: Arc<dyn ProcessControl>,
    events: EventBroadcaster,
    config: SupervisorConfig,

    /// Serializes registry read + status write so the last write wins with fresh state
    status_lock: Mutex<()>,
}

/// Process supervisor, cheap to clone
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Builder for [`Supervisor`]
pub struct SupervisorBuilder {
    store: Arc<dyn ProjectStore>,
    events: EventBroadcaster,
    registry: Option<Arc<Registry>>,
    resolver: Option<LaunchResolver>,
    control: Option<Arc<dyn ProcessControl>>,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resolver(mut self, resolver: LaunchResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Supervisor {
        Supervisor {
            inner: Arc::new(Inner {
                registry: self.registry.unwrap_or_default(),
                resolver: self.resolver.unwrap_or_default(),
                store: self.store,
                control: self
                    .control
                    .unwrap_or_else(|| Arc::new(NativeProcessControl::new())),
                events: self.events,
                config: self.config,
                status_lock: Mutex::new(()),
            }),
        }
    }
}

impl Supervisor {
    pub fn builder(store: Arc<dyn ProjectStore>, events: EventBroadcaster) -> SupervisorBuilder {
        SupervisorBuilder {
            store,
            events,
            registry: None,
            resolver: None,
            control: None,
            config: SupervisorConfig::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Stats collector sharing this supervisor's registry and OS primitives
    pub fn stats_collector(&self) -> StatsCollector {
        StatsCollector::new(self.inner.registry.clone(), self.inner.control.clone())
    }

    /// Names of the registered apps of a project, sorted
    pub fn running_apps(&self, project_id: &str) -> Vec<String> {
        self.inner
            .registry
            .snapshot(project_id)
            .into_iter()
            .map(|app| app.app_name)
            .collect()
    }

    /// Start an app.
    ///
    /// Spawn failures are reported on the app's log channels, not returned.
    pub async fn start(&self, project_id: &str, app_name: &str) -> Result<()> {
        let key = AppKey::new(project_id, app_name);
        let generation = self.inner.registry.claim(&key)?;
        self.launch(key, generation).await
    }

    async fn launch(&self, key: AppKey, generation: u64) -> Result<()> {
        let project = match self.inner.store.get_project(&key.project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                self.inner.registry.release(&key, generation);
                return Err(SupervisorError::ProjectNotFound(key.project_id));
            }
            Err(e) => {
                self.inner.registry.release(&key, generation);
                return Err(e);
            }
        };

        let spec = self.inner.resolver.resolve(&project, &key.app_name).await;
        let route = LogRoute::new(&key.project_id, &key.app_name);

        info!(
            "Starting {} with `{}` in {}",
            key,
            spec.command_line(),
            spec.working_directory.display()
        );

        let process = match spawn_app(&spec) {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start {}: {}", key, e);
                let message = format!("Failed to start process {}: {}", key.app_name, e);
                self.inner.events.publish_log(&route, &message);
                self.inner.events.publish_lifecycle(
                    &key.project_id,
                    &LifecycleEvent::SpawnFailed {
                        app: key.app_name.clone(),
                        error: e.to_string(),
                    },
                );
                self.inner.registry.release(&key, generation);
                self.sync_status(&key.project_id).await;
                return Ok(());
            }
        };

        let pid = process.pid;
        if !self.inner.registry.attach_pid(&key, generation, pid) {
            warn!("Registry entry of {} was replaced while spawning PID {}", key, pid);
        }
        info!("Started {} as PID {} (generation {})", key, pid, generation);

        self.sync_status(&key.project_id).await;
        self.inner.events.publish_lifecycle(
            &key.project_id,
            &LifecycleEvent::Started {
                app: key.app_name.clone(),
                pid,
                generation,
            },
        );

        tokio::spawn(self.clone().supervise(key, generation, route, process));
        Ok(())
    }

    /// Output pipeline and exit handling of one incarnation
    async fn supervise(self, key: AppKey, generation: u64, route: LogRoute, process: AppProcess) {
        let AppProcess {
            pid,
            stdout,
            stderr,
            exit,
        } = process;

        let events = &self.inner.events;
        let out = tokio::spawn(pump_output(events.clone(), route.clone(), stdout));
        let err = tokio::spawn(pump_output(events.clone(), route.clone(), stderr));

        let code = match exit.await {
            Ok(info) => {
                if let Some(signal) = info.signal {
                    debug!("{} (PID {}) terminated by signal {}", key, pid, signal);
                }
                info.code
            }
            Err(e) => {
                error!("Failed to wait for {} (PID {}): {}", key, pid, e);
                None
            }
        };

        // Descendants may keep the pipes open after the child itself is gone
        let drained = tokio::time::timeout(self.inner.config.output_drain(), async {
            let _ = out.await;
            let _ = err.await;
        })
        .await;
        if drained.is_err() {
            debug!("Output of {} still open after exit, not waiting", key);
        }

        let code_text = code.map_or_else(|| "null".to_string(), |c| c.to_string());
        info!("{} (PID {}) exited with code {}", key, pid, code_text);
        events.publish_log(
            &route,
            &format!("Process {} exited with code {}", key.app_name, code_text),
        );

        if self.inner.registry.release(&key, generation).is_none() {
            debug!("{} generation {} was already replaced", key, generation);
        }
        events.publish_lifecycle(
            &key.project_id,
            &LifecycleEvent::Exited {
                app: key.app_name.clone(),
                code,
                generation,
            },
        );
        self.sync_status(&key.project_id).await;
    }

    /// Request termination of an app's process tree with SIGTERM
    pub async fn stop(&self, project_id: &str, app_name: &str) -> Result<()> {
        self.signal(project_id, app_name, TreeSignal::Terminate).await
    }

    /// Request termination of an app's process tree with SIGKILL
    pub async fn kill(&self, project_id: &str, app_name: &str) -> Result<()> {
        self.signal(project_id, app_name, TreeSignal::Kill).await
    }

    async fn signal(&self, project_id: &str, app_name: &str, signal: TreeSignal) -> Result<()> {
        let key = AppKey::new(project_id, app_name);
        let pid = self
            .inner
            .registry
            .get(&key)
            .and_then(|app| app.pid)
            .ok_or_else(|| SupervisorError::NotRunning {
                project_id: project_id.to_string(),
                app: app_name.to_string(),
            })?;

        info!("Sending {} to {} (PID {})", signal, key, pid);
        self.terminate(&key, pid, signal).await;
        self.inner.events.publish_lifecycle(
            project_id,
            &LifecycleEvent::StopRequested {
                app: app_name.to_string(),
                signal: signal.to_string(),
            },
        );
        Ok(())
    }

    async fn terminate(&self, key: &AppKey, pid: u32, signal: TreeSignal) {
        let control = self.inner.control.clone();
        match tokio::task::spawn_blocking(move || control.terminate_tree(pid, signal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to send {} to {}: {}", signal, key, e),
            Err(e) => error!("Signal task for {} failed: {}", key, e),
        }
    }

    /// Restart an app, or start it if it is not running.
    ///
    /// A running app gets SIGTERM; after the restart grace delay its entry is
    /// evicted (if it is still the same incarnation) and the app is started
    /// again in the background.
    pub async fn restart(&self, project_id: &str, app_name: &str) -> Result<RestartMode> {
        if self.inner.store.get_project(project_id).await?.is_none() {
            return Err(SupervisorError::ProjectNotFound(project_id.to_string()));
        }

        let key = AppKey::new(project_id, app_name);
        let Some(current) = self.inner.registry.get(&key) else {
            self.start(project_id, app_name).await?;
            return Ok(RestartMode::Started);
        };

        if let Some(pid) = current.pid {
            info!("Restarting {} (PID {})", key, pid);
            self.terminate(&key, pid, TreeSignal::Terminate).await;
        }

        let delay = self.inner.config.restart_grace();
        self.inner.events.publish_lifecycle(
            project_id,
            &LifecycleEvent::RestartScheduled {
                app: app_name.to_string(),
                delay_ms: delay.as_millis() as u64,
            },
        );

        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.restart_after_grace(key, current.generation, current.pid).await;
        });

        Ok(RestartMode::Restarting)
    }

    async fn restart_after_grace(&self, key: AppKey, generation: u64, signalled: Option<u32>) {
        if let Some(stale) = self.inner.registry.release(&key, generation) {
            debug!("Evicted {} generation {} before restart", key, generation);
            // The pid was attached after the restart request and never signalled
            if let Some(pid) = stale.pid.filter(|pid| Some(*pid) != signalled) {
                self.terminate(&key, pid, TreeSignal::Terminate).await;
            }
        }

        match self.start(&key.project_id, &key.app_name).await {
            Ok(()) => {}
            Err(SupervisorError::AlreadyRunning { .. }) => {
                info!("Skipping restart of {}: a newer instance is already running", key);
            }
            Err(e) => {
                error!("Restart of {} failed: {}", key, e);
                self.sync_status(&key.project_id).await;
            }
        }
    }

    /// SIGTERM every registered process tree
    pub async fn shutdown(&self) {
        let apps = self.inner.registry.all();
        if apps.is_empty() {
            return;
        }

        info!("Stopping {} running apps", apps.len());
        for app in apps {
            if let Some(pid) = app.pid {
                let key = AppKey::new(app.project_id, app.app_name);
                self.terminate(&key, pid, TreeSignal::Terminate).await;
            }
        }
    }

    /// Persist `running` iff the registry holds an app for the project
    async fn sync_status(&self, project_id: &str) {
        let _guard = self.inner.status_lock.lock().await;
        let status = if self.inner.registry.is_project_running(project_id) {
            ProjectStatus::Running
        } else {
            ProjectStatus::Stopped
        };

        if let Err(e) = self.inner.store.set_status(project_id, status).await {
            warn!("Failed to persist status of project {}: {}", project_id, e);
        }
    }
}

async fn pump_output(events: EventBroadcaster, route: LogRoute, mut output: OutputStream) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => events.publish_log(&route, &String::from_utf8_lossy(&bytes)),
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        }
    }
}
