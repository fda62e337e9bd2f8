//! OS process primitives
//!
//! Spawning turns a [`LaunchSpec`] into an [`AppProcess`]: two lazy streams of
//! output chunks and a single exit future. Terminating trees and reading
//! resource usage sit behind [`ProcessControl`] so the supervisor can be tested
//! without touching real signals.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::launch::LaunchSpec;

/// Lazy stream of raw output chunks
pub type OutputStream = BoxStream<'static, io::Result<Bytes>>;

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,

    /// Terminating signal number on Unix
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A spawned child
pub struct AppProcess {
    pub pid: u32,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: BoxFuture<'static, io::Result<ExitInfo>>,
}

/// Spawn the launch spec through the platform shell.
///
/// On Unix the child leads its own process group so the whole tree can be
/// signalled at once.
pub fn spawn_app(spec: &LaunchSpec) -> io::Result<AppProcess> {
    let mut cmd = shell_command(&spec.command_line());
    cmd.current_dir(&spec.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("spawned process has no pid"))?;

    debug!("Spawned `{}` in {} as PID {}", spec.command_line(), spec.working_directory.display(), pid);

    let stdout = match child.stdout.take() {
        Some(out) => ReaderStream::new(out).boxed(),
        None => stream::empty::<io::Result<Bytes>>().boxed(),
    };
    let stderr = match child.stderr.take() {
        Some(err) => ReaderStream::new(err).boxed(),
        None => stream::empty::<io::Result<Bytes>>().boxed(),
    };
    let exit = async move { child.wait().await.map(ExitInfo::from) }.boxed();

    Ok(AppProcess {
        pid,
        stdout,
        stderr,
        exit,
    })
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

/// Signal used to terminate a process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// Polite termination (SIGTERM)
    Terminate,
    /// Forceful termination (SIGKILL)
    Kill,
}

impl TreeSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeSignal::Terminate => "SIGTERM",
            TreeSignal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for TreeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage of one process tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in percent of one core
    pub cpu_percent: f64,

    /// Resident memory in bytes
    pub memory_bytes: u64,
}

/// OS primitives used by the supervisor
pub trait ProcessControl: Send + Sync {
    /// Send `signal` to `pid` and all its descendants
    fn terminate_tree(&self, pid: u32, signal: TreeSignal) -> Result<()>;

    /// Usage of each requested tree, keyed by root pid. Vanished pids are omitted.
    fn resource_usage(&self, pids: &[u32]) -> Result<HashMap<u32, ResourceUsage>>;
}

/// [`ProcessControl`] on the host OS, via `nix` signals and `sysinfo`
pub struct NativeProcessControl {
    /// Kept between calls so CPU usage is measured over the polling interval
    system: Mutex<System>,
}

impl Default for NativeProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeProcessControl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh(&self, kind: ProcessRefreshKind) -> parking_lot::MutexGuard<'_, System> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
        system
    }
}

/// Build parent -> children map from a refreshed process table
fn children_map(system: &System) -> HashMap<u32, Vec<u32>> {
    let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        // Threads are listed as processes on Linux; they share their owner's memory
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            map.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    map
}

/// `root` followed by all of its descendants
fn tree_of(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut tree = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![root];

    while let Some(pid) = pending.pop() {
        if !seen.insert(pid) {
            continue;
        }
        tree.push(pid);
        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied());
        }
    }
    tree
}

impl ProcessControl for NativeProcessControl {
    fn terminate_tree(&self, pid: u32, signal: TreeSignal) -> Result<()> {
        // PID 0 and 1 would hit the daemon's own group or init
        if pid <= 1 {
            return Ok(());
        }

        let tree = {
            let system = self.refresh(ProcessRefreshKind::new());
            tree_of(&children_map(&system), pid)
        };
        debug!("Sending {} to tree of PID {} ({} processes)", signal, pid, tree.len());

        signal_tree(pid, &tree, signal)
    }

    fn resource_usage(&self, pids: &[u32]) -> Result<HashMap<u32, ResourceUsage>> {
        if pids.is_empty() {
            return Ok(HashMap::new());
        }

        let system = self.refresh(ProcessRefreshKind::new().with_cpu().with_memory());
        let children = children_map(&system);

        let mut usage = HashMap::new();
        for &root in pids {
            if system.process(SysPid::from_u32(root)).is_none() {
                continue;
            }

            let mut total = ResourceUsage::default();
            for pid in tree_of(&children, root) {
                if let Some(process) = system.process(SysPid::from_u32(pid)) {
                    total.cpu_percent += process.cpu_usage() as f64;
                    total.memory_bytes += process.memory();
                }
            }
            usage.insert(root, total);
        }

        if usage.is_empty() {
            return Err(SupervisorError::ResourceQuery(format!(
                "no such process: {:?}",
                pids
            )));
        }
        Ok(usage)
    }
}

#[cfg(unix)]
fn signal_tree(root: u32, tree: &[u32], signal: TreeSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };

    // The child leads its own group; this reaches every member still in it
    match killpg(Pid::from_raw(root as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to signal process group {}: {}", root, e),
    }

    // Descendants that left the group
    for &pid in tree.iter().filter(|&&p| p != root) {
        let _ = kill(Pid::from_raw(pid as i32), sig);
    }

    match kill(Pid::from_raw(root as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Termination(format!(
            "{} to PID {}: {}",
            signal, root, e
        ))),
    }
}

#[cfg(not(unix))]
fn signal_tree(root: u32, tree: &[u32], signal: TreeSignal) -> Result<()> {
    use sysinfo::Signal;

    let sig = match signal {
        TreeSignal::Terminate => Signal::Term,
        TreeSignal::Kill => Signal::Kill,
    };

    let mut system = System::new();
    let pids: Vec<SysPid> = tree.iter().map(|&p| SysPid::from_u32(p)).collect();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, ProcessRefreshKind::new());

    // Leaves first so the root cannot respawn them
    for pid in pids.iter().rev() {
        if let Some(process) = system.process(*pid) {
            if process.kill_with(sig).is_none() {
                process.kill();
            }
        }
    }

    if system.process(SysPid::from_u32(root)).is_none() && !tree.is_empty() {
        debug!("Root PID {} already gone", root);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_tree_of_walks_descendants_once() {
        let mut children = HashMap::new();
        children.insert(10, vec![11, 12]);
        children.insert(11, vec![13]);
        children.insert(13, vec![10]); // cycle guard

        let mut tree = tree_of(&children, 10);
        tree.sort();
        assert_eq!(tree, vec![10, 11, 12, 13]);
        assert_eq!(tree_of(&children, 99), vec![99]);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(TreeSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(TreeSignal::Kill.as_str(), "SIGKILL");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            command: "echo".into(),
            args: vec!["out;".into(), "echo".into(), "err".into(), "1>&2;".into(), "exit".into(), "3".into()],
            working_directory: dir.path().to_path_buf(),
        };

        let process = spawn_app(&spec).unwrap();
        assert!(process.pid > 1);

        let stdout: Vec<Bytes> = process.stdout.map(|c| c.unwrap()).collect().await;
        let stderr: Vec<Bytes> = process.stderr.map(|c| c.unwrap()).collect().await;
        let exit = process.exit.await.unwrap();

        assert_eq!(stdout.concat(), b"out\n");
        assert_eq!(stderr.concat(), b"err\n");
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_spawn_in_missing_directory_fails() {
        let spec = LaunchSpec {
            command: "true".into(),
            args: vec![],
            working_directory: PathBuf::from("/definitely/not/here"),
        };
        assert!(spawn_app(&spec).is_err());
    }

    #[test]
    fn test_resource_usage_of_missing_pid_errors() {
        let control = NativeProcessControl::new();
        assert!(control.resource_usage(&[]).unwrap().is_empty());
        assert!(control.resource_usage(&[u32::MAX - 1]).is_err());
    }

    #[test]
    fn test_resource_usage_of_self() {
        let control = NativeProcessControl::new();
        let me = std::process::id();
        let usage = control.resource_usage(&[me]).unwrap();
        assert!(usage[&me].memory_bytes > 0);
    }
}
