//! Worker process specs, state, and spawning.
//!
//! A worker is an ordinary child process. The supervisor describes what to
//! run with a [`WorkerSpec`] and keeps platform signal details behind
//! [`parse_signal`] / [`send_signal`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

/// Specification of a worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Agent id this worker serves.
    pub agent_id: String,

    /// Program to execute.
    pub command: String,

    /// Program arguments.
    pub args: Vec<String>,

    /// Working directory.
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl WorkerSpec {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> WorkerSpecBuilder {
        WorkerSpecBuilder::default()
    }
}

/// Builder for [`WorkerSpec`].
#[derive(Debug, Default)]
pub struct WorkerSpecBuilder {
    agent_id: Option<String>,
    command: Option<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl WorkerSpecBuilder {
    /// Set the agent id.
    #[must_use]
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the program to execute.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Build the spec.
    ///
    /// # Panics
    ///
    /// Panics if `agent_id` or `command` is not set.
    #[must_use]
    pub fn build(self) -> WorkerSpec {
        WorkerSpec {
            agent_id: self.agent_id.expect("agent_id is required"),
            command: self.command.expect("command is required"),
            args: self.args,
            cwd: self.cwd,
            env: self.env,
        }
    }
}

/// Supervisor-side view of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerProcState {
    /// Spawned, first heartbeat not yet observed.
    Starting,
    /// Heartbeating and eligible to claim.
    Active,
    /// Dead, respawn scheduled.
    Restarting,
    /// Dead with no respawn scheduled (drained or disabled).
    Stopped,
}

impl std::fmt::Display for WorkerProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A spawned worker with its child handle and PID.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// The child process handle.
    pub child: Child,
    /// The OS process id.
    pub pid: u32,
}

/// Errors from spawning or signalling worker processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Failed to spawn the worker.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Invalid signal name.
    #[error("invalid signal name: {0}")]
    InvalidSignal(String),

    /// Failed to deliver a signal.
    #[error("failed to send signal: {0}")]
    SignalFailed(String),
}

/// Spawn a worker according to its specification.
///
/// Stdio is detached; workers write their own runtime logs.
///
/// # Errors
///
/// Returns [`ProcessError::SpawnFailed`] if the process cannot be spawned
/// or its PID cannot be obtained.
pub fn spawn(spec: &WorkerSpec) -> Result<SpawnedWorker, ProcessError> {
    let mut cmd = Command::new(&spec.command);

    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let child = cmd
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| ProcessError::SpawnFailed("failed to get process ID".to_string()))?;

    Ok(SpawnedWorker { child, pid })
}

/// Parse a signal name to the corresponding nix signal.
///
/// # Errors
///
/// Returns [`ProcessError::InvalidSignal`] if the name is not recognized.
pub fn parse_signal(name: &str) -> Result<nix::sys::signal::Signal, ProcessError> {
    use nix::sys::signal::Signal;

    let name = name.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    match name {
        "TERM" => Ok(Signal::SIGTERM),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "HUP" => Ok(Signal::SIGHUP),
        _ => Err(ProcessError::InvalidSignal(name.to_string())),
    }
}

/// Send a signal to a process by PID.
///
/// # Errors
///
/// Returns [`ProcessError::SignalFailed`] if delivery fails.
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    let pid = nix::unistd::Pid::from_raw(
        i32::try_from(pid).map_err(|_| ProcessError::SignalFailed(format!("pid {pid}")))?,
    );
    nix::sys::signal::kill(pid, signal).map_err(|e| ProcessError::SignalFailed(e.to_string()))
}
