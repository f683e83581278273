//! Supervision of per-agent worker processes.
//!
//! The supervisor spawns one `swarm-worker` subprocess per agent, watches
//! process exit and heartbeat liveness, restarts dead workers under a
//! bounded backoff budget, and drains everything on shutdown. Every
//! lifecycle transition is published as a durable control event so the
//! projection (and the operators reading it) see the same history the
//! supervisor acted on.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use hive_core::event::{iso_now, NewEvent};
use hive_core::process::{self, WorkerProcState, WorkerSpec};
use hive_core::restart::{RestartConfig, RestartDecision, RestartManager};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::mailstore::{MailStore, MailStoreConfig, MailStoreError};

/// Errors from supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The mailstore failed; fatal for the supervisor process.
    #[error(transparent)]
    Store(#[from] MailStoreError),

    /// Spawning or signalling a worker failed.
    #[error(transparent)]
    Process(#[from] hive_core::process::ProcessError),

    /// A configured worktree is missing.
    #[error("missing worktree for agent '{agent_id}': {}", path.display())]
    MissingWorktree {
        /// Agent whose worktree is absent.
        agent_id: String,
        /// The configured path.
        path: PathBuf,
    },

    /// The agent roster was empty after normalization.
    #[error("supervisor requires at least one agent id")]
    NoAgents,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Mailstore database path.
    pub db_path: PathBuf,
    /// Agents to supervise (normalized lowercase).
    pub agents: Vec<String>,
    /// Worker binary to spawn; defaults to the `swarm-worker` next to the
    /// running executable.
    pub worker_program: PathBuf,
    /// Lease window workers request per claim.
    pub lease_seconds: f64,
    /// Sleep between empty worker claim attempts.
    pub claim_poll: Duration,
    /// Whether workers also claim unrouted events.
    pub include_unrouted: bool,
    /// Supervisor heartbeat cadence `H`.
    pub heartbeat_interval: Duration,
    /// Liveness deadline; a worker silent for longer is presumed dead.
    pub heartbeat_timeout: Duration,
    /// Restart/backoff budget.
    pub restart: RestartConfig,
    /// Directory for per-worker runtime logs.
    pub runtime_log_dir: PathBuf,
    /// Workspace root per agent.
    pub workspace_roots: HashMap<String, PathBuf>,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub shutdown_grace: Duration,
    /// Monitor loop tick.
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    /// Reasonable defaults around a database path and an agent roster.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, agents: Vec<String>) -> Self {
        Self {
            db_path: db_path.into(),
            agents,
            worker_program: default_worker_program(),
            lease_seconds: 15.0,
            claim_poll: Duration::from_millis(200),
            include_unrouted: false,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            restart: RestartConfig::default(),
            runtime_log_dir: PathBuf::from("hive_state/workers"),
            workspace_roots: HashMap::new(),
            shutdown_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// The `swarm-worker` binary shipped next to the current executable.
#[must_use]
pub fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("swarm-worker")))
        .unwrap_or_else(|| PathBuf::from("swarm-worker"))
}

struct WorkerEntry {
    child: tokio::process::Child,
    pid: u32,
    consumer_id: String,
    spawned_at: Instant,
    state: WorkerProcState,
}

/// Supervises per-agent workers with durable liveness and bounded restarts.
pub struct Supervisor {
    config: SupervisorConfig,
    mail_store: MailStore,
    workers: HashMap<String, WorkerEntry>,
    restart_managers: HashMap<String, RestartManager>,
    scheduled_restarts: HashMap<String, Instant>,
    disabled: HashSet<String>,
    recent_control_keys: HashMap<String, Instant>,
}

impl Supervisor {
    /// Open the mailstore and build a supervisor.
    pub fn new(mut config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.agents = config
            .agents
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        if config.agents.is_empty() {
            return Err(SupervisorError::NoAgents);
        }
        config.heartbeat_timeout = config.heartbeat_timeout.max(config.heartbeat_interval * 2);

        let mail_store = MailStore::open(
            &config.db_path,
            MailStoreConfig {
                lease_seconds: config.lease_seconds,
                ..MailStoreConfig::default()
            },
        )?;
        let restart_managers = config
            .agents
            .iter()
            .map(|agent| (agent.clone(), RestartManager::new(config.restart.clone())))
            .collect();

        Ok(Self {
            config,
            mail_store,
            workers: HashMap::new(),
            restart_managers,
            scheduled_restarts: HashMap::new(),
            disabled: HashSet::new(),
            recent_control_keys: HashMap::new(),
        })
    }

    /// The mailstore handle (shared with producers in tests).
    #[must_use]
    pub fn mail_store(&self) -> &MailStore {
        &self.mail_store
    }

    /// Run until cancelled or until `duration` elapses, then drain.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        duration: Option<Duration>,
    ) -> Result<(), SupervisorError> {
        self.start()?;
        let deadline = duration.map(|d| Instant::now() + d);
        let mut next_heartbeat = Instant::now() + self.config.heartbeat_interval;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            self.monitor_workers().await?;

            if Instant::now() >= next_heartbeat {
                self.publish_heartbeats()?;
                next_heartbeat = Instant::now() + self.config.heartbeat_interval;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }

        self.stop().await
    }

    /// Emit `SUPERVISOR_START` and spawn every enabled worker.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(&self.config.runtime_log_dir)?;
        info!(agents = ?self.config.agents, db = %self.config.db_path.display(), "supervisor starting");

        self.publish_control_event(
            "SUPERVISOR_START",
            None,
            format!("supervisor_start:{}", Utc::now().timestamp_micros()),
            Duration::from_secs(1),
            json!({
                "agents": self.config.agents,
                "db_path": self.config.db_path.display().to_string(),
            }),
        )?;

        let agents: Vec<String> = self.config.agents.clone();
        for agent in agents {
            if !self.disabled.contains(&agent) && !self.workers.contains_key(&agent) {
                self.spawn_worker(&agent, false)?;
            }
        }
        Ok(())
    }

    /// Drain all workers and emit `SUPERVISOR_STOP`.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let agents: Vec<String> = self.workers.keys().cloned().collect();
        for agent in agents {
            let Some(mut entry) = self.workers.remove(&agent) else {
                continue;
            };
            let exit_code = match entry.child.try_wait() {
                Ok(Some(status)) => status.code(),
                _ => {
                    if let Err(err) =
                        process::send_signal(entry.pid, nix::sys::signal::Signal::SIGTERM)
                    {
                        warn!(agent_id = %agent, %err, "SIGTERM delivery failed");
                    }
                    match tokio::time::timeout(self.config.shutdown_grace, entry.child.wait())
                        .await
                    {
                        Ok(Ok(status)) => status.code(),
                        Ok(Err(err)) => {
                            warn!(agent_id = %agent, %err, "wait failed during drain");
                            None
                        },
                        Err(_) => {
                            warn!(agent_id = %agent, "graceful deadline passed; killing");
                            let _ = entry.child.kill().await;
                            None
                        },
                    }
                },
            };
            entry.state = WorkerProcState::Stopped;
            self.record_worker_event(
                "WORKER_EXITED",
                &agent,
                json!({ "exit_code": exit_code, "reason": "stop" }),
            )?;
        }

        self.publish_control_event(
            "SUPERVISOR_STOP",
            None,
            format!("supervisor_stop:{}", Utc::now().timestamp_micros()),
            Duration::from_secs(1),
            json!({}),
        )?;
        info!("supervisor stopped");
        Ok(())
    }

    /// Publish an event on behalf of a producer (operator surface).
    pub fn publish_event(&self, event: NewEvent) -> Result<i64, MailStoreError> {
        self.mail_store.publish(event)
    }

    /// PIDs of currently live workers.
    #[must_use]
    pub fn worker_pids(&self) -> HashMap<String, u32> {
        self.workers
            .iter()
            .map(|(agent, entry)| (agent.clone(), entry.pid))
            .collect()
    }

    /// Current supervision state per live worker.
    #[must_use]
    pub fn worker_states(&self) -> HashMap<String, WorkerProcState> {
        self.workers
            .iter()
            .map(|(agent, entry)| (agent.clone(), entry.state))
            .collect()
    }

    /// Total restarts recorded for an agent.
    #[must_use]
    pub fn restart_count(&self, agent_id: &str) -> u32 {
        self.restart_managers
            .get(&agent_id.trim().to_ascii_lowercase())
            .map_or(0, RestartManager::restart_count)
    }

    /// Whether an agent has been disabled by the restart budget.
    #[must_use]
    pub fn is_worker_disabled(&self, agent_id: &str) -> bool {
        self.disabled
            .contains(&agent_id.trim().to_ascii_lowercase())
    }

    /// Manual reset of a disabled worker; it respawns on the next monitor
    /// tick.
    pub fn reset_worker(&mut self, agent_id: &str) {
        let normalized = agent_id.trim().to_ascii_lowercase();
        if self.disabled.remove(&normalized) {
            if let Some(manager) = self.restart_managers.get_mut(&normalized) {
                manager.reset();
            }
            self.scheduled_restarts
                .insert(normalized, Instant::now());
        }
    }

    /// Forcibly kill a worker process (test and operator hook).
    pub fn kill_worker(&mut self, agent_id: &str) -> bool {
        let normalized = agent_id.trim().to_ascii_lowercase();
        if let Some(entry) = self.workers.get_mut(&normalized) {
            let killed = entry.child.start_kill().is_ok();
            warn!(agent_id = %normalized, pid = entry.pid, "worker killed on request");
            return killed;
        }
        false
    }

    async fn monitor_workers(&mut self) -> Result<(), SupervisorError> {
        let agents: Vec<String> = self.workers.keys().cloned().collect();
        for agent in agents {
            let exited = match self.workers.get_mut(&agent) {
                Some(entry) => entry.child.try_wait().ok().flatten(),
                None => continue,
            };

            if let Some(status) = exited {
                self.workers.remove(&agent);
                self.record_worker_event(
                    "WORKER_EXITED",
                    &agent,
                    json!({ "exit_code": status.code(), "reason": "process_exit" }),
                )?;
                self.schedule_restart_or_disable(&agent, "process_exit")?;
                continue;
            }

            if self.heartbeat_stale(&agent)? {
                let Some(mut entry) = self.workers.remove(&agent) else {
                    continue;
                };
                self.record_worker_event(
                    "WORKER_HEARTBEAT_MISSED",
                    &agent,
                    json!({ "pid": entry.pid, "consumer_id": entry.consumer_id }),
                )?;
                warn!(agent_id = %agent, pid = entry.pid, "worker heartbeat missed; killing");
                let _ = entry.child.kill().await;
                let exit_code = entry.child.try_wait().ok().flatten().and_then(|s| s.code());
                self.record_worker_event(
                    "WORKER_EXITED",
                    &agent,
                    json!({ "exit_code": exit_code, "reason": "heartbeat_missed" }),
                )?;
                self.schedule_restart_or_disable(&agent, "heartbeat_missed")?;
                continue;
            }

            let heartbeat_consumer = self
                .mail_store
                .get_worker_heartbeat(&agent)?
                .map(|hb| hb.consumer_id);
            if let Some(entry) = self.workers.get_mut(&agent) {
                if entry.state == WorkerProcState::Starting
                    && heartbeat_consumer.as_deref() == Some(entry.consumer_id.as_str())
                {
                    entry.state = WorkerProcState::Active;
                }
            }
        }

        let now = Instant::now();
        let due: Vec<String> = self
            .scheduled_restarts
            .iter()
            .filter(|(agent, at)| {
                **at <= now && !self.disabled.contains(*agent) && !self.workers.contains_key(*agent)
            })
            .map(|(agent, _)| agent.clone())
            .collect();
        for agent in due {
            self.scheduled_restarts.remove(&agent);
            self.spawn_worker(&agent, true)?;
        }

        Ok(())
    }

    fn heartbeat_stale(&self, agent: &str) -> Result<bool, MailStoreError> {
        let Some(entry) = self.workers.get(agent) else {
            return Ok(false);
        };
        let grace_expired = entry.spawned_at.elapsed() > self.config.heartbeat_timeout;

        let Some(heartbeat) = self.mail_store.get_worker_heartbeat(agent)? else {
            return Ok(grace_expired);
        };
        if heartbeat.consumer_id != entry.consumer_id {
            // Row from a previous incarnation.
            return Ok(grace_expired);
        }
        match chrono::DateTime::parse_from_rfc3339(&heartbeat.ts) {
            Ok(parsed) => {
                let age = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
                Ok(age
                    .to_std()
                    .is_ok_and(|age| age > self.config.heartbeat_timeout))
            },
            Err(_) => Ok(true),
        }
    }

    fn schedule_restart_or_disable(
        &mut self,
        agent: &str,
        reason: &str,
    ) -> Result<(), SupervisorError> {
        let restart_config = self.config.restart.clone();
        let manager = self
            .restart_managers
            .entry(agent.to_string())
            .or_insert_with(|| RestartManager::new(restart_config));

        match manager.record_failure() {
            RestartDecision::Schedule {
                delay,
                restart_count,
            } => {
                self.scheduled_restarts
                    .insert(agent.to_string(), Instant::now() + delay);
                warn!(
                    agent_id = %agent,
                    reason,
                    restart_count,
                    delay_seconds = delay.as_secs_f64(),
                    "worker restart scheduled"
                );
                self.record_worker_event(
                    "WORKER_RESTART_SCHEDULED",
                    agent,
                    json!({
                        "reason": reason,
                        "restart_count": restart_count,
                        "restart_in_seconds": delay.as_secs_f64(),
                    }),
                )?;
            },
            RestartDecision::Disable {
                restart_count,
                window_count,
            } => {
                self.disabled.insert(agent.to_string());
                self.scheduled_restarts.remove(agent);
                error!(
                    agent_id = %agent,
                    reason,
                    restart_count,
                    window_count,
                    "worker disabled; restart budget exhausted"
                );
                self.record_worker_event(
                    "WORKER_DISABLED",
                    agent,
                    json!({
                        "reason": reason,
                        "restart_count": restart_count,
                        "restart_window_count": window_count,
                    }),
                )?;
                self.publish_control_event(
                    "SUPERVISOR_ALERT",
                    Some("command"),
                    format!("alert:{agent}:{}", Utc::now().timestamp_micros()),
                    Duration::from_secs(2),
                    json!({
                        "agent_id": agent,
                        "alert": "worker_disabled",
                        "reason": reason,
                        "restart_count": restart_count,
                    }),
                )?;
            },
        }
        Ok(())
    }

    fn spawn_worker(&mut self, agent: &str, is_restart: bool) -> Result<(), SupervisorError> {
        if self.disabled.contains(agent) {
            return Ok(());
        }

        let worktree = match self.config.workspace_roots.get(agent) {
            Some(path) => {
                if !path.exists() {
                    return Err(SupervisorError::MissingWorktree {
                        agent_id: agent.to_string(),
                        path: path.clone(),
                    });
                }
                path.clone()
            },
            None => std::env::current_dir()?,
        };

        let consumer_id = format!("worker:{agent}:{}", Utc::now().timestamp_micros());
        let log_path = self.config.runtime_log_dir.join(format!("{agent}.log"));
        let heartbeat_interval = self
            .config
            .heartbeat_interval
            .min(self.config.heartbeat_timeout / 2);

        let mut builder = WorkerSpec::builder()
            .agent_id(agent)
            .command(self.config.worker_program.to_string_lossy().into_owned())
            .args([
                "--agent-id",
                agent,
                "--db-path",
                &self.config.db_path.to_string_lossy(),
                "--worktree",
                &worktree.to_string_lossy(),
                "--consumer-id",
                &consumer_id,
                "--log-path",
                &log_path.to_string_lossy(),
            ])
            .args([
                "--lease-seconds".to_string(),
                self.config.lease_seconds.to_string(),
                "--claim-poll-ms".to_string(),
                self.config.claim_poll.as_millis().to_string(),
                "--heartbeat-interval-seconds".to_string(),
                heartbeat_interval.as_secs_f64().to_string(),
            ]);
        if self.config.include_unrouted {
            builder = builder.arg("--include-unrouted");
        }
        let spec = builder.build();

        let spawned = process::spawn(&spec)?;
        let pid = spawned.pid;
        self.workers.insert(
            agent.to_string(),
            WorkerEntry {
                child: spawned.child,
                pid,
                consumer_id: consumer_id.clone(),
                spawned_at: Instant::now(),
                state: WorkerProcState::Starting,
            },
        );

        let event_type = if is_restart {
            "WORKER_RESTARTED"
        } else {
            "WORKER_STARTED"
        };
        info!(agent_id = %agent, pid, event_type, "worker spawned");
        self.record_worker_event(
            event_type,
            agent,
            json!({
                "pid": pid,
                "consumer_id": consumer_id,
                "worktree": worktree.display().to_string(),
                "log_path": log_path.display().to_string(),
            }),
        )?;
        Ok(())
    }

    fn record_worker_event(
        &mut self,
        event_type: &str,
        agent: &str,
        details: Value,
    ) -> Result<(), SupervisorError> {
        let mut payload = json!({ "agent_id": agent });
        if let (Some(map), Some(extra)) = (payload.as_object_mut(), details.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        self.publish_control_event(
            event_type,
            Some("command"),
            format!("{event_type}:{agent}:{}", Utc::now().timestamp_micros()),
            Duration::ZERO,
            payload,
        )?;
        Ok(())
    }

    /// Publish `SUPERVISOR_HEARTBEAT` to every enabled agent.
    fn publish_heartbeats(&mut self) -> Result<(), SupervisorError> {
        let cycle = Utc::now().timestamp();
        let ttl = self.config.heartbeat_interval.mul_f64(0.8);
        let agents: Vec<String> = self
            .config
            .agents
            .iter()
            .filter(|agent| !self.disabled.contains(*agent))
            .cloned()
            .collect();
        for agent in agents {
            self.publish_control_event(
                "SUPERVISOR_HEARTBEAT",
                Some(&agent),
                format!("supervisor_heartbeat:{agent}:{cycle}"),
                ttl,
                json!({
                    "agent_id": agent,
                    "heartbeat_at": iso_now(),
                }),
            )?;
        }
        Ok(())
    }

    /// Publish a control event exactly once per correlation id.
    ///
    /// A short in-memory TTL suppresses same-process repetition cheaply;
    /// the durable idempotency key (`control:<correlation_id>`) is what
    /// actually guarantees at-most-once across restarts.
    fn publish_control_event(
        &mut self,
        event_type: &str,
        target_agent: Option<&str>,
        correlation_id: String,
        dedupe_ttl: Duration,
        payload: Value,
    ) -> Result<Option<i64>, MailStoreError> {
        let now = Instant::now();
        self.recent_control_keys
            .retain(|_, stamp| now.duration_since(*stamp) < Duration::from_secs(300));
        if let Some(previous) = self.recent_control_keys.get(&correlation_id) {
            if now.duration_since(*previous) < dedupe_ttl {
                return Ok(None);
            }
        }
        self.recent_control_keys.insert(correlation_id.clone(), now);

        let idempotency_key = format!("control:{correlation_id}");
        if !self.mail_store.reserve_idempotency_key(
            &idempotency_key,
            "supervisor",
            "CONTROL_EVENT",
            None,
        )? {
            return Ok(None);
        }

        let mut event = NewEvent::new(event_type, "supervisor")
            .with_correlation(correlation_id)
            .with_justification("Supervisor control events keep the swarm observable and safe.")
            .with_payload(payload);
        if let Some(target) = target_agent {
            event = event.with_target(target);
        }
        let event_id = self.mail_store.publish(event)?;
        self.mail_store.set_idempotency_result(
            &idempotency_key,
            &json!({ "event_id": event_id, "event_type": event_type }),
        )?;
        Ok(Some(event_id))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn config(dir: &TempDir, agents: &[&str]) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(
            dir.path().join("mail.db"),
            agents.iter().map(ToString::to_string).collect(),
        );
        config.runtime_log_dir = dir.path().join("workers");
        // A worker stand-in that stays alive until signalled.
        config.worker_program = PathBuf::from("sleep");
        config
    }

    #[tokio::test]
    async fn start_emits_supervisor_and_worker_events() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, &["recon"]);
        // `sleep` ignores the worker flags; give it a duration argument.
        config.worker_program = PathBuf::from("sleep");
        let mut supervisor = Supervisor::new(config).unwrap();

        // Spawn will fail to parse worker flags but the process still
        // launches; lifecycle events must be durable either way.
        supervisor.start().unwrap();
        let events = supervisor.mail_store().list_events(0, 100).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"SUPERVISOR_START"));
        assert!(types.contains(&"WORKER_STARTED"));

        supervisor.stop().await.unwrap();
        let events = supervisor.mail_store().list_events(0, 100).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"WORKER_EXITED"));
        assert!(types.contains(&"SUPERVISOR_STOP"));
    }

    #[tokio::test]
    async fn restart_budget_disables_worker() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, &["forge"]);
        config.restart = RestartConfig {
            window_limit: 2,
            ..RestartConfig::default()
        };
        let mut supervisor = Supervisor::new(config).unwrap();

        supervisor.schedule_restart_or_disable("forge", "test").unwrap();
        supervisor.schedule_restart_or_disable("forge", "test").unwrap();
        assert!(!supervisor.is_worker_disabled("forge"));
        supervisor.schedule_restart_or_disable("forge", "test").unwrap();
        assert!(supervisor.is_worker_disabled("forge"));
        assert_eq!(supervisor.restart_count("forge"), 3);

        let events = supervisor.mail_store().list_events(0, 100).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"WORKER_RESTART_SCHEDULED"));
        assert!(types.contains(&"WORKER_DISABLED"));
        assert!(types.contains(&"SUPERVISOR_ALERT"));

        supervisor.reset_worker("forge");
        assert!(!supervisor.is_worker_disabled("forge"));
    }

    #[tokio::test]
    async fn control_events_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(config(&dir, &["recon"])).unwrap();

        let first = supervisor
            .publish_control_event(
                "SUPERVISOR_ALERT",
                Some("command"),
                "alert:fixed".to_string(),
                Duration::ZERO,
                json!({}),
            )
            .unwrap();
        assert!(first.is_some());

        // Same correlation id: durably suppressed.
        let second = supervisor
            .publish_control_event(
                "SUPERVISOR_ALERT",
                Some("command"),
                "alert:fixed".to_string(),
                Duration::ZERO,
                json!({}),
            )
            .unwrap();
        assert!(second.is_none());
    }
}
