//! # hive-daemon
//!
//! Runtime half of hive: the durable SQLite mailstore, the policy-gated
//! tool gateway, per-agent workspace provisioning, the worker claim loop,
//! the supervising process manager, and the projection materializer.
//!
//! Three binaries drive it:
//!
//! - `run_swarm` spawns and supervises one `swarm-worker` per agent;
//! - `swarm-worker` claims routed events and acknowledges results;
//! - `run_projector` tails the store read-only and publishes the view and
//!   inspection index files atomically.

pub mod fsio;
pub mod gateway;
pub mod logging;
pub mod mailstore;
pub mod projector;
pub mod supervisor;
pub mod view_store;
pub mod worker;
pub mod workspace;

pub use gateway::ToolGateway;
pub use mailstore::{MailStore, MailStoreConfig, MailStoreError};
pub use projector::{Projector, ProjectorConfig};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{WorkerLoopConfig, WorkerRuntime};
pub use workspace::WorkspaceManager;
