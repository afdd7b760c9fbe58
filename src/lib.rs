//! Distexp: A Distributed Experiment Runner.
//!
//! A controller program registers experiments against groups of servers and
//! hands them to the [`Scheduler`]. Each server runs `distexp-agent`, which
//! spawns the commands the experiments issue and streams their output back.

// Serde helper module.
mod serde;
// Error handling.
pub mod error;
// Command line arguments and logging.
pub mod config;
// Wire format and connection plumbing.
pub mod rpc;
// Agent side: process supervision per connection.
pub mod supervisor;
// Agent side: TCP listener and shutdown.
pub mod agent;
// Controller side: callbacks from an agent.
pub mod controller;
// Controller side: handles to remote commands.
pub mod handle;
// Output handlers for remote command lines.
pub mod output;
// Agent endpoints and the servers file.
pub mod server;
// Collections of servers.
pub mod group;
// Parameter grids.
pub mod grid;
// Resume checkpoints.
pub mod checkpoint;
// Experiment registrations.
pub mod registry;
// Sequential experiment scheduling.
pub mod scheduler;
// Batch completion notifications.
pub mod notification;

pub use agent::Agent;
pub use checkpoint::Checkpoint;
pub use config::{init_logging, AgentConfig, ControllerConfig};
pub use error::DistexpError;
pub use grid::{ParameterGrid, Params};
pub use group::ServerGroup;
pub use handle::{any_failed, wait_all, RemoteProcess, ReturnCode};
pub use output::{Collector, Console, FileSink, OutputHandler, SubstrMatcher};
pub use registry::{Action, Experiment, FnExperiment, Registry, RunPolicy};
pub use scheduler::{BatchSummary, Scheduler};
pub use server::{load_servers, Server};
