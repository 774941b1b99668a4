//! # Havoc Core
//!
//! Chaos harness for a federated, eventually-consistent chat protocol.
//! Drives a cluster of homeservers through a deterministic workload of
//! membership and message operations while injecting faults (federation
//! partitions, server restarts), and periodically asserts that all servers
//! converge on the same room membership once faults are healed.
//!
//! ## Architecture
//!
//! - **Dispatcher**: tick loop generating commands from the seeded
//!   [`state_machine::StateMachine`] and fanning them out to per-user
//!   [`worker::Worker`]s over bounded channels. A `TickEof` sentinel per
//!   worker turns the end-of-tick barrier into in-band signalling.
//! - **Convergence**: causal barrier (synchronise messages + event polling)
//!   followed by a membership diff of every homeserver against the
//!   generator's ground truth.
//! - **Interceptor**: callback server for the upstream intercepting proxy;
//!   fails cross-server requests with a 504 while the partition gate is up.
//! - **ControlBus**: WebSocket pub/sub used to issue fault commands and
//!   stream events to observers; the [`orchestrator`] is its canonical
//!   client.

pub mod bootstrap;
pub mod bus;
pub mod client;
pub mod convergence;
pub mod dispatcher;
pub mod interceptor;
pub mod orchestrator;
pub mod proxy;
pub mod restart;
pub mod snapshot;
pub mod state_machine;
pub mod worker;

pub use bootstrap::{bootstrap, Registry};
pub use bus::BusServer;
pub use client::{ChatApi, Client, ClientError, MatrixEvent, SyncRequest, SyncResponse};
pub use convergence::{Convergence, ConvergenceError, ConvergenceObserver, GroundTruth, Mechanism};
pub use dispatcher::{Dispatcher, TickHook};
pub use orchestrator::orchestrate;
pub use state_machine::{StateMachine, UserRoomState, WorkerCommand};
pub use worker::{Worker, WorkerSignal};

/// Errors that terminate the harness. With the sole exception of
/// convergence mismatches (reported over the bus, see
/// [`convergence::ConvergenceError`]), the first unexpected error crashes
/// the process: a worker failure desynchronises the state machine from
/// reality and nothing sound can be asserted afterwards.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("worker for {user} returned an error, terminating: {source}")]
    WorkerFailed {
        user: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("worker channel for {0} closed unexpectedly")]
    WorkerGone(String),

    #[error("not all users have workers: {mapped} != {users}")]
    WorkerMapIncomplete { mapped: usize, users: usize },

    #[error("dispatcher started before workers were spawned")]
    NotStarted,

    #[error("no homeservers configured")]
    NoHomeservers,

    #[error("multiple users per worker is not supported ({workers} workers for {users} users)")]
    TooFewWorkers { workers: usize, users: usize },

    #[error("proxy: {0}")]
    Proxy(String),

    #[error("interceptor: {0}")]
    Interceptor(String),

    #[error("control bus: {0}")]
    ControlBus(String),

    #[error("hs {domain} has an unsupported snapshot type: {kind}")]
    UnsupportedSnapshotType { domain: String, kind: String },

    #[error("hs {domain} has an unsupported restart type: {kind}")]
    UnsupportedRestartType { domain: String, kind: String },

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("snapshot storage: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config: {0}")]
    Config(#[from] havoc_proto::ConfigError),
}
