//! Fossorial web control plane
//!
//! REST API over the site registry, with peer reconciliation against exit
//! nodes and newt agents.

pub mod access;
pub mod config;
pub mod exit_node;
pub mod invites;
pub mod names;
pub mod outbox;
pub mod rate_limit;
pub mod reconciler;
pub mod registry;
pub mod routes;
pub mod secrets;
pub mod server;
pub mod sites;

pub use config::ServerConfig;
pub use exit_node::{ExitNodeClient, HttpExitNodeClient};
pub use reconciler::{PeerReconciler, ReconcileOutcome};
pub use routes::{router, AppState};
