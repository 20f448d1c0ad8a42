//! stackd core library
//!
//! Shared building blocks for the stackd deployment daemon: the process
//! execution bridge, compose document rewriting, the secret store, and
//! stack lifecycle/inventory orchestration.

pub mod compose;
pub mod config;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod lifecycle;
pub mod observability;
pub mod secrets;

// Re-export commonly used items
pub use compose::{RoutingConfig, Transformed};
pub use config::Config;
pub use error::{Result, StackdError};
pub use exec::{Invocation, OutputSink, ProcessRunner, Runner};
pub use inventory::{Container, StackInventory, StackSummary};
pub use lifecycle::{DownPlan, StackManager, UpPlan};
pub use secrets::SecretStore;
