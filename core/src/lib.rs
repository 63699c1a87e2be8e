//! Core library for hostwatch
//!
//! This crate defines the shared types, the multiplexed run protocol,
//! check evaluation and alert dispatch used by the other hostwatch crates.

pub mod alerts;
pub mod checks;
pub mod error;
pub mod expr;
pub mod protocol;
pub mod remote;
pub mod run;
pub mod types;
pub mod vars;

// Re-exports
pub use alerts::{AlertDispatcher, AlertKind, AlertMessage, AlertRunner, CommandRunner};
pub use checks::evaluate_checks;
pub use error::{Error, Result};
pub use expr::{CompiledExpression, Env, Expression};
pub use remote::{connector_for, Connector, LocalConnector, Session, SessionHandle, SshConnector};
pub use run::{check_connection, Run, TaskResult, RUN_TIMEOUT};
pub use types::{
    has_class, matches_targets, Alert, Check, HourRange, Host, Probe, Scalar, SshTarget, Task,
    Transport, GENERAL_CLASS,
};
