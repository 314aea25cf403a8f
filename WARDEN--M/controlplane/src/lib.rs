#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Warden command-execution control plane.
//!
//! Operators append commands to a shared queue; a single leased poller validates them,
//! claims each one exactly once, signs and dispatches it to the authorization service,
//! and appends every outcome to a hash-chained ledger.

/// Command vocabulary, severities and result records.
#[path = "../commands.rs"]
pub mod commands;

/// Queue line grammar.
#[path = "../parser.rs"]
pub mod parser;

/// Per-type schemas and the validated-command gate.
#[path = "../validator.rs"]
pub mod validator;

/// Key-value backend with TTLs and atomic insert-if-absent.
#[path = "../kv.rs"]
pub mod kv;

/// Exactly-once claims and cached results.
#[path = "../idempotency.rs"]
pub mod idempotency;

/// Single-holder leases with heartbeat renewal.
#[path = "../lease.rs"]
pub mod lease;

/// Consecutive-failure circuit breaker.
#[path = "../circuit.rs"]
pub mod circuit;

/// File and environment configuration plus mounted secrets.
#[path = "../config.rs"]
pub mod config;

/// Canonical signing, verification and dispatch transports.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Policy, risk and judge stages.
#[path = "../authorization/main.rs"]
pub mod authorization;

/// Tool registry executing authorized actions.
#[path = "../tools.rs"]
pub mod tools;

/// Append-only hash-chained audit ledger.
#[path = "../ledger.rs"]
pub mod ledger;

/// Global stop capability.
#[path = "../killswitch.rs"]
pub mod killswitch;

/// Pipeline counters.
#[path = "../metrics.rs"]
pub mod metrics;

/// Structured log and event sinks.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Authorization service core.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

/// Per-command processing from validation to ledger append.
#[path = "../pipeline.rs"]
pub mod pipeline;

/// Leased polling loop over the command queue.
#[path = "../poller.rs"]
pub mod poller;

/// HTTP routes of the authorization service.
#[path = "../service.rs"]
pub mod service;

/// Construction of every component from configuration.
#[path = "../bootstrap.rs"]
pub mod bootstrap;

/// Convenience re-exports.
pub mod prelude {
    pub use crate::authorization::{
        JudgeFallback, JudgePanel, PolicyGate, RiskFailureMode, RiskValidator,
    };
    pub use crate::bootstrap::DispatchMode;
    pub use crate::commands::{
        ActionResult, ActionStatus, Command, CommandType, Params, Severity, ValidatedCommand,
    };
    pub use crate::config::{ControlPlaneConfig, SecretSource, Secrets};
    pub use crate::dispatcher::{RequestSigner, RequestVerifier, SignedDispatcher};
    pub use crate::ledger::{verify_chain, ChainVerification, Ledger, LedgerEntry};
    pub use crate::orchestrator::ActionOrchestrator;
    pub use crate::pipeline::{CommandPipeline, ControlError, ProcessedCommand};
    pub use crate::poller::{CommandPoller, CycleReport};
    pub use crate::service::{router, ServiceState};
}
