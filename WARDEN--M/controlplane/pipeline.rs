use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    authorization::{JudgeError, RiskError},
    commands::{ActionResult, ActionStatus, Command},
    config::ConfigError,
    dispatcher::{SignedDispatcher, TransportError},
    idempotency::{fingerprint, IdempotencyStore},
    killswitch::{KillSwitch, StaticKillSwitch, KILL_SWITCH_RATIONALE},
    kv::{MemoryKvStore, StoreError},
    ledger::{Ledger, LedgerEntry, LedgerError},
    metrics::PipelineMetrics,
    parser::ParseError,
    telemetry::ControlTelemetry,
    tools::ToolError,
    validator::{CommandValidator, ValidationError},
};

/// Control-plane error aggregating every stage.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Queue line could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Command failed schema validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Idempotency or lease backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Dispatch failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Risk validator failure.
    #[error(transparent)]
    Risk(#[from] RiskError),
    /// Judge failure.
    #[error(transparent)]
    Judge(#[from] JudgeError),
    /// Tool failure.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// Audit ledger failure. The command must not be marked processed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Configuration or secret failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Command source failure.
    #[error("command source error: {0}")]
    Source(String),
}

/// Terminal outcome of one command together with its audit entry.
#[derive(Debug, Clone)]
pub struct ProcessedCommand {
    /// Result returned to the operator.
    pub result: ActionResult,
    /// Ledger entry written for the command.
    pub entry: LedgerEntry,
    /// Whether the command was answered from the idempotency store.
    pub duplicate: bool,
}

impl ProcessedCommand {
    /// Ledger hash acting as the receipt.
    #[must_use]
    pub fn receipt(&self) -> &str {
        &self.entry.hash
    }
}

struct Resolution {
    result: ActionResult,
    duplicate: bool,
    cache: bool,
}

impl Resolution {
    const fn fresh(result: ActionResult, cache: bool) -> Self {
        Self {
            result,
            duplicate: false,
            cache,
        }
    }
}

/// Builder used to configure a [`CommandPipeline`].
pub struct CommandPipelineBuilder {
    dispatcher: SignedDispatcher,
    ledger: Arc<Ledger>,
    validator: CommandValidator,
    idempotency: IdempotencyStore,
    idempotency_ttl: Duration,
    kill_switch: Arc<dyn KillSwitch>,
    signer: String,
    metrics: Arc<PipelineMetrics>,
    telemetry: Option<ControlTelemetry>,
}

impl CommandPipelineBuilder {
    /// Overrides the schema validator.
    #[must_use]
    pub const fn validator(mut self, validator: CommandValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Overrides the idempotency store.
    #[must_use]
    pub fn idempotency(mut self, idempotency: IdempotencyStore) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// Sets how long claims and cached results live.
    #[must_use]
    pub const fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Overrides the kill switch.
    #[must_use]
    pub fn kill_switch(mut self, kill_switch: Arc<dyn KillSwitch>) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    /// Sets the signer recorded on ledger entries.
    #[must_use]
    pub fn signer(mut self, signer: impl Into<String>) -> Self {
        self.signer = signer.into();
        self
    }

    /// Shares metrics with another component.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalizes the builder.
    #[must_use]
    pub fn build(self) -> CommandPipeline {
        CommandPipeline {
            dispatcher: self.dispatcher,
            ledger: self.ledger,
            validator: self.validator,
            idempotency: self.idempotency,
            idempotency_ttl: self.idempotency_ttl,
            kill_switch: self.kill_switch,
            signer: self.signer,
            metrics: self.metrics,
            telemetry: self.telemetry,
        }
    }
}

/// Validates, deduplicates, dispatches and audits one command at a time.
pub struct CommandPipeline {
    dispatcher: SignedDispatcher,
    ledger: Arc<Ledger>,
    validator: CommandValidator,
    idempotency: IdempotencyStore,
    idempotency_ttl: Duration,
    kill_switch: Arc<dyn KillSwitch>,
    signer: String,
    metrics: Arc<PipelineMetrics>,
    telemetry: Option<ControlTelemetry>,
}

impl CommandPipeline {
    /// Starts a builder around the two collaborators without defaults.
    #[must_use]
    pub fn builder(dispatcher: SignedDispatcher, ledger: Arc<Ledger>) -> CommandPipelineBuilder {
        CommandPipelineBuilder {
            dispatcher,
            ledger,
            validator: CommandValidator::default(),
            idempotency: IdempotencyStore::new(Arc::new(MemoryKvStore::new())),
            idempotency_ttl: Duration::from_secs(3600),
            kill_switch: Arc::new(StaticKillSwitch::default()),
            signer: "command_poller".into(),
            metrics: Arc::new(PipelineMetrics::new()),
            telemetry: None,
        }
    }

    /// Audit ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Per-process counters.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Dispatcher, for breaker inspection.
    #[must_use]
    pub const fn dispatcher(&self) -> &SignedDispatcher {
        &self.dispatcher
    }

    /// Resolves `command` to a terminal result and writes exactly one ledger entry for it.
    ///
    /// Only a ledger failure is returned as an error; every other failure becomes a
    /// `FAILED` or `BLOCKED` result. Outcomes that claimed the command are cached before
    /// the append, so resubmitting after a ledger failure records the original result
    /// without running the command again.
    pub async fn process(&self, command: Command) -> Result<ProcessedCommand, ControlError> {
        let started = Instant::now();
        let action_id = command.id.to_string();
        let raw_text = command.raw_text.clone();
        let fingerprint = fingerprint(&raw_text);
        self.emit(
            LogLevel::Info,
            "controlplane.command.accepted",
            json!({
                "action_id": action_id,
                "command_type": command.command_type,
                "line": command.line_number,
            }),
        );

        let resolution = self.resolve(command, &fingerprint).await;
        let latency = started.elapsed();
        let result = resolution.result;

        // Cached before the append so a retry after a ledger failure replays this outcome.
        if resolution.cache {
            if let Err(err) = self
                .idempotency
                .cache_result(&fingerprint, &result, self.idempotency_ttl)
                .await
            {
                warn!(action_id = %action_id, error = %err, "caching result failed");
            }
        }

        let entry = self
            .ledger
            .append(
                &action_id,
                &raw_text,
                result.status,
                u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                &result.rationale,
                &self.signer,
            )
            .await?;
        self.emit(
            LogLevel::Info,
            "controlplane.command.ledger.appended",
            json!({ "action_id": action_id, "hash": entry.hash }),
        );

        if self.metrics.record(result.status, resolution.duplicate, latency) {
            let snapshot = self.metrics.snapshot();
            info!(
                processed = snapshot.processed,
                success = snapshot.success,
                failed = snapshot.failed,
                blocked = snapshot.blocked,
                needs_approval = snapshot.needs_approval,
                duplicate = snapshot.duplicate,
                avg_latency_ms = snapshot.avg_latency_ms(),
                "pipeline metrics"
            );
            self.log(
                LogLevel::Info,
                "controlplane.metrics",
                json!({ "snapshot": snapshot, "avg_latency_ms": snapshot.avg_latency_ms() }),
            );
        }

        self.emit(
            LogLevel::Info,
            "controlplane.command.completed",
            json!({
                "action_id": action_id,
                "status": result.status,
                "duplicate": resolution.duplicate,
                "latency_ms": entry.latency_ms,
            }),
        );
        Ok(ProcessedCommand {
            result,
            entry,
            duplicate: resolution.duplicate,
        })
    }

    async fn resolve(&self, command: Command, fingerprint: &str) -> Resolution {
        let action_id = command.id.to_string();
        let command_type = command.command_type;
        let failed = |rationale: String| {
            ActionResult::new(action_id.clone(), command_type, ActionStatus::Failed, rationale)
        };

        let validated = match self.validator.validate(command) {
            Ok(validated) => validated,
            Err(err) => {
                info!(action_id = %action_id, error = %err, "command failed validation");
                return Resolution::fresh(failed(format!("Validation failed: {err}")), false);
            }
        };

        match self
            .idempotency
            .check_and_record(fingerprint, self.idempotency_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.duplicate(&action_id, fingerprint, failed).await,
            Err(err) => {
                warn!(action_id = %action_id, error = %err, "idempotency store unavailable");
                return Resolution::fresh(
                    failed(format!("Idempotency store unavailable: {err}")),
                    false,
                );
            }
        }

        if self.kill_switch.engaged().await {
            warn!(action_id = %action_id, "kill switch engaged, command not dispatched");
            self.release(fingerprint).await;
            let blocked = ActionResult::new(
                action_id.clone(),
                command_type,
                ActionStatus::Blocked,
                KILL_SWITCH_RATIONALE,
            );
            return Resolution::fresh(blocked, false);
        }

        self.emit(
            LogLevel::Info,
            "controlplane.command.dispatched",
            json!({
                "action_id": action_id,
                "command_type": command_type,
                "severity": validated.severity(),
            }),
        );
        match self.dispatcher.dispatch(&validated).await {
            Ok(result) => Resolution::fresh(result, true),
            Err(TransportError::CircuitOpen(open)) => {
                self.release(fingerprint).await;
                Resolution::fresh(failed(format!("Dispatch failed: {open}")), false)
            }
            Err(err) => {
                warn!(action_id = %action_id, error = %err, "dispatch failed");
                Resolution::fresh(failed(format!("Dispatch failed: {err}")), true)
            }
        }
    }

    async fn duplicate(
        &self,
        action_id: &str,
        fingerprint: &str,
        failed: impl FnOnce(String) -> ActionResult + Send,
    ) -> Resolution {
        info!(action_id, fingerprint, "duplicate command short-circuited");
        self.emit(
            LogLevel::Info,
            "controlplane.command.duplicate",
            json!({ "action_id": action_id, "fingerprint": fingerprint }),
        );
        let result = match self.idempotency.get_cached_result(fingerprint).await {
            Ok(Some(mut cached)) => {
                if cached.status == ActionStatus::Success {
                    cached.status = ActionStatus::SuccessCached;
                }
                cached
            }
            Ok(None) => failed(format!(
                "Duplicate of command {} still in flight",
                &fingerprint[..fingerprint.len().min(12)]
            )),
            Err(err) => failed(format!("Idempotency store unavailable: {err}")),
        };
        Resolution {
            result,
            duplicate: true,
            cache: false,
        }
    }

    async fn release(&self, fingerprint: &str) {
        match self.idempotency.release(fingerprint).await {
            Ok(()) => debug!(fingerprint, "idempotency claim released"),
            Err(err) => warn!(fingerprint, error = %err, "releasing idempotency claim failed"),
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.log(level, message, metadata) {
                debug!(record = message, error = %err, "telemetry sink rejected log record");
            }
        }
    }

    fn emit(&self, level: LogLevel, name: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.emit(level, name, payload) {
                debug!(event = name, error = %err, "telemetry sink rejected event");
            }
        }
    }
}
