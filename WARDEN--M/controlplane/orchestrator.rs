use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tracing::{debug, info, warn};

use crate::{
    authorization::{
        policy::rule_for, HeuristicRiskValidator, JudgeFallback, JudgePanel, PolicyDecision,
        PolicyGate, PolicyRule, RiskError, RiskFailureMode, RiskValidator,
    },
    commands::{ActionResult, ActionStatus, CommandType, Params, ValidationResult},
    dispatcher::{ActionRequest, ActionTransport, RequestVerifier, SignedRequest, TransportError},
    telemetry::ControlTelemetry,
    tools::ToolRegistry,
    validator::schema_for,
};

/// Rationale of an executed action.
pub const SUCCESS_RATIONALE: &str = "Action completed successfully";

/// Rationale when the judge majority is not reached.
pub const NEEDS_APPROVAL_RATIONALE: &str = "Majority judge approval required";

/// Builder used to configure an [`ActionOrchestrator`].
pub struct ActionOrchestratorBuilder {
    policy: PolicyGate,
    risk: Arc<dyn RiskValidator>,
    risk_timeout: Duration,
    risk_failure_mode: RiskFailureMode,
    judges: JudgePanel,
    tools: ToolRegistry,
    telemetry: Option<ControlTelemetry>,
}

impl Default for ActionOrchestratorBuilder {
    fn default() -> Self {
        let roster = ["security", "compliance", "business"].map(String::from);
        Self {
            policy: PolicyGate::default(),
            risk: Arc::new(HeuristicRiskValidator),
            risk_timeout: Duration::from_secs(10),
            risk_failure_mode: RiskFailureMode::Open,
            judges: JudgePanel::rule_based(&roster, Duration::from_secs(10), JudgeFallback::Approve),
            tools: ToolRegistry::production_default(),
            telemetry: None,
        }
    }
}

impl ActionOrchestratorBuilder {
    /// Overrides the policy gate.
    #[must_use]
    pub fn policy(mut self, policy: PolicyGate) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the risk validator.
    #[must_use]
    pub fn risk_validator(mut self, risk: Arc<dyn RiskValidator>) -> Self {
        self.risk = risk;
        self
    }

    /// Bounds each risk validation call.
    #[must_use]
    pub const fn risk_timeout(mut self, timeout: Duration) -> Self {
        self.risk_timeout = timeout;
        self
    }

    /// Chooses how validator failures are handled.
    #[must_use]
    pub const fn risk_failure_mode(mut self, mode: RiskFailureMode) -> Self {
        self.risk_failure_mode = mode;
        self
    }

    /// Overrides the judge panel.
    #[must_use]
    pub fn judges(mut self, judges: JudgePanel) -> Self {
        self.judges = judges;
        self
    }

    /// Overrides the tool registry.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
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
    pub fn build(self) -> ActionOrchestrator {
        ActionOrchestrator {
            policy: self.policy,
            risk: self.risk,
            risk_timeout: self.risk_timeout,
            risk_failure_mode: self.risk_failure_mode,
            judges: self.judges,
            tools: self.tools,
            telemetry: self.telemetry,
        }
    }
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Always `healthy` while the process serves requests.
    pub status: &'static str,
    /// Report time.
    pub timestamp: DateTime<Utc>,
    /// Per-stage details keyed by `validator`, `judge` and `policy`.
    pub components: Value,
}

/// Authorization service: policy gate, risk validation, judge panel, then tool execution.
pub struct ActionOrchestrator {
    policy: PolicyGate,
    risk: Arc<dyn RiskValidator>,
    risk_timeout: Duration,
    risk_failure_mode: RiskFailureMode,
    judges: JudgePanel,
    tools: ToolRegistry,
    telemetry: Option<ControlTelemetry>,
}

impl std::fmt::Debug for ActionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionOrchestrator")
            .field("risk", &self.risk.name())
            .field("risk_failure_mode", &self.risk_failure_mode)
            .field("judges", &self.judges)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ActionOrchestrator {
    /// Creates a builder with offline defaults.
    #[must_use]
    pub fn builder() -> ActionOrchestratorBuilder {
        ActionOrchestratorBuilder::default()
    }

    /// Runs every authorization stage for `request` and executes it when allowed.
    pub async fn authorize_and_execute(&self, request: &ActionRequest) -> ActionResult {
        let command_type = request.command_type;
        let severity = request.severity.max(schema_for(command_type).severity);
        let result = |status, rationale: String| {
            ActionResult::new(request.action_id.clone(), command_type, status, rationale)
        };

        let require_judges = match self.policy.evaluate(command_type, &request.params) {
            decision @ PolicyDecision::Block { .. } => {
                let rationale = decision.rationale().unwrap_or_default();
                warn!(action_id = %request.action_id, command_type = %command_type, "action blocked by policy");
                self.record("controlplane.action.blocked", request, &rationale);
                return result(ActionStatus::Blocked, rationale);
            }
            PolicyDecision::Allow {
                require_judge_approval,
            } => require_judge_approval,
        };

        let validation = match self.assess(command_type, &request.params).await {
            Ok(validation) => validation,
            Err(err) => {
                let rationale = format!("Risk validation unavailable: {err}");
                self.record("controlplane.action.blocked", request, &rationale);
                return result(ActionStatus::Blocked, rationale);
            }
        };
        if !validation.passed {
            let rationale = format!("Failed validation: {}", validation.summary);
            self.record("controlplane.action.blocked", request, &rationale);
            return result(ActionStatus::Blocked, rationale).with_validation(Some(validation));
        }

        let mut judge_decisions = None;
        if severity.is_elevated() || require_judges {
            let verdict = self
                .judges
                .review(command_type, &request.params, Some(&validation))
                .await;
            let approved = verdict.approved;
            judge_decisions = Some(verdict.decisions);
            if !approved {
                self.record(
                    "controlplane.action.needs_approval",
                    request,
                    NEEDS_APPROVAL_RATIONALE,
                );
                return result(ActionStatus::NeedsApproval, NEEDS_APPROVAL_RATIONALE.into())
                    .with_validation(Some(validation))
                    .with_judges(judge_decisions);
            }
        }

        if let Some(reason) = self.policy.reserve(command_type) {
            let rationale = format!("Action blocked by policy: {reason}");
            warn!(action_id = %request.action_id, command_type = %command_type, "rate window full");
            self.record("controlplane.action.blocked", request, &rationale);
            return result(ActionStatus::Blocked, rationale)
                .with_validation(Some(validation))
                .with_judges(judge_decisions);
        }

        match self.tools.execute(command_type, &request.params).await {
            Ok(tool_result) => {
                info!(action_id = %request.action_id, command_type = %command_type, "action executed");
                self.record("controlplane.action.executed", request, SUCCESS_RATIONALE);
                result(ActionStatus::Success, SUCCESS_RATIONALE.into())
                    .with_validation(Some(validation))
                    .with_judges(judge_decisions)
                    .with_tool_result(tool_result)
            }
            Err(err) => {
                let rationale = format!("Execution error: {err}");
                warn!(action_id = %request.action_id, error = %err, "tool execution failed");
                self.record("controlplane.action.failed", request, &rationale);
                result(ActionStatus::Failed, rationale)
                    .with_validation(Some(validation))
                    .with_judges(judge_decisions)
            }
        }
    }

    /// Risk validation alone, without policy, judges or execution.
    pub async fn validate_only(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<ValidationResult, RiskError> {
        tokio::time::timeout(self.risk_timeout, self.risk.validate(command_type, params))
            .await
            .map_err(|_| {
                RiskError::Unavailable(format!(
                    "timed out after {}ms",
                    self.risk_timeout.as_millis()
                ))
            })?
    }

    /// Component summary for `GET /health`.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let blocked: Vec<&str> = CommandType::ALL
            .into_iter()
            .filter(|kind| matches!(rule_for(*kind), PolicyRule::Block { .. }))
            .map(CommandType::as_str)
            .collect();
        HealthReport {
            status: "healthy",
            timestamp: Utc::now(),
            components: json!({
                "validator": {
                    "name": self.risk.name(),
                    "failure_mode": self.risk_failure_mode,
                },
                "judge": {
                    "roster": self.judges.roster(),
                },
                "policy": {
                    "blocked": blocked,
                },
            }),
        }
    }

    async fn assess(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<ValidationResult, RiskError> {
        match self.validate_only(command_type, params).await {
            Ok(validation) => Ok(validation),
            Err(err) => match self.risk_failure_mode {
                RiskFailureMode::Open => {
                    warn!(validator = self.risk.name(), error = %err, "risk validator unavailable, continuing degraded");
                    Ok(ValidationResult::degraded(err.to_string()))
                }
                RiskFailureMode::Closed => {
                    warn!(validator = self.risk.name(), error = %err, "risk validator unavailable, blocking");
                    Err(err)
                }
            },
        }
    }

    fn record(&self, name: &str, request: &ActionRequest, rationale: &str) {
        if let Some(tel) = &self.telemetry {
            let payload = json!({
                "action_id": request.action_id,
                "command_type": request.command_type,
                "rationale": rationale,
            });
            if let Err(err) = tel.emit(LogLevel::Info, name, payload) {
                debug!(event = name, error = %err, "telemetry sink rejected event");
            }
        }
    }
}

/// Transport that verifies the signature and runs an orchestrator in-process.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    orchestrator: Arc<ActionOrchestrator>,
    verifier: Arc<RequestVerifier>,
}

impl LocalTransport {
    /// Creates a loopback transport.
    #[must_use]
    pub const fn new(orchestrator: Arc<ActionOrchestrator>, verifier: Arc<RequestVerifier>) -> Self {
        Self {
            orchestrator,
            verifier,
        }
    }
}

#[async_trait]
impl ActionTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(&self, request: &SignedRequest) -> Result<ActionResult, TransportError> {
        let verified = self
            .verifier
            .verify(&request.body, Some(&request.signature), Some(request.nonce()))
            .map_err(|err| TransportError::Rejected(err.to_string()))?;
        Ok(self.orchestrator.authorize_and_execute(&verified).await)
    }
}
