use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned to every parsed command.
pub type ActionId = Uuid;

/// Parameter map carried by a command. Ordered so serialized forms are stable.
pub type Params = BTreeMap<String, String>;

/// Every command type the control plane knows how to route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Security scan of a public site.
    ScanSite,
    /// Render and publish a client report.
    PublishReport,
    /// Launch a marketing campaign on an external channel.
    StartCampaign,
    /// Upload a video to Vimeo.
    PostVimeo,
    /// Kick off an agent training run.
    TrainAgent,
    /// Apply an enforcement policy.
    EnforcePolicy,
    /// Roll back a previously executed action.
    RevertAction,
    /// Read-only health probe of an integration.
    CheckIntegrationStatus,
    /// Rotate the credentials of an integration.
    RefreshToken,
    /// Connect a brand new integration.
    ConnectIntegration,
}

impl CommandType {
    /// All command types in declaration order.
    pub const ALL: [Self; 10] = [
        Self::ScanSite,
        Self::PublishReport,
        Self::StartCampaign,
        Self::PostVimeo,
        Self::TrainAgent,
        Self::EnforcePolicy,
        Self::RevertAction,
        Self::CheckIntegrationStatus,
        Self::RefreshToken,
        Self::ConnectIntegration,
    ];

    /// Wire label, e.g. `SCAN_SITE`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScanSite => "SCAN_SITE",
            Self::PublishReport => "PUBLISH_REPORT",
            Self::StartCampaign => "START_CAMPAIGN",
            Self::PostVimeo => "POST_VIMEO",
            Self::TrainAgent => "TRAIN_AGENT",
            Self::EnforcePolicy => "ENFORCE_POLICY",
            Self::RevertAction => "REVERT_ACTION",
            Self::CheckIntegrationStatus => "CHECK_INTEGRATION_STATUS",
            Self::RefreshToken => "REFRESH_TOKEN",
            Self::ConnectIntegration => "CONNECT_INTEGRATION",
        }
    }

    /// Case-insensitive lookup of a wire label.
    #[must_use]
    pub fn lookup(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = UnknownCommandType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| UnknownCommandType(s.to_string()))
    }
}

/// Returned when a label does not name a known command type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown command type `{0}`")]
pub struct UnknownCommandType(pub String);

/// Severity tier. Drives whether the judge panel is consulted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Routine, reversible actions.
    Low,
    /// Actions with external visibility.
    Medium,
    /// Actions with spend, enforcement or rollback impact.
    High,
}

impl Severity {
    /// Whether this tier requires a judge vote on its own.
    #[must_use]
    pub const fn is_elevated(self) -> bool {
        matches!(self, Self::Medium | Self::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        })
    }
}

/// A command as recovered from one line of the queue. Carries no severity yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Fresh identifier assigned at parse time.
    pub id: ActionId,
    /// Parsed command type.
    pub command_type: CommandType,
    /// Parameters keyed by name.
    pub params: Params,
    /// Trimmed source text; the fingerprint is derived from it.
    pub raw_text: String,
    /// One-based line number inside the queue.
    pub line_number: usize,
    /// When the line was parsed.
    pub issued_at: DateTime<Utc>,
}

/// A command that passed schema validation.
///
/// Only the validator can construct one, so severity is always schema-derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    command: Command,
    severity: Severity,
}

impl ValidatedCommand {
    pub(crate) const fn new(command: Command, severity: Severity) -> Self {
        Self { command, severity }
    }

    /// Underlying command.
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// Schema-assigned severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.severity
    }

    /// Shorthand for the command identifier.
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.command.id
    }

    /// Shorthand for the command type.
    #[must_use]
    pub const fn command_type(&self) -> CommandType {
        self.command.command_type
    }
}

/// Terminal status of one action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Tool executed.
    Success,
    /// Duplicate submission answered from the idempotency cache.
    SuccessCached,
    /// Rejected before or during execution.
    Failed,
    /// Refused by policy, risk validation or the kill switch.
    Blocked,
    /// Judge majority not reached; waits for a human.
    NeedsApproval,
}

impl ActionStatus {
    /// Wire label, e.g. `SUCCESS_CACHED`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SuccessCached => "SUCCESS_CACHED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::NeedsApproval => "NEEDS_APPROVAL",
        }
    }

    /// Whether the action ran (now or previously).
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessCached)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk assessment for a single command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    /// Risk in `[0, 1]`.
    pub risk_score: f64,
    /// One-line summary.
    pub summary: String,
    /// Evidence backing the score.
    pub proof: String,
    /// Whether execution may proceed.
    pub passed: bool,
    /// Set when the validator was unavailable and this result is a stand-in.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl ValidationResult {
    /// Builds a regular result, clamping the score.
    #[must_use]
    pub fn new(
        risk_score: f64,
        summary: impl Into<String>,
        proof: impl Into<String>,
        passed: bool,
    ) -> Self {
        Self {
            risk_score: clamp_unit(risk_score),
            summary: summary.into(),
            proof: proof.into(),
            passed,
            degraded: false,
        }
    }

    /// Low-confidence pass used when the validator could not be consulted.
    #[must_use]
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            risk_score: 0.5,
            summary: "Risk validation unavailable".into(),
            proof: reason.into(),
            passed: true,
            degraded: true,
        }
    }
}

/// Vote cast by one judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeDecision {
    /// Roster name of the judge.
    pub judge_id: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    /// Explanation.
    pub rationale: String,
    /// Vote.
    pub approved: bool,
    /// Set when the judge failed and the panel substituted its default vote.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl JudgeDecision {
    /// Builds a regular decision, clamping the score.
    #[must_use]
    pub fn new(
        judge_id: impl Into<String>,
        score: f64,
        rationale: impl Into<String>,
        approved: bool,
    ) -> Self {
        Self {
            judge_id: judge_id.into(),
            score: clamp_unit(score),
            rationale: rationale.into(),
            approved,
            fallback: false,
        }
    }
}

/// Terminal outcome of one action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    /// Action identifier.
    pub action_id: String,
    /// Command type.
    pub command_type: CommandType,
    /// Terminal status.
    pub status: ActionStatus,
    /// Human readable explanation.
    pub rationale: String,
    /// Risk assessment if one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    /// Judge votes if the panel was consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_decisions: Option<Vec<JudgeDecision>>,
    /// Tool payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<serde_json::Value>,
    /// When the status was fixed.
    pub timestamp: DateTime<Utc>,
}

impl ActionResult {
    /// Creates a result with no optional sections.
    #[must_use]
    pub fn new(
        action_id: impl Into<String>,
        command_type: CommandType,
        status: ActionStatus,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            command_type,
            status,
            rationale: rationale.into(),
            validation: None,
            judge_decisions: None,
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches a risk assessment.
    #[must_use]
    pub fn with_validation(mut self, validation: Option<ValidationResult>) -> Self {
        self.validation = validation;
        self
    }

    /// Attaches judge votes.
    #[must_use]
    pub fn with_judges(mut self, decisions: Option<Vec<JudgeDecision>>) -> Self {
        self.judge_decisions = decisions;
        self
    }

    /// Attaches the tool payload.
    #[must_use]
    pub fn with_tool_result(mut self, tool_result: serde_json::Value) -> Self {
        self.tool_result = Some(tool_result);
        self
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_lookup_ignores_case() {
        assert_eq!(CommandType::lookup("scan_site"), Some(CommandType::ScanSite));
        assert_eq!(
            "Connect_Integration".parse::<CommandType>(),
            Ok(CommandType::ConnectIntegration)
        );
        assert!(CommandType::lookup("LAUNCH_ROCKET").is_none());
    }

    #[test]
    fn status_serializes_to_wire_labels() {
        let json = serde_json::to_string(&ActionStatus::SuccessCached).unwrap();
        assert_eq!(json, "\"SUCCESS_CACHED\"");
        let json = serde_json::to_string(&CommandType::CheckIntegrationStatus).unwrap();
        assert_eq!(json, "\"CHECK_INTEGRATION_STATUS\"");
        for kind in CommandType::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, serde_json::json!(kind.as_str()));
        }
    }

    #[test]
    fn scores_are_clamped() {
        assert!((ValidationResult::new(1.7, "s", "p", true).risk_score - 1.0).abs() < f64::EPSILON);
        assert!(JudgeDecision::new("j", f64::NAN, "r", true).score.abs() < f64::EPSILON);
        assert!(ValidationResult::degraded("offline").degraded);
    }
}
