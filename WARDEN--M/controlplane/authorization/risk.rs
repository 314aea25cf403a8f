use std::{fmt, str::FromStr};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::chat::{ChatClient, ChatError};
use crate::{
    commands::{CommandType, Params, Severity, ValidationResult},
    validator::schema_for,
};

/// Score at or above which a command does not pass.
pub const RISK_THRESHOLD: f64 = 0.8;

/// Failure of a risk validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RiskError {
    /// Validator could not be reached.
    #[error("risk validator unavailable: {0}")]
    Unavailable(String),
    /// Validator answered with something that is not an assessment.
    #[error("invalid risk assessment: {0}")]
    InvalidResponse(String),
}

impl From<ChatError> for RiskError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Decode(message) => Self::InvalidResponse(message),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// What the orchestrator does when the validator fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskFailureMode {
    /// Continue with a degraded, flagged assessment.
    #[default]
    Open,
    /// Block the command.
    Closed,
}

impl fmt::Display for RiskFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

impl FromStr for RiskFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown risk failure mode `{other}`")),
        }
    }
}

/// Capability producing a risk assessment for a command.
#[async_trait]
pub trait RiskValidator: Send + Sync {
    /// Validator name used in logs.
    fn name(&self) -> &str;

    /// Assesses `command_type` with `params`.
    async fn validate(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<ValidationResult, RiskError>;
}

static RISK_PATTERNS: Lazy<Vec<(Regex, f64, &'static str)>> = Lazy::new(|| {
    [
        (
            "(?i)unauthorized access|privilege escalation",
            0.4,
            "privilege escalation keywords",
        ),
        (
            r"(?i)zero\s*day|exploit kit",
            0.5,
            "potential exploit content",
        ),
        (
            "(?i)delete all|drop database",
            0.4,
            "destructive intent",
        ),
    ]
    .into_iter()
    .map(|(pattern, weight, note)| {
        (
            Regex::new(pattern).expect("risk pattern compiles"),
            weight,
            note,
        )
    })
    .collect()
});

const fn base_score(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.1,
        Severity::Medium => 0.3,
        Severity::High => 0.5,
    }
}

/// Offline validator that scores from schema severity plus keyword signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRiskValidator;

impl HeuristicRiskValidator {
    /// Synchronous scoring used by the async trait method.
    #[must_use]
    pub fn assess(command_type: CommandType, params: &Params) -> ValidationResult {
        let severity = schema_for(command_type).severity;
        let payload = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");

        let mut score = base_score(severity);
        let mut signals = Vec::new();
        for (pattern, weight, note) in RISK_PATTERNS.iter() {
            if pattern.is_match(&payload) {
                score += weight;
                signals.push(*note);
            }
        }

        let score = score.min(1.0);
        let passed = score < RISK_THRESHOLD;
        let proof = if signals.is_empty() {
            format!("{severity} severity baseline, no risk signals")
        } else {
            format!("{severity} severity baseline; signals: {}", signals.join(", "))
        };
        ValidationResult::new(
            score,
            format!("{command_type} assessed at {score:.2}"),
            proof,
            passed,
        )
    }
}

#[async_trait]
impl RiskValidator for HeuristicRiskValidator {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn validate(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<ValidationResult, RiskError> {
        Ok(Self::assess(command_type, params))
    }
}

const RISK_PROMPT: &str = "You are a risk validator for an automated operations platform. \
Score the risk of executing the given command between 0 and 1. Answer with a JSON object \
with keys risk_score (number), summary (string), proof (string) and passed (boolean).";

/// Validator backed by an OpenAI-compatible model.
#[derive(Debug, Clone)]
pub struct HttpRiskValidator {
    client: ChatClient,
}

impl HttpRiskValidator {
    /// Wraps a chat client.
    #[must_use]
    pub const fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RiskValidator for HttpRiskValidator {
    fn name(&self) -> &str {
        self.client.model()
    }

    async fn validate(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<ValidationResult, RiskError> {
        let request = serde_json::json!({ "command_type": command_type, "params": params });
        let reply = self
            .client
            .complete_json(RISK_PROMPT, &request.to_string())
            .await?;
        parse_assessment(&reply)
    }
}

fn parse_assessment(reply: &Value) -> Result<ValidationResult, RiskError> {
    let score = reply
        .get("risk_score")
        .and_then(Value::as_f64)
        .ok_or_else(|| RiskError::InvalidResponse("missing risk_score".into()))?;
    let text = |key: &str| {
        reply
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let passed = reply
        .get("passed")
        .and_then(Value::as_bool)
        .unwrap_or(score < RISK_THRESHOLD);
    Ok(ValidationResult::new(score, text("summary"), text("proof"), passed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn routine_scan_passes() {
        let result = HeuristicRiskValidator
            .validate(CommandType::ScanSite, &params(&[("domain", "example.com")]))
            .await
            .unwrap();
        assert!(result.passed);
        assert!(result.risk_score < RISK_THRESHOLD);
        assert!(!result.degraded);
    }

    #[test]
    fn signals_raise_the_score() {
        let result = HeuristicRiskValidator::assess(
            CommandType::EnforcePolicy,
            &params(&[("policy", "privilege escalation then drop database")]),
        );
        assert!(!result.passed);
        assert!(result.proof.contains("destructive intent"));
    }

    #[test]
    fn failure_mode_parses() {
        assert_eq!("Closed".parse::<RiskFailureMode>(), Ok(RiskFailureMode::Closed));
        assert!("sideways".parse::<RiskFailureMode>().is_err());
        assert_eq!(RiskFailureMode::default(), RiskFailureMode::Open);
    }

    #[test]
    fn model_reply_is_parsed() {
        let result = parse_assessment(&json!({"risk_score": 0.9, "summary": "s"})).unwrap();
        assert!(!result.passed);
        assert!(parse_assessment(&json!({"summary": "none"})).is_err());
    }
}
