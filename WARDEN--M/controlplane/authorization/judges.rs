use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::chat::{ChatClient, ChatError};
use crate::commands::{CommandType, JudgeDecision, Params, ValidationResult};

/// Failure of a single judge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JudgeError {
    /// Judge could not be reached.
    #[error("judge unavailable: {0}")]
    Unavailable(String),
    /// Judge answered with something that is not a decision.
    #[error("invalid judge decision: {0}")]
    InvalidResponse(String),
}

impl From<ChatError> for JudgeError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Decode(message) => Self::InvalidResponse(message),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Vote substituted for a judge that errored or timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeFallback {
    /// Count the missing judge as an approval.
    #[default]
    Approve,
    /// Count the missing judge as a rejection.
    Reject,
}

impl JudgeFallback {
    const fn approves(self) -> bool {
        matches!(self, Self::Approve)
    }
}

impl fmt::Display for JudgeFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        })
    }
}

impl FromStr for JudgeFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown judge fallback `{other}`")),
        }
    }
}

/// Independent reviewer of a command.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Roster name.
    fn id(&self) -> &str;

    /// Casts a vote on `command_type` with `params`.
    async fn judge(
        &self,
        command_type: CommandType,
        params: &Params,
        validation: Option<&ValidationResult>,
    ) -> Result<JudgeDecision, JudgeError>;
}

/// Outcome of one panel vote.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelVerdict {
    /// One decision per rostered judge, in roster order.
    pub decisions: Vec<JudgeDecision>,
    /// Number of approving votes.
    pub approvals: usize,
    /// Strict majority reached.
    pub approved: bool,
}

impl PanelVerdict {
    fn tally(decisions: Vec<JudgeDecision>) -> Self {
        let approvals = decisions.iter().filter(|d| d.approved).count();
        let approved = !decisions.is_empty() && approvals * 2 > decisions.len();
        Self {
            decisions,
            approvals,
            approved,
        }
    }

    /// Whether any vote was substituted.
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.decisions.iter().any(|d| d.fallback)
    }
}

/// Fixed roster of judges queried concurrently with a join barrier before the tally.
pub struct JudgePanel {
    judges: Vec<Arc<dyn Judge>>,
    timeout: Duration,
    fallback: JudgeFallback,
}

impl fmt::Debug for JudgePanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgePanel")
            .field("roster", &self.roster())
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl JudgePanel {
    /// Creates a panel.
    #[must_use]
    pub fn new(judges: Vec<Arc<dyn Judge>>, timeout: Duration, fallback: JudgeFallback) -> Self {
        Self {
            judges,
            timeout,
            fallback,
        }
    }

    /// Panel of offline [`RuleJudge`]s named by `roster`.
    #[must_use]
    pub fn rule_based(roster: &[String], timeout: Duration, fallback: JudgeFallback) -> Self {
        let judges = roster
            .iter()
            .map(|id| Arc::new(RuleJudge::new(id.clone())) as Arc<dyn Judge>)
            .collect();
        Self::new(judges, timeout, fallback)
    }

    /// Judge names in roster order.
    #[must_use]
    pub fn roster(&self) -> Vec<String> {
        self.judges.iter().map(|j| j.id().to_string()).collect()
    }

    /// Number of judges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.judges.len()
    }

    /// Whether the roster is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.judges.is_empty()
    }

    /// Queries every judge and tallies a strict majority.
    pub async fn review(
        &self,
        command_type: CommandType,
        params: &Params,
        validation: Option<&ValidationResult>,
    ) -> PanelVerdict {
        let votes = self.judges.iter().map(|judge| async move {
            let outcome =
                tokio::time::timeout(self.timeout, judge.judge(command_type, params, validation))
                    .await;
            match outcome {
                Ok(Ok(mut decision)) => {
                    decision.judge_id = judge.id().to_string();
                    decision
                }
                Ok(Err(err)) => self.substitute(judge.id(), &err.to_string()),
                Err(_) => self.substitute(
                    judge.id(),
                    &format!("timed out after {}ms", self.timeout.as_millis()),
                ),
            }
        });
        let verdict = PanelVerdict::tally(join_all(votes).await);
        debug!(
            command_type = %command_type,
            approvals = verdict.approvals,
            total = verdict.decisions.len(),
            approved = verdict.approved,
            "judge panel tallied"
        );
        verdict
    }

    fn substitute(&self, judge_id: &str, reason: &str) -> JudgeDecision {
        warn!(judge = judge_id, reason, fallback = %self.fallback, "judge unavailable, substituting vote");
        let mut decision = JudgeDecision::new(
            judge_id,
            0.5,
            format!("Judge unavailable: {reason}"),
            self.fallback.approves(),
        );
        decision.fallback = true;
        decision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lens {
    Security,
    Compliance,
    Business,
}

/// Offline judge applying a fixed rule set for its lens.
///
/// `security` rejects risky or failed assessments, `compliance` rejects
/// irreversible actions backed only by a degraded assessment, `business`
/// rejects campaigns above the discretionary budget. Unknown names use the
/// security lens.
#[derive(Debug, Clone)]
pub struct RuleJudge {
    id: String,
    lens: Lens,
}

/// Budget above which the business lens wants a human.
const DISCRETIONARY_BUDGET: f64 = 5_000.0;

impl RuleJudge {
    /// Creates a judge whose lens is chosen by `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let lens = match id.to_ascii_lowercase().as_str() {
            "compliance" => Lens::Compliance,
            "business" => Lens::Business,
            _ => Lens::Security,
        };
        Self { id, lens }
    }

    fn decide(
        &self,
        command_type: CommandType,
        params: &Params,
        validation: Option<&ValidationResult>,
    ) -> JudgeDecision {
        let risk = validation.map_or(0.5, |v| v.risk_score);
        let (approved, rationale) = match self.lens {
            Lens::Security => match validation {
                Some(v) if !v.passed => (false, "risk assessment did not pass".to_string()),
                _ if risk >= 0.6 => (false, format!("risk {risk:.2} is too high")),
                _ => (true, format!("risk {risk:.2} is acceptable")),
            },
            Lens::Compliance => {
                let irreversible = matches!(
                    command_type,
                    CommandType::EnforcePolicy | CommandType::RevertAction
                );
                let unverified = validation.is_none_or(|v| v.degraded);
                if irreversible && unverified {
                    (
                        false,
                        format!("{command_type} needs a verified risk assessment"),
                    )
                } else {
                    (true, "no compliance concerns".to_string())
                }
            }
            Lens::Business => {
                let budget = params
                    .get("budget")
                    .and_then(|raw| raw.trim().parse::<f64>().ok());
                match budget {
                    Some(budget) if budget > DISCRETIONARY_BUDGET => (
                        false,
                        format!("budget {budget} exceeds discretionary limit"),
                    ),
                    _ => (true, "within business guidelines".to_string()),
                }
            }
        };
        let score = if approved { 1.0 - risk / 2.0 } else { risk };
        JudgeDecision::new(self.id.clone(), score, rationale, approved)
    }
}

#[async_trait]
impl Judge for RuleJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn judge(
        &self,
        command_type: CommandType,
        params: &Params,
        validation: Option<&ValidationResult>,
    ) -> Result<JudgeDecision, JudgeError> {
        Ok(self.decide(command_type, params, validation))
    }
}

/// Judge backed by an OpenAI-compatible model, prompted with its roster name as the area of expertise.
#[derive(Debug, Clone)]
pub struct HttpJudge {
    id: String,
    client: ChatClient,
}

impl HttpJudge {
    /// Creates a remote judge.
    #[must_use]
    pub fn new(id: impl Into<String>, client: ChatClient) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }
}

#[async_trait]
impl Judge for HttpJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn judge(
        &self,
        command_type: CommandType,
        params: &Params,
        validation: Option<&ValidationResult>,
    ) -> Result<JudgeDecision, JudgeError> {
        let system = format!(
            "You are a {} expert reviewing automated actions. Respond with JSON: \
             {{\"score\": 0.0-1.0, \"rationale\": \"reasoning\", \"approved\": true/false}}",
            self.id
        );
        let request = serde_json::json!({
            "command_type": command_type,
            "params": params,
            "risk": validation.map(|v| serde_json::json!({
                "summary": v.summary,
                "risk_score": v.risk_score,
            })),
        });
        let reply = self.client.complete_json(&system, &request.to_string()).await?;
        parse_decision(&self.id, &reply)
    }
}

fn parse_decision(judge_id: &str, reply: &Value) -> Result<JudgeDecision, JudgeError> {
    let approved = reply
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| JudgeError::InvalidResponse("missing approved".into()))?;
    let score = reply.get("score").and_then(Value::as_f64).unwrap_or(0.5);
    let rationale = reply
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or("Analysis complete");
    Ok(JudgeDecision::new(judge_id, score, rationale, approved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedJudge {
        id: String,
        vote: Option<bool>,
        delay: Duration,
    }

    impl FixedJudge {
        fn arc(id: &str, vote: Option<bool>) -> Arc<dyn Judge> {
            Arc::new(Self {
                id: id.into(),
                vote,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Judge for FixedJudge {
        fn id(&self) -> &str {
            &self.id
        }

        async fn judge(
            &self,
            _command_type: CommandType,
            _params: &Params,
            _validation: Option<&ValidationResult>,
        ) -> Result<JudgeDecision, JudgeError> {
            tokio::time::sleep(self.delay).await;
            self.vote
                .map(|approved| JudgeDecision::new(self.id.clone(), 0.9, "fixed", approved))
                .ok_or_else(|| JudgeError::Unavailable("offline".into()))
        }
    }

    fn panel(votes: &[Option<bool>], fallback: JudgeFallback) -> JudgePanel {
        let judges = votes
            .iter()
            .enumerate()
            .map(|(i, vote)| FixedJudge::arc(&format!("j{i}"), *vote))
            .collect();
        JudgePanel::new(judges, Duration::from_millis(200), fallback)
    }

    #[tokio::test]
    async fn two_of_three_proceeds() {
        let verdict = panel(&[Some(true), Some(true), Some(false)], JudgeFallback::Approve)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(verdict.approved);
        assert_eq!(verdict.approvals, 2);
        assert_eq!(verdict.decisions.len(), 3);
    }

    #[tokio::test]
    async fn one_of_three_does_not() {
        let verdict = panel(&[Some(true), Some(false), Some(false)], JudgeFallback::Approve)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(!verdict.approved);
    }

    #[tokio::test]
    async fn even_split_is_not_a_majority() {
        let verdict = panel(&[Some(true), Some(false)], JudgeFallback::Approve)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(!verdict.approved);
        let empty = panel(&[], JudgeFallback::Approve)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(!empty.approved);
    }

    #[tokio::test]
    async fn failing_judge_gets_flagged_fallback_vote() {
        let verdict = panel(&[None, Some(true), Some(false)], JudgeFallback::Approve)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(verdict.approved);
        assert!(verdict.has_fallback());
        assert!(verdict.decisions[0].fallback);
        assert_eq!(verdict.decisions[0].judge_id, "j0");

        let strict = panel(&[None, Some(true), Some(false)], JudgeFallback::Reject)
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(!strict.approved);
    }

    #[tokio::test]
    async fn slow_judge_times_out_into_fallback() {
        let slow: Arc<dyn Judge> = Arc::new(FixedJudge {
            id: "slow".into(),
            vote: Some(false),
            delay: Duration::from_secs(5),
        });
        let panel = JudgePanel::new(
            vec![slow, FixedJudge::arc("a", Some(true))],
            Duration::from_millis(30),
            JudgeFallback::Approve,
        );
        let verdict = panel
            .review(CommandType::PublishReport, &Params::new(), None)
            .await;
        assert!(verdict.decisions[0].fallback);
        assert!(verdict.decisions[0].rationale.contains("timed out"));
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn rule_judges_follow_their_lens() {
        let roster = ["security", "compliance", "business"].map(String::from);
        let panel = JudgePanel::rule_based(&roster, Duration::from_secs(1), JudgeFallback::Approve);
        let validation = ValidationResult::new(0.2, "ok", "baseline", true);
        let mut params = Params::new();
        params.insert("budget".into(), "9000".into());
        let verdict = panel
            .review(CommandType::StartCampaign, &params, Some(&validation))
            .await;
        assert_eq!(verdict.approvals, 2);
        assert!(verdict.approved);

        let degraded = ValidationResult::degraded("offline");
        let verdict = panel
            .review(CommandType::RevertAction, &Params::new(), Some(&degraded))
            .await;
        assert!(!verdict.decisions[1].approved);
    }

    #[test]
    fn model_decision_is_parsed() {
        let decision = parse_decision("security", &json!({"approved": false, "score": 0.3})).unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.rationale, "Analysis complete");
        assert!(parse_decision("security", &json!({"score": 0.3})).is_err());
    }

    #[test]
    fn fallback_parses() {
        assert_eq!("reject".parse::<JudgeFallback>(), Ok(JudgeFallback::Reject));
        assert!("maybe".parse::<JudgeFallback>().is_err());
    }
}
