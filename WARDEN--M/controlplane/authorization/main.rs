//! Authorization stages run by the action orchestrator before any tool executes.

/// Static per-type authorization table.
pub mod policy;
/// Numeric risk assessment capability.
pub mod risk;
/// Independent reviewers and majority voting.
pub mod judges;
/// OpenAI-compatible chat client shared by the remote risk validator and judges.
pub mod chat;

pub use judges::{HttpJudge, Judge, JudgeError, JudgeFallback, JudgePanel, PanelVerdict, RuleJudge};
pub use policy::{PolicyDecision, PolicyGate, PolicyRule};
pub use risk::{
    HeuristicRiskValidator, HttpRiskValidator, RiskError, RiskFailureMode, RiskValidator,
};
