use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::commands::{CommandType, Params};

/// Extra condition attached to an `Allow` rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Constraint {
    /// Field value must be one of `values` (case-insensitive).
    AllowedValues {
        /// Constrained parameter.
        field: &'static str,
        /// Accepted values.
        values: &'static [&'static str],
    },
    /// Numeric field, when present, must not exceed `max`.
    MaxValue {
        /// Constrained parameter.
        field: &'static str,
        /// Upper bound.
        max: f64,
    },
    /// At most this many executions of the type per rolling window. The gate only checks
    /// the window; a slot is taken by [`PolicyGate::reserve`] when the tool is about to run.
    MaxPerWindow(u32),
}

/// Policy table entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum PolicyRule {
    /// Command may proceed subject to constraints.
    Allow {
        /// Forces the judge panel regardless of severity.
        require_judge_approval: bool,
        /// Conditions checked before allowing.
        constraints: &'static [Constraint],
    },
    /// Command is refused outright.
    Block {
        /// Reason quoted in the rationale.
        reason: &'static str,
    },
}

const CAMPAIGN_CONSTRAINTS: &[Constraint] = &[
    Constraint::AllowedValues {
        field: "channel",
        values: &["linkedin", "meta", "mailchimp"],
    },
    Constraint::MaxValue {
        field: "budget",
        max: 10_000.0,
    },
];

const TOKEN_REFRESH_CONSTRAINTS: &[Constraint] = &[Constraint::MaxPerWindow(5)];

/// Table entry for `command_type`.
#[must_use]
pub const fn rule_for(command_type: CommandType) -> PolicyRule {
    match command_type {
        CommandType::ConnectIntegration => PolicyRule::Block {
            reason: "New integrations require manual security and permissions review.",
        },
        CommandType::RefreshToken => PolicyRule::Allow {
            require_judge_approval: true,
            constraints: TOKEN_REFRESH_CONSTRAINTS,
        },
        CommandType::StartCampaign => PolicyRule::Allow {
            require_judge_approval: false,
            constraints: CAMPAIGN_CONSTRAINTS,
        },
        CommandType::EnforcePolicy | CommandType::RevertAction => PolicyRule::Allow {
            require_judge_approval: true,
            constraints: &[],
        },
        CommandType::ScanSite
        | CommandType::PublishReport
        | CommandType::PostVimeo
        | CommandType::TrainAgent
        | CommandType::CheckIntegrationStatus => PolicyRule::Allow {
            require_judge_approval: false,
            constraints: &[],
        },
    }
}

/// Gate outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Proceed to risk validation.
    Allow {
        /// Whether the judge panel must vote regardless of severity.
        require_judge_approval: bool,
    },
    /// Terminal refusal.
    Block {
        /// Command type whose policy fired.
        policy: CommandType,
        /// Policy reason.
        reason: String,
    },
}

impl PolicyDecision {
    /// Rationale recorded on a blocked result.
    #[must_use]
    pub fn rationale(&self) -> Option<String> {
        match self {
            Self::Allow { .. } => None,
            Self::Block { reason, .. } => Some(format!("Action blocked by policy: {reason}")),
        }
    }
}

/// Static authorization table plus the per-process rate window.
#[derive(Debug)]
pub struct PolicyGate {
    judge_overrides: BTreeMap<CommandType, bool>,
    window: Duration,
    recent: Mutex<HashMap<CommandType, VecDeque<Instant>>>,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl PolicyGate {
    /// Creates a gate with per-type judge requirement overrides.
    #[must_use]
    pub fn new(judge_overrides: BTreeMap<CommandType, bool>) -> Self {
        Self {
            judge_overrides,
            window: Duration::from_secs(3600),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the rolling window used by [`Constraint::MaxPerWindow`].
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Evaluates `command_type` with `params`. Rate constraints are checked, not consumed.
    pub fn evaluate(&self, command_type: CommandType, params: &Params) -> PolicyDecision {
        let (require_judge_approval, constraints) = match rule_for(command_type) {
            PolicyRule::Block { reason } => {
                info!(command_type = %command_type, reason, "policy block");
                return PolicyDecision::Block {
                    policy: command_type,
                    reason: reason.to_string(),
                };
            }
            PolicyRule::Allow {
                require_judge_approval,
                constraints,
            } => (require_judge_approval, constraints),
        };

        for constraint in constraints {
            if let Some(reason) = self.violation(command_type, params, constraint) {
                info!(command_type = %command_type, reason = %reason, "policy constraint violated");
                return PolicyDecision::Block {
                    policy: command_type,
                    reason,
                };
            }
        }

        PolicyDecision::Allow {
            require_judge_approval: self
                .judge_overrides
                .get(&command_type)
                .copied()
                .unwrap_or(require_judge_approval),
        }
    }

    fn violation(
        &self,
        command_type: CommandType,
        params: &Params,
        constraint: &Constraint,
    ) -> Option<String> {
        match *constraint {
            Constraint::AllowedValues { field, values } => {
                let value = params.get(field)?;
                (!values.iter().any(|allowed| allowed.eq_ignore_ascii_case(value))).then(|| {
                    format!("{field} `{value}` is not one of [{}]", values.join(", "))
                })
            }
            Constraint::MaxValue { field, max } => {
                let raw = params.get(field)?;
                match raw.trim().parse::<f64>() {
                    Ok(value) if value.is_finite() && value <= max => None,
                    Ok(_) => Some(format!("{field} {raw} exceeds the limit of {max}")),
                    Err(_) => Some(format!("{field} `{raw}` is not a number")),
                }
            }
            Constraint::MaxPerWindow(limit) => {
                let mut recent = self.recent.lock();
                let entries = recent.entry(command_type).or_default();
                prune(entries, self.window);
                self.window_full(command_type, entries, limit)
            }
        }
    }

    /// Takes a rate slot for `command_type` right before execution.
    ///
    /// Returns the block reason when a concurrent request filled the window since
    /// [`PolicyGate::evaluate`].
    pub fn reserve(&self, command_type: CommandType) -> Option<String> {
        let PolicyRule::Allow { constraints, .. } = rule_for(command_type) else {
            return None;
        };
        let mut recent = self.recent.lock();
        for constraint in constraints {
            if let Constraint::MaxPerWindow(limit) = *constraint {
                let entries = recent.entry(command_type).or_default();
                prune(entries, self.window);
                if let Some(reason) = self.window_full(command_type, entries, limit) {
                    info!(command_type = %command_type, reason = %reason, "rate window full at execution");
                    return Some(reason);
                }
                entries.push_back(Instant::now());
            }
        }
        None
    }

    fn window_full(
        &self,
        command_type: CommandType,
        entries: &VecDeque<Instant>,
        limit: u32,
    ) -> Option<String> {
        (entries.len() >= limit as usize).then(|| {
            format!(
                "{command_type} is limited to {limit} per {} minutes",
                self.window.as_secs() / 60
            )
        })
    }
}

fn prune(entries: &mut VecDeque<Instant>, window: Duration) {
    while entries
        .front()
        .is_some_and(|at| at.elapsed() >= window)
    {
        entries.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn connect_integration_is_always_blocked() {
        let gate = PolicyGate::default();
        for p in [params(&[]), params(&[("service", "salesforce")])] {
            let decision = gate.evaluate(CommandType::ConnectIntegration, &p);
            let rationale = decision.rationale().expect("blocked");
            assert!(rationale.contains("New integrations require manual security and permissions review."));
            assert!(rationale.starts_with("Action blocked by policy: "));
        }
    }

    #[test]
    fn every_type_has_a_rule() {
        let blocked: Vec<_> = CommandType::ALL
            .into_iter()
            .filter(|kind| matches!(rule_for(*kind), PolicyRule::Block { .. }))
            .collect();
        assert_eq!(blocked, vec![CommandType::ConnectIntegration]);
    }

    #[test]
    fn judge_requirement_comes_from_table_and_overrides() {
        let gate = PolicyGate::default();
        assert_eq!(
            gate.evaluate(CommandType::RevertAction, &params(&[("action_id", "a")])),
            PolicyDecision::Allow {
                require_judge_approval: true
            }
        );
        let gate = PolicyGate::new(BTreeMap::from([(CommandType::ScanSite, true)]));
        assert_eq!(
            gate.evaluate(CommandType::ScanSite, &params(&[("domain", "x.io")])),
            PolicyDecision::Allow {
                require_judge_approval: true
            }
        );
    }

    #[test]
    fn campaign_constraints() {
        let gate = PolicyGate::default();
        let ok = params(&[("channel", "LinkedIn"), ("campaign_id", "c"), ("budget", "9000")]);
        assert!(matches!(
            gate.evaluate(CommandType::StartCampaign, &ok),
            PolicyDecision::Allow { .. }
        ));
        let channel = params(&[("channel", "tiktok"), ("campaign_id", "c")]);
        assert!(gate
            .evaluate(CommandType::StartCampaign, &channel)
            .rationale()
            .unwrap()
            .contains("channel"));
        let spend = params(&[("channel", "meta"), ("campaign_id", "c"), ("budget", "25000")]);
        assert!(gate
            .evaluate(CommandType::StartCampaign, &spend)
            .rationale()
            .unwrap()
            .contains("budget"));
    }

    #[test]
    fn token_refresh_is_rate_limited() {
        let gate = PolicyGate::default();
        let p = params(&[("service", "hubspot")]);
        for _ in 0..5 {
            assert!(matches!(
                gate.evaluate(CommandType::RefreshToken, &p),
                PolicyDecision::Allow { .. }
            ));
            assert_eq!(gate.reserve(CommandType::RefreshToken), None);
        }
        assert!(matches!(
            gate.evaluate(CommandType::RefreshToken, &p),
            PolicyDecision::Block { .. }
        ));
    }

    #[test]
    fn rate_window_rolls_over() {
        let gate = PolicyGate::default().with_window(Duration::from_millis(20));
        let p = params(&[("service", "hubspot")]);
        for _ in 0..5 {
            assert_eq!(gate.reserve(CommandType::RefreshToken), None);
        }
        assert!(gate.reserve(CommandType::RefreshToken).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            gate.evaluate(CommandType::RefreshToken, &p),
            PolicyDecision::Allow { .. }
        ));
    }

    #[test]
    fn evaluation_alone_takes_no_rate_slot() {
        let gate = PolicyGate::default();
        let p = params(&[("service", "hubspot")]);
        for _ in 0..20 {
            assert!(matches!(
                gate.evaluate(CommandType::RefreshToken, &p),
                PolicyDecision::Allow { .. }
            ));
        }
        assert_eq!(gate.reserve(CommandType::RefreshToken), None);
        assert_eq!(gate.reserve(CommandType::ScanSite), None);
        assert_eq!(gate.reserve(CommandType::ConnectIntegration), None);
    }
}
