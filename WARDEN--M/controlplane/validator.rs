use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::commands::{Command, CommandType, Severity, ValidatedCommand};

/// Maximum length of any parameter value.
pub const MAX_VALUE_LENGTH: usize = 1000;

/// Per-type parameter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    /// Fields that must be present.
    pub required: &'static [&'static str],
    /// Fields that may be present.
    pub optional: &'static [&'static str],
    /// Severity assigned on success.
    pub severity: Severity,
}

impl Schema {
    /// Whether `field` is part of the contract.
    #[must_use]
    pub fn accepts(&self, field: &str) -> bool {
        self.required
            .iter()
            .chain(self.optional)
            .any(|known| *known == field)
    }
}

/// Schema for each command type.
#[must_use]
pub fn schema_for(command_type: CommandType) -> Schema {
    use Severity::{High, Low, Medium};
    let (required, optional, severity): (&[&str], &[&str], Severity) = match command_type {
        CommandType::ScanSite => (&["domain"], &[], Low),
        CommandType::PublishReport => (&["client", "dataset", "format"], &["template"], Medium),
        CommandType::StartCampaign => (
            &["channel", "campaign_id"],
            &["schedule_at", "budget"],
            High,
        ),
        CommandType::PostVimeo => (&["title", "url"], &["visibility"], Low),
        CommandType::TrainAgent => (&["dataset", "run"], &["hyperparams"], Low),
        CommandType::EnforcePolicy => (&["policy_id", "reason"], &[], High),
        CommandType::RevertAction => (&["action_id"], &["reason"], High),
        CommandType::CheckIntegrationStatus => (&["service"], &[], Low),
        CommandType::RefreshToken => (&["service"], &[], Medium),
        CommandType::ConnectIntegration => (&["service"], &[], High),
    };
    Schema {
        required,
        optional,
        severity,
    }
}

/// Schema violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required parameter is absent.
    #[error("{command_type} requires parameter `{field}`")]
    MissingField {
        /// Command type being validated.
        command_type: CommandType,
        /// Missing field.
        field: &'static str,
    },
    /// A parameter is not part of the schema.
    #[error("{command_type} does not accept parameter `{field}`")]
    UnknownField {
        /// Command type being validated.
        command_type: CommandType,
        /// Offending field.
        field: String,
    },
    /// A parameter value matched the denylist or exceeded the length limit.
    #[error("parameter `{field}` rejected: {reason}")]
    UnsafeValue {
        /// Offending field.
        field: String,
        /// Which rule fired.
        reason: String,
    },
}

static DENYLIST: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"[;|&$`]", "shell metacharacter"),
        (r"(?i)<\s*script", "script tag"),
        (r"(?i)union\s+(all\s+)?select", "SQL UNION SELECT"),
        (r"\.\.[/\\]", "path traversal"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("denylist pattern compiles"), label))
    .collect()
});

/// Checks commands against their schema and the injection denylist.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    max_value_length: usize,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self {
            max_value_length: MAX_VALUE_LENGTH,
        }
    }
}

impl CommandValidator {
    /// Creates a validator with a custom length limit.
    #[must_use]
    pub const fn with_max_value_length(max_value_length: usize) -> Self {
        Self { max_value_length }
    }

    /// Validates `command` and stamps it with the schema severity.
    pub fn validate(&self, command: Command) -> Result<ValidatedCommand, ValidationError> {
        let schema = schema_for(command.command_type);
        if let Some(field) = schema
            .required
            .iter()
            .find(|field| !command.params.contains_key(**field))
        {
            return Err(ValidationError::MissingField {
                command_type: command.command_type,
                field: *field,
            });
        }
        for (field, value) in &command.params {
            if !schema.accepts(field) {
                return Err(ValidationError::UnknownField {
                    command_type: command.command_type,
                    field: field.clone(),
                });
            }
            self.check_value(field, value)?;
        }
        Ok(ValidatedCommand::new(command, schema.severity))
    }

    /// Applies the length limit and denylist to one value.
    pub fn check_value(&self, field: &str, value: &str) -> Result<(), ValidationError> {
        if value.chars().count() > self.max_value_length {
            return Err(ValidationError::UnsafeValue {
                field: field.to_string(),
                reason: format!("longer than {} characters", self.max_value_length),
            });
        }
        if let Some((_, label)) = DENYLIST.iter().find(|(pattern, _)| pattern.is_match(value)) {
            return Err(ValidationError::UnsafeValue {
                field: field.to_string(),
                reason: (*label).to_string(),
            });
        }
        Ok(())
    }
}
