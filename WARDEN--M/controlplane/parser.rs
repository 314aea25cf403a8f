//! Line grammar: `TYPE key1=value1 key2="quoted value" ...`.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::commands::{Command, CommandType, Params};

static PARAM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\w+)=(?:"([^"]*)"|([^\s"]\S*))"#).expect("parameter pattern compiles")
});

/// Marker that starts a comment line.
pub const COMMENT_MARKER: char = '#';

/// Prefix of receipt lines written back into the queue.
pub const RECEIPT_PREFIX: &str = "RECEIPT:";

/// Reasons a non-blank line produced no command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// First token is not a known command type.
    #[error("line {line}: unknown command type `{label}`")]
    UnknownType {
        /// Line number.
        line: usize,
        /// Offending token.
        label: String,
    },
    /// Parameters could not be tokenised.
    #[error("line {line}: malformed parameters near `{fragment}`")]
    Malformed {
        /// Line number.
        line: usize,
        /// Text that failed to parse.
        fragment: String,
    },
}

/// Returns `true` for lines the parser ignores without error.
#[must_use]
pub fn is_ignorable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with(COMMENT_MARKER) || trimmed.starts_with(RECEIPT_PREFIX)
}

/// Parses one line, reporting why a non-blank line was rejected.
///
/// Blank, comment and receipt lines yield `Ok(None)`.
pub fn try_parse_line(line: &str, line_number: usize) -> Result<Option<Command>, ParseError> {
    if is_ignorable(line) {
        return Ok(None);
    }
    let trimmed = line.trim();
    let (label, rest) = trimmed
        .split_once(char::is_whitespace)
        .unwrap_or((trimmed, ""));
    let command_type = CommandType::lookup(label).ok_or_else(|| ParseError::UnknownType {
        line: line_number,
        label: label.to_string(),
    })?;
    let params = parse_params(rest, line_number)?;

    Ok(Some(Command {
        id: Uuid::new_v4(),
        command_type,
        params,
        raw_text: trimmed.to_string(),
        line_number,
        issued_at: Utc::now(),
    }))
}

/// Parses one line. Rejections are logged at warn level and yield `None`.
#[must_use]
pub fn parse_line(line: &str, line_number: usize) -> Option<Command> {
    match try_parse_line(line, line_number) {
        Ok(command) => command,
        Err(err) => {
            warn!(line = line_number, error = %err, "skipping unparseable command line");
            None
        }
    }
}

fn parse_params(rest: &str, line_number: usize) -> Result<Params, ParseError> {
    let mut params = Params::new();
    let mut cursor = 0;
    for captures in PARAM_PATTERN.captures_iter(rest) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let gap = &rest[cursor..whole.start()];
        let separated = cursor == 0 || gap.chars().next().is_some_and(char::is_whitespace);
        if !gap.trim().is_empty() || !separated {
            return Err(malformed(line_number, &rest[cursor..whole.end()]));
        }
        let key = captures.get(1).map_or("", |m| m.as_str());
        let value = captures
            .get(2)
            .or_else(|| captures.get(3))
            .map_or("", |m| m.as_str());
        params.insert(key.to_string(), value.to_string());
        cursor = whole.end();
    }
    let tail = &rest[cursor..];
    if !tail.trim().is_empty() {
        return Err(malformed(line_number, tail.trim()));
    }
    Ok(params)
}

fn malformed(line: usize, fragment: &str) -> ParseError {
    ParseError::Malformed {
        line,
        fragment: fragment.trim().to_string(),
    }
}
