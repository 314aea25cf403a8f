use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    authorization::{judges::JudgeFallback, risk::RiskFailureMode},
    circuit::BreakerConfig,
    commands::CommandType,
};

/// Default location of mounted secret files.
pub const DEFAULT_SECRETS_DIR: &str = "/mnt/secrets";

/// Secret holding the dispatch signing key.
pub const SIGNING_KEY_SECRET: &str = "MCP_PRIVATE_KEY";

/// Configuration failures. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("reading config {}: {source}", path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not valid TOML for this schema.
    #[error("parsing config {}: {message}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },
    /// An environment override could not be parsed.
    #[error("environment variable {key}={value:?} is invalid")]
    InvalidEnv {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// A required secret is missing from both the secrets directory and the environment.
    #[error("required secret {0} is not configured")]
    MissingSecret(String),
}

/// Endpoints of the OpenAI-compatible scoring services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Base URL exposing `/chat/completions`. `None` selects the offline heuristics.
    pub endpoint: Option<String>,
    /// Model used by the risk validator.
    pub risk_model: String,
    /// Model used by each judge.
    pub judge_model: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            risk_model: "llama-3.1-70b-versatile".into(),
            judge_model: "mistral-large-latest".into(),
        }
    }
}

/// Optional structured-log and event sinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// JSON-lines log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    pub event_log: Option<PathBuf>,
}

/// Full control-plane configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Delay between poll cycles.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Dedup window of the idempotency store.
    #[serde(with = "duration_secs")]
    pub idempotency_ttl: Duration,
    /// Lease key shared by every poller replica.
    pub lease_key: String,
    /// Lease lifetime; renewed every third of it while a cycle runs.
    #[serde(with = "duration_secs")]
    pub lease_ttl: Duration,
    /// Dispatch circuit breaker.
    pub breaker: BreakerConfig,
    /// Bound on one dispatch round trip.
    #[serde(with = "duration_secs")]
    pub dispatch_timeout: Duration,
    /// Bound on one risk validation.
    #[serde(with = "duration_secs")]
    pub risk_timeout: Duration,
    /// Bound on each judge query.
    #[serde(with = "duration_secs")]
    pub judge_timeout: Duration,
    /// Accepted clock skew for signed requests.
    #[serde(with = "duration_secs")]
    pub max_clock_skew: Duration,
    /// Authorization service base URL.
    pub base_url: String,
    /// Address the authorization service binds to.
    pub bind: String,
    /// Command queue file.
    pub queue_path: PathBuf,
    /// Ledger file.
    pub ledger_path: PathBuf,
    /// SQLite database holding idempotency claims, cached results and the poller lease.
    /// Every replica must point at the same file.
    pub state_path: PathBuf,
    /// Signer recorded on ledger entries.
    pub signer: String,
    /// Behaviour when the risk validator is unavailable.
    pub risk_failure_mode: RiskFailureMode,
    /// Vote substituted for a judge that fails.
    pub judge_fallback: JudgeFallback,
    /// Judge roster.
    pub judges: Vec<String>,
    /// Per-type override of the policy table's judge requirement, keyed by wire label.
    pub require_judge_approval: BTreeMap<String, bool>,
    /// File whose presence engages the kill switch.
    pub kill_switch_path: Option<PathBuf>,
    /// Webhook receiving tool executions; simulated tools are used when unset.
    pub webhook_url: Option<String>,
    /// Scoring services.
    pub ai: AiConfig,
    /// Structured telemetry sinks.
    pub telemetry: TelemetryConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(3600),
            lease_key: "command-poller-lock".into(),
            lease_ttl: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
            dispatch_timeout: Duration::from_secs(30),
            risk_timeout: Duration::from_secs(10),
            judge_timeout: Duration::from_secs(10),
            max_clock_skew: Duration::from_secs(300),
            base_url: "http://mcp-orchestrator:8080".into(),
            bind: "0.0.0.0:8080".into(),
            queue_path: PathBuf::from("command_queue.txt"),
            ledger_path: PathBuf::from("ledger.jsonl"),
            state_path: PathBuf::from("warden_state.db"),
            signer: "command_poller".into(),
            risk_failure_mode: RiskFailureMode::Open,
            judge_fallback: JudgeFallback::Approve,
            judges: vec!["security".into(), "compliance".into(), "business".into()],
            require_judge_approval: BTreeMap::new(),
            kill_switch_path: None,
            webhook_url: None,
            ai: AiConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Loads the optional TOML file, then applies process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Applies overrides from `lookup` (the process environment in production).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|raw| parse_env::<u64>(key, &raw).map(Duration::from_secs))
                .transpose()
        };
        if let Some(value) = secs("POLL_INTERVAL_SECONDS")? {
            self.poll_interval = value;
        }
        if let Some(value) = secs("IDEMPOTENCY_TTL_SECONDS")? {
            self.idempotency_ttl = value;
        }
        if let Some(value) = secs("LEASE_TTL_SECONDS")? {
            self.lease_ttl = value;
        }
        if let Some(value) = secs("BREAKER_COOLDOWN_SECONDS")? {
            self.breaker.cooldown = value;
        }
        if let Some(value) = secs("DISPATCH_TIMEOUT_SECONDS")? {
            self.dispatch_timeout = value;
        }
        if let Some(raw) = lookup("BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_env("BREAKER_FAILURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("RISK_FAILURE_MODE") {
            self.risk_failure_mode = parse_env("RISK_FAILURE_MODE", &raw)?;
        }
        if let Some(raw) = lookup("JUDGE_FALLBACK") {
            self.judge_fallback = parse_env("JUDGE_FALLBACK", &raw)?;
        }
        if let Some(value) = lookup("LEASE_KEY") {
            self.lease_key = value;
        }
        if let Some(value) = lookup("MCP_BASE_URL") {
            self.base_url = value;
        }
        if let Some(value) = lookup("WARDEN_BIND") {
            self.bind = value;
        }
        if let Some(value) = lookup("COMMAND_QUEUE_PATH") {
            self.queue_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("LEDGER_PATH") {
            self.ledger_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("STATE_DB_PATH") {
            self.state_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("LEDGER_SIGNER") {
            self.signer = value;
        }
        if let Some(value) = lookup("KILL_SWITCH_PATH") {
            self.kill_switch_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("WEBHOOK_URL") {
            self.webhook_url = Some(value);
        }
        if let Some(value) = lookup("AI_ENDPOINT") {
            self.ai.endpoint = Some(value);
        }
        Ok(())
    }

    /// Configured judge requirement for `command_type`, if any.
    #[must_use]
    pub fn judge_override(&self, command_type: CommandType) -> Option<bool> {
        self.require_judge_approval
            .iter()
            .find(|(label, _)| CommandType::lookup(label) == Some(command_type))
            .map(|(_, required)| *required)
    }

    /// Every override, resolved to command types. Unknown labels are ignored.
    #[must_use]
    pub fn judge_overrides(&self) -> BTreeMap<CommandType, bool> {
        self.require_judge_approval
            .iter()
            .filter_map(|(label, required)| Some((CommandType::lookup(label)?, *required)))
            .collect()
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Reads secrets from a mounted directory, falling back to the environment.
#[derive(Debug, Clone)]
pub struct SecretSource {
    dir: PathBuf,
}

impl Default for SecretSource {
    fn default() -> Self {
        let dir = std::env::var("SECRETS_DIR").unwrap_or_else(|_| DEFAULT_SECRETS_DIR.into());
        Self::new(dir)
    }
}

impl SecretSource {
    /// Uses `dir` as the secrets mount.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves `name` from `<dir>/<name>` first, then the environment. Blank values count as missing.
    #[must_use]
    pub fn read(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(name))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                std::env::var(name)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    /// Like [`SecretSource::read`] but fails when the secret is absent.
    pub fn require(&self, name: &str) -> Result<String, ConfigError> {
        self.read(name)
            .ok_or_else(|| ConfigError::MissingSecret(name.to_string()))
    }
}

/// Credentials used by the control plane.
#[derive(Clone)]
pub struct Secrets {
    /// HMAC key shared by the poller and the authorization service.
    pub signing_key: Vec<u8>,
    /// Bearer token for the risk service.
    pub risk_api_key: Option<String>,
    /// Bearer token for the judge service.
    pub judge_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("signing_key", &"<redacted>")
            .field("risk_api_key", &self.risk_api_key.as_ref().map(|_| "<redacted>"))
            .field("judge_api_key", &self.judge_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    /// Loads every secret. A missing signing key is a [`ConfigError::MissingSecret`].
    pub fn load(source: &SecretSource) -> Result<Self, ConfigError> {
        Ok(Self {
            signing_key: source.require(SIGNING_KEY_SECRET)?.into_bytes(),
            risk_api_key: source.read("RISK_API_KEY"),
            judge_api_key: source.read("JUDGE_API_KEY"),
        })
    }
}

/// Serde adapter storing a [`Duration`] as (possibly fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    /// Serializes as seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    /// Deserializes from integer or float seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
