use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::commands::{CommandType, Params};

/// Failure while executing a tool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No tool is registered for the command type.
    #[error("no tool registered for {0}")]
    Unsupported(CommandType),
    /// The remote endpoint failed.
    #[error("remote tool call failed: {0}")]
    Remote(String),
    /// The tool itself reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// Executor for one command type.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Command type served by this tool.
    fn command_type(&self) -> CommandType;
    /// Human readable tool name.
    fn name(&self) -> &str;
    /// Runs the tool and returns its payload.
    async fn execute(&self, params: &Params) -> Result<Value, ToolError>;
}

/// In-process tool returning a deterministic simulated payload.
#[derive(Debug, Clone)]
pub struct SimulatedTool {
    command_type: CommandType,
    name: String,
}

impl SimulatedTool {
    /// Creates the simulated tool for `command_type`.
    #[must_use]
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_type,
            name: format!("simulated:{}", command_type.as_str().to_ascii_lowercase()),
        }
    }

    fn payload(&self, params: &Params) -> Value {
        let param = |key: &str| params.get(key).cloned().unwrap_or_default();
        match self.command_type {
            CommandType::ScanSite => json!({
                "domain": param("domain"),
                "grade": "A",
                "status": "simulated",
            }),
            CommandType::StartCampaign => json!({
                "campaign_id": param("campaign_id"),
                "channel": param("channel"),
                "handle": format!("cmp-{}", param("campaign_id")),
                "status": "simulated",
            }),
            CommandType::CheckIntegrationStatus => json!({
                "service": param("service"),
                "connected": true,
                "status": "simulated",
            }),
            _ => {
                let mut body: Map<String, Value> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                body.insert("status".into(), Value::String("simulated".into()));
                Value::Object(body)
            }
        }
    }
}

#[async_trait]
impl Tool for SimulatedTool {
    fn command_type(&self) -> CommandType {
        self.command_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
        Ok(self.payload(params))
    }
}

/// Tool that forwards `{action, ...params}` to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookTool {
    client: reqwest::Client,
    url: String,
    command_type: CommandType,
    action: String,
    name: String,
}

impl WebhookTool {
    /// Creates a webhook tool posting `action` for `command_type`.
    pub fn new(
        url: impl Into<String>,
        command_type: CommandType,
        action: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ToolError::Remote(err.to_string()))?;
        let action = action.into();
        Ok(Self {
            client,
            url: url.into(),
            command_type,
            name: format!("webhook:{action}"),
            action,
        })
    }
}

#[async_trait]
impl Tool for WebhookTool {
    fn command_type(&self) -> CommandType {
        self.command_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
        let mut body: Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        body.insert("action".into(), Value::String(self.action.clone()));

        info!(action = %self.action, url = %self.url, "calling webhook");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ToolError::Remote(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(action = %self.action, status = status.as_u16(), "webhook rejected call");
            return Err(ToolError::Remote(format!("webhook answered {status}")));
        }
        let text = response
            .text()
            .await
            .map_err(|err| ToolError::Remote(err.to_string()))?;
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "status": "ok", "body": text })))
    }
}

/// Registry mapping command types to tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<CommandType, Arc<dyn Tool>>,
    fallback: Option<Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "tools",
                &self.tools.values().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.as_ref().map(|t| t.name()))
            .finish()
    }
}

/// Webhook action labels for the tools routed to the webhook.
const WEBHOOK_ACTIONS: [(CommandType, &str); 3] = [
    (CommandType::StartCampaign, "meta_campaign"),
    (CommandType::CheckIntegrationStatus, "get_integration_status"),
    (CommandType::RefreshToken, "refresh_token"),
];

impl ToolRegistry {
    /// Registry with a simulated tool for every command type.
    #[must_use]
    pub fn production_default() -> Self {
        let mut registry = Self::default();
        for command_type in CommandType::ALL {
            registry.register(Arc::new(SimulatedTool::new(command_type)));
        }
        registry
    }

    /// Default registry with the integration tools routed through `url`.
    pub fn with_webhook(url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let mut registry = Self::production_default();
        for (command_type, action) in WEBHOOK_ACTIONS {
            registry.register(Arc::new(WebhookTool::new(url, command_type, action, timeout)?));
        }
        Ok(registry)
    }

    /// Registers `tool` for its command type, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.command_type(), tool);
    }

    /// Sets the tool used for unregistered command types.
    pub fn set_fallback(&mut self, tool: Arc<dyn Tool>) {
        self.fallback = Some(tool);
    }

    /// Resolves the tool for `command_type`.
    #[must_use]
    pub fn resolve(&self, command_type: CommandType) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(&command_type)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Resolves and runs the tool for `command_type`.
    pub async fn execute(
        &self,
        command_type: CommandType,
        params: &Params,
    ) -> Result<Value, ToolError> {
        let tool = self
            .resolve(command_type)
            .ok_or(ToolError::Unsupported(command_type))?;
        info!(command_type = %command_type, tool = tool.name(), "executing tool");
        tool.execute(params).await
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

    #[tokio::test]
    async fn scan_site_is_simulated() {
        let registry = ToolRegistry::production_default();
        let payload = registry
            .execute(CommandType::ScanSite, &params(&[("domain", "example.com")]))
            .await
            .unwrap();
        assert_eq!(payload["grade"], "A");
        assert_eq!(payload["domain"], "example.com");
    }

    #[tokio::test]
    async fn types_without_a_dedicated_payload_echo_their_params() {
        let payload = SimulatedTool::new(CommandType::TrainAgent)
            .execute(&params(&[("dataset", "d1"), ("run", "r7")]))
            .await
            .unwrap();
        assert_eq!(payload["dataset"], "d1");
        assert_eq!(payload["run"], "r7");
        assert_eq!(payload["status"], "simulated");
    }

    #[tokio::test]
    async fn empty_registry_reports_unsupported() {
        let registry = ToolRegistry::default();
        let err = registry
            .execute(CommandType::TrainAgent, &Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::Unsupported(CommandType::TrainAgent));
    }

    #[tokio::test]
    async fn fallback_serves_unregistered_types() {
        let mut registry = ToolRegistry::default();
        registry.set_fallback(Arc::new(SimulatedTool::new(CommandType::TrainAgent)));
        assert!(registry.resolve(CommandType::PostVimeo).is_some());
    }

    #[test]
    fn webhook_registry_overrides_integration_tools() {
        let registry =
            ToolRegistry::with_webhook("http://127.0.0.1:9/hook", Duration::from_secs(1)).unwrap();
        assert_eq!(
            registry.resolve(CommandType::RefreshToken).unwrap().name(),
            "webhook:refresh_token"
        );
        assert!(registry
            .resolve(CommandType::ScanSite)
            .unwrap()
            .name()
            .starts_with("simulated"));
    }
}
