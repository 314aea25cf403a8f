//! Wiring of the control plane from configuration and secrets.

use std::sync::Arc;

use anyhow::{Context, Result};
use shared_event_bus::FileEventPublisher;
use tracing::info;

use crate::{
    authorization::{
        chat::ChatClient, HeuristicRiskValidator, HttpJudge, HttpRiskValidator, Judge, JudgePanel,
        PolicyGate, RiskValidator,
    },
    circuit::CircuitBreaker,
    config::{ControlPlaneConfig, Secrets},
    dispatcher::{ActionTransport, HttpTransport, RequestSigner, RequestVerifier, SignedDispatcher},
    idempotency::IdempotencyStore,
    killswitch::{FileKillSwitch, KillSwitch, StaticKillSwitch},
    kv::{KvStore, SqliteKvStore},
    lease::LeaseLock,
    ledger::{JsonlLedgerSink, Ledger},
    orchestrator::{ActionOrchestrator, LocalTransport},
    pipeline::CommandPipeline,
    poller::{CommandPoller, FileCommandQueue, PollerSettings},
    service::ServiceState,
    telemetry::ControlTelemetry,
    tools::ToolRegistry,
};

/// How the poller reaches the authorization service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Signed HTTP calls to `base_url`.
    #[default]
    Http,
    /// In-process orchestrator behind the same signature check.
    Local,
}

/// Builds the signer from the configured key.
pub fn signer(secrets: &Secrets) -> Result<RequestSigner> {
    RequestSigner::new(&secrets.signing_key).context("invalid signing key")
}

/// Structured sinks for `module`, or `None` when neither sink is configured.
pub fn telemetry(config: &ControlPlaneConfig, module: &str) -> Result<Option<ControlTelemetry>> {
    let sinks = &config.telemetry;
    if sinks.log_path.is_none() && sinks.event_log.is_none() {
        return Ok(None);
    }
    let mut builder = ControlTelemetry::builder(module);
    if let Some(path) = &sinks.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &sinks.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build().map(Some)
}

/// Authorization service with scoring backends chosen by configuration.
pub fn orchestrator(
    config: &ControlPlaneConfig,
    secrets: &Secrets,
    telemetry: Option<ControlTelemetry>,
) -> Result<ActionOrchestrator> {
    let (risk, judges): (Arc<dyn RiskValidator>, JudgePanel) = match &config.ai.endpoint {
        Some(endpoint) => {
            let client = ChatClient::new(
                endpoint.as_str(),
                secrets.risk_api_key.clone(),
                &config.ai.risk_model,
            )
            .context("building risk client")?;
            let judges = config
                .judges
                .iter()
                .map(|id| {
                    let client = ChatClient::new(
                        endpoint.as_str(),
                        secrets.judge_api_key.clone(),
                        &config.ai.judge_model,
                    )?;
                    Ok(Arc::new(HttpJudge::new(id.as_str(), client)) as Arc<dyn Judge>)
                })
                .collect::<Result<Vec<_>, crate::authorization::chat::ChatError>>()
                .context("building judge clients")?;
            (
                Arc::new(HttpRiskValidator::new(client)),
                JudgePanel::new(judges, config.judge_timeout, config.judge_fallback),
            )
        }
        None => (
            Arc::new(HeuristicRiskValidator),
            JudgePanel::rule_based(&config.judges, config.judge_timeout, config.judge_fallback),
        ),
    };
    let tools = match &config.webhook_url {
        Some(url) => ToolRegistry::with_webhook(url, config.dispatch_timeout)
            .context("building webhook tools")?,
        None => ToolRegistry::production_default(),
    };
    info!(
        validator = risk.name(),
        judges = judges.len(),
        webhook = config.webhook_url.is_some(),
        "authorization service configured"
    );

    let mut builder = ActionOrchestrator::builder()
        .policy(PolicyGate::new(config.judge_overrides()))
        .risk_validator(risk)
        .risk_timeout(config.risk_timeout)
        .risk_failure_mode(config.risk_failure_mode)
        .judges(judges)
        .tools(tools);
    if let Some(telemetry) = telemetry {
        builder = builder.telemetry(telemetry);
    }
    Ok(builder.build())
}

/// Router state of the authorization service process.
pub fn service_state(config: &ControlPlaneConfig, secrets: &Secrets) -> Result<ServiceState> {
    let verifier = Arc::new(RequestVerifier::new(signer(secrets)?, config.max_clock_skew));
    let telemetry = telemetry(config, "authorization")?;
    let orchestrator = Arc::new(orchestrator(config, secrets, telemetry)?);
    Ok(ServiceState::new(orchestrator, verifier))
}

/// Poller over the configured queue, ledger and dispatch transport.
pub async fn poller(
    config: &ControlPlaneConfig,
    secrets: &Secrets,
    mode: DispatchMode,
) -> Result<CommandPoller> {
    let signer = signer(secrets)?;
    let telemetry = telemetry(config, "poller")?;

    let transport: Arc<dyn ActionTransport> = match mode {
        DispatchMode::Http => {
            Arc::new(HttpTransport::new(config.base_url.as_str()).context("building http transport")?)
        }
        DispatchMode::Local => {
            let verifier = Arc::new(RequestVerifier::new(signer.clone(), config.max_clock_skew));
            let orchestrator = Arc::new(orchestrator(config, secrets, telemetry.clone())?);
            Arc::new(LocalTransport::new(orchestrator, verifier))
        }
    };
    let dispatcher = SignedDispatcher::new(
        signer,
        transport,
        Arc::new(CircuitBreaker::new("mcp_api", config.breaker)),
        config.dispatch_timeout,
    );

    let ledger = Ledger::open(Arc::new(JsonlLedgerSink::new(&config.ledger_path)))
        .await
        .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;

    let kill_switch: Arc<dyn KillSwitch> = match &config.kill_switch_path {
        Some(path) => Arc::new(FileKillSwitch::new(path)),
        None => Arc::new(StaticKillSwitch::default()),
    };

    let kv: Arc<dyn KvStore> = Arc::new(
        SqliteKvStore::open(&config.state_path)
            .with_context(|| format!("opening state store {}", config.state_path.display()))?,
    );
    let mut builder = CommandPipeline::builder(dispatcher, Arc::new(ledger))
        .idempotency(IdempotencyStore::new(kv.clone()))
        .idempotency_ttl(config.idempotency_ttl)
        .kill_switch(kill_switch)
        .signer(config.signer.as_str());
    if let Some(telemetry) = telemetry {
        builder = builder.telemetry(telemetry);
    }

    let settings = PollerSettings {
        lease_key: config.lease_key.clone(),
        lease_ttl: config.lease_ttl,
        poll_interval: config.poll_interval,
    };
    info!(
        queue = %config.queue_path.display(),
        ledger = %config.ledger_path.display(),
        state = %config.state_path.display(),
        ?mode,
        "poller configured"
    );
    Ok(CommandPoller::new(
        Arc::new(FileCommandQueue::new(&config.queue_path)),
        Arc::new(builder.build()),
        LeaseLock::new(kv),
        settings,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{commands::ActionStatus, ledger::verify_chain};
    use tempfile::tempdir;

    fn secrets() -> Secrets {
        Secrets {
            signing_key: b"bootstrap-key".to_vec(),
            risk_api_key: None,
            judge_api_key: None,
        }
    }

    #[test]
    fn empty_key_is_rejected() {
        let secrets = Secrets {
            signing_key: Vec::new(),
            ..secrets()
        };
        assert!(signer(&secrets).is_err());
    }

    #[test]
    fn telemetry_is_optional() {
        assert!(telemetry(&ControlPlaneConfig::default(), "test")
            .unwrap()
            .is_none());
    }

    #[test]
    fn offline_orchestrator_uses_heuristics() {
        let orchestrator = orchestrator(&ControlPlaneConfig::default(), &secrets(), None).unwrap();
        let health = orchestrator.health();
        assert_eq!(health.components["validator"]["name"], "heuristic");
        assert_eq!(
            health.components["judge"]["roster"],
            serde_json::json!(["security", "compliance", "business"])
        );
    }

    #[tokio::test]
    async fn local_poller_runs_end_to_end() {
        let tmp = tempdir().unwrap();
        let config = ControlPlaneConfig {
            queue_path: tmp.path().join("queue.txt"),
            ledger_path: tmp.path().join("ledger.jsonl"),
            state_path: tmp.path().join("state.db"),
            ..ControlPlaneConfig::default()
        };
        std::fs::write(&config.queue_path, "SCAN_SITE domain=example.com\n").unwrap();

        let poller = poller(&config, &secrets(), DispatchMode::Local).await.unwrap();
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.processed[0].result.status, ActionStatus::Success);

        let raw = std::fs::read_to_string(&config.ledger_path).unwrap();
        let entries = crate::ledger::parse_entries(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(verify_chain(&entries).valid);
    }

    #[tokio::test]
    async fn restarted_poller_does_not_rerun_commands() {
        let tmp = tempdir().unwrap();
        let config = ControlPlaneConfig {
            queue_path: tmp.path().join("queue.txt"),
            ledger_path: tmp.path().join("ledger.jsonl"),
            state_path: tmp.path().join("state.db"),
            ..ControlPlaneConfig::default()
        };
        std::fs::write(&config.queue_path, "SCAN_SITE domain=example.com\n").unwrap();

        let first = poller(&config, &secrets(), DispatchMode::Local).await.unwrap();
        let report = first.run_cycle().await.unwrap();
        assert_eq!(report.processed[0].result.status, ActionStatus::Success);
        drop(first);

        let restarted = poller(&config, &secrets(), DispatchMode::Local).await.unwrap();
        let report = restarted.run_cycle().await.unwrap();
        assert!(report.lease_acquired);
        assert_eq!(report.processed.len(), 1);
        assert!(report.processed[0].duplicate);
        assert_eq!(report.processed[0].result.status, ActionStatus::SuccessCached);

        let raw = std::fs::read_to_string(&config.ledger_path).unwrap();
        let entries = crate::ledger::parse_entries(&raw).unwrap();
        let statuses: Vec<_> = entries.iter().map(|entry| entry.result).collect();
        assert_eq!(statuses, [ActionStatus::Success, ActionStatus::SuccessCached]);
        assert!(verify_chain(&entries).valid);
    }

    #[tokio::test]
    async fn replicas_share_the_lease() {
        let tmp = tempdir().unwrap();
        let config = ControlPlaneConfig {
            queue_path: tmp.path().join("queue.txt"),
            ledger_path: tmp.path().join("ledger.jsonl"),
            state_path: tmp.path().join("state.db"),
            ..ControlPlaneConfig::default()
        };
        let holder = LeaseLock::new(Arc::new(SqliteKvStore::open(&config.state_path).unwrap()))
            .acquire_guarded(&config.lease_key, config.lease_ttl)
            .await
            .unwrap()
            .expect("lease is free");

        let replica = poller(&config, &secrets(), DispatchMode::Local).await.unwrap();
        assert!(!replica.run_cycle().await.unwrap().lease_acquired);
        holder.release().await.unwrap();
        assert!(replica.run_cycle().await.unwrap().lease_acquired);
    }

    #[tokio::test]
    async fn engaged_kill_switch_blocks_dispatch() {
        let tmp = tempdir().unwrap();
        let marker = tmp.path().join("STOP");
        std::fs::write(&marker, "").unwrap();
        let config = ControlPlaneConfig {
            queue_path: tmp.path().join("queue.txt"),
            ledger_path: tmp.path().join("ledger.jsonl"),
            state_path: tmp.path().join("state.db"),
            kill_switch_path: Some(marker),
            ..ControlPlaneConfig::default()
        };
        std::fs::write(&config.queue_path, "SCAN_SITE domain=example.com\n").unwrap();

        let poller = poller(&config, &secrets(), DispatchMode::Local).await.unwrap();
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.processed[0].result.status, ActionStatus::Blocked);
    }
}
