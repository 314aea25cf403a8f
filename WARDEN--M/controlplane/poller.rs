use std::{collections::HashSet, fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::{
    commands::ActionStatus,
    idempotency::fingerprint,
    lease::LeaseLock,
    parser::{is_ignorable, try_parse_line},
    pipeline::{CommandPipeline, ControlError, ProcessedCommand},
};

/// Document the poller reads commands from and writes status lines back into.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Current lines in document order.
    async fn read_lines(&self) -> Result<Vec<String>, ControlError>;
    /// Appends a status line to the document.
    async fn append_status(&self, line: &str) -> Result<(), ControlError>;
}

/// Plain-text queue file standing in for the shared document.
#[derive(Debug, Clone)]
pub struct FileCommandQueue {
    path: PathBuf,
}

impl FileCommandQueue {
    /// Uses `path`; a missing file reads as empty.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn source_error(&self, err: &std::io::Error) -> ControlError {
        ControlError::Source(format!("{}: {err}", self.path.display()))
    }
}

#[async_trait]
impl CommandSource for FileCommandQueue {
    async fn read_lines(&self) -> Result<Vec<String>, ControlError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(self.source_error(&err)),
        }
    }

    async fn append_status(&self, line: &str) -> Result<(), ControlError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.source_error(&err))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|err| self.source_error(&err))
    }
}

/// Status line written after a command reaches its terminal state.
#[must_use]
pub fn status_line(line_number: usize, action_id: &str, status: ActionStatus, hash: &str) -> String {
    let short = hash.get(..12).unwrap_or(hash);
    format!("# Line {line_number} -> {action_id}: {status} (receipt: {short}...)")
}

/// Lease and timing settings of a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    /// Lease key shared by every replica.
    pub lease_key: String,
    /// Lease lifetime.
    pub lease_ttl: Duration,
    /// Delay between cycles.
    pub poll_interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            lease_key: "command-poller-lock".into(),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Whether this replica held the lease for the cycle.
    pub lease_acquired: bool,
    /// Commands resolved during the cycle, in document order.
    pub processed: Vec<ProcessedCommand>,
    /// Blank, comment, receipt and already-handled lines.
    pub skipped: usize,
    /// Lines that did not parse.
    pub unparsable: usize,
}

/// Timer-driven loop turning queue lines into pipeline runs under a lease.
pub struct CommandPoller {
    source: Arc<dyn CommandSource>,
    pipeline: Arc<CommandPipeline>,
    lease: LeaseLock,
    settings: PollerSettings,
    handled: Mutex<HashSet<String>>,
}

impl fmt::Debug for CommandPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPoller")
            .field("settings", &self.settings)
            .field("handled", &self.handled.lock().len())
            .finish_non_exhaustive()
    }
}

impl CommandPoller {
    /// Creates a poller.
    #[must_use]
    pub fn new(
        source: Arc<dyn CommandSource>,
        pipeline: Arc<CommandPipeline>,
        lease: LeaseLock,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            pipeline,
            lease,
            settings,
            handled: Mutex::new(HashSet::new()),
        }
    }

    /// Pipeline driven by this poller.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<CommandPipeline> {
        &self.pipeline
    }

    /// Runs one cycle. Replicas that cannot take the lease skip the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, ControlError> {
        let Some(guard) = self
            .lease
            .acquire_guarded(&self.settings.lease_key, self.settings.lease_ttl)
            .await?
        else {
            info!(key = %self.settings.lease_key, "lease held by another replica, skipping cycle");
            return Ok(CycleReport::default());
        };
        debug!(key = %self.settings.lease_key, "lease acquired");

        let outcome = self.drain().await;
        if let Err(err) = guard.release().await {
            warn!(key = %self.settings.lease_key, error = %err, "lease release failed");
        }
        outcome
    }

    /// Polls until `shutdown` resolves. A failed cycle backs off for twice the interval.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    if !report.processed.is_empty() || report.unparsable > 0 {
                        info!(
                            processed = report.processed.len(),
                            unparsable = report.unparsable,
                            skipped = report.skipped,
                            "poll cycle complete"
                        );
                    }
                    self.settings.poll_interval
                }
                Err(err) => {
                    error!(error = %err, "poll cycle failed, backing off");
                    self.settings.poll_interval.saturating_mul(2)
                }
            };
            tokio::select! {
                () = &mut shutdown => {
                    info!("poller shutting down");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn drain(&self) -> Result<CycleReport, ControlError> {
        let lines = self.source.read_lines().await?;
        let mut report = CycleReport {
            lease_acquired: true,
            ..CycleReport::default()
        };

        for (index, line) in lines.iter().enumerate() {
            let line_number = index + 1;
            let trimmed = line.trim();
            if is_ignorable(trimmed) {
                report.skipped += 1;
                continue;
            }
            let key = format!("{line_number}:{}", fingerprint(trimmed));
            if self.handled.lock().contains(&key) {
                report.skipped += 1;
                continue;
            }

            let command = match try_parse_line(trimmed, line_number) {
                Ok(Some(command)) => command,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(line = line_number, error = %err, "skipping unparseable command line");
                    self.handled.lock().insert(key);
                    report.unparsable += 1;
                    continue;
                }
            };

            let processed = self.pipeline.process(command).await?;
            self.handled.lock().insert(key);
            self.source
                .append_status(&status_line(
                    line_number,
                    &processed.result.action_id,
                    processed.result.status,
                    processed.receipt(),
                ))
                .await?;
            report.processed.push(processed);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit::{BreakerConfig, CircuitBreaker},
        dispatcher::{RequestSigner, RequestVerifier, SignedDispatcher},
        kv::{KvStore, MemoryKvStore},
        ledger::Ledger,
        orchestrator::{ActionOrchestrator, LocalTransport},
    };
    use tempfile::tempdir;

    fn pipeline() -> Arc<CommandPipeline> {
        let signer = RequestSigner::new(b"poller-key").unwrap();
        let verifier = Arc::new(RequestVerifier::new(signer.clone(), Duration::from_secs(300)));
        let transport = LocalTransport::new(Arc::new(ActionOrchestrator::builder().build()), verifier);
        let dispatcher = SignedDispatcher::new(
            signer,
            Arc::new(transport),
            Arc::new(CircuitBreaker::new("mcp_api", BreakerConfig::default())),
            Duration::from_secs(5),
        );
        let (ledger, _) = Ledger::in_memory();
        Arc::new(CommandPipeline::builder(dispatcher, Arc::new(ledger)).build())
    }

    #[test]
    fn status_line_quotes_short_receipt() {
        assert_eq!(
            status_line(3, "abc", ActionStatus::Success, "0123456789abcdef"),
            "# Line 3 -> abc: SUCCESS (receipt: 0123456789ab...)"
        );
    }

    #[tokio::test]
    async fn cycle_processes_each_line_once_and_writes_status() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("queue.txt");
        std::fs::write(
            &path,
            "# operator notes\nSCAN_SITE domain=example.com\nRECEIPT: old\nLAUNCH_ROCKET now=1\nCONNECT_INTEGRATION service=hubspot\n",
        )
        .unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let poller = CommandPoller::new(
            Arc::new(FileCommandQueue::new(&path)),
            pipeline(),
            LeaseLock::new(kv),
            PollerSettings::default(),
        );

        let report = poller.run_cycle().await.unwrap();
        assert!(report.lease_acquired);
        assert_eq!(report.processed.len(), 2);
        assert_eq!(report.unparsable, 1);
        assert_eq!(report.processed[0].result.status, ActionStatus::Success);
        assert_eq!(report.processed[1].result.status, ActionStatus::Blocked);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# Line 2 -> "));
        assert!(content.contains(": BLOCKED (receipt: "));

        let again = poller.run_cycle().await.unwrap();
        assert!(again.processed.is_empty());
        assert_eq!(again.unparsable, 0);
        assert_eq!(poller.pipeline().ledger().entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn busy_lease_skips_the_cycle() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("queue.txt");
        std::fs::write(&path, "SCAN_SITE domain=example.com\n").unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let settings = PollerSettings::default();
        let holder = LeaseLock::new(kv.clone())
            .acquire_guarded(&settings.lease_key, settings.lease_ttl)
            .await
            .unwrap()
            .unwrap();

        let poller = CommandPoller::new(
            Arc::new(FileCommandQueue::new(&path)),
            pipeline(),
            LeaseLock::new(kv),
            settings,
        );
        let report = poller.run_cycle().await.unwrap();
        assert!(!report.lease_acquired);
        assert!(report.processed.is_empty());

        holder.release().await.unwrap();
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.processed.len(), 1);
    }

    #[tokio::test]
    async fn missing_queue_reads_empty() {
        let tmp = tempdir().unwrap();
        let queue = FileCommandQueue::new(tmp.path().join("absent.txt"));
        assert!(queue.read_lines().await.unwrap().is_empty());
    }
}
