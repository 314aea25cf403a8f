use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

/// Rationale recorded on commands refused by an engaged kill switch.
pub const KILL_SWITCH_RATIONALE: &str = "Kill switch engaged";

/// Global stop capability consulted before every dispatch.
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// Whether execution is currently halted.
    async fn engaged(&self) -> bool;
}

/// In-memory switch toggled by the owner.
#[derive(Debug, Default)]
pub struct StaticKillSwitch {
    engaged: AtomicBool,
}

impl StaticKillSwitch {
    /// Creates a switch in the given position.
    #[must_use]
    pub const fn new(engaged: bool) -> Self {
        Self {
            engaged: AtomicBool::new(engaged),
        }
    }

    /// Moves the switch.
    pub fn set(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::SeqCst);
    }
}

#[async_trait]
impl KillSwitch for StaticKillSwitch {
    async fn engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

/// Switch engaged while a marker file exists.
#[derive(Debug, Clone)]
pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    /// Watches `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KillSwitch for FileKillSwitch {
    async fn engaged(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn static_switch_toggles() {
        let switch = StaticKillSwitch::default();
        assert!(!switch.engaged().await);
        switch.set(true);
        assert!(switch.engaged().await);
    }

    #[tokio::test]
    async fn file_switch_follows_marker() {
        let tmp = tempdir().unwrap();
        let marker = tmp.path().join("STOP");
        let switch = FileKillSwitch::new(&marker);
        assert!(!switch.engaged().await);
        std::fs::write(&marker, "halt").unwrap();
        assert!(switch.engaged().await);
    }
}
