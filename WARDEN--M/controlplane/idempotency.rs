use std::{sync::Arc, time::Duration};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    commands::ActionResult,
    kv::{KvStore, StoreError},
};

/// Deterministic fingerprint of a command's raw text (hex SHA-256).
#[must_use]
pub fn fingerprint(raw_text: &str) -> String {
    hex::encode(Sha256::digest(raw_text.as_bytes()))
}

/// At-most-once guard keyed by command fingerprint.
#[derive(Clone)]
pub struct IdempotencyStore {
    kv: Arc<dyn KvStore>,
}

impl IdempotencyStore {
    /// Wraps a key-value backend.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn claim_key(fingerprint: &str) -> String {
        format!("idempotent:{fingerprint}")
    }

    fn result_key(fingerprint: &str) -> String {
        format!("result:{fingerprint}")
    }

    /// Atomically claims `fingerprint` for `ttl`.
    ///
    /// Returns `true` for a new command and `false` for a duplicate.
    pub async fn check_and_record(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let claimed = self
            .kv
            .set_if_absent(&Self::claim_key(fingerprint), "1", ttl)
            .await?;
        debug!(fingerprint, claimed, "idempotency claim");
        Ok(claimed)
    }

    /// Gives up a claim so a later submission is treated as new.
    pub async fn release(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.kv.delete(&Self::claim_key(fingerprint)).await?;
        Ok(())
    }

    /// Stores the terminal result for `fingerprint`.
    pub async fn cache_result(
        &self,
        fingerprint: &str,
        result: &ActionResult,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = Self::result_key(fingerprint);
        let encoded = serde_json::to_string(result).map_err(|err| StoreError::Corrupt {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        self.kv.set(&key, &encoded, Some(ttl)).await
    }

    /// Reads the terminal result cached for `fingerprint`.
    pub async fn get_cached_result(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ActionResult>, StoreError> {
        let key = Self::result_key(fingerprint);
        let Some(encoded) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&encoded)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key,
                reason: err.to_string(),
            })
    }
}
