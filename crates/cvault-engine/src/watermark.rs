//! Persisted "last seen time" used to detect clock rollback, plus the anchor
//! of the playback log as last appended.

use anyhow::Context;
use cvault_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::timechain::ChainAnchor;
use crate::util::atomic_write;

/// Monotonically non-decreasing wall-clock watermark (`.vault/watermark.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockWatermark {
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainAnchor>,
}

impl ClockWatermark {
    /// A missing file is a fresh vault. A present but unreadable file fails
    /// closed.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading watermark: {}", path.display()))?;
        serde_json::from_str(&content).map_err(|e| VaultError::Format(format!("watermark: {e}")))
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        let json = serde_json::to_vec(self)?;
        atomic_write(path, &json)
    }

    /// Fail with `ClockRollbackDetected` if `now` lies more than `tolerance`
    /// behind the watermark; otherwise advance it to `max(last_seen, now)`.
    pub fn observe(&mut self, now: u64, tolerance: u64) -> VaultResult<()> {
        if now.saturating_add(tolerance) < self.last_seen {
            tracing::warn!(now, watermark = self.last_seen, "clock rollback detected");
            return Err(VaultError::ClockRollbackDetected {
                now,
                watermark: self.last_seen,
            });
        }
        self.last_seen = self.last_seen.max(now);
        Ok(())
    }
}
