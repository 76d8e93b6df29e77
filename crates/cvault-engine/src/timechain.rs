//! Hash-chained, append-only playback log (`.vault/timechain.jsonl`).
//!
//! ```text
//! payload_digest = BLAKE3(asset_id, duration_ms, session_id, timestamp)
//! event_hash     = BLAKE3(seq || prev_hash || payload_digest || timestamp)
//! ```
//!
//! Entry 0 links to an all-zero hash. Validation walks from genesis and marks
//! everything from the first bad entry onward as corrupted. A corrupted chain
//! is reported rather than fatal, but every corrupted entry is charged against
//! play quotas.

use anyhow::Context;
use cvault_core::config::TimechainConfig;
use cvault_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

const PAYLOAD_CONTEXT: &str = "cvault timechain v1 payload";
const ENTRY_CONTEXT: &str = "cvault timechain v1 entry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub asset_id: String,
    pub duration_ms: u64,
    pub session_id: String,
    pub timestamp: u64,
}

impl PlaybackEvent {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(PAYLOAD_CONTEXT);
        for field in [self.asset_id.as_bytes(), self.session_id.as_bytes()] {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(&self.duration_ms.to_be_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimechainEntry {
    pub sequence_number: u64,
    /// hex
    pub prev_hash: String,
    /// hex
    pub event_hash: String,
    pub timestamp: u64,
    /// hex
    pub payload_digest: String,
    pub event: PlaybackEvent,
}

fn entry_hash(seq: u64, prev: &[u8; 32], digest: &[u8; 32], timestamp: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(ENTRY_CONTEXT);
    hasher.update(&seq.to_be_bytes());
    hasher.update(prev);
    hasher.update(digest);
    hasher.update(&timestamp.to_be_bytes());
    *hasher.finalize().as_bytes()
}

impl TimechainEntry {
    fn new(seq: u64, prev: &[u8; 32], event: PlaybackEvent) -> Self {
        let digest = event.digest();
        let hash = entry_hash(seq, prev, &digest, event.timestamp);
        Self {
            sequence_number: seq,
            prev_hash: hex::encode(prev),
            event_hash: hex::encode(hash),
            timestamp: event.timestamp,
            payload_digest: hex::encode(digest),
            event,
        }
    }

    /// Recompute every derived field and compare with what is stored.
    fn is_consistent(&self, expected_seq: u64, expected_prev: &[u8; 32]) -> bool {
        if self.sequence_number != expected_seq
            || self.prev_hash != hex::encode(expected_prev)
            || self.timestamp != self.event.timestamp
        {
            return false;
        }
        let digest = self.event.digest();
        if self.payload_digest != hex::encode(digest) {
            return false;
        }
        self.event_hash
            == hex::encode(entry_hash(
                self.sequence_number,
                expected_prev,
                &digest,
                self.timestamp,
            ))
    }

    fn hash_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.event_hash).ok()?;
        bytes.try_into().ok()
    }
}

/// Result of walking the chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub corrupted_entries: usize,
    /// Sequence position of the first corrupted entry
    pub first_corrupted: Option<u64>,
    /// Fewer entries on disk than last recorded, or the recorded tip is gone
    pub rolled_back: bool,
    pub intact: bool,
}

impl ChainReport {
    pub fn corruption_error(&self) -> VaultError {
        VaultError::ChainCorrupted {
            first_corrupted: self.first_corrupted.unwrap_or(self.valid_entries as u64),
            corrupted: self.corrupted_entries,
            total: self.total_entries,
        }
    }
}

/// Validate entries. `tolerance_secs` is the backwards skew permitted between
/// consecutive timestamps.
pub fn validate_entries(entries: &[TimechainEntry], tolerance_secs: u64) -> ChainReport {
    let mut prev = GENESIS_HASH;
    let mut prev_ts: Option<u64> = None;
    let mut valid = 0usize;

    for (i, entry) in entries.iter().enumerate() {
        let ts_ok = prev_ts.map_or(true, |p| entry.timestamp.saturating_add(tolerance_secs) >= p);
        let hash = entry.hash_bytes();
        match hash {
            Some(hash) if ts_ok && entry.is_consistent(i as u64, &prev) => {
                prev = hash;
                prev_ts = Some(entry.timestamp);
                valid += 1;
            }
            _ => break,
        }
    }

    let total = entries.len();
    ChainReport {
        total_entries: total,
        valid_entries: valid,
        corrupted_entries: total - valid,
        first_corrupted: (valid < total).then_some(valid as u64),
        rolled_back: false,
        intact: valid == total,
    }
}

/// Length and tip of the log as this vault last wrote it. Kept outside the log
/// (in `watermark.json`) so that truncating or replacing the file is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAnchor {
    pub length: u64,
    /// hex
    pub tip_hash: String,
}

/// In-memory snapshot of the chain file.
///
/// Every line is parsed on its own, so entries after a damaged line are still
/// seen. Appends go straight to disk. Callers serialize writers; readers open
/// their own snapshot.
#[derive(Debug)]
pub struct Timechain {
    path: PathBuf,
    /// Lines that parsed, in file order
    entries: Vec<TimechainEntry>,
    /// Line positions that did not parse, ascending
    unreadable: Vec<usize>,
}

impl Timechain {
    pub fn open(path: &Path) -> VaultResult<Self> {
        let mut entries = Vec::new();
        let mut unreadable = Vec::new();

        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading timechain: {}", path.display()))?;
            let lines = content.lines().filter(|l| !l.trim().is_empty());
            for (pos, line) in lines.enumerate() {
                match serde_json::from_str::<TimechainEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(line = pos, "unparseable timechain line: {e}");
                        unreadable.push(pos);
                    }
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            unreadable,
        })
    }

    /// Entries that parsed. Unreadable lines are skipped.
    pub fn entries(&self) -> &[TimechainEntry] {
        &self.entries
    }

    /// Lines in the file, readable or not.
    pub fn len(&self) -> usize {
        self.entries.len() + self.unreadable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries before the first unreadable line. Only these can verify.
    fn readable_prefix(&self) -> &[TimechainEntry] {
        let end = self.unreadable.first().copied().unwrap_or(self.entries.len());
        &self.entries[..end]
    }

    fn entry_at_line(&self, line: usize) -> Option<&TimechainEntry> {
        if self.unreadable.binary_search(&line).is_ok() {
            return None;
        }
        let skipped = self.unreadable.partition_point(|&p| p < line);
        self.entries.get(line - skipped)
    }

    /// Hash the next entry links to.
    pub fn tip_hash(&self) -> [u8; 32] {
        self.entries
            .last()
            .and_then(TimechainEntry::hash_bytes)
            .unwrap_or(GENESIS_HASH)
    }

    /// Anchor for the file as it stands, if its last line is readable.
    pub fn anchor(&self) -> Option<ChainAnchor> {
        let last = self.len().checked_sub(1)?;
        self.entry_at_line(last).map(|entry| ChainAnchor {
            length: self.len() as u64,
            tip_hash: entry.event_hash.clone(),
        })
    }

    /// True if the file still holds the anchored entry at the anchored
    /// position. Later appends keep it true; truncation or rewriting does not.
    pub fn matches_anchor(&self, anchor: &ChainAnchor) -> bool {
        let Some(line) = (anchor.length as usize).checked_sub(1) else {
            return true;
        };
        self.entry_at_line(line)
            .is_some_and(|entry| entry.event_hash == anchor.tip_hash)
    }

    /// Append one event and sync it to disk.
    pub fn append(&mut self, event: PlaybackEvent) -> VaultResult<&TimechainEntry> {
        let seq = self.len() as u64;
        let entry = TimechainEntry::new(seq, &self.tip_hash(), event);

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening timechain: {}", self.path.display()))?;
        file.write_all(&line)?;
        file.sync_data()?;

        tracing::debug!(seq, asset_id = %entry.event.asset_id, "timechain entry appended");
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn validate(&self, tolerance_secs: u64) -> ChainReport {
        self.validate_anchored(tolerance_secs, None)
    }

    /// Validate from genesis and, given the last recorded anchor, check that
    /// no anchored history has gone missing.
    pub fn validate_anchored(
        &self,
        tolerance_secs: u64,
        anchor: Option<&ChainAnchor>,
    ) -> ChainReport {
        let checked = validate_entries(self.readable_prefix(), tolerance_secs);
        let total = self.len();
        let valid = checked.valid_entries;
        let rolled_back = anchor.is_some_and(|a| !self.matches_anchor(a));

        let report = ChainReport {
            total_entries: total,
            valid_entries: valid,
            corrupted_entries: total - valid,
            first_corrupted: (valid < total || rolled_back).then_some(valid as u64),
            rolled_back,
            intact: valid == total && !rolled_back,
        };
        if !report.intact {
            tracing::warn!(
                total = report.total_entries,
                valid = report.valid_entries,
                first_corrupted = ?report.first_corrupted,
                rolled_back,
                expected_length = anchor.map(|a| a.length),
                "timechain integrity check failed"
            );
        }
        report
    }

    /// Readable entries naming `asset_id`.
    pub fn plays_for(&self, asset_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.event.asset_id == asset_id)
            .count()
    }

    /// Plays charged to `asset_id` against a per-media quota: its entries in
    /// the verified prefix, plus every entry from the first corrupted one on,
    /// whatever asset it names.
    pub fn charged_plays(&self, asset_id: &str, report: &ChainReport) -> usize {
        let verified = self.entries[..report.valid_entries.min(self.entries.len())]
            .iter()
            .filter(|e| e.event.asset_id == asset_id)
            .count();
        verified + report.corrupted_entries
    }

    /// Every line present, readable or not.
    pub fn total_plays(&self) -> usize {
        self.len()
    }
}

/// Burst detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyPolicy {
    /// More than this many starts inside the window is a burst
    pub burst_threshold: usize,
    pub window_secs: u64,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self::from(&TimechainConfig::default())
    }
}

impl From<&TimechainConfig> for AnomalyPolicy {
    fn from(config: &TimechainConfig) -> Self {
        Self {
            burst_threshold: config.burst_threshold,
            window_secs: config.burst_window_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    Burst {
        asset_id: String,
        count: usize,
        window_start: u64,
    },
}

/// Flag assets started more than `burst_threshold` times inside any sliding
/// window of `window_secs`. One anomaly per burst; the chain itself is not
/// judged here.
pub fn detect_anomalies(entries: &[TimechainEntry], policy: &AnomalyPolicy) -> Vec<Anomaly> {
    let mut by_asset: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for entry in entries {
        by_asset
            .entry(entry.event.asset_id.as_str())
            .or_default()
            .push(entry.timestamp);
    }

    let mut anomalies = Vec::new();
    for (asset_id, mut stamps) in by_asset {
        stamps.sort_unstable();
        let mut start = 0;
        let mut in_burst = false;
        let mut peak = 0;
        let mut burst_start = 0;

        for end in 0..stamps.len() {
            while start < end && stamps[end] - stamps[start] >= policy.window_secs {
                start += 1;
            }
            let count = end - start + 1;
            if count > policy.burst_threshold {
                if !in_burst {
                    in_burst = true;
                    burst_start = stamps[start];
                }
                peak = peak.max(count);
            } else if in_burst {
                anomalies.push(Anomaly::Burst {
                    asset_id: asset_id.to_string(),
                    count: peak,
                    window_start: burst_start,
                });
                in_burst = false;
                peak = 0;
            }
        }
        if in_burst {
            anomalies.push(Anomaly::Burst {
                asset_id: asset_id.to_string(),
                count: peak,
                window_start: burst_start,
            });
        }
    }

    if !anomalies.is_empty() {
        tracing::info!(count = anomalies.len(), "playback anomalies detected");
    }
    anomalies
}
