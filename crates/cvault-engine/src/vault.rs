//! Player-side entry point: open a vault, unlock it into a [`Session`], and
//! serve catalog, streams and playback records from that session.

use anyhow::Context;
use cvault_core::{VaultConfig, VaultError, VaultResult, MEDIA_DIR, STATE_DIR};
use cvault_crypto::sign::parse_verifying_key;
use cvault_crypto::{KdfParams, PurposeKeys};
use ed25519_dalek::VerifyingKey;
use secrecy::SecretString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::device::DeviceTag;
use crate::fingerprint::{platform_probe, DeviceFingerprint, SignalProbe, StableDeviceId};
use crate::license::{LicensePayload, LicenseRules, LicenseValidator};
use crate::manifest::{open_manifest, Manifest, ManifestEntry};
use crate::stream::AssetStream;
use crate::timechain::{
    detect_anomalies, Anomaly, AnomalyPolicy, ChainReport, PlaybackEvent, Timechain,
    TimechainEntry,
};
use crate::util::now_secs;
use crate::watermark::ClockWatermark;

/// File layout of one vault directory.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    pub fn device_tag(&self) -> PathBuf {
        self.state_dir().join("device.tag")
    }

    pub fn manifest(&self) -> PathBuf {
        self.state_dir().join("manifest.bin")
    }

    pub fn license(&self) -> PathBuf {
        self.state_dir().join("license.bin")
    }

    pub fn watermark(&self) -> PathBuf {
        self.state_dir().join("watermark.json")
    }

    pub fn timechain(&self) -> PathBuf {
        self.state_dir().join("timechain.jsonl")
    }

    pub fn keyring(&self) -> PathBuf {
        self.state_dir().join("keyring.json")
    }

    /// `media/<id>.enc`. Ids are restricted to `[A-Za-z0-9_-]`.
    pub fn media(&self, asset_id: &str) -> VaultResult<PathBuf> {
        let valid = !asset_id.is_empty()
            && asset_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(VaultError::Format(format!("invalid asset id: {asset_id:?}")));
        }
        Ok(self.media_dir().join(format!("{asset_id}.enc")))
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> VaultResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| VaultError::Other(anyhow::anyhow!("{what} lock poisoned")))
}

/// A vault directory as seen by the player.
pub struct Vault {
    paths: VaultPaths,
    config: VaultConfig,
    authority: VerifyingKey,
    probe: Box<dyn SignalProbe>,
    /// Serializes read-modify-write of `watermark.json`
    watermark_lock: Mutex<()>,
    /// Single timechain writer
    chain_lock: Mutex<()>,
}

impl Vault {
    /// Open with an explicit trust anchor and the probe for this platform.
    pub fn open(root: &Path, config: VaultConfig, authority: VerifyingKey) -> VaultResult<Self> {
        config.validate()?;
        let paths = VaultPaths::new(root);
        if !paths.device_tag().exists() {
            return Err(VaultError::Format(format!(
                "not a vault (no device tag): {}",
                root.display()
            )));
        }
        Ok(Self {
            paths,
            config,
            authority,
            probe: platform_probe(),
            watermark_lock: Mutex::new(()),
            chain_lock: Mutex::new(()),
        })
    }

    /// Open using `license.authority_public_key` from the config.
    pub fn open_with_config(root: &Path, config: VaultConfig) -> VaultResult<Self> {
        let hex_key = config
            .license
            .authority_public_key
            .as_deref()
            .ok_or_else(|| VaultError::Config("license.authority_public_key is not set".into()))?;
        let authority = parse_verifying_key(hex_key)?;
        Self::open(root, config, authority)
    }

    /// Replace the signal probe (tests, or hosts that gather signals
    /// themselves).
    pub fn with_probe(mut self, probe: Box<dyn SignalProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint::collect(self.probe.as_ref())
    }

    /// Machine hash to send to the authority when requesting a license.
    pub fn machine_hash(&self) -> StableDeviceId {
        self.fingerprint().stable_id()
    }

    pub fn unlock(&self, passphrase: &SecretString) -> VaultResult<Session<'_>> {
        self.unlock_at(passphrase, now_secs())
    }

    /// Run the full license gate at time `now` and open the catalog.
    pub fn unlock_at(&self, passphrase: &SecretString, now: u64) -> VaultResult<Session<'_>> {
        let _guard = lock(&self.watermark_lock, "watermark")?;

        let license_path = self.paths.license();
        let license_bytes = std::fs::read(&license_path)
            .with_context(|| format!("reading license: {}", license_path.display()))?;
        let tag = DeviceTag::load(&self.paths.device_tag())?;
        let keys = tag.derive_keys(passphrase, &KdfParams::from(&self.config.kdf))?;
        let machine = self.machine_hash();

        let watermark_path = self.paths.watermark();
        let mut watermark = ClockWatermark::load(&watermark_path)?;
        let before = watermark.last_seen;

        let validator =
            LicenseValidator::new(&self.authority, self.config.license.rollback_tolerance_secs);
        let result = validator.validate(&license_bytes, &keys, &tag, &machine, &mut watermark, now);
        if watermark.last_seen != before {
            watermark.save(&watermark_path)?;
        }
        let license = result.map_err(|e| {
            if e.is_security_event() {
                tracing::warn!(error = %e, "unlock refused");
            } else {
                tracing::info!(error = %e, "unlock refused");
            }
            e
        })?;

        let manifest_key = license.unwrap_manifest_key(&keys)?;
        let manifest_path = self.paths.manifest();
        let manifest_bytes = std::fs::read(&manifest_path)
            .with_context(|| format!("reading manifest: {}", manifest_path.display()))?;
        let manifest = open_manifest(&manifest_bytes, &self.authority, Some(&manifest_key))?;

        tracing::info!(
            owner = %license.owner,
            assets = license.wrapped_ceks.len(),
            items = manifest.items.len(),
            "vault unlocked"
        );
        Ok(Session {
            vault: self,
            keys,
            license,
            manifest,
            unlocked_at: now,
        })
    }

    /// Snapshot of the playback log.
    pub fn timechain(&self) -> VaultResult<Timechain> {
        Timechain::open(&self.paths.timechain())
    }

    /// Validate the playback log against the anchor in `watermark.json`.
    /// Needs no unlock.
    pub fn timechain_report(&self) -> VaultResult<ChainReport> {
        Ok(self.chain_state()?.1)
    }

    fn chain_state(&self) -> VaultResult<(Timechain, ChainReport)> {
        let chain = self.timechain()?;
        let watermark = ClockWatermark::load(&self.paths.watermark())?;
        let report = chain.validate_anchored(
            self.config.timechain.timestamp_tolerance_secs,
            watermark.chain.as_ref(),
        );
        Ok((chain, report))
    }

    /// Record the chain's current length and tip in `watermark.json`.
    fn anchor_chain(&self, chain: &Timechain) -> VaultResult<()> {
        let _guard = lock(&self.watermark_lock, "watermark")?;
        let path = self.paths.watermark();
        let mut watermark = ClockWatermark::load(&path)?;
        watermark.chain = chain.anchor();
        watermark.save(&path)
    }

    pub fn anomalies(&self) -> VaultResult<Vec<Anomaly>> {
        let chain = self.timechain()?;
        Ok(detect_anomalies(
            chain.entries(),
            &AnomalyPolicy::from(&self.config.timechain),
        ))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.paths.root())
            .finish_non_exhaustive()
    }
}

/// An unlocked vault. Holds the purpose keys, the decrypted license and the
/// catalog; all of it is dropped (and keys zeroized) on [`Session::lock`].
pub struct Session<'v> {
    vault: &'v Vault,
    keys: PurposeKeys,
    license: LicensePayload,
    manifest: Manifest,
    unlocked_at: u64,
}

impl<'v> Session<'v> {
    pub fn unlocked_at(&self) -> u64 {
        self.unlocked_at
    }

    pub fn owner(&self) -> &str {
        &self.license.owner
    }

    pub fn rules(&self) -> &LicenseRules {
        &self.license.rules
    }

    pub fn list_catalog(&self) -> &[ManifestEntry] {
        &self.manifest.items
    }

    pub fn is_licensed(&self, asset_id: &str) -> bool {
        self.license.is_licensed(asset_id)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.license.has_feature(feature)
    }

    pub fn require_feature(&self, feature: &str) -> VaultResult<()> {
        if self.has_feature(feature) {
            Ok(())
        } else {
            Err(VaultError::FeatureNotLicensed(feature.to_string()))
        }
    }

    /// Open a verified plaintext stream for one licensed asset.
    pub fn open_asset_stream(&self, asset_id: &str) -> VaultResult<AssetStream> {
        let cek = self.license.unwrap_cek(&self.keys, asset_id)?;
        let (chain, report) = self.vault.chain_state()?;
        self.check_quota(&chain, &report, asset_id)?;
        let path = self.vault.paths.media(asset_id)?;
        let file = File::open(&path)
            .with_context(|| format!("opening media: {}", path.display()))?;
        AssetStream::open(asset_id, &cek, file)
    }

    /// Reject a playback start that would exceed the license quotas.
    ///
    /// Corrupted entries count against every asset. A log that lost anchored
    /// history cannot be counted at all, so any quota fails closed.
    fn check_quota(
        &self,
        chain: &Timechain,
        report: &ChainReport,
        asset_id: &str,
    ) -> VaultResult<()> {
        let rules = &self.license.rules;
        if rules.max_plays_per_media().is_none() && rules.max_plays_global().is_none() {
            return Ok(());
        }
        if report.rolled_back {
            tracing::warn!(asset_id, "quota check refused: playback history rolled back");
            return Err(report.corruption_error());
        }
        if let Some(max) = rules.max_plays_per_media() {
            let plays = chain.charged_plays(asset_id, report);
            if plays >= max as usize {
                return Err(VaultError::QuotaExceeded(format!(
                    "{asset_id}: {plays} of {max} plays used"
                )));
            }
        }
        if let Some(max) = rules.max_plays_global() {
            let plays = chain.total_plays();
            if plays >= max as usize {
                return Err(VaultError::QuotaExceeded(format!(
                    "{plays} of {max} total plays used"
                )));
            }
        }
        Ok(())
    }

    pub fn record_playback(
        &self,
        asset_id: &str,
        duration_ms: u64,
        session_id: &str,
    ) -> VaultResult<TimechainEntry> {
        self.record_playback_at(asset_id, duration_ms, session_id, now_secs())
    }

    /// Append a playback event after the license and quota checks.
    pub fn record_playback_at(
        &self,
        asset_id: &str,
        duration_ms: u64,
        session_id: &str,
        timestamp: u64,
    ) -> VaultResult<TimechainEntry> {
        if !self.license.is_licensed(asset_id) {
            return Err(VaultError::AssetNotLicensed(asset_id.to_string()));
        }

        let _guard = lock(&self.vault.chain_lock, "timechain")?;
        let (mut chain, report) = self.vault.chain_state()?;
        if !report.intact {
            tracing::warn!(
                valid = report.valid_entries,
                total = report.total_entries,
                "recording playback on a corrupted timechain"
            );
        }
        self.check_quota(&chain, &report, asset_id)?;

        let entry = chain
            .append(PlaybackEvent {
                asset_id: asset_id.to_string(),
                duration_ms,
                session_id: session_id.to_string(),
                timestamp,
            })?
            .clone();
        // a rolled-back log keeps its old anchor so the loss stays visible
        if !report.rolled_back {
            self.vault.anchor_chain(&chain)?;
        }
        Ok(entry)
    }

    /// End the session. Purpose keys zeroize as they drop.
    pub fn lock(self) {
        tracing::info!(owner = %self.license.owner, "vault locked");
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner", &self.license.owner)
            .field("unlocked_at", &self.unlocked_at)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}
