//! Packaging-authority operations: initialize a vault, import media, seal the
//! catalog and issue licenses.
//!
//! Content keys are kept in `.vault/keyring.json`, wrapped under the purpose
//! keys of the authoring passphrase. The player never reads the keyring.

use anyhow::Context;
use cvault_core::{VaultConfig, VaultError, VaultResult};
use cvault_crypto::{
    encrypt_file, unwrap_key, wrap_key, AuthorityKey, ContentKey, KdfParams, KeyMaterial,
    ManifestKey, PurposeKeys, WrappedKey,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::device::DeviceTag;
use crate::fingerprint::StableDeviceId;
use crate::license::{issue_license, LicenseRequest, LicenseRules, MANIFEST_KEY_LABEL};
use crate::manifest::{seal_manifest, Manifest, ManifestEntry, ManifestProtection, SourceKind};
use crate::util::atomic_write;
use crate::vault::VaultPaths;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Keyring {
    #[serde(default)]
    entries: Vec<ManifestEntry>,
    #[serde(default)]
    wrapped_ceks: BTreeMap<String, WrappedKey>,
    #[serde(default)]
    wrapped_manifest_key: Option<WrappedKey>,
}

/// Catalog fields supplied at import. The title defaults to the file stem.
#[derive(Debug, Clone, Default)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u16>,
    pub duration_ms: Option<u64>,
    pub source_kind: Option<SourceKind>,
}

impl MediaMetadata {
    pub fn titled(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Self::default()
        }
    }
}

/// An open vault on the authoring side.
pub struct Authoring {
    paths: VaultPaths,
    config: VaultConfig,
    tag: DeviceTag,
    keys: PurposeKeys,
    keyring: Keyring,
}

impl Authoring {
    /// Create `.vault/device.tag`, `media/` and an empty keyring. Refuses to
    /// touch an already initialized vault.
    pub fn init_vault(
        root: &Path,
        passphrase: &SecretString,
        config: VaultConfig,
    ) -> VaultResult<Self> {
        config.validate()?;
        let paths = VaultPaths::new(root);
        let tag = DeviceTag::generate();
        tag.create(&paths.device_tag())?;
        std::fs::create_dir_all(paths.media_dir())
            .with_context(|| format!("creating media dir: {}", paths.media_dir().display()))?;

        let keys = tag.derive_keys(passphrase, &KdfParams::from(&config.kdf))?;
        let authoring = Self {
            paths,
            config,
            tag,
            keys,
            keyring: Keyring::default(),
        };
        authoring.save_keyring()?;
        tracing::info!(root = %root.display(), "vault initialized");
        Ok(authoring)
    }

    /// Reopen an initialized vault. A wrong passphrase fails with
    /// `DecryptionFailed` as soon as the keyring holds a key.
    pub fn open(root: &Path, passphrase: &SecretString, config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let paths = VaultPaths::new(root);
        let tag = DeviceTag::load(&paths.device_tag())?;
        let keys = tag.derive_keys(passphrase, &KdfParams::from(&config.kdf))?;

        let keyring_path = paths.keyring();
        let content = std::fs::read_to_string(&keyring_path)
            .with_context(|| format!("reading keyring: {}", keyring_path.display()))?;
        let keyring: Keyring = serde_json::from_str(&content)
            .map_err(|e| VaultError::Format(format!("keyring: {e}")))?;

        if let Some((id, wrapped)) = keyring.wrapped_ceks.iter().next() {
            unwrap_key::<ContentKey>(&keys.wrap_cek, wrapped, id.as_bytes())?;
        }

        Ok(Self {
            paths,
            config,
            tag,
            keys,
            keyring,
        })
    }

    pub fn device_tag(&self) -> &DeviceTag {
        &self.tag
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.keyring.entries
    }

    fn save_keyring(&self) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(&self.keyring)?;
        atomic_write(&self.paths.keyring(), &json)
    }

    /// Hash, encrypt under a fresh CEK into `media/<id>.enc`, and record the
    /// entry. Returns the new asset id.
    pub fn add_media(&mut self, src: &Path, meta: MediaMetadata) -> VaultResult<String> {
        let asset_id = uuid::Uuid::new_v4().simple().to_string();
        let content_hash = hash_file_streaming(src)?;

        let cek = ContentKey::generate();
        let dst = self.paths.media(&asset_id)?;
        let size = encrypt_file(&cek, src, &dst, self.config.codec.chunk_size)?;

        let title = meta.title.unwrap_or_else(|| {
            src.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| asset_id.clone())
        });
        let entry = ManifestEntry {
            id: asset_id.clone(),
            title,
            artist: meta.artist,
            genre: meta.genre,
            year: meta.year,
            duration_ms: meta.duration_ms,
            source_kind: meta.source_kind.unwrap_or(SourceKind::File),
            content_hash,
            file_extension_hint: src
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase()),
        };

        self.keyring.wrapped_ceks.insert(
            asset_id.clone(),
            wrap_key(&self.keys.wrap_cek, &cek, asset_id.as_bytes())?,
        );
        self.keyring.entries.push(entry);
        self.save_keyring()?;

        tracing::info!(asset_id = %asset_id, bytes = size, "media added");
        Ok(asset_id)
    }

    /// Seal the current catalog into `.vault/manifest.bin` and return the
    /// ManifestKey licenses must carry. Sealing again replaces the key.
    pub fn seal_manifest(&mut self, authority: &AuthorityKey) -> VaultResult<ManifestKey> {
        let manifest = Manifest::build(self.keyring.entries.clone());
        let (bytes, key) = seal_manifest(&manifest, authority, ManifestProtection::Encrypted)?;
        let key = key.ok_or_else(|| {
            VaultError::Other(anyhow::anyhow!("encrypted manifest produced no key"))
        })?;

        atomic_write(&self.paths.manifest(), &bytes)?;
        self.keyring.wrapped_manifest_key =
            Some(wrap_key(&self.keys.manifest, &key, MANIFEST_KEY_LABEL)?);
        self.save_keyring()?;
        Ok(key)
    }

    /// Issue a license for the machine identified by `machine_hash`, write it
    /// to `.vault/license.bin` and return its bytes.
    ///
    /// Keys are re-wrapped under `license_passphrase` combined with this
    /// vault's device tag.
    pub fn issue_license(
        &self,
        authority: &AuthorityKey,
        license_passphrase: &SecretString,
        machine_hash: StableDeviceId,
        owner: &str,
        rules: LicenseRules,
        asset_ids: &[String],
    ) -> VaultResult<Vec<u8>> {
        let wrapped_manifest_key = self
            .keyring
            .wrapped_manifest_key
            .as_ref()
            .ok_or_else(|| VaultError::Config("seal the manifest before issuing licenses".into()))?;
        let manifest_key: ManifestKey =
            unwrap_key(&self.keys.manifest, wrapped_manifest_key, MANIFEST_KEY_LABEL)?;

        let mut ceks = BTreeMap::new();
        for asset_id in asset_ids {
            let wrapped = self
                .keyring
                .wrapped_ceks
                .get(asset_id)
                .ok_or_else(|| VaultError::AssetNotLicensed(asset_id.clone()))?;
            let cek: ContentKey = unwrap_key(&self.keys.wrap_cek, wrapped, asset_id.as_bytes())?;
            ceks.insert(asset_id.clone(), cek);
        }

        let license_keys = self
            .tag
            .derive_keys(license_passphrase, &KdfParams::from(&self.config.kdf))?;
        let request = LicenseRequest {
            owner,
            device_tag: &self.tag,
            machine_hash,
            rules,
            manifest_key: &manifest_key,
            ceks: &ceks,
        };
        let bytes = issue_license(&request, &license_keys, authority)?;
        atomic_write(&self.paths.license(), &bytes)?;
        Ok(bytes)
    }

    /// Install a license produced elsewhere (e.g. by [`issue_license`] with a
    /// hand-built request).
    pub fn install_license(&self, bytes: &[u8]) -> VaultResult<()> {
        atomic_write(&self.paths.license(), bytes)
    }
}

impl std::fmt::Debug for Authoring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authoring")
            .field("root", &self.paths.root())
            .field("assets", &self.keyring.entries.len())
            .finish_non_exhaustive()
    }
}

/// BLAKE3 of a file's contents, hex, read in 64 KiB blocks.
fn hash_file_streaming(path: &Path) -> VaultResult<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening file for hashing: {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> VaultConfig {
        let mut config = VaultConfig::default();
        config.kdf.log_n = 10;
        config.kdf.allow_weak = true;
        config.codec.chunk_size = 1024;
        config
    }

    fn pass(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let a = Authoring::init_vault(dir.path(), &pass("author"), fast_config()).unwrap();
        assert!(a.paths().device_tag().exists());
        assert!(a.paths().keyring().exists());
        assert!(a.paths().media_dir().is_dir());
    }

    #[test]
    fn test_init_twice_refused() {
        let dir = tempfile::tempdir().unwrap();
        Authoring::init_vault(dir.path(), &pass("author"), fast_config()).unwrap();
        assert!(Authoring::init_vault(dir.path(), &pass("author"), fast_config()).is_err());
    }

    #[test]
    fn test_add_media_records_entry() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("Holiday Clip.MP4");
        std::fs::write(&src, vec![9u8; 5000]).unwrap();

        let vault = dir.path().join("vault");
        let mut a = Authoring::init_vault(&vault, &pass("author"), fast_config()).unwrap();
        let id = a.add_media(&src, MediaMetadata::default()).unwrap();

        let entry = &a.entries()[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.title, "Holiday Clip");
        assert_eq!(entry.file_extension_hint.as_deref(), Some("mp4"));
        assert_eq!(entry.content_hash, blake3::hash(&[9u8; 5000]).to_hex().to_string());

        let enc = std::fs::read(a.paths().media(&id).unwrap()).unwrap();
        assert!(enc.starts_with(b"CVMF"));
        assert!(!enc.windows(64).any(|w| w == [9u8; 64]));
    }

    #[test]
    fn test_keyring_never_holds_raw_keys() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"data").unwrap();
        let vault = dir.path().join("vault");
        let mut a = Authoring::init_vault(&vault, &pass("author"), fast_config()).unwrap();
        a.add_media(&src, MediaMetadata::titled("A")).unwrap();

        let keyring: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(a.paths().keyring()).unwrap()).unwrap();
        let wrapped = keyring["wrapped_ceks"].as_object().unwrap();
        assert_eq!(wrapped.len(), 1);
        for value in wrapped.values() {
            let wk = WrappedKey::from_base64(value.as_str().unwrap()).unwrap();
            assert_eq!(wk.to_bytes().len(), WrappedKey::ENCODED_LEN);
        }
    }

    #[test]
    fn test_reopen_checks_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"data").unwrap();
        let vault = dir.path().join("vault");
        let mut a = Authoring::init_vault(&vault, &pass("author"), fast_config()).unwrap();
        a.add_media(&src, MediaMetadata::titled("A")).unwrap();

        assert!(Authoring::open(&vault, &pass("author"), fast_config()).is_ok());
        assert!(matches!(
            Authoring::open(&vault, &pass("wrong"), fast_config()),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_issue_requires_sealed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let a = Authoring::init_vault(dir.path(), &pass("author"), fast_config()).unwrap();
        let rules = LicenseRules::new(None, u64::MAX).unwrap();
        let result = a.issue_license(
            &AuthorityKey::generate(),
            &pass("user"),
            StableDeviceId::from_bytes([1; 32]),
            "bob",
            rules,
            &[],
        );
        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[test]
    fn test_issue_unknown_asset() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Authoring::init_vault(dir.path(), &pass("author"), fast_config()).unwrap();
        let authority = AuthorityKey::generate();
        a.seal_manifest(&authority).unwrap();
        let rules = LicenseRules::new(None, u64::MAX).unwrap();
        let result = a.issue_license(
            &authority,
            &pass("user"),
            StableDeviceId::from_bytes([1; 32]),
            "bob",
            rules,
            &["nope".to_string()],
        );
        assert!(matches!(result, Err(VaultError::AssetNotLicensed(_))));
    }
}
