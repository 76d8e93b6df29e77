#![allow(dead_code)]

use cvault_core::VaultConfig;
use cvault_crypto::AuthorityKey;
use cvault_engine::{
    Authoring, DeviceFingerprint, LicenseRules, MediaMetadata, StableDeviceId, StaticProbe, Vault,
};
use secrecy::SecretString;
use std::path::PathBuf;
use tempfile::TempDir;

pub const NOW: u64 = 1_700_000_000;
pub const DAY: u64 = 86_400;

pub fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

pub fn author_pass() -> SecretString {
    secret("authority passphrase")
}

pub fn user_pass() -> SecretString {
    secret("viewer passphrase")
}

pub fn fast_config() -> VaultConfig {
    let mut config = VaultConfig::default();
    config.kdf.log_n = 10;
    config.kdf.allow_weak = true;
    config.codec.chunk_size = 1024;
    config
}

pub fn probe_f1() -> StaticProbe {
    StaticProbe::new("machine-one")
        .with_usb_serial("USB0001")
        .with_network_mac("aa:bb:cc:dd:ee:01")
}

pub fn probe_f2() -> StaticProbe {
    StaticProbe::new("machine-one")
        .with_usb_serial("USB0002")
        .with_network_mac("aa:bb:cc:dd:ee:01")
}

pub fn machine_hash(probe: &StaticProbe) -> StableDeviceId {
    DeviceFingerprint::collect(probe).stable_id()
}

pub fn default_rules() -> LicenseRules {
    LicenseRules::new(Some(NOW - DAY), NOW + 30 * DAY).unwrap()
}

pub fn media_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub config: VaultConfig,
    pub authority: AuthorityKey,
    pub authoring: Authoring,
    /// (asset id, plaintext), in import order
    pub assets: Vec<(String, Vec<u8>)>,
}

impl Fixture {
    /// Vault with two imported assets and a sealed manifest, no license yet.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vault");
        let config = fast_config();
        let authority = AuthorityKey::generate();
        let mut authoring = Authoring::init_vault(&root, &author_pass(), config.clone()).unwrap();

        let mut assets = Vec::new();
        for (name, len, seed) in [("Night Drive.mp4", 3000usize, 1u8), ("Aurora.mkv", 10_000, 2)] {
            let src = dir.path().join(name);
            let data = media_bytes(len, seed);
            std::fs::write(&src, &data).unwrap();
            let id = authoring.add_media(&src, MediaMetadata::default()).unwrap();
            assets.push((id, data));
        }
        authoring.seal_manifest(&authority).unwrap();

        Self {
            dir,
            root,
            config,
            authority,
            authoring,
            assets,
        }
    }

    /// Vault licensed for every asset on machine F1.
    pub fn licensed(rules: LicenseRules) -> Self {
        let fx = Self::new();
        fx.issue(rules, &fx.asset_ids());
        fx
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.assets.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn issue(&self, rules: LicenseRules, ids: &[String]) -> Vec<u8> {
        self.authoring
            .issue_license(
                &self.authority,
                &user_pass(),
                machine_hash(&probe_f1()),
                "alice",
                rules,
                ids,
            )
            .unwrap()
    }

    pub fn player(&self, probe: StaticProbe) -> Vault {
        Vault::open(&self.root, self.config.clone(), self.authority.verifying_key())
            .unwrap()
            .with_probe(Box::new(probe))
    }
}
