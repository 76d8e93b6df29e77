mod common;

use common::*;
use cvault_core::VaultError;
use cvault_crypto::{AuthorityKey, ContentKey, KdfParams, KeyMaterial, ManifestKey};
use cvault_engine::license::{issue_license, LicenseRequest};
use cvault_engine::{Authoring, LicenseRules, Vault};
use std::collections::BTreeMap;

#[test]
fn test_unlock_lists_sorted_catalog() {
    let fx = Fixture::licensed(default_rules());
    let vault = fx.player(probe_f1());
    let session = vault.unlock_at(&user_pass(), NOW).unwrap();

    let titles: Vec<&str> = session
        .list_catalog()
        .iter()
        .map(|e| e.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Aurora", "Night Drive"]);
    assert_eq!(session.owner(), "alice");
    assert_eq!(session.unlocked_at(), NOW);
}

#[test]
fn test_wrong_passphrase() {
    let fx = Fixture::licensed(default_rules());
    let vault = fx.player(probe_f1());
    let result = vault.unlock_at(&secret("guess"), NOW);
    assert!(matches!(result, Err(VaultError::DecryptionFailed)));
}

#[test]
fn test_other_fingerprint_is_device_mismatch() {
    let fx = Fixture::licensed(default_rules());
    let vault = fx.player(probe_f2());
    let result = vault.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::DeviceMismatch)));
}

#[test]
fn test_license_relocated_to_other_vault() {
    let fx = Fixture::licensed(default_rules());

    let other_root = fx.dir.path().join("other");
    Authoring::init_vault(&other_root, &author_pass(), fast_config()).unwrap();
    std::fs::copy(
        fx.root.join(".vault/license.bin"),
        other_root.join(".vault/license.bin"),
    )
    .unwrap();

    let vault = Vault::open(&other_root, fast_config(), fx.authority.verifying_key())
        .unwrap()
        .with_probe(Box::new(probe_f1()));
    let result = vault.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::DecryptionFailed)));
}

#[test]
fn test_expiry_boundary() {
    let valid_until = NOW + DAY;
    let fx = Fixture::licensed(LicenseRules::new(None, valid_until).unwrap());
    let vault = fx.player(probe_f1());

    assert!(vault.unlock_at(&user_pass(), valid_until - 1).is_ok());
    assert!(vault.unlock_at(&user_pass(), valid_until).is_ok());
    let result = vault.unlock_at(&user_pass(), valid_until + 1);
    assert!(matches!(
        result,
        Err(VaultError::Expired { valid_until: v, now }) if v == valid_until && now == valid_until + 1
    ));
}

#[test]
fn test_not_yet_valid() {
    let fx = Fixture::licensed(LicenseRules::new(Some(NOW + 100), NOW + DAY).unwrap());
    let vault = fx.player(probe_f1());
    let result = vault.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::NotYetValid { .. })));
    assert!(vault.unlock_at(&user_pass(), NOW + 100).is_ok());
}

#[test]
fn test_clock_rollback_detected() {
    let fx = Fixture::licensed(default_rules());
    let vault = fx.player(probe_f1());
    let tolerance = fx.config.license.rollback_tolerance_secs;

    let t2 = NOW + 5 * DAY;
    vault.unlock_at(&user_pass(), t2).unwrap();

    // inside tolerance is fine
    assert!(vault.unlock_at(&user_pass(), t2 - tolerance).is_ok());

    let t1 = t2 - tolerance - 1;
    let result = vault.unlock_at(&user_pass(), t1);
    assert!(matches!(
        result,
        Err(VaultError::ClockRollbackDetected { now, watermark }) if now == t1 && watermark == t2
    ));
}

#[test]
fn test_watermark_survives_reopen() {
    let fx = Fixture::licensed(default_rules());
    let t2 = NOW + 5 * DAY;
    fx.player(probe_f1()).unlock_at(&user_pass(), t2).unwrap();

    let reopened = fx.player(probe_f1());
    let result = reopened.unlock_at(&user_pass(), NOW);
    assert!(matches!(
        result,
        Err(VaultError::ClockRollbackDetected { .. })
    ));
}

#[test]
fn test_tampered_license_signature() {
    let fx = Fixture::licensed(default_rules());
    let path = fx.root.join(".vault/license.bin");
    let mut bytes = std::fs::read(&path).unwrap();
    let pos = bytes.len() / 2;
    bytes[pos] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let player = fx.player(probe_f1());
    let result = player.unlock_at(&user_pass(), NOW);
    let err = result.unwrap_err();
    assert!(matches!(err, VaultError::SignatureInvalid(_)));
    assert!(err.is_security_event());
}

#[test]
fn test_license_from_unknown_authority() {
    let fx = Fixture::licensed(default_rules());
    let stranger = AuthorityKey::generate();
    let vault = Vault::open(&fx.root, fx.config.clone(), stranger.verifying_key())
        .unwrap()
        .with_probe(Box::new(probe_f1()));
    let result = vault.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::SignatureInvalid(_))));
}

#[test]
fn test_tampered_manifest_signature() {
    let fx = Fixture::licensed(default_rules());
    let path = fx.root.join(".vault/manifest.bin");
    let mut bytes = std::fs::read(&path).unwrap();
    let pos = bytes.len() / 2;
    bytes[pos] ^= 0x80;
    std::fs::write(&path, &bytes).unwrap();

    let player = fx.player(probe_f1());
    let result = player.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::SignatureInvalid(_))));
}

#[test]
fn test_manifest_requires_matching_license_key() {
    // manifest sealed under M1 by the fixture; license carries M2
    let fx = Fixture::new();
    let tag = fx.authoring.device_tag();
    let keys = tag
        .derive_keys(&user_pass(), &KdfParams::from(&fx.config.kdf))
        .unwrap();

    let m2 = ManifestKey::generate();
    let mut ceks = BTreeMap::new();
    ceks.insert(fx.assets[0].0.clone(), ContentKey::generate());
    let request = LicenseRequest {
        owner: "mallory",
        device_tag: tag,
        machine_hash: machine_hash(&probe_f1()),
        rules: default_rules(),
        manifest_key: &m2,
        ceks: &ceks,
    };
    let bytes = issue_license(&request, &keys, &fx.authority).unwrap();
    fx.authoring.install_license(&bytes).unwrap();

    let player = fx.player(probe_f1());
    let result = player.unlock_at(&user_pass(), NOW);
    assert!(matches!(result, Err(VaultError::DecryptionFailed)));
}

#[test]
fn test_open_with_configured_trust_anchor() {
    let fx = Fixture::licensed(default_rules());
    let mut config = fx.config.clone();
    config.license.authority_public_key = Some(fx.authority.verifying_key_hex());

    let vault = Vault::open_with_config(&fx.root, config)
        .unwrap()
        .with_probe(Box::new(probe_f1()));
    assert!(vault.unlock_at(&user_pass(), NOW).is_ok());
}

#[test]
fn test_reissue_replaces_license() {
    let fx = Fixture::licensed(LicenseRules::new(None, NOW - 1).unwrap());
    let vault = fx.player(probe_f1());
    assert!(matches!(
        vault.unlock_at(&user_pass(), NOW),
        Err(VaultError::Expired { .. })
    ));

    fx.issue(default_rules(), &fx.asset_ids());
    assert!(vault.unlock_at(&user_pass(), NOW).is_ok());
}
