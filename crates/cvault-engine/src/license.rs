//! Signed, encrypted license (`.vault/license.bin`) and its validator.
//!
//! ```text
//! envelope: [MAGIC "CVLC"][BODY][SIG_ALGO_ID][u16 SIG_LEN][SIGNATURE]
//! body:     [VERSION][NONCE_LEN][NONCE][u32 CT_LEN][CT][TAG_LEN][TAG]
//! ```
//!
//! The ciphertext is the JSON [`LicensePayload`] sealed under the
//! `license-json` purpose key of the target vault.

use cvault_core::{VaultError, VaultResult};
use cvault_crypto::aead;
use cvault_crypto::wire::{BodyReader, BodyWriter};
use cvault_crypto::{
    open_envelope, seal_envelope, unwrap_key, wrap_key, AuthorityKey, ContentKey, KeyMaterial,
    ManifestKey, PurposeKeys, WrappedKey, NONCE_SIZE, TAG_SIZE,
};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::device::DeviceTag;
use crate::fingerprint::StableDeviceId;
use crate::util::now_secs;
use crate::watermark::ClockWatermark;

pub const LICENSE_MAGIC: &[u8; 4] = b"CVLC";
pub const LICENSE_VERSION: u8 = 1;

/// Label authenticated with the wrapped ManifestKey.
pub const MANIFEST_KEY_LABEL: &[u8] = b"manifest";

/// Business constraints, validated when constructed or deserialized.
///
/// Bounds are inclusive: a license is usable at exactly `valid_from` and at
/// exactly `valid_until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawRules")]
pub struct LicenseRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_from: Option<u64>,
    valid_until: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_plays_global: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_plays_per_media: Option<u32>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    features: BTreeSet<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRules {
    #[serde(default)]
    valid_from: Option<u64>,
    valid_until: u64,
    #[serde(default)]
    max_plays_global: Option<u32>,
    #[serde(default)]
    max_plays_per_media: Option<u32>,
    #[serde(default)]
    features: BTreeSet<String>,
}

impl TryFrom<RawRules> for LicenseRules {
    type Error = VaultError;

    fn try_from(raw: RawRules) -> VaultResult<Self> {
        let mut rules = LicenseRules::new(raw.valid_from, raw.valid_until)?;
        if let Some(n) = raw.max_plays_global {
            rules = rules.with_max_plays_global(n)?;
        }
        if let Some(n) = raw.max_plays_per_media {
            rules = rules.with_max_plays_per_media(n)?;
        }
        for feature in raw.features {
            rules = rules.with_feature(feature)?;
        }
        Ok(rules)
    }
}

impl LicenseRules {
    pub fn new(valid_from: Option<u64>, valid_until: u64) -> VaultResult<Self> {
        if let Some(from) = valid_from {
            if from > valid_until {
                return Err(VaultError::InvalidRules(format!(
                    "valid_from {from} is after valid_until {valid_until}"
                )));
            }
        }
        Ok(Self {
            valid_from,
            valid_until,
            max_plays_global: None,
            max_plays_per_media: None,
            features: BTreeSet::new(),
        })
    }

    pub fn with_max_plays_global(mut self, max: u32) -> VaultResult<Self> {
        if max == 0 {
            return Err(VaultError::InvalidRules("max_plays_global must be > 0".into()));
        }
        self.max_plays_global = Some(max);
        Ok(self)
    }

    pub fn with_max_plays_per_media(mut self, max: u32) -> VaultResult<Self> {
        if max == 0 {
            return Err(VaultError::InvalidRules(
                "max_plays_per_media must be > 0".into(),
            ));
        }
        self.max_plays_per_media = Some(max);
        Ok(self)
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> VaultResult<Self> {
        let feature = feature.into();
        if feature.trim().is_empty() {
            return Err(VaultError::InvalidRules("empty feature name".into()));
        }
        self.features.insert(feature);
        Ok(self)
    }

    pub fn valid_from(&self) -> Option<u64> {
        self.valid_from
    }

    pub fn valid_until(&self) -> u64 {
        self.valid_until
    }

    pub fn max_plays_global(&self) -> Option<u32> {
        self.max_plays_global
    }

    pub fn max_plays_per_media(&self) -> Option<u32> {
        self.max_plays_per_media
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn check_window(&self, now: u64) -> VaultResult<()> {
        if let Some(valid_from) = self.valid_from {
            if now < valid_from {
                return Err(VaultError::NotYetValid { valid_from, now });
            }
        }
        if now > self.valid_until {
            return Err(VaultError::Expired {
                valid_until: self.valid_until,
                now,
            });
        }
        Ok(())
    }
}

/// Decrypted license contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePayload {
    pub version: u32,
    pub owner: String,
    pub device_id_hex: String,
    pub machine_hash: StableDeviceId,
    pub rules: LicenseRules,
    pub wrapped_manifest_key: WrappedKey,
    #[serde(rename = "wrappedCEKs")]
    pub wrapped_ceks: BTreeMap<String, WrappedKey>,
    pub issued_at: u64,
}

impl LicensePayload {
    /// Step 4: the license must name this vault and this machine.
    pub fn check_binding(&self, tag: &DeviceTag, machine: &StableDeviceId) -> VaultResult<()> {
        if self.machine_hash != *machine || self.device_id_hex != tag.device_id_hex() {
            tracing::warn!(owner = %self.owner, "license device binding mismatch");
            return Err(VaultError::DeviceMismatch);
        }
        Ok(())
    }

    pub fn is_licensed(&self, asset_id: &str) -> bool {
        self.wrapped_ceks.contains_key(asset_id)
    }

    pub fn licensed_assets(&self) -> impl Iterator<Item = &str> {
        self.wrapped_ceks.keys().map(String::as_str)
    }

    /// Step 6: only ids present in the license can be unwrapped.
    pub fn unwrap_cek(&self, keys: &PurposeKeys, asset_id: &str) -> VaultResult<ContentKey> {
        let wrapped = self
            .wrapped_ceks
            .get(asset_id)
            .ok_or_else(|| VaultError::AssetNotLicensed(asset_id.to_string()))?;
        unwrap_key(&keys.wrap_cek, wrapped, asset_id.as_bytes())
    }

    pub fn unwrap_manifest_key(&self, keys: &PurposeKeys) -> VaultResult<ManifestKey> {
        unwrap_key(
            &keys.manifest,
            &self.wrapped_manifest_key,
            MANIFEST_KEY_LABEL,
        )
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.rules.features().contains(feature)
    }
}

/// Everything the authority needs to issue one license.
pub struct LicenseRequest<'a> {
    pub owner: &'a str,
    pub device_tag: &'a DeviceTag,
    pub machine_hash: StableDeviceId,
    pub rules: LicenseRules,
    pub manifest_key: &'a ManifestKey,
    pub ceks: &'a BTreeMap<String, ContentKey>,
}

fn payload_aad() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(LICENSE_MAGIC);
    aad[4] = LICENSE_VERSION;
    aad
}

/// Wrap keys under `keys` (derived from the license passphrase and the target
/// vault's tag), encrypt the payload and sign the result.
pub fn issue_license(
    request: &LicenseRequest<'_>,
    keys: &PurposeKeys,
    authority: &AuthorityKey,
) -> VaultResult<Vec<u8>> {
    let mut wrapped_ceks = BTreeMap::new();
    for (asset_id, cek) in request.ceks {
        wrapped_ceks.insert(
            asset_id.clone(),
            wrap_key(&keys.wrap_cek, cek, asset_id.as_bytes())?,
        );
    }

    let payload = LicensePayload {
        version: u32::from(LICENSE_VERSION),
        owner: request.owner.to_string(),
        device_id_hex: request.device_tag.device_id_hex(),
        machine_hash: request.machine_hash,
        rules: request.rules.clone(),
        wrapped_manifest_key: wrap_key(&keys.manifest, request.manifest_key, MANIFEST_KEY_LABEL)?,
        wrapped_ceks,
        issued_at: now_secs(),
    };

    let bytes = seal_payload(&payload, keys, authority)?;
    tracing::info!(
        owner = %payload.owner,
        assets = payload.wrapped_ceks.len(),
        valid_until = payload.rules.valid_until(),
        "license issued"
    );
    Ok(bytes)
}

fn seal_payload(
    payload: &LicensePayload,
    keys: &PurposeKeys,
    authority: &AuthorityKey,
) -> VaultResult<Vec<u8>> {
    let json = zeroize::Zeroizing::new(serde_json::to_vec(payload)?);
    let sealed = aead::seal(keys.license.as_bytes(), &payload_aad(), &json)?;

    let mut body = BodyWriter::new();
    body.put_u8(LICENSE_VERSION);
    body.put_short(&sealed.nonce)?;
    body.put_long(&sealed.ciphertext)?;
    body.put_short(&sealed.tag)?;
    Ok(seal_envelope(LICENSE_MAGIC, &body.finish(), authority))
}

/// Steps 1–3: magic and version, signature, decryption.
pub fn open_license(
    data: &[u8],
    authority: &VerifyingKey,
    keys: &PurposeKeys,
) -> VaultResult<LicensePayload> {
    let body = open_envelope(LICENSE_MAGIC, LICENSE_VERSION, data, authority, "license")?;

    let mut r = BodyReader::new(body);
    r.get_u8()?;
    let nonce = r.get_fixed::<NONCE_SIZE>("license nonce")?;
    let ciphertext = r.get_long()?;
    let tag = r.get_fixed::<TAG_SIZE>("license tag")?;
    r.expect_end()?;

    let json = zeroize::Zeroizing::new(aead::open(
        keys.license.as_bytes(),
        &nonce,
        &payload_aad(),
        ciphertext,
        &tag,
    )?);
    let payload: LicensePayload = serde_json::from_slice(&json)
        .map_err(|e| VaultError::Format(format!("license payload: {e}")))?;
    if payload.version != u32::from(LICENSE_VERSION) {
        return Err(VaultError::Version {
            found: u8::try_from(payload.version).unwrap_or(u8::MAX),
            supported: LICENSE_VERSION,
        });
    }
    Ok(payload)
}

/// The unlock gate. Runs validation steps 1–5 in order; each is a hard stop.
#[derive(Debug)]
pub struct LicenseValidator<'a> {
    authority: &'a VerifyingKey,
    rollback_tolerance_secs: u64,
}

impl<'a> LicenseValidator<'a> {
    pub fn new(authority: &'a VerifyingKey, rollback_tolerance_secs: u64) -> Self {
        Self {
            authority,
            rollback_tolerance_secs,
        }
    }

    /// Validate at time `now`. The watermark is advanced in memory once the
    /// rollback check passes; persisting it is the caller's job.
    pub fn validate(
        &self,
        data: &[u8],
        keys: &PurposeKeys,
        tag: &DeviceTag,
        machine: &StableDeviceId,
        watermark: &mut ClockWatermark,
        now: u64,
    ) -> VaultResult<LicensePayload> {
        let payload = open_license(data, self.authority, keys)?;
        payload.check_binding(tag, machine)?;
        watermark.observe(now, self.rollback_tolerance_secs)?;
        payload.rules.check_window(now)?;
        tracing::debug!(owner = %payload.owner, "license validated");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn keys_for(tag: &DeviceTag) -> PurposeKeys {
        let master = cvault_crypto::MasterKey::from_bytes([7u8; 32]);
        cvault_crypto::derive_purpose_keys(&master, &tag.salt().unwrap()).unwrap()
    }

    fn machine() -> StableDeviceId {
        StableDeviceId::from_bytes([0xAB; 32])
    }

    fn issue(tag: &DeviceTag, authority: &AuthorityKey, rules: LicenseRules) -> Vec<u8> {
        let mut ceks = BTreeMap::new();
        ceks.insert("asset-a".to_string(), ContentKey::generate());
        let manifest_key = ManifestKey::generate();
        let request = LicenseRequest {
            owner: "alice",
            device_tag: tag,
            machine_hash: machine(),
            rules,
            manifest_key: &manifest_key,
            ceks: &ceks,
        };
        issue_license(&request, &keys_for(tag), authority).unwrap()
    }

    fn rules() -> LicenseRules {
        LicenseRules::new(Some(NOW - 100), NOW + 100).unwrap()
    }

    #[test]
    fn test_rules_reject_inverted_window() {
        assert!(matches!(
            LicenseRules::new(Some(10), 5),
            Err(VaultError::InvalidRules(_))
        ));
    }

    #[test]
    fn test_rules_reject_zero_quota() {
        let r = LicenseRules::new(None, 10).unwrap();
        assert!(r.clone().with_max_plays_global(0).is_err());
        assert!(r.with_max_plays_per_media(0).is_err());
    }

    #[test]
    fn test_rules_deserialize_validates() {
        let bad = r#"{"validFrom": 20, "validUntil": 10}"#;
        assert!(serde_json::from_str::<LicenseRules>(bad).is_err());

        let zero = r#"{"validUntil": 10, "maxPlaysPerMedia": 0}"#;
        assert!(serde_json::from_str::<LicenseRules>(zero).is_err());

        let ok = r#"{"validUntil": 10, "maxPlaysPerMedia": 2, "features": ["hdmi"]}"#;
        let r: LicenseRules = serde_json::from_str(ok).unwrap();
        assert_eq!(r.max_plays_per_media(), Some(2));
        assert!(r.features().contains("hdmi"));
    }

    #[test]
    fn test_window_is_inclusive() {
        let r = LicenseRules::new(Some(100), 200).unwrap();
        assert!(r.check_window(100).is_ok());
        assert!(r.check_window(200).is_ok());
        assert!(matches!(
            r.check_window(99),
            Err(VaultError::NotYetValid { .. })
        ));
        assert!(matches!(r.check_window(201), Err(VaultError::Expired { .. })));
    }

    #[test]
    fn test_issue_open_roundtrip() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let bytes = issue(&tag, &authority, rules());

        let payload = open_license(&bytes, &authority.verifying_key(), &keys_for(&tag)).unwrap();
        assert_eq!(payload.owner, "alice");
        assert_eq!(payload.device_id_hex, tag.device_id_hex());
        assert!(payload.is_licensed("asset-a"));
        payload.unwrap_cek(&keys_for(&tag), "asset-a").unwrap();
    }

    #[test]
    fn test_unknown_payload_version_rejected() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let keys = keys_for(&tag);
        let bytes = issue(&tag, &authority, rules());
        let mut payload = open_license(&bytes, &authority.verifying_key(), &keys).unwrap();
        payload.version = 2;

        let resealed = seal_payload(&payload, &keys, &authority).unwrap();
        let result = open_license(&resealed, &authority.verifying_key(), &keys);
        assert!(matches!(
            result,
            Err(VaultError::Version {
                found: 2,
                supported: LICENSE_VERSION
            })
        ));
    }

    #[test]
    fn test_unlicensed_asset() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let bytes = issue(&tag, &authority, rules());
        let payload = open_license(&bytes, &authority.verifying_key(), &keys_for(&tag)).unwrap();

        let result = payload.unwrap_cek(&keys_for(&tag), "asset-b");
        assert!(matches!(result, Err(VaultError::AssetNotLicensed(id)) if id == "asset-b"));
    }

    #[test]
    fn test_other_vault_keys_fail_decryption() {
        let tag = DeviceTag::generate();
        let other = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let bytes = issue(&tag, &authority, rules());

        let result = open_license(&bytes, &authority.verifying_key(), &keys_for(&other));
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn test_forged_body_rejected() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let mut bytes = issue(&tag, &authority, rules());
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;

        let result = open_license(&bytes, &authority.verifying_key(), &keys_for(&tag));
        assert!(matches!(result, Err(VaultError::SignatureInvalid(_))));
    }

    #[test]
    fn test_validator_order_binding_before_time() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let expired = LicenseRules::new(None, NOW - 1).unwrap();
        let bytes = issue(&tag, &authority, expired);

        let vk = authority.verifying_key();
        let validator = LicenseValidator::new(&vk, 600);
        let mut wm = ClockWatermark::default();
        let other_machine = StableDeviceId::from_bytes([0xCD; 32]);

        let result = validator.validate(&bytes, &keys_for(&tag), &tag, &other_machine, &mut wm, NOW);
        assert!(matches!(result, Err(VaultError::DeviceMismatch)));
        assert_eq!(wm.last_seen, 0, "watermark untouched before step 5");

        let result = validator.validate(&bytes, &keys_for(&tag), &tag, &machine(), &mut wm, NOW);
        assert!(matches!(result, Err(VaultError::Expired { .. })));
    }

    #[test]
    fn test_validator_rollback() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let bytes = issue(&tag, &authority, rules());
        let vk = authority.verifying_key();
        let validator = LicenseValidator::new(&vk, 60);
        let mut wm = ClockWatermark {
            last_seen: NOW + 50,
            ..Default::default()
        };

        validator
            .validate(&bytes, &keys_for(&tag), &tag, &machine(), &mut wm, NOW)
            .unwrap();
        assert_eq!(wm.last_seen, NOW + 50);

        let mut wm = ClockWatermark {
            last_seen: NOW + 1000,
            ..Default::default()
        };
        let result = validator.validate(&bytes, &keys_for(&tag), &tag, &machine(), &mut wm, NOW);
        assert!(matches!(
            result,
            Err(VaultError::ClockRollbackDetected { .. })
        ));
    }

    #[test]
    fn test_payload_json_field_names() {
        let tag = DeviceTag::generate();
        let authority = AuthorityKey::generate();
        let bytes = issue(&tag, &authority, rules());
        let payload = open_license(&bytes, &authority.verifying_key(), &keys_for(&tag)).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"deviceIdHex\""));
        assert!(json.contains("\"wrappedCEKs\""));
        assert!(json.contains("\"wrappedManifestKey\""));
    }
}
