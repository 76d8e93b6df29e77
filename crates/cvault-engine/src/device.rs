//! Vault-local device tag: the root of trust for key derivation.
//!
//! Created once by the packaging tool. Regenerating it invalidates every
//! license issued against the vault.

use anyhow::Context;
use cvault_core::{VaultError, VaultResult};
use cvault_crypto::{derive_master_key, derive_purpose_keys, KdfParams, PurposeKeys, SALT_SIZE};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::{atomic_write, now_secs};

/// Random device identifier length in bytes
pub const DEVICE_ID_SIZE: usize = 16;

/// Contents of `.vault/device.tag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTag {
    /// Hex of 16 random bytes; the scrypt salt for this vault
    pub device_id: String,
    /// Hex of 16 random bytes; the HKDF salt for purpose keys
    pub salt_hex: String,
    /// Unix timestamp of vault initialization
    pub created_at: u64,
}

impl DeviceTag {
    pub fn generate() -> Self {
        let mut id = [0u8; DEVICE_ID_SIZE];
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut id);
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            device_id: hex::encode(id),
            salt_hex: hex::encode(salt),
            created_at: now_secs(),
        }
    }

    pub fn load(path: &Path) -> VaultResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading device tag: {}", path.display()))?;
        let tag: Self = serde_json::from_str(&content)
            .map_err(|e| VaultError::Format(format!("device tag: {e}")))?;
        tag.device_id_bytes()?;
        tag.salt()?;
        Ok(tag)
    }

    /// Write the tag. Refuses to replace an existing one.
    pub fn create(&self, path: &Path) -> VaultResult<()> {
        if path.exists() {
            return Err(VaultError::Config(format!(
                "device tag already exists: {}",
                path.display()
            )));
        }
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)
    }

    pub fn device_id_bytes(&self) -> VaultResult<[u8; DEVICE_ID_SIZE]> {
        decode_fixed(&self.device_id, "device_id")
    }

    pub fn salt(&self) -> VaultResult<[u8; SALT_SIZE]> {
        decode_fixed(&self.salt_hex, "salt_hex")
    }

    /// Normalized device id as bound into licenses.
    pub fn device_id_hex(&self) -> String {
        self.device_id.to_ascii_lowercase()
    }

    /// Passphrase → scrypt master key (salted with the device id) → HKDF
    /// purpose keys (salted with the tag salt).
    pub fn derive_keys(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> VaultResult<PurposeKeys> {
        let master = derive_master_key(passphrase, &self.device_id_bytes()?, params)?;
        derive_purpose_keys(&master, &self.salt()?)
    }
}

fn decode_fixed<const N: usize>(value: &str, field: &str) -> VaultResult<[u8; N]> {
    let bytes =
        hex::decode(value).map_err(|e| VaultError::Format(format!("device tag {field}: {e}")))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        VaultError::Format(format!(
            "device tag {field} is {} bytes (expected {N})",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvault_crypto::KeyMaterial;

    fn fast_params() -> KdfParams {
        KdfParams {
            log_n: 10,
            ..KdfParams::default()
        }
    }

    #[test]
    fn test_generate_is_random() {
        let a = DeviceTag::generate();
        let b = DeviceTag::generate();
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.salt_hex, b.salt_hex);
        assert_eq!(a.device_id.len(), DEVICE_ID_SIZE * 2);
    }

    #[test]
    fn test_create_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vault/device.tag");
        let tag = DeviceTag::generate();
        tag.create(&path).unwrap();

        let loaded = DeviceTag::load(&path).unwrap();
        assert_eq!(loaded, tag);
    }

    #[test]
    fn test_create_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.tag");
        DeviceTag::generate().create(&path).unwrap();
        assert!(matches!(
            DeviceTag::generate().create(&path),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_load_rejects_malformed_salt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.tag");
        let mut tag = DeviceTag::generate();
        tag.salt_hex = "abcd".into();
        std::fs::write(&path, serde_json::to_vec(&tag).unwrap()).unwrap();
        assert!(matches!(DeviceTag::load(&path), Err(VaultError::Format(_))));
    }

    #[test]
    fn test_keys_bound_to_tag() {
        let pass = SecretString::from("correct horse".to_string());
        let a = DeviceTag::generate();
        let b = DeviceTag::generate();

        let ka1 = a.derive_keys(&pass, &fast_params()).unwrap();
        let ka2 = a.derive_keys(&pass, &fast_params()).unwrap();
        let kb = b.derive_keys(&pass, &fast_params()).unwrap();

        assert_eq!(ka1.license.as_bytes(), ka2.license.as_bytes());
        assert_ne!(ka1.license.as_bytes(), kb.license.as_bytes());
    }
}
