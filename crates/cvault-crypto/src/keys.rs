//! Key hierarchy: master key → purpose keys, CEK/ManifestKey generation, key wrapping

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cvault_core::{VaultError, VaultResult};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::aead;
use crate::kdf::MasterKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// 256-bit secrets that can be wrapped under a purpose key.
pub trait KeyMaterial: Sized {
    fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self;
    fn as_bytes(&self) -> &[u8; KEY_SIZE];

    fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl KeyMaterial for $name {
            fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// Per-asset content encryption key. Only ever persisted in wrapped form.
    ContentKey
);

secret_key!(
    /// Random key sealing the catalog. Travels wrapped inside the license.
    ManifestKey
);

secret_key!(
    /// HKDF output bound to a single `Purpose`.
    PurposeKey
);

/// The three key-derivation contexts. Each info string yields an independent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    WrapCek,
    LicenseJson,
    ManifestKey,
}

impl Purpose {
    pub fn info(self) -> &'static [u8] {
        match self {
            Purpose::WrapCek => b"wrap-cek",
            Purpose::LicenseJson => b"license-json",
            Purpose::ManifestKey => b"manifest-key",
        }
    }
}

/// Derive one purpose key: HKDF-SHA256(ikm = master, salt = DeviceTag salt, info).
pub fn derive_purpose_key(
    master: &MasterKey,
    tag_salt: &[u8],
    purpose: Purpose,
) -> VaultResult<PurposeKey> {
    hkdf_derive(master.as_bytes(), Some(tag_salt), purpose.info()).map(PurposeKey::from_bytes)
}

/// All purpose keys for one vault, derived together at unlock or issuance.
#[derive(Debug, Clone)]
pub struct PurposeKeys {
    pub wrap_cek: PurposeKey,
    pub license: PurposeKey,
    pub manifest: PurposeKey,
}

pub fn derive_purpose_keys(master: &MasterKey, tag_salt: &[u8]) -> VaultResult<PurposeKeys> {
    Ok(PurposeKeys {
        wrap_cek: derive_purpose_key(master, tag_salt, Purpose::WrapCek)?,
        license: derive_purpose_key(master, tag_salt, Purpose::LicenseJson)?,
        manifest: derive_purpose_key(master, tag_salt, Purpose::ManifestKey)?,
    })
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(
    ikm: &[u8; KEY_SIZE],
    salt: Option<&[u8]>,
    info: &[u8],
) -> VaultResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| VaultError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// A short secret encrypted under a purpose key: `{nonce, ciphertext, tag}`.
///
/// Serialized as base64 of `[12-byte nonce][32-byte ciphertext][16-byte tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl WrappedKey {
    pub const ENCODED_LEN: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(VaultError::Format(format!(
                "wrapped key is {} bytes (expected {})",
                data.len(),
                Self::ENCODED_LEN
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&data[NONCE_SIZE + KEY_SIZE..]);
        Ok(Self {
            nonce,
            ciphertext: data[NONCE_SIZE..NONCE_SIZE + KEY_SIZE].to_vec(),
            tag,
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> VaultResult<Self> {
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| VaultError::Format(format!("wrapped key base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for WrappedKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        WrappedKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Wrap (encrypt) a key under a purpose key with a fresh random nonce.
///
/// `label` is authenticated alongside the key (e.g. the asset id), so a wrapped
/// key cannot be moved to a different slot.
pub fn wrap_key<K: KeyMaterial>(
    wrapping: &PurposeKey,
    key: &K,
    label: &[u8],
) -> VaultResult<WrappedKey> {
    let sealed = aead::seal(wrapping.as_bytes(), label, key.as_bytes())?;
    Ok(WrappedKey {
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
        tag: sealed.tag,
    })
}

/// Unwrap (decrypt) a key. A wrong wrapping key, wrong label and tampering all
/// surface as `DecryptionFailed`.
pub fn unwrap_key<K: KeyMaterial>(
    wrapping: &PurposeKey,
    wrapped: &WrappedKey,
    label: &[u8],
) -> VaultResult<K> {
    let mut plaintext = aead::open(
        wrapping.as_bytes(),
        &wrapped.nonce,
        label,
        &wrapped.ciphertext,
        &wrapped.tag,
    )?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(VaultError::Format(format!(
            "unwrapped key has wrong size: {} bytes",
            plaintext.len()
        )));
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(K::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master_key() -> MasterKey {
        MasterKey::from_bytes([42u8; KEY_SIZE])
    }

    fn test_purpose_keys() -> PurposeKeys {
        derive_purpose_keys(&test_master_key(), &[5u8; 16]).unwrap()
    }

    #[test]
    fn test_content_key_generation() {
        let k1 = ContentKey::generate();
        let k2 = ContentKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        let keys = test_purpose_keys();
        let cek = ContentKey::generate();

        let wrapped = wrap_key(&keys.wrap_cek, &cek, b"asset-1").unwrap();
        let unwrapped: ContentKey = unwrap_key(&keys.wrap_cek, &wrapped, b"asset-1").unwrap();

        assert_eq!(cek.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_key_unwrap_wrong_purpose() {
        let keys = test_purpose_keys();
        let cek = ContentKey::generate();

        let wrapped = wrap_key(&keys.wrap_cek, &cek, b"asset-1").unwrap();
        let result: VaultResult<ContentKey> = unwrap_key(&keys.manifest, &wrapped, b"asset-1");

        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn test_key_unwrap_wrong_label() {
        let keys = test_purpose_keys();
        let cek = ContentKey::generate();

        let wrapped = wrap_key(&keys.wrap_cek, &cek, b"asset-1").unwrap();
        let result: VaultResult<ContentKey> = unwrap_key(&keys.wrap_cek, &wrapped, b"asset-2");

        assert!(result.is_err(), "a wrapped key is bound to its label");
    }

    #[test]
    fn test_purpose_keys_are_distinct() {
        let keys = test_purpose_keys();
        assert_ne!(keys.wrap_cek.as_bytes(), keys.license.as_bytes());
        assert_ne!(keys.wrap_cek.as_bytes(), keys.manifest.as_bytes());
        assert_ne!(keys.license.as_bytes(), keys.manifest.as_bytes());
    }

    #[test]
    fn test_purpose_keys_depend_on_tag_salt() {
        let a = derive_purpose_keys(&test_master_key(), &[1u8; 16]).unwrap();
        let b = derive_purpose_keys(&test_master_key(), &[2u8; 16]).unwrap();
        assert_ne!(a.license.as_bytes(), b.license.as_bytes());
    }

    #[test]
    fn test_wrapped_key_encoding() {
        let keys = test_purpose_keys();
        let wrapped = wrap_key(&keys.manifest, &ManifestKey::generate(), b"manifest").unwrap();

        // nonce (12) + key (32) + tag (16) = 60
        assert_eq!(wrapped.to_bytes().len(), 60);

        let back = WrappedKey::from_base64(&wrapped.to_base64()).unwrap();
        assert_eq!(back, wrapped);
    }

    #[test]
    fn test_wrapped_key_rejects_bad_length() {
        assert!(matches!(
            WrappedKey::from_bytes(&[0u8; 20]),
            Err(VaultError::Format(_))
        ));
    }
}
