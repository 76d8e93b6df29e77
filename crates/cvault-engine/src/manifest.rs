//! Signed, optionally encrypted asset catalog (`.vault/manifest.bin`).
//!
//! ```text
//! envelope: [MAGIC "CVMN"][BODY][SIG_ALGO_ID][u16 SIG_LEN][SIGNATURE]
//! body:     [VERSION][KDF_ID][SALT_LEN][SALT][NONCE_LEN][NONCE]
//!           [u32 CT_LEN][CT][TAG_LEN][TAG]
//! ```
//!
//! With `KDF_ID = 1` the catalog JSON is sealed under a random [`ManifestKey`]
//! which travels only inside the license, so the catalog cannot be read
//! without a matching license. `KDF_ID = 0` stores the JSON signed but in the
//! clear (salt, nonce and tag fields empty).

use cvault_core::{VaultError, VaultResult};
use cvault_crypto::aead;
use cvault_crypto::wire::{BodyReader, BodyWriter};
use cvault_crypto::{open_envelope, seal_envelope, AuthorityKey, KeyMaterial, ManifestKey};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::util::now_secs;

pub const MANIFEST_MAGIC: &[u8; 4] = b"CVMN";
pub const MANIFEST_VERSION: u8 = 1;

const KDF_NONE: u8 = 0;
const KDF_LICENSE_WRAPPED: u8 = 1;

/// Where an asset was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Disc,
    Capture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub source_kind: SourceKind,
    /// BLAKE3 of the plaintext, hex
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub created_at: u64,
    pub items: Vec<ManifestEntry>,
}

impl Manifest {
    /// Catalog with entries sorted by title (then id) for reproducible output.
    pub fn build(mut items: Vec<ManifestEntry>) -> Self {
        items.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        Self {
            version: MANIFEST_VERSION as u32,
            created_at: now_secs(),
            items,
        }
    }

    pub fn find(&self, id: &str) -> Option<&ManifestEntry> {
        self.items.iter().find(|e| e.id == id)
    }
}

/// How the catalog body is protected inside the signed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestProtection {
    /// Sealed under a fresh random ManifestKey
    Encrypted,
    /// Signed only
    SignedOnly,
}

fn payload_aad() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(MANIFEST_MAGIC);
    aad[4] = MANIFEST_VERSION;
    aad
}

/// Serialize, optionally encrypt, and sign a catalog.
///
/// Returns the file bytes and, for [`ManifestProtection::Encrypted`], the
/// ManifestKey that licenses must wrap.
pub fn seal_manifest(
    manifest: &Manifest,
    authority: &AuthorityKey,
    protection: ManifestProtection,
) -> VaultResult<(Vec<u8>, Option<ManifestKey>)> {
    let json = serde_json::to_vec(manifest)?;

    let mut body = BodyWriter::new();
    body.put_u8(MANIFEST_VERSION);

    let key = match protection {
        ManifestProtection::Encrypted => {
            let key = ManifestKey::generate();
            let sealed = aead::seal(key.as_bytes(), &payload_aad(), &json)?;
            body.put_u8(KDF_LICENSE_WRAPPED);
            body.put_short(&[])?;
            body.put_short(&sealed.nonce)?;
            body.put_long(&sealed.ciphertext)?;
            body.put_short(&sealed.tag)?;
            Some(key)
        }
        ManifestProtection::SignedOnly => {
            body.put_u8(KDF_NONE);
            body.put_short(&[])?;
            body.put_short(&[])?;
            body.put_long(&json)?;
            body.put_short(&[])?;
            None
        }
    };

    let out = seal_envelope(MANIFEST_MAGIC, &body.finish(), authority);
    tracing::info!(
        items = manifest.items.len(),
        encrypted = key.is_some(),
        "manifest sealed"
    );
    Ok((out, key))
}

/// Verify the signature, then decrypt with the key unwrapped from the license.
///
/// An encrypted catalog opened without a key, or with a key other than the one
/// it was sealed under, fails with `DecryptionFailed`.
pub fn open_manifest(
    data: &[u8],
    authority: &VerifyingKey,
    key: Option<&ManifestKey>,
) -> VaultResult<Manifest> {
    let body = open_envelope(MANIFEST_MAGIC, MANIFEST_VERSION, data, authority, "manifest")?;

    let mut r = BodyReader::new(body);
    r.get_u8()?;
    let kdf_id = r.get_u8()?;
    let salt = r.get_short()?;
    if !salt.is_empty() {
        return Err(VaultError::Format(format!(
            "manifest: unexpected {}-byte salt",
            salt.len()
        )));
    }

    let json = match kdf_id {
        KDF_LICENSE_WRAPPED => {
            let nonce = r.get_fixed::<{ cvault_crypto::NONCE_SIZE }>("manifest nonce")?;
            let ciphertext = r.get_long()?;
            let tag = r.get_fixed::<{ cvault_crypto::TAG_SIZE }>("manifest tag")?;
            r.expect_end()?;
            let key = key.ok_or(VaultError::DecryptionFailed)?;
            aead::open(key.as_bytes(), &nonce, &payload_aad(), ciphertext, &tag)?
        }
        KDF_NONE => {
            r.get_fixed::<0>("manifest nonce")?;
            let json = r.get_long()?.to_vec();
            r.get_fixed::<0>("manifest tag")?;
            r.expect_end()?;
            json
        }
        other => {
            return Err(VaultError::Format(format!(
                "manifest: unknown KDF id {other}"
            )))
        }
    };

    serde_json::from_slice(&json).map_err(|e| VaultError::Format(format!("manifest payload: {e}")))
}
