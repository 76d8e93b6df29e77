//! Ed25519 signed envelope shared by the manifest and license files.
//!
//! ```text
//! [4 bytes: MAGIC][BODY][1 byte: SIG_ALGO_ID][u16 BE: SIG_LEN][SIG_LEN bytes: signature over BODY]
//! ```
//!
//! BODY always starts with its format version byte. The packaging authority's
//! public key is the trust anchor and is distributed out of band.

use cvault_core::{VaultError, VaultResult};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;

pub const MAGIC_LEN: usize = 4;

/// Only Ed25519 is defined; any other id is rejected.
pub const SIG_ALGO_ED25519: u8 = 1;

const TRAILER_LEN: usize = 1 + 2 + SIGNATURE_LENGTH;

/// The packaging authority's signing key. Held only by authoring tools.
pub struct AuthorityKey {
    signing: SigningKey,
}

impl AuthorityKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, body: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(body).to_bytes()
    }
}

impl std::fmt::Debug for AuthorityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityKey")
            .field("public", &self.verifying_key_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Parse the hex-encoded trust anchor (e.g. from `license.authority_public_key`).
pub fn parse_verifying_key(hex_key: &str) -> VaultResult<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| VaultError::Config(format!("authority public key is not hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VaultError::Config("authority public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| VaultError::Config(format!("invalid authority public key: {e}")))
}

/// Wrap `body` in the signed envelope.
pub fn seal_envelope(magic: &[u8; MAGIC_LEN], body: &[u8], key: &AuthorityKey) -> Vec<u8> {
    let signature = key.sign(body);
    let mut out = Vec::with_capacity(MAGIC_LEN + body.len() + TRAILER_LEN);
    out.extend_from_slice(magic);
    out.extend_from_slice(body);
    out.push(SIG_ALGO_ED25519);
    out.extend_from_slice(&(SIGNATURE_LENGTH as u16).to_be_bytes());
    out.extend_from_slice(&signature);
    out
}

/// Check magic, then the body version, then the signature. Returns the verified
/// body. Nothing in the body may be interpreted before this returns `Ok`.
pub fn open_envelope<'a>(
    magic: &[u8; MAGIC_LEN],
    version: u8,
    data: &'a [u8],
    authority: &VerifyingKey,
    what: &str,
) -> VaultResult<&'a [u8]> {
    if data.len() < MAGIC_LEN || &data[..MAGIC_LEN] != magic {
        return Err(VaultError::Format(format!("{what}: bad magic")));
    }
    if data.len() < MAGIC_LEN + 1 + TRAILER_LEN {
        return Err(VaultError::Truncated(format!("{what}: {} bytes", data.len())));
    }

    let body_end = data.len() - TRAILER_LEN;
    let body = &data[MAGIC_LEN..body_end];
    if body[0] != version {
        return Err(VaultError::Version {
            found: body[0],
            supported: version,
        });
    }

    let trailer = &data[body_end..];
    if trailer[0] != SIG_ALGO_ED25519 {
        return Err(VaultError::SignatureInvalid(format!(
            "{what}: unsupported signature algorithm {}",
            trailer[0]
        )));
    }
    let sig_len = u16::from_be_bytes([trailer[1], trailer[2]]) as usize;
    if sig_len != SIGNATURE_LENGTH {
        return Err(VaultError::SignatureInvalid(format!(
            "{what}: signature length {sig_len}"
        )));
    }

    let mut sig_bytes = [0u8; SIGNATURE_LENGTH];
    sig_bytes.copy_from_slice(&trailer[3..]);
    let signature = Signature::from_bytes(&sig_bytes);

    authority.verify_strict(body, &signature).map_err(|_| {
        tracing::warn!(what, "signature verification failed");
        VaultError::SignatureInvalid(what.to_string())
    })?;

    Ok(body)
}
