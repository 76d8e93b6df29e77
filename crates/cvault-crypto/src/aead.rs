//! ChaCha20-Poly1305 with detached tags.
//!
//! Used for short records (wrapped keys, manifest and license payloads) where
//! nonce, ciphertext and tag are stored as separate fields.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use cvault_core::{VaultError, VaultResult};
use rand::RngCore;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Output of a detached seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Generate a random 96-bit nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; KEY_SIZE], aad: &[u8], plaintext: &[u8]) -> VaultResult<Sealed> {
    let nonce = generate_nonce();
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| VaultError::Other(anyhow::anyhow!("AEAD encryption failed: {e}")))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypt and verify. Any failure maps to `DecryptionFailed`; wrong key and
/// tampering are not distinguished.
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> VaultResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| VaultError::DecryptionFailed)?;
    Ok(buffer)
}
