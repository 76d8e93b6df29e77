//! Key derivation: scrypt passphrase → master key

use cvault_core::config::{KdfConfig, MIN_SECURE_LOG_N};
use cvault_core::{VaultError, VaultResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit master key derived from a passphrase via scrypt.
///
/// Never persisted. Recomputed on every unlock and zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// scrypt parameters for the KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// log2(N) (default: 15)
    pub log_n: u8,
    /// Block size (default: 8)
    pub r: u32,
    /// Parallelism (default: 1)
    pub p: u32,
    /// Refuse parameters needing more memory than this (default: 64 MiB)
    pub max_mem_bytes: u64,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&KdfConfig::default())
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(config: &KdfConfig) -> Self {
        Self {
            log_n: config.log_n,
            r: config.r,
            p: config.p,
            max_mem_bytes: config.max_mem_mib.saturating_mul(1024 * 1024),
        }
    }
}

impl KdfParams {
    /// 128 * r * N bytes
    pub fn memory_bytes(&self) -> u64 {
        128u64
            .saturating_mul(self.r as u64)
            .saturating_mul(1u64 << self.log_n.min(63))
    }

    pub fn is_weak(&self) -> bool {
        self.log_n < MIN_SECURE_LOG_N
    }
}

/// Derive a 256-bit master key from a passphrase and salt using scrypt.
///
/// The salt is the vault's device identifier, so the same passphrase yields
/// unrelated keys on different vaults.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> VaultResult<MasterKey> {
    if params.memory_bytes() > params.max_mem_bytes {
        return Err(VaultError::Config(format!(
            "scrypt parameters need {} bytes, cap is {}",
            params.memory_bytes(),
            params.max_mem_bytes
        )));
    }
    if params.is_weak() {
        tracing::warn!(log_n = params.log_n, "deriving master key with weak scrypt cost");
    }

    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_SIZE)
        .map_err(|e| VaultError::Config(format!("invalid scrypt params: {e}")))?;

    let mut key = [0u8; KEY_SIZE];
    scrypt::scrypt(
        passphrase.expose_secret().as_bytes(),
        salt,
        &scrypt_params,
        &mut key,
    )
    .map_err(|e| VaultError::Other(anyhow::anyhow!("scrypt KDF failed: {e}")))?;

    Ok(MasterKey::from_bytes(key))
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        log_n: 10,
        r: 8,
        p: 1,
        max_mem_bytes: 64 * 1024 * 1024,
    }
}
