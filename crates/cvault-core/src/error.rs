use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Every failure a vault operation can surface.
///
/// Messages carry file names and field names only. Key material, derived keys
/// and passphrases never appear in a `VaultError`.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Bad magic, malformed header or body layout.
    #[error("format error: {0}")]
    Format(String),

    #[error("unsupported format version {found} (supported: {supported})")]
    Version { found: u8, supported: u8 },

    /// AEAD tag mismatch on a media container. Deliberately carries no detail.
    #[error("authentication failed: container is corrupted or the key is wrong")]
    Authentication,

    #[error("truncated data: {0}")]
    Truncated(String),

    /// License or manifest payload did not decrypt: wrong passphrase, tampered
    /// body, or a license relocated to another vault.
    #[error("decryption failed: wrong passphrase or tampered data")]
    DecryptionFailed,

    #[error("signature verification failed for {0}")]
    SignatureInvalid(String),

    #[error("license is bound to a different device")]
    DeviceMismatch,

    #[error("license expired at {valid_until} (now {now})")]
    Expired { valid_until: u64, now: u64 },

    #[error("license not valid before {valid_from} (now {now})")]
    NotYetValid { valid_from: u64, now: u64 },

    #[error("system clock moved backwards: now {now}, last seen {watermark}")]
    ClockRollbackDetected { now: u64, watermark: u64 },

    #[error("asset not licensed: {0}")]
    AssetNotLicensed(String),

    #[error("feature not licensed: {0}")]
    FeatureNotLicensed(String),

    #[error("play quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("timechain corrupted at entry {first_corrupted} ({corrupted} of {total} entries)")]
    ChainCorrupted {
        first_corrupted: u64,
        corrupted: usize,
        total: usize,
    },

    #[error("invalid license rules: {0}")]
    InvalidRules(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Failures that indicate tampering, relocation or clock manipulation rather
    /// than a missing or malformed file.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            VaultError::Authentication
                | VaultError::DecryptionFailed
                | VaultError::SignatureInvalid(_)
                | VaultError::DeviceMismatch
                | VaultError::ClockRollbackDetected { .. }
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_classification() {
        assert!(VaultError::Authentication.is_security_event());
        assert!(VaultError::SignatureInvalid("license".into()).is_security_event());
        assert!(VaultError::ClockRollbackDetected {
            now: 1,
            watermark: 2000
        }
        .is_security_event());
        assert!(!VaultError::AssetNotLicensed("a".into()).is_security_event());
        assert!(!VaultError::QuotaExceeded("a".into()).is_security_event());
    }

    #[test]
    fn test_messages_are_opaque() {
        let msg = VaultError::DecryptionFailed.to_string();
        assert!(msg.contains("wrong passphrase"));
        let msg = VaultError::Authentication.to_string();
        assert!(!msg.contains("tag"));
    }
}
