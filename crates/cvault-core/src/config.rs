use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{VaultError, VaultResult};

/// Top-level vault configuration (loaded from cvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub kdf: KdfConfig,
    pub codec: CodecConfig,
    pub license: LicenseConfig,
    pub timechain: TimechainConfig,
    pub logging: LoggingConfig,
}

/// scrypt work factors for the master key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// log2 of the scrypt cost parameter N (default: 15)
    pub log_n: u8,
    /// Block size r (default: 8)
    pub r: u32,
    /// Parallelism p (default: 1)
    pub p: u32,
    /// Upper bound on scrypt memory use in MiB (default: 64)
    pub max_mem_mib: u64,
    /// Permit log_n below 15. Only meant for test suites.
    pub allow_weak: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Plaintext bytes per authenticated chunk (default: 64 KiB)
    pub chunk_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// How far the clock may fall behind the persisted watermark before unlock
    /// is refused (default: 600s)
    pub rollback_tolerance_secs: u64,
    /// Hex-encoded Ed25519 public key of the packaging authority
    pub authority_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimechainConfig {
    /// Allowed backwards skew between consecutive entries (default: 600s)
    pub timestamp_tolerance_secs: u64,
    /// Play starts for one asset inside the burst window that count as
    /// suspicious (default: 5)
    pub burst_threshold: usize,
    /// Sliding window for burst detection (default: 60s)
    pub burst_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

pub const MIN_CHUNK_SIZE: u32 = 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;
pub const MIN_SECURE_LOG_N: u8 = 15;

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            log_n: MIN_SECURE_LOG_N,
            r: 8,
            p: 1,
            max_mem_mib: 64,
            allow_weak: false,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
        }
    }
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            rollback_tolerance_secs: 600,
            authority_public_key: None,
        }
    }
}

impl Default for TimechainConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: 600,
            burst_threshold: 5,
            burst_window_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl KdfConfig {
    /// Memory scrypt needs for these parameters: 128 * r * N bytes.
    pub fn memory_bytes(&self) -> u64 {
        128u64
            .saturating_mul(self.r as u64)
            .saturating_mul(1u64 << self.log_n.min(63))
    }
}

impl VaultConfig {
    /// Load the config from a TOML file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: VaultConfig = toml::from_str(&content)
            .map_err(|e| VaultError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        let kdf = &self.kdf;
        if kdf.log_n < MIN_SECURE_LOG_N && !kdf.allow_weak {
            return Err(VaultError::Config(format!(
                "kdf.log_n = {} is below the minimum of {MIN_SECURE_LOG_N}",
                kdf.log_n
            )));
        }
        if kdf.log_n == 0 || kdf.log_n >= 32 || kdf.r == 0 || kdf.p == 0 {
            return Err(VaultError::Config("kdf parameters out of range".into()));
        }
        if kdf.memory_bytes() > kdf.max_mem_mib.saturating_mul(1024 * 1024) {
            return Err(VaultError::Config(format!(
                "kdf needs {} MiB, cap is {} MiB",
                kdf.memory_bytes() / (1024 * 1024),
                kdf.max_mem_mib
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.codec.chunk_size) {
            return Err(VaultError::Config(format!(
                "codec.chunk_size = {} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}",
                self.codec.chunk_size
            )));
        }
        if self.timechain.burst_threshold == 0 || self.timechain.burst_window_secs == 0 {
            return Err(VaultError::Config(
                "timechain burst threshold and window must be non-zero".into(),
            ));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(VaultError::Config(format!("unknown log format: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[kdf]
log_n = 16
r = 8
p = 2
max_mem_mib = 128

[codec]
chunk_size = 131072

[license]
rollback_tolerance_secs = 300
authority_public_key = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"

[timechain]
timestamp_tolerance_secs = 120
burst_threshold = 3
burst_window_secs = 30

[logging]
level = "debug"
format = "json"
"#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.kdf.log_n, 16);
        assert_eq!(config.kdf.p, 2);
        assert_eq!(config.codec.chunk_size, 131072);
        assert_eq!(config.license.rollback_tolerance_secs, 300);
        assert!(config.license.authority_public_key.is_some());
        assert_eq!(config.timechain.burst_threshold, 3);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: VaultConfig = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.kdf.log_n, 15);
        assert_eq!(config.kdf.r, 8);
        assert_eq!(config.kdf.p, 1);
        assert_eq!(config.codec.chunk_size, 65536);
        assert_eq!(config.license.rollback_tolerance_secs, 600);
        assert_eq!(config.timechain.burst_window_secs, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_weak_kdf_rejected() {
        let config: VaultConfig = toml::from_str("[kdf]\nlog_n = 10\n").unwrap();
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));

        let config: VaultConfig = toml::from_str("[kdf]\nlog_n = 10\nallow_weak = true\n").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_memory_cap_enforced() {
        let config: VaultConfig = toml::from_str("[kdf]\nlog_n = 20\nmax_mem_mib = 64\n").unwrap();
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_chunk_size_bounds() {
        let config: VaultConfig = toml::from_str("[codec]\nchunk_size = 16\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.kdf.log_n, 15);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cvault.toml");
        std::fs::write(&path, "[logging]\nformat = \"xml\"\n").unwrap();
        assert!(matches!(VaultConfig::load(&path), Err(VaultError::Config(_))));
    }
}
