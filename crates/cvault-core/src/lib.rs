//! cvault-core: shared types for the cvault media vault
//!
//! - `error`: the single error taxonomy surfaced to players and authoring tools
//! - `config`: `cvault.toml` schema (KDF work factors, codec chunking, clock tolerances)
//! - `logging`: tracing subscriber bootstrap for host applications

pub mod config;
pub mod error;
pub mod logging;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};

/// Directory (relative to the vault root) holding tag, manifest, license and local state.
pub const STATE_DIR: &str = ".vault";

/// Directory (relative to the vault root) holding encrypted media containers.
pub const MEDIA_DIR: &str = "media";
