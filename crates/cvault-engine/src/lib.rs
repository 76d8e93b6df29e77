//! cvault-engine: vault state, license gate and playback records
//!
//! Player flow:
//!
//! ```text
//! Vault::open ─► unlock(passphrase)
//!                 ├─ license: magic/version ─► signature ─► decrypt ─► device ─► time
//!                 └─ manifest: signature ─► decrypt with the license's ManifestKey
//!               ─► Session
//!                 ├─ list_catalog()
//!                 ├─ open_asset_stream(id)   (CEK unwrap + quota check)
//!                 └─ record_playback(id, ..) (timechain append)
//! ```
//!
//! Authoring flow: [`Authoring::init_vault`] → [`Authoring::add_media`] →
//! [`Authoring::seal_manifest`] → [`Authoring::issue_license`].

pub mod authoring;
pub mod device;
pub mod fingerprint;
pub mod license;
pub mod manifest;
pub mod stream;
pub mod timechain;
mod util;
pub mod vault;
pub mod watermark;

pub use authoring::{Authoring, MediaMetadata};
pub use device::DeviceTag;
pub use fingerprint::{
    platform_probe, DeviceFingerprint, SignalProbe, StableDeviceId, StaticProbe,
};
pub use license::{LicensePayload, LicenseRules, LicenseValidator};
pub use manifest::{Manifest, ManifestEntry, SourceKind};
pub use stream::AssetStream;
pub use timechain::{Anomaly, AnomalyPolicy, ChainAnchor, ChainReport, PlaybackEvent, Timechain};
pub use util::now_secs;
pub use vault::{Session, Vault, VaultPaths};
pub use watermark::ClockWatermark;
