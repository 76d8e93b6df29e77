//! cvault-crypto: cryptographic primitives for the cvault media vault
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, scrypt(passphrase, salt = DeviceTag.device_id))
//!   ├── wrap-cek      (HKDF-SHA256, salt = DeviceTag.salt) → wraps per-asset CEKs
//!   ├── license-json  (HKDF-SHA256, salt = DeviceTag.salt) → encrypts the license payload
//!   └── manifest-key  (HKDF-SHA256, salt = DeviceTag.salt) → wraps the random ManifestKey
//!
//! Content Encryption Key (per asset, 256-bit random, only ever stored wrapped)
//!   └── File key = HKDF-SHA256(CEK, salt = container salt, "cvault-media-v1")
//!       └── Chunk AEAD: ChaCha20-Poly1305 (nonce = base ⊕ index, AAD = header||index||final)
//! ```
//!
//! Signed files (manifest, license) share one envelope:
//! `[MAGIC][BODY][SIG_ALGO_ID][SIG_LEN][SIGNATURE]`, signature over BODY.

pub mod aead;
pub mod codec;
pub mod kdf;
pub mod keys;
pub mod sign;
pub mod wire;

pub use codec::{decrypt_file, decrypt_stream, encrypt_file, encrypt_stream, Decryptor};
pub use kdf::{derive_master_key, KdfParams, MasterKey};
pub use keys::{
    derive_purpose_keys, unwrap_key, wrap_key, ContentKey, KeyMaterial, ManifestKey, Purpose,
    PurposeKey, PurposeKeys, WrappedKey,
};
pub use sign::{open_envelope, seal_envelope, AuthorityKey};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of random salts (container salt, DeviceTag salt)
pub const SALT_SIZE: usize = 16;
