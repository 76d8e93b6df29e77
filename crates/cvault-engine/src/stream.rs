//! Plaintext byte streams over `media/<id>.enc` containers.

use cvault_core::VaultResult;
use cvault_crypto::{ContentKey, Decryptor};
use std::fs::File;
use std::io::Read;
use tokio::sync::mpsc;

/// Verified plaintext of one asset.
///
/// Every chunk is authenticated before its bytes are handed out. Dropping the
/// stream closes the file and discards the cipher state.
pub struct AssetStream {
    asset_id: String,
    inner: Decryptor<File>,
}

impl AssetStream {
    pub(crate) fn open(asset_id: &str, cek: &ContentKey, file: File) -> VaultResult<Self> {
        let inner = Decryptor::new(cek, file)?;
        tracing::debug!(asset_id, "asset stream opened");
        Ok(Self {
            asset_id: asset_id.to_string(),
            inner,
        })
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// True once the final chunk has been verified.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn plaintext_bytes(&self) -> u64 {
        self.inner.plaintext_bytes()
    }

    /// Next verified chunk, or `None` after the final one.
    pub fn next_chunk(&mut self) -> VaultResult<Option<&[u8]>> {
        self.inner.next_chunk()
    }

    /// Move decryption onto a blocking task feeding a bounded channel.
    ///
    /// The task waits whenever the channel is full. Dropping the receiver stops
    /// it at the next chunk. An error is delivered as the last item. Must be
    /// called from within a Tokio runtime.
    pub fn into_channel(mut self, capacity: usize) -> mpsc::Receiver<VaultResult<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::task::spawn_blocking(move || loop {
            let item = match self.next_chunk() {
                Ok(Some([])) => continue,
                Ok(Some(chunk)) => Ok(chunk.to_vec()),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() {
                tracing::debug!(asset_id = %self.asset_id, "asset stream cancelled");
                break;
            }
            if failed {
                break;
            }
        });
        rx
    }
}

impl Read for AssetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for AssetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetStream")
            .field("asset_id", &self.asset_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
