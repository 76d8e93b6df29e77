use anyhow::Context;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use cvault_core::VaultResult;

/// Current wall-clock time as Unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Atomic write: write to a temp file, then rename over `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating dir: {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("writing temp file: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming into place: {}", path.display()))?;
    Ok(())
}
