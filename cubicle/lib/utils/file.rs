//! Filesystem helpers shared by the storage, snapshot, and runtime layers.

use std::path::Path;

use rand::distributions::{Alphanumeric, DistString};
use tokio::{fs, io::AsyncWriteExt};

use crate::CubicleResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes `data` to `path` atomically.
///
/// The bytes land in a hidden temporary file in the destination directory and are
/// renamed into place, so readers never observe a half-written file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> CubicleResult<()> {
    let tmp = sibling_temp_path(path);
    {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Returns a temporary path in the same directory as `path`.
///
/// Same-directory placement keeps the final `rename` on one filesystem.
pub fn sibling_temp_path(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), 8);
    path.with_file_name(format!(".{}.tmp-{}", name, suffix))
}

/// Creates a directory (and missing parents) with mode 0700.
pub async fn create_private_dir(path: &Path) -> CubicleResult<()> {
    fs::create_dir_all(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).await?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
