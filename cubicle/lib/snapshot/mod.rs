//! Workspace snapshots: compressed archives with per-user retention.

mod archive;
mod engine;

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;
pub use engine::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The storage key prefix for all snapshot objects.
pub const SNAPSHOT_KEY_PREFIX: &str = "snapshots";

/// The file suffix for snapshot payloads.
pub const SNAPSHOT_PAYLOAD_SUFFIX: &str = ".tar.zst";

/// The file suffix for snapshot metadata sidecars.
pub const SNAPSHOT_META_SUFFIX: &str = ".json";

/// The compression algorithm token recorded in snapshot metadata.
pub const SNAPSHOT_COMPRESSION: &str = "zstd";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An immutable point-in-time archive of a workspace, owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Snapshot {
    /// Snapshot identifier, `snap_<YYYY_MM_DD_HHMMSS>_<rand>`.
    snapshot_id: String,

    /// Owning user.
    user_id: String,

    /// Sandbox the snapshot was taken from, when known.
    sandbox_id: Option<String>,

    /// Compressed payload size.
    size_bytes: u64,

    /// Creation time.
    created_at: DateTime<Utc>,

    /// The workspace the archive was taken from.
    source_workspace_path: PathBuf,

    /// Compression algorithm token.
    compression: String,

    /// SHA-256 of the compressed payload, hex encoded.
    digest: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The storage key of a snapshot payload.
pub fn payload_key(user_id: &str, snapshot_id: &str) -> String {
    format!(
        "{}/{}/{}{}",
        SNAPSHOT_KEY_PREFIX, user_id, snapshot_id, SNAPSHOT_PAYLOAD_SUFFIX
    )
}

/// The storage key of a snapshot metadata sidecar.
pub fn meta_key(user_id: &str, snapshot_id: &str) -> String {
    format!(
        "{}/{}/{}{}",
        SNAPSHOT_KEY_PREFIX, user_id, snapshot_id, SNAPSHOT_META_SUFFIX
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            payload_key("u_a", "snap_2025_01_01_000000_ab12"),
            "snapshots/u_a/snap_2025_01_01_000000_ab12.tar.zst"
        );
        assert_eq!(
            meta_key("u_a", "snap_2025_01_01_000000_ab12"),
            "snapshots/u_a/snap_2025_01_01_000000_ab12.json"
        );
    }
}
