//! Identifier generation and validation.

use std::sync::LazyLock;

use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use regex::Regex;

use crate::{CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Identifiers are restricted to alphanumerics, underscores, and hyphens so they
/// can be embedded in filesystem paths and storage keys without escaping.
static VALID_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// The prefix for sandbox identifiers.
pub const SANDBOX_ID_PREFIX: &str = "sbx";

/// The prefix for snapshot identifiers.
pub const SNAPSHOT_ID_PREFIX: &str = "snap";

/// The prefix for background job identifiers.
pub const JOB_ID_PREFIX: &str = "job";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates an opaque identifier (user, sandbox, snapshot, or job).
pub fn validate_id(value: &str, label: &str) -> CubicleResult<()> {
    if VALID_ID.is_match(value) {
        Ok(())
    } else {
        Err(CubicleError::InvalidArgument(format!(
            "invalid {} format: {:?}; only alphanumerics, underscores, and hyphens are allowed",
            label, value
        )))
    }
}

/// Generates a new sandbox identifier.
pub fn new_sandbox_id() -> String {
    format!("{}_{}", SANDBOX_ID_PREFIX, random_suffix(10))
}

/// Generates a new snapshot identifier of the form `snap_<YYYY_MM_DD_HHMMSS>_<rand>`.
///
/// The embedded timestamp makes identifiers sort chronologically.
pub fn new_snapshot_id() -> String {
    format!(
        "{}_{}_{}",
        SNAPSHOT_ID_PREFIX,
        Utc::now().format("%Y_%m_%d_%H%M%S"),
        random_suffix(4)
    )
}

/// Generates a new background job identifier.
pub fn new_job_id() -> String {
    format!("{}_{}", JOB_ID_PREFIX, random_suffix(8))
}

fn random_suffix(len: usize) -> String {
    Alphanumeric
        .sample_string(&mut rand::thread_rng(), len)
        .to_lowercase()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("u_123", "user_id").is_ok());
        assert!(validate_id("snap_2025_01_01_000000_ab12", "snapshot_id").is_ok());
        assert!(validate_id("../escape", "user_id").is_err());
        assert!(validate_id("a/b", "user_id").is_err());
        assert!(validate_id("", "user_id").is_err());
        assert!(validate_id("white space", "user_id").is_err());
    }

    #[test]
    fn test_generated_ids_validate() {
        validate_id(&new_sandbox_id(), "sandbox_id").unwrap();
        validate_id(&new_snapshot_id(), "snapshot_id").unwrap();
        validate_id(&new_job_id(), "job_id").unwrap();
    }

    #[test]
    fn test_snapshot_ids_sort_chronologically() {
        let a = new_snapshot_id();
        let b = new_snapshot_id();
        // Same-second ids may tie on the timestamp segment; strictly later
        // timestamps always sort after earlier ones.
        assert!(b[..SNAPSHOT_ID_PREFIX.len() + 18] >= a[..SNAPSHOT_ID_PREFIX.len() + 18]);
    }
}
