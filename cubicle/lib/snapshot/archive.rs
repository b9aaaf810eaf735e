//! The snapshot archive codec: tar with USTAR headers through zstd.
//!
//! Packing and unpacking are synchronous (both `tar` and `zstd` drive blocking
//! writers); the engine runs them on the blocking pool.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Component, Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::{CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What the packer produced: payload size and digest of the compressed bytes.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Size of the compressed archive in bytes.
    pub size_bytes: u64,

    /// SHA-256 of the compressed archive, hex encoded.
    pub digest: String,
}

/// A writer that hashes everything flowing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(W, ArchiveSummary)> {
        self.inner.flush()?;
        let digest = format!("{:x}", self.hasher.finalize());
        Ok((
            self.inner,
            ArchiveSummary {
                size_bytes: self.written,
                digest,
            },
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Packs a workspace into a zstd-compressed tar archive at `dest`.
///
/// Entries use workspace-relative paths and USTAR headers. Symlinks whose target
/// escapes the workspace and special files (devices, FIFOs, sockets) abort the
/// archive.
pub fn pack_workspace(workspace: &Path, dest: &Path, level: i32) -> CubicleResult<ArchiveSummary> {
    let out = HashingWriter::new(BufWriter::new(File::create(dest)?));
    let encoder = zstd::Encoder::new(out, level)?;
    let mut builder = Builder::new(encoder);

    // Stable walk order keeps archives reproducible.
    let walker = WalkDir::new(workspace).min_depth(1).sort_by_file_name();
    for entry in walker.into_iter() {
        let entry = entry.map_err(CubicleError::custom)?;
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .map_err(CubicleError::custom)?
            .to_path_buf();
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        let mut header = Header::new_ustar();
        set_unix_metadata(&mut header, &meta);

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            builder.append_data(&mut header, &rel, File::open(entry.path())?)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            ensure_link_within_workspace(workspace, entry.path(), &target)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else {
            return Err(CubicleError::InvalidArgument(format!(
                "unsupported file type in workspace: {}",
                rel.display()
            )));
        }
    }

    let encoder = builder.into_inner()?;
    let out = encoder.finish()?;
    let (_, summary) = out.finish()?;
    Ok(summary)
}

/// Unpacks a snapshot archive into `dest_dir`, which must not yet contain the
/// live workspace.
///
/// Every entry path is validated to stay inside `dest_dir` before anything is
/// written; symlink targets are checked the same way. Entry types other than
/// regular file, directory, and symlink are rejected.
pub fn unpack_archive(archive: &Path, dest_dir: &Path, preserve_mtime: bool) -> CubicleResult<()> {
    std::fs::create_dir_all(dest_dir)?;

    let decoder = zstd::Decoder::new(BufReader::new(File::open(archive)?))?;
    let mut tar = Archive::new(decoder);
    tar.set_preserve_mtime(preserve_mtime);
    tar.set_preserve_permissions(true);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        validate_entry_path(&rel)?;

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| {
                        CubicleError::InvalidArgument(format!(
                            "symlink entry without target: {}",
                            rel.display()
                        ))
                    })?
                    .into_owned();
                ensure_link_within_workspace(dest_dir, &dest_dir.join(&rel), &target)?;
            }
            other => {
                return Err(CubicleError::InvalidArgument(format!(
                    "unsupported archive entry type {:?}: {}",
                    other,
                    rel.display()
                )));
            }
        }

        let dest = dest_dir.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }

    Ok(())
}

/// Rejects absolute entry paths and any parent-directory component.
fn validate_entry_path(path: &Path) -> CubicleResult<()> {
    if path.is_absolute() {
        return Err(CubicleError::InvalidArgument(format!(
            "absolute path in archive: {}",
            path.display()
        )));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(CubicleError::InvalidArgument(format!(
                    "unsafe path in archive: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Checks that a symlink at `link_path` with `target` resolves inside `root`.
///
/// Resolution is lexical; the target itself may not exist yet.
fn ensure_link_within_workspace(root: &Path, link_path: &Path, target: &Path) -> CubicleResult<()> {
    let resolved = if target.is_absolute() {
        normalize_lexically(target)
    } else {
        let base = link_path.parent().unwrap_or(root);
        normalize_lexically(&base.join(target))
    };

    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(CubicleError::InvalidArgument(format!(
            "symlink escapes workspace: {} -> {}",
            link_path.display(),
            target.display()
        )))
    }
}

/// Collapses `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(unix)]
fn set_unix_metadata(header: &mut Header, meta: &std::fs::Metadata) {
    use std::os::unix::fs::MetadataExt;
    header.set_mode(meta.mode() & 0o7777);
    header.set_mtime(meta.mtime().max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
}

#[cfg(not(unix))]
fn set_unix_metadata(header: &mut Header, _meta: &std::fs::Metadata) {
    header.set_mode(0o644);
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn build_workspace(dir: &Path) {
        std::fs::create_dir_all(dir.join("code/src")).unwrap();
        std::fs::write(dir.join("code/src/main.rs"), b"fn main() {}").unwrap();
        std::fs::write(dir.join("notes.txt"), b"hello").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("code/src/main.rs", dir.join("entry")).unwrap();
    }

    #[test]
    fn test_pack_unpack_round_trip() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        build_workspace(src.path());

        let spool = tempfile::tempdir()?;
        let archive = spool.path().join("snap.tar.zst");
        let summary = pack_workspace(src.path(), &archive, 3)?;
        assert!(summary.size_bytes > 0);
        assert_eq!(summary.digest.len(), 64);

        let dest = tempfile::tempdir()?;
        let out = dest.path().join("restored");
        unpack_archive(&archive, &out, true)?;

        assert_eq!(
            std::fs::read(out.join("code/src/main.rs"))?,
            b"fn main() {}"
        );
        assert_eq!(std::fs::read(out.join("notes.txt"))?, b"hello");
        #[cfg(unix)]
        {
            let target = std::fs::read_link(out.join("entry"))?;
            assert_eq!(target, PathBuf::from("code/src/main.rs"));
        }
        Ok(())
    }

    #[test]
    fn test_digest_tracks_content() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        build_workspace(src.path());
        let spool = tempfile::tempdir()?;

        let a = pack_workspace(src.path(), &spool.path().join("a.tar.zst"), 3)?;
        std::fs::write(src.path().join("notes.txt"), b"changed")?;
        let b = pack_workspace(src.path(), &spool.path().join("b.tar.zst"), 3)?;

        assert_ne!(a.digest, b.digest);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_escaping_symlink_rejected_on_pack() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        build_workspace(src.path());
        std::os::unix::fs::symlink("../../etc/passwd", src.path().join("escape"))?;

        let spool = tempfile::tempdir()?;
        let result = pack_workspace(src.path(), &spool.path().join("x.tar.zst"), 3);
        assert!(matches!(result, Err(CubicleError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn test_traversal_entry_rejected_on_unpack() -> anyhow::Result<()> {
        // Hand-roll an archive with a traversal path.
        let spool = tempfile::tempdir()?;
        let archive_path = spool.path().join("evil.tar.zst");
        {
            let file = File::create(&archive_path)?;
            let encoder = zstd::Encoder::new(file, 3)?;
            let mut builder = Builder::new(encoder);
            let mut header = Header::new_ustar();
            header.set_entry_type(EntryType::Regular);
            header.set_size(4);
            header.set_mode(0o644);
            builder.append_data(&mut header, "../evil.txt", &b"boom"[..])?;
            builder.into_inner()?.finish()?;
        }

        let dest = tempfile::tempdir()?;
        let result = unpack_archive(&archive_path, &dest.path().join("out"), true);
        assert!(matches!(result, Err(CubicleError::InvalidArgument(_))));
        assert!(!dest.path().join("evil.txt").exists());
        Ok(())
    }

    #[test]
    fn test_mtime_preserved_on_unpack() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        std::fs::write(src.path().join("a.txt"), b"x")?;

        let spool = tempfile::tempdir()?;
        let archive = spool.path().join("snap.tar.zst");
        pack_workspace(src.path(), &archive, 3)?;

        // Ensure wall-clock moves past the recorded second.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let dest = tempfile::tempdir()?;
        let out = dest.path().join("restored");
        unpack_archive(&archive, &out, true)?;

        let orig = std::fs::metadata(src.path().join("a.txt"))?.modified()?;
        let restored = std::fs::metadata(out.join("a.txt"))?.modified()?;
        let drift = restored
            .duration_since(orig)
            .unwrap_or_else(|e| e.duration());
        assert!(drift.as_secs() <= 1);
        Ok(())
    }
}
