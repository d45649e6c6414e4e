//! Recursive copy used to move an image's filesystem onto a host path.
//!
//! The same routine runs in two places: on the host, to seed the copy tool
//! binary into a volume's support directory, and inside the extraction
//! container (as the `imagevol-copy` binary), where it copies the image root
//! into the content directory that is mounted from the host.
//!
//! Mode, timestamps and symlinks are preserved. Ownership is preserved when
//! requested (the extraction container runs as root). Device nodes, fifos and
//! sockets are skipped. Paths listed in [`CopyOptions::excludes`] and the
//! destination itself are never descended into, so copying `/` into a
//! directory below `/` terminates.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("source {0} does not exist")]
    MissingSource(PathBuf),

    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> CopyError + 'a {
    move |source| CopyError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Copy behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Source paths that are skipped together with everything below them.
    pub excludes: Vec<PathBuf>,
    /// Apply source uid/gid to copied entries (requires CAP_CHOWN).
    pub preserve_ownership: bool,
}

/// Counts of what a copy did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub skipped: u64,
}

/// Copy `src` (a file, symlink or directory tree) to `dst`.
///
/// Existing destination entries are overwritten, so a copy interrupted half
/// way can simply be re-run.
pub fn copy_path(src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyStats, CopyError> {
    let meta = match fs::symlink_metadata(src) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CopyError::MissingSource(src.to_path_buf()));
        }
        Err(e) => return Err(io_err("stat", src)(e)),
    };

    let mut stats = CopyStats::default();

    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io_err("create directory", parent))?;
        }
        copy_entry(src, dst, &meta, options, &mut stats)?;
        return Ok(stats);
    }

    // Directory metadata is applied after their contents are written;
    // a read-only source directory would otherwise block its own copy.
    let mut dirs: Vec<(PathBuf, fs::Metadata)> = Vec::new();

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.path(), dst, &options.excludes));

    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| CopyError::Io {
                op: "resolve",
                path: entry.path().to_path_buf(),
                source: io::Error::other("entry outside source tree"),
            })?;
        let target = dst.join(rel);
        let meta = entry.metadata()?;

        if meta.is_dir() {
            fs::create_dir_all(&target).map_err(io_err("create directory", &target))?;
            // Keep the directory writable until finalized.
            fs::set_permissions(&target, fs::Permissions::from_mode(0o700))
                .map_err(io_err("chmod", &target))?;
            stats.dirs += 1;
            dirs.push((target, meta));
        } else {
            copy_entry(entry.path(), &target, &meta, options, &mut stats)?;
        }
    }

    for (dir, meta) in dirs.iter().rev() {
        apply_metadata(dir, meta, options, false)?;
    }

    Ok(stats)
}

fn is_excluded(path: &Path, dst: &Path, excludes: &[PathBuf]) -> bool {
    path.starts_with(dst) || excludes.iter().any(|ex| path.starts_with(ex))
}

fn copy_entry(
    src: &Path,
    dst: &Path,
    meta: &fs::Metadata,
    options: &CopyOptions,
    stats: &mut CopyStats,
) -> Result<(), CopyError> {
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let link = fs::read_link(src).map_err(io_err("read link", src))?;
        remove_existing(dst)?;
        std::os::unix::fs::symlink(&link, dst).map_err(io_err("create symlink", dst))?;
        apply_metadata(dst, meta, options, true)?;
        stats.symlinks += 1;
    } else if file_type.is_file() {
        if fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink()) {
            remove_existing(dst)?;
        }
        fs::copy(src, dst).map_err(io_err("copy", src))?;
        apply_metadata(dst, meta, options, false)?;
        stats.files += 1;
    } else {
        tracing::debug!(path = %src.display(), "Skipping special file");
        stats.skipped += 1;
    }

    Ok(())
}

fn remove_existing(path: &Path) -> Result<(), CopyError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_err("remove", path)),
        Ok(_) => fs::remove_file(path).map_err(io_err("remove", path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("stat", path)(e)),
    }
}

fn apply_metadata(
    path: &Path,
    meta: &fs::Metadata,
    options: &CopyOptions,
    is_symlink: bool,
) -> Result<(), CopyError> {
    if options.preserve_ownership {
        std::os::unix::fs::lchown(path, Some(meta.uid()), Some(meta.gid()))
            .map_err(io_err("chown", path))?;
    }

    let atime = FileTime::from_last_access_time(meta);
    let mtime = FileTime::from_last_modification_time(meta);

    if is_symlink {
        filetime::set_symlink_file_times(path, atime, mtime).map_err(io_err("set times", path))?;
    } else {
        // chown clears setuid bits, so the mode goes on after it.
        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(io_err("chmod", path))?;
        filetime::set_file_times(path, atime, mtime).map_err(io_err("set times", path))?;
    }

    Ok(())
}
