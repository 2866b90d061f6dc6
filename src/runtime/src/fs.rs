//! Filesystem helpers shared by the layer store, cache and executor.

use std::io::Write;
use std::path::{Path, PathBuf};

use stratum_core::error::{BuildError, Result};

/// Copy a single entry (file, directory, symlink or special file) from `src`
/// to `dst`.
///
/// Directories are created without their contents and with default
/// permissions; [`copy_mode`] applies the source mode once the contents are
/// in place. Parents of `dst` are created as needed.
pub(crate) fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(src).map_err(|e| {
        BuildError::Storage(format!("Failed to stat {}: {}", src.display(), e))
    })?;

    if let Some(parent) = dst.parent() {
        create_dir_all(parent)?;
    }

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        create_dir_all(dst)
    } else if file_type.is_symlink() {
        copy_symlink(src, dst)
    } else if file_type.is_file() {
        std::fs::copy(src, dst).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to copy {} to {}: {}",
                src.display(),
                dst.display(),
                e
            ))
        })?;
        Ok(())
    } else {
        create_special(&metadata, dst)
    }
}

/// Copy the entries named by `paths` (relative, sorted) from `src_root` to
/// `dst_root`, together with any ancestor directories missing at the
/// destination. Directory modes are applied last, deepest first, so a
/// read-only directory is sealed only after its children are written.
pub(crate) fn copy_paths(src_root: &Path, dst_root: &Path, paths: &[PathBuf]) -> Result<()> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    for path in paths {
        let mut ancestors: Vec<&Path> = path
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .collect();
        ancestors.reverse();
        for ancestor in ancestors {
            let dst = dst_root.join(ancestor);
            if std::fs::symlink_metadata(&dst).is_err() {
                copy_entry(&src_root.join(ancestor), &dst)?;
                dirs.push(ancestor.to_path_buf());
            }
        }

        let dst = dst_root.join(path);
        copy_entry(&src_root.join(path), &dst)?;
        if is_real_dir(&dst) {
            dirs.push(path.clone());
        }
    }

    for dir in dirs.iter().rev() {
        copy_mode(&src_root.join(dir), &dst_root.join(dir))?;
    }
    Ok(())
}

/// Overlay the tree at `src` onto `dst`, replacing entries whose type differs.
///
/// Every directory below `dst` ends with the mode of its counterpart in
/// `src`; `dst` itself keeps its own.
pub(crate) fn merge_tree(src: &Path, dst: &Path) -> Result<()> {
    create_dir_all(dst)?;
    merge_dir(src, dst)
}

fn merge_dir(src: &Path, dst: &Path) -> Result<()> {
    let read_dir = std::fs::read_dir(src).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to read directory {}: {}",
            src.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| BuildError::Storage(format!("Failed to read directory entry: {}", e)))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| {
            BuildError::Storage(format!("Failed to stat {}: {}", src_path.display(), e))
        })?;

        let existing = std::fs::symlink_metadata(&dst_path).ok();
        if file_type.is_dir() {
            match existing {
                Some(m) if m.is_dir() => ensure_writable(&dst_path, &m)?,
                Some(_) => {
                    remove_path(&dst_path)?;
                    create_dir_all(&dst_path)?;
                }
                None => create_dir_all(&dst_path)?,
            }
            merge_dir(&src_path, &dst_path)?;
            copy_mode(&src_path, &dst_path)?;
        } else {
            if existing.is_some() {
                remove_path(&dst_path)?;
            }
            copy_entry(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path).map_or(false, |m| m.is_dir())
}

/// Give `dst` the permission bits of `src`.
#[cfg(unix)]
pub(crate) fn copy_mode(src: &Path, dst: &Path) -> Result<()> {
    let permissions = std::fs::symlink_metadata(src)
        .map_err(|e| BuildError::Storage(format!("Failed to stat {}: {}", src.display(), e)))?
        .permissions();
    std::fs::set_permissions(dst, permissions).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to set permissions on {}: {}",
            dst.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
pub(crate) fn copy_mode(_src: &Path, _dst: &Path) -> Result<()> {
    Ok(())
}

/// Make an existing directory owner-writable so entries can be merged into it.
#[cfg(unix)]
fn ensure_writable(path: &Path, metadata: &std::fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    if mode & 0o700 == 0o700 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o700)).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to set permissions on {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn ensure_writable(_path: &Path, _metadata: &std::fs::Metadata) -> Result<()> {
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are ignored.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BuildError::Storage(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            )))
        }
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| BuildError::Storage(format!("Failed to remove {}: {}", path.display(), e)))
}

/// Write `data` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to create temp file in {}: {}",
            dir.display(),
            e
        ))
    })?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| BuildError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
    tmp.persist(path).map_err(|e| {
        BuildError::Storage(format!("Failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

pub(crate) fn create_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)
        .map_err(|e| BuildError::Storage(format!("Failed to read link {}: {}", src.display(), e)))?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        BuildError::Storage(format!("Failed to create link {}: {}", dst.display(), e))
    })
}

/// Recreate a FIFO, socket or device node at `dst` with the source's type,
/// mode and device number.
#[cfg(unix)]
fn create_special(metadata: &std::fs::Metadata, dst: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};

    let file_type = metadata.file_type();
    let node_type = if file_type.is_fifo() {
        libc::S_IFIFO
    } else if file_type.is_socket() {
        libc::S_IFSOCK
    } else if file_type.is_char_device() {
        libc::S_IFCHR
    } else if file_type.is_block_device() {
        libc::S_IFBLK
    } else {
        return Err(BuildError::Storage(format!(
            "Unsupported file type at {}",
            dst.display()
        )));
    };

    let path = CString::new(dst.as_os_str().as_bytes()).map_err(|e| {
        BuildError::Storage(format!("Invalid path {}: {}", dst.display(), e))
    })?;
    let perm = metadata.mode() & 0o7777;
    let rc = if file_type.is_fifo() {
        unsafe { libc::mkfifo(path.as_ptr(), perm as libc::mode_t) }
    } else {
        unsafe {
            libc::mknod(
                path.as_ptr(),
                node_type | perm as libc::mode_t,
                metadata.rdev() as libc::dev_t,
            )
        }
    };
    if rc != 0 {
        return Err(BuildError::Storage(format!(
            "Failed to create special file {}: {}",
            dst.display(),
            std::io::Error::last_os_error()
        )));
    }

    // mknod applies the umask
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(perm)).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to set permissions on {}: {}",
            dst.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn create_special(_metadata: &std::fs::Metadata, dst: &Path) -> Result<()> {
    Err(BuildError::Storage(format!(
        "Unsupported file type at {}",
        dst.display()
    )))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<()> {
    tracing::warn!(path = %src.display(), "Symlinks are not supported on this platform, skipping");
    Ok(())
}
