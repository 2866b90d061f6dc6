//! Layer identity and filesystem snapshotting.
//!
//! Provides content-aware directory snapshots, before/after diffing into a
//! [`Delta`], and the deterministic digests that name layers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stratum_core::error::{BuildError, Result};

/// Parent marker hashed in place of a missing parent id.
pub const SCRATCH: &str = "scratch";

/// Content-derived layer identifier (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Derive a layer id from its parent, canonical instruction and output digest.
    pub fn compute(parent: Option<&LayerId>, instruction: &str, output_digest: &str) -> Self {
        let parent = parent.map(LayerId::as_str).unwrap_or(SCRATCH);
        LayerId(sha256_bytes(
            format!("{}\n{}\n{}", parent, instruction, output_digest).as_bytes(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for progress output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of a committed layer, persisted as `layer.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    /// Canonical form of the instruction that produced this layer
    pub instruction: String,
    /// Output digest over the stored delta and removed paths
    pub digest: String,
    /// Paths deleted relative to the parent chain
    #[serde(default)]
    pub removed: Vec<PathBuf>,
    pub size_bytes: u64,
    /// Unix timestamp of the commit
    pub created_at: i64,
}

/// Non-regular, non-directory file types. Recorded by type, never opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl SpecialKind {
    fn tag(self) -> &'static str {
        match self {
            SpecialKind::Fifo => "fifo",
            SpecialKind::Socket => "socket",
            SpecialKind::CharDevice => "char",
            SpecialKind::BlockDevice => "block",
        }
    }
}

/// Kind-specific content of a snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { sha256: String, mode: u32 },
    Dir { mode: u32 },
    Symlink { target: PathBuf },
    Special { kind: SpecialKind, mode: u32, rdev: u64 },
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path from the snapshot root
    pub path: PathBuf,
    /// File size in bytes (zero for anything but regular files)
    pub size: u64,
    pub kind: EntryKind,
}

impl FileEntry {
    /// Feed this entry into the output digest. Timestamps never participate.
    fn hash_into(&self, hasher: &mut Sha256) {
        let mode_field = |mode: &u32| format!("{:o}", mode);
        match &self.kind {
            EntryKind::File { sha256, mode } => hash_fields(
                hasher,
                b"F",
                &[
                    path_bytes(&self.path),
                    mode_field(mode).as_bytes(),
                    sha256.as_bytes(),
                ],
            ),
            EntryKind::Dir { mode } => hash_fields(
                hasher,
                b"D",
                &[path_bytes(&self.path), mode_field(mode).as_bytes()],
            ),
            EntryKind::Symlink { target } => hash_fields(
                hasher,
                b"L",
                &[path_bytes(&self.path), path_bytes(target)],
            ),
            EntryKind::Special { kind, mode, rdev } => hash_fields(
                hasher,
                b"S",
                &[
                    path_bytes(&self.path),
                    kind.tag().as_bytes(),
                    mode_field(mode).as_bytes(),
                    rdev.to_string().as_bytes(),
                ],
            ),
        }
    }
}

fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_encoded_bytes()
}

/// One digest record: a tag, then each field as `:<len>:<bytes>`, then `\n`.
/// Fields are length-prefixed so raw path bytes cannot forge a record.
fn hash_fields(hasher: &mut Sha256, tag: &[u8], fields: &[&[u8]]) {
    hasher.update(tag);
    for field in fields {
        hasher.update(format!(":{}:", field.len()).as_bytes());
        hasher.update(field);
    }
    hasher.update(b"\n");
}

/// Paths added or modified, and paths removed, between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Added or modified entries, sorted
    pub changed: Vec<PathBuf>,
    /// Removed entries, sorted, with descendants of removed directories elided
    pub removed: Vec<PathBuf>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Relative path → entry, in sorted path order
    pub entries: BTreeMap<PathBuf, FileEntry>,
}

impl DirSnapshot {
    /// Take a snapshot of a directory, hashing every regular file.
    ///
    /// Symlinks are recorded, never followed.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Compute the delta from this snapshot (before) to another (after).
    pub fn diff(&self, after: &DirSnapshot) -> Delta {
        let changed = after
            .entries
            .iter()
            .filter(|(path, entry)| {
                self.entries
                    .get(*path)
                    .map_or(true, |before| before.kind != entry.kind)
            })
            .map(|(path, _)| path.clone())
            .collect();

        let mut removed: Vec<PathBuf> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // BTreeMap order places descendants directly after their ancestor
            if removed.last().map_or(false, |top| path.starts_with(top)) {
                continue;
            }
            removed.push(path.clone());
        }

        Delta { changed, removed }
    }

    /// Deterministic digest of this snapshot plus a list of removed paths.
    pub fn output_digest(&self, removed: &[PathBuf]) -> String {
        let mut hasher = Sha256::new();
        for entry in self.entries.values() {
            entry.hash_into(&mut hasher);
        }
        for path in removed {
            hash_fields(&mut hasher, b"R", &[path_bytes(path)]);
        }
        hex::encode(hasher.finalize())
    }

    /// Sum of regular file sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut BTreeMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| BuildError::Storage(format!("Failed to read directory entry: {}", e)))?;

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                BuildError::Storage(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            BuildError::Storage(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let file_type = metadata.file_type();
        let (kind, size) = if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| {
                BuildError::Storage(format!("Failed to read link {}: {}", path.display(), e))
            })?;
            (EntryKind::Symlink { target }, 0)
        } else if file_type.is_dir() {
            (
                EntryKind::Dir {
                    mode: file_mode(&metadata),
                },
                0,
            )
        } else if file_type.is_file() {
            let sha256 = sha256_file(&path)?;
            (
                EntryKind::File {
                    sha256,
                    mode: file_mode(&metadata),
                },
                metadata.len(),
            )
        } else {
            // Opening a FIFO would block until a writer appears
            (special_entry(&path, &metadata)?, 0)
        };

        let is_dir = matches!(kind, EntryKind::Dir { .. });
        entries.insert(
            relative.clone(),
            FileEntry {
                path: relative,
                size,
                kind,
            },
        );

        if is_dir {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn special_entry(path: &Path, metadata: &std::fs::Metadata) -> Result<EntryKind> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let file_type = metadata.file_type();
    let kind = if file_type.is_fifo() {
        SpecialKind::Fifo
    } else if file_type.is_socket() {
        SpecialKind::Socket
    } else if file_type.is_char_device() {
        SpecialKind::CharDevice
    } else if file_type.is_block_device() {
        SpecialKind::BlockDevice
    } else {
        return Err(BuildError::Storage(format!(
            "Unsupported file type at {}",
            path.display()
        )));
    };
    Ok(EntryKind::Special {
        kind,
        mode: file_mode(metadata),
        rdev: metadata.rdev(),
    })
}

#[cfg(not(unix))]
fn special_entry(path: &Path, _metadata: &std::fs::Metadata) -> Result<EntryKind> {
    Err(BuildError::Storage(format!(
        "Unsupported file type at {}",
        path.display()
    )))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Compute SHA256 hex digest of a file, streaming its contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        BuildError::Storage(format!(
            "Failed to open file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| {
        BuildError::Storage(format!("Failed to hash {}: {}", path.display(), e))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 hex digest of bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_snapshot_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(snap.entries.is_empty());
    }

    #[test]
    fn test_snapshot_with_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "etc/os-release", "ID=base\n");
        write(tmp.path(), "hello.txt", "hi");

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(snap.entries.len(), 3);
        assert!(matches!(snap.entries[Path::new("etc")].kind, EntryKind::Dir { .. }));
        assert_eq!(snap.total_size(), 10);
        match &snap.entries[Path::new("hello.txt")].kind {
            EntryKind::File { sha256, .. } => assert_eq!(sha256, &sha256_bytes(b"hi")),
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_records_symlink() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "target.txt", "x");
        std::os::unix::fs::symlink("target.txt", tmp.path().join("link")).unwrap();

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(
            snap.entries[Path::new("link")].kind,
            EntryKind::Symlink {
                target: PathBuf::from("target.txt")
            }
        );
    }

    #[test]
    fn test_diff_new_and_modified() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "keep.txt", "same");
        write(tmp.path(), "edit.txt", "v1");
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        write(tmp.path(), "edit.txt", "v2");
        write(tmp.path(), "new/file.txt", "n");
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let delta = before.diff(&after);
        assert_eq!(
            delta.changed,
            vec![
                PathBuf::from("edit.txt"),
                PathBuf::from("new"),
                PathBuf::from("new/file.txt"),
            ]
        );
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn test_diff_same_size_content_change_detected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "aaaa");
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        write(tmp.path(), "a.txt", "bbbb");
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(before.diff(&after).changed, vec![PathBuf::from("a.txt")]);
    }

    #[test]
    fn test_diff_removed_collapses_subtree() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "gone/a.txt", "a");
        write(tmp.path(), "gone/deep/b.txt", "b");
        write(tmp.path(), "gone-sibling.txt", "c");
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        std::fs::remove_dir_all(tmp.path().join("gone")).unwrap();
        std::fs::remove_file(tmp.path().join("gone-sibling.txt")).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let delta = before.diff(&after);
        assert!(delta.changed.is_empty());
        assert_eq!(
            delta.removed,
            vec![PathBuf::from("gone"), PathBuf::from("gone-sibling.txt")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_diff_detects_directory_chmod() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "data/file", "x");
        let data = tmp.path().join("data");
        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o700)).unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(
            before.entries[Path::new("data")].kind,
            EntryKind::Dir { mode: 0o700 }
        );

        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o777)).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(before.diff(&after).changed, vec![PathBuf::from("data")]);
        assert_ne!(before.output_digest(&[]), after.output_digest(&[]));
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_records_fifo_without_opening() {
        let tmp = TempDir::new().unwrap();
        let status = std::process::Command::new("mkfifo")
            .arg(tmp.path().join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        let entry = &snap.entries[Path::new("pipe")];
        assert!(matches!(
            entry.kind,
            EntryKind::Special {
                kind: SpecialKind::Fifo,
                ..
            }
        ));
        assert_eq!(entry.size, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_output_digest_distinguishes_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let snapshot_of = |name: &[u8]| {
            let path = PathBuf::from(OsStr::from_bytes(name));
            let mut entries = BTreeMap::new();
            entries.insert(
                path.clone(),
                FileEntry {
                    path,
                    size: 0,
                    kind: EntryKind::Dir { mode: 0o755 },
                },
            );
            DirSnapshot { entries }
        };
        assert_ne!(
            snapshot_of(b"cache\xff").output_digest(&[]),
            snapshot_of(b"cache\xfe").output_digest(&[])
        );
    }

    #[test]
    fn test_output_digest_resists_newline_in_names() {
        let dir = |path: &str| {
            (
                PathBuf::from(path),
                FileEntry {
                    path: PathBuf::from(path),
                    size: 0,
                    kind: EntryKind::Dir { mode: 0o755 },
                },
            )
        };
        let forged = DirSnapshot {
            entries: [dir("a\nD:b")].into_iter().collect(),
        };
        let honest = DirSnapshot {
            entries: [dir("a"), dir("b")].into_iter().collect(),
        };
        assert_ne!(forged.output_digest(&[]), honest.output_digest(&[]));
        assert_ne!(
            DirSnapshot::default().output_digest(&[PathBuf::from("x\nR:y")]),
            DirSnapshot::default().output_digest(&[PathBuf::from("x"), PathBuf::from("y")])
        );
    }

    #[test]
    fn test_diff_no_changes() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a");
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn test_output_digest_ignores_timestamps() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        write(one.path(), "bin/tool", "#!/bin/sh\n");
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(two.path(), "bin/tool", "#!/bin/sh\n");

        let a = DirSnapshot::capture(one.path()).unwrap();
        let b = DirSnapshot::capture(two.path()).unwrap();
        assert_eq!(a.output_digest(&[]), b.output_digest(&[]));
    }

    #[test]
    fn test_output_digest_includes_removed_paths() {
        let snap = DirSnapshot::default();
        assert_ne!(
            snap.output_digest(&[]),
            snap.output_digest(&[PathBuf::from("tmp/cache")])
        );
    }

    #[test]
    fn test_layer_id_deterministic() {
        let a = LayerId::compute(None, "BASE_IMAGE base:1", "abc");
        let b = LayerId::compute(None, "BASE_IMAGE base:1", "abc");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);

        let child = LayerId::compute(Some(&a), "RUN echo hi", "abc");
        assert_ne!(child, a);
        assert_ne!(child, LayerId::compute(Some(&a), "RUN echo hi", "abd"));
    }

    #[test]
    fn test_layer_id_scratch_parent() {
        let expected = sha256_bytes(b"scratch\nBASE_IMAGE base:1\nabc");
        assert_eq!(
            LayerId::compute(None, "BASE_IMAGE base:1", "abc").as_str(),
            expected
        );
    }

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "f", "hello world");
        let hash = sha256_file(&tmp.path().join("f")).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha256_file_missing() {
        assert!(sha256_file(Path::new("/nonexistent/stratum/file")).is_err());
    }
}
