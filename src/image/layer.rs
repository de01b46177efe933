//! Filesystem snapshots and layer deltas.
//!
//! A [`Snapshot`] records every entry under a rootfs: type, permission bits
//! and, for regular files, size and content digest. Modification times are
//! not recorded: identical content must yield identical digests.
//!
//! A [`Layer`] is the delta between the snapshots taken before and after one
//! step.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    File { size: u64, sha256: String },
    Dir,
    Symlink { target: String },
    /// Device nodes, fifos, sockets.
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub mode: u32,
}

impl Entry {
    pub fn is_executable_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. }) && self.mode & 0o111 != 0
    }
}

/// Every entry under a root, keyed by `/`-separated relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

impl Snapshot {
    /// Walk `root` without following symlinks.
    pub fn capture(root: &Path) -> io::Result<Self> {
        let mut entries = BTreeMap::new();
        walk(root, "", &mut entries)?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path.trim_start_matches('/'))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of regular file sizes.
    pub fn total_size(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match e.kind {
                EntryKind::File { size, .. } => size,
                _ => 0,
            })
            .sum()
    }

    /// Content digest of the whole tree.
    pub fn digest(&self) -> String {
        digest_json(&self.entries)
    }
}

fn walk(dir: &Path, prefix: &str, out: &mut BTreeMap<String, Entry>) -> io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let path = child.path();
        let meta = fs::symlink_metadata(&path)?;
        let mode = meta.permissions().mode() & 0o7777;
        let file_type = meta.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink {
                target: fs::read_link(&path)?.to_string_lossy().into_owned(),
            }
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File {
                size: meta.len(),
                sha256: hash_file(&path)?,
            }
        } else {
            EntryKind::Special
        };

        let is_dir = matches!(kind, EntryKind::Dir);
        out.insert(rel.clone(), Entry { kind, mode });
        if is_dir {
            walk(&path, &rel, out)?;
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digest_json<T: Serialize>(value: &T) -> String {
    // BTreeMap/BTreeSet serialize in key order, so this is canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Filesystem delta produced by one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Index of the step that produced this layer.
    pub index: usize,
    /// Step kind label.
    pub kind: String,
    pub added: BTreeMap<String, Entry>,
    pub modified: BTreeMap<String, Entry>,
    pub removed: BTreeSet<String>,
    pub digest: String,
}

impl Layer {
    /// Compute the delta from `before` to `after`.
    pub fn diff(index: usize, kind: &str, before: &Snapshot, after: &Snapshot) -> Self {
        let mut added = BTreeMap::new();
        let mut modified = BTreeMap::new();
        let mut removed = BTreeSet::new();

        for (path, entry) in &after.entries {
            match before.entries.get(path) {
                None => {
                    added.insert(path.clone(), entry.clone());
                }
                Some(old) if old != entry => {
                    modified.insert(path.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }
        for path in before.entries.keys() {
            if !after.entries.contains_key(path) {
                removed.insert(path.clone());
            }
        }

        let digest = digest_json(&(&added, &modified, &removed));
        Self {
            index,
            kind: kind.to_string(),
            added,
            modified,
            removed,
            digest,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn summary(&self) -> LayerSummary {
        LayerSummary {
            index: self.index,
            kind: self.kind.clone(),
            digest: self.digest.clone(),
            added: self.added.len(),
            modified: self.modified.len(),
            removed: self.removed.len(),
        }
    }
}

/// Layer metadata kept in `image.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub index: usize,
    pub kind: String,
    pub digest: String,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_capture_records_types() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "usr/bin/tool", "#!/bin/sh\n");
        fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("usr/bin", root.join("bin")).unwrap();

        let snap = Snapshot::capture(root).unwrap();
        assert!(matches!(snap.get("usr").unwrap().kind, EntryKind::Dir));
        assert!(snap.get("/usr/bin/tool").unwrap().is_executable_file());
        assert_eq!(
            snap.get("bin").unwrap().kind,
            EntryKind::Symlink {
                target: "usr/bin".into()
            }
        );
        assert_eq!(snap.total_size(), 10);
    }

    #[test]
    fn test_digest_ignores_mtime() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        write(a.path(), "etc/hostname", "box\n");
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(b.path(), "etc/hostname", "box\n");

        let sa = Snapshot::capture(a.path()).unwrap();
        let sb = Snapshot::capture(b.path()).unwrap();
        assert_eq!(sa.digest(), sb.digest());
    }

    #[test]
    fn test_diff() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "keep", "same");
        write(root, "change", "old");
        write(root, "gone", "bye");
        let before = Snapshot::capture(root).unwrap();

        write(root, "change", "new");
        fs::remove_file(root.join("gone")).unwrap();
        write(root, "opt/new", "hi");
        let after = Snapshot::capture(root).unwrap();

        let layer = Layer::diff(0, "package-install", &before, &after);
        assert_eq!(
            layer.added.keys().collect::<Vec<_>>(),
            vec!["opt", "opt/new"]
        );
        assert_eq!(layer.modified.keys().collect::<Vec<_>>(), vec!["change"]);
        assert_eq!(layer.removed.iter().collect::<Vec<_>>(), vec!["gone"]);
        assert!(!layer.is_empty());

        let summary = layer.summary();
        assert_eq!((summary.added, summary.modified, summary.removed), (2, 1, 1));
    }

    #[test]
    fn test_empty_diff_has_stable_digest() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a", "x");
        let snap = Snapshot::capture(dir.path()).unwrap();
        let one = Layer::diff(0, "cleanup", &snap, &snap);
        let two = Layer::diff(0, "cleanup", &snap, &snap);
        assert!(one.is_empty());
        assert_eq!(one.digest, two.digest);
    }
}
