//! Inode table: FUSE addresses files by numeric inode, the engine and
//! sidecar address them by virtual path. This table is the bijection
//! between the two, minted lazily as the kernel looks paths up.

use std::collections::HashMap;

/// Inode reserved for the virtual root, `/`.
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub struct InodeTable {
    next_ino: u64,
    entries: HashMap<u64, String>,
    path_index: HashMap<String, u64>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// A fresh table containing only the root entry.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let mut path_index = HashMap::new();
        entries.insert(ROOT_INO, "/".to_string());
        path_index.insert("/".to_string(), ROOT_INO);
        Self { next_ino: ROOT_INO + 1, entries, path_index }
    }

    /// The virtual path for `ino`, if it is still live.
    pub fn path(&self, ino: u64) -> Option<String> {
        self.entries.get(&ino).cloned()
    }

    /// The inode for `path`, allocating a new one if this is the first
    /// time it has been seen.
    pub fn ensure_ino(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_index.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(ino, path.to_string());
        self.path_index.insert(path.to_string(), ino);
        ino
    }

    /// The inode for `path`, without allocating one.
    pub fn lookup(&self, path: &str) -> Option<u64> {
        self.path_index.get(path).copied()
    }

    /// Drop the entry for `path` (used on unlink; kernel forgets the
    /// inode separately via `forget`).
    pub fn remove(&mut self, path: &str) {
        if let Some(ino) = self.path_index.remove(path) {
            self.entries.remove(&ino);
        }
    }

    /// Drop `path` and every entry beneath it (used on rmdir-equivalent
    /// subtree removal from outside the mount).
    pub fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let victims: Vec<String> = self
            .entries
            .values()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in victims {
            self.remove(&p);
        }
    }

    /// Relabel `old` (and anything beneath it) to `new`, preserving
    /// inode numbers, matching the sidecar's own rename relabeling.
    pub fn rename(&mut self, old: &str, new: &str) {
        let Some(ino) = self.path_index.remove(old) else { return };
        self.entries.insert(ino, new.to_string());
        self.path_index.insert(new.to_string(), ino);

        let prefix = format!("{}/", old.trim_end_matches('/'));
        let descendants: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter_map(|(&id, p)| p.strip_prefix(&prefix).map(|suffix| (id, suffix.to_string())))
            .collect();
        for (id, suffix) in descendants {
            if let Some(old_path) = self.entries.get(&id).cloned() {
                self.path_index.remove(&old_path);
            }
            let updated = format!("{}/{suffix}", new.trim_end_matches('/'));
            self.entries.insert(id, updated.clone());
            self.path_index.insert(updated, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preseeded() {
        let t = InodeTable::new();
        assert_eq!(t.path(ROOT_INO), Some("/".to_string()));
        assert_eq!(t.lookup("/"), Some(ROOT_INO));
    }

    #[test]
    fn ensure_ino_is_stable_and_allocates_once() {
        let mut t = InodeTable::new();
        let a = t.ensure_ino("/a.txt");
        let b = t.ensure_ino("/a.txt");
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INO);
    }

    #[test]
    fn remove_drops_entry() {
        let mut t = InodeTable::new();
        let ino = t.ensure_ino("/a.txt");
        t.remove("/a.txt");
        assert_eq!(t.path(ino), None);
        assert_eq!(t.lookup("/a.txt"), None);
    }

    #[test]
    fn remove_subtree_drops_descendants() {
        let mut t = InodeTable::new();
        t.ensure_ino("/dir");
        t.ensure_ino("/dir/a.txt");
        t.ensure_ino("/dirty/b.txt");
        t.remove_subtree("/dir");
        assert_eq!(t.lookup("/dir"), None);
        assert_eq!(t.lookup("/dir/a.txt"), None);
        assert!(t.lookup("/dirty/b.txt").is_some());
    }

    #[test]
    fn rename_preserves_ino_and_relabels_descendants() {
        let mut t = InodeTable::new();
        let dir_ino = t.ensure_ino("/dir");
        let file_ino = t.ensure_ino("/dir/a.txt");
        t.rename("/dir", "/moved");
        assert_eq!(t.lookup("/moved"), Some(dir_ino));
        assert_eq!(t.lookup("/moved/a.txt"), Some(file_ino));
        assert_eq!(t.lookup("/dir"), None);
    }
}
