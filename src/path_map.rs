//! Translates virtual paths into backing-store paths.

use std::path::{Path, PathBuf};

/// Maps virtual paths rooted at `/` onto a fixed backing directory.
#[derive(Debug)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    /// `root` is the backing directory; trailing separators are stripped.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let trimmed = root.to_string_lossy().trim_end_matches('/').to_string();
        let root = if trimmed.is_empty() { PathBuf::from("/") } else { PathBuf::from(trimmed) };
        Self { root }
    }

    /// Concatenate the root with a virtual path. The caller guarantees
    /// `virtual_path` starts with `/`; no `.`/`..` normalization is
    /// attempted here, matching the dispatch layer's own resolution.
    pub fn map(&self, virtual_path: &str) -> PathBuf {
        let trimmed = virtual_path.trim_start_matches('/');
        if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }
}

/// Join a parent virtual path with a child name, producing a virtual path.
pub fn join_virtual(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
