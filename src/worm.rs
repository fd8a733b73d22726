//! WORM policy: a predicate over virtual paths.

/// An immutable set of append-only directory prefixes, fixed at mount time.
#[derive(Debug, Clone)]
pub struct WormPolicy {
    prefixes: Vec<String>,
}

impl WormPolicy {
    /// `prefixes` are virtual-path prefixes; a leading `/` is added if
    /// missing and empty entries are dropped, matching the
    /// `append_only_dirs` mount option's parsing rules.
    pub fn new(prefixes: impl IntoIterator<Item = String>) -> Self {
        let prefixes = prefixes
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
            .collect();
        Self { prefixes }
    }

    /// True iff `path` equals a configured prefix or lies beneath one.
    /// Purely lexical: symbolic links are never followed, because WORM
    /// is a policy over the virtual namespace, not the backing one.
    pub fn is_append_only(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            path == prefix || path.starts_with(prefix.as_str()) && path[prefix.len()..].starts_with('/')
        })
    }
}
