use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out fresh directories of one kind (e.g. "code" or "scratch")
/// under a shared root, and removes all of them at once on cleanup.
#[derive(Debug)]
pub struct DirMaker {
    kind: String,
    base: PathBuf,
    next_id: AtomicU64,
}

impl DirMaker {
    pub fn new(root: &Path, kind: &str) -> std::io::Result<Self> {
        let base = root.join(kind);
        std::fs::create_dir_all(&base)?;
        Ok(Self {
            kind: kind.to_string(),
            base,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create a new, empty directory tagged with `name`
    pub fn make(&self, name: &str) -> std::io::Result<PathBuf> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tag: String = name
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
            .collect();
        let path = self.base.join(format!("{}-{}", id, tag));
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove every directory this maker has handed out
    pub fn cleanup(&self) {
        if !self.base.exists() {
            return;
        }
        match std::fs::remove_dir_all(&self.base) {
            Ok(()) => tracing::debug!("removed {} dirs at {}", self.kind, self.base.display()),
            Err(err) => tracing::warn!(
                "failed to remove {} dirs at {}: {}",
                self.kind,
                self.base.display(),
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_returns_distinct_dirs_and_cleanup_removes_them() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = DirMaker::new(root.path(), "scratch").expect("dir maker");

        let a = dirs.make("echo").expect("make");
        let b = dirs.make("echo").expect("make");
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        assert!(a.starts_with(root.path().join("scratch")));

        dirs.cleanup();
        assert!(!a.exists());
        assert!(!dirs.base().exists());
    }

    #[test]
    fn make_sanitizes_names() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = DirMaker::new(root.path(), "code").expect("dir maker");

        let path = dirs.make("../escape").expect("make");
        assert_eq!(path.parent(), Some(dirs.base()));
    }
}
