use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use arbor_types::{FileContent, FileItem};

mod diff;
mod lang;

pub use diff::{apply_unified_diff, unified_diff, PatchError};
pub use lang::language_for;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("path escape")]
    PathEscape { path: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("file too large: {path} ({size} > {limit} bytes)")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Stable machine-readable kind used by the error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkspaceError::PathEscape { .. } => "tool_path_escape",
            WorkspaceError::NotFound { .. } => "tool_not_found",
            WorkspaceError::TooLarge { .. } => "tool_io",
            WorkspaceError::Io(_) => "tool_io",
        }
    }
}

/// The single directory all tool and HTTP file I/O is confined to. Every
/// path entering the engine goes through `resolve` before any I/O happens.
#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    write_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path, rejecting absolute paths, `..`
    /// escapes, and symlinks that point outside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let escape = || WorkspaceError::PathEscape {
            path: relative.to_string(),
        };

        let raw = Path::new(relative);
        if raw.is_absolute() {
            return Err(escape());
        }

        let mut normalized = PathBuf::new();
        for component in raw.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }

        let full = self.root.join(&normalized);
        // Existing paths may still escape through a symlink.
        if full.exists() {
            let canonical = full.canonicalize()?;
            if !canonical.starts_with(&self.root) {
                return Err(escape());
            }
        }
        Ok(full)
    }

    pub async fn file_size(&self, relative: &str) -> Result<u64, WorkspaceError> {
        let full = self.resolve(relative)?;
        let meta = tokio::fs::metadata(&full).await.map_err(|_| {
            WorkspaceError::NotFound {
                path: relative.to_string(),
            }
        })?;
        Ok(meta.len())
    }

    pub async fn read_to_string(&self, relative: &str) -> Result<String, WorkspaceError> {
        let full = self.resolve(relative)?;
        if !full.is_file() {
            return Err(WorkspaceError::NotFound {
                path: relative.to_string(),
            });
        }
        let bytes = tokio::fs::read(&full).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn read_file(&self, relative: &str) -> Result<FileContent, WorkspaceError> {
        let content = self.read_to_string(relative).await?;
        Ok(FileContent {
            path: relative.to_string(),
            content,
            language: Some(language_for(relative).to_string()),
        })
    }

    /// Write via temp file + rename so a crash never leaves a torn file.
    pub async fn write_file(&self, relative: &str, content: &str) -> Result<(), WorkspaceError> {
        let full = self.resolve(relative)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        match tokio::fs::rename(&tmp, &full).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err.into())
            }
        }
    }

    pub async fn create_item(
        &self,
        relative: &str,
        is_dir: bool,
        content: &str,
    ) -> Result<(), WorkspaceError> {
        if is_dir {
            let full = self.resolve(relative)?;
            tokio::fs::create_dir_all(&full).await?;
            Ok(())
        } else {
            self.write_file(relative, content).await
        }
    }

    pub async fn delete_item(&self, relative: &str) -> Result<(), WorkspaceError> {
        let full = self.resolve(relative)?;
        if full.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else if full.is_file() {
            tokio::fs::remove_file(&full).await?;
        } else {
            return Err(WorkspaceError::NotFound {
                path: relative.to_string(),
            });
        }
        Ok(())
    }

    pub async fn rename_item(&self, old: &str, new: &str) -> Result<(), WorkspaceError> {
        let old_full = self.resolve(old)?;
        let new_full = self.resolve(new)?;
        if !old_full.exists() {
            return Err(WorkspaceError::NotFound {
                path: old.to_string(),
            });
        }
        if let Some(parent) = new_full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_full, &new_full).await?;
        Ok(())
    }

    /// Directory listing for the UI file tree: directories first, name-sorted,
    /// dotfiles hidden, children populated recursively.
    pub fn list_tree(&self, relative: &str) -> Result<Vec<FileItem>, WorkspaceError> {
        let full = self.resolve(relative)?;
        if !full.is_dir() {
            return Err(WorkspaceError::NotFound {
                path: relative.to_string(),
            });
        }
        self.list_tree_at(&full, relative)
    }

    fn list_tree_at(&self, dir: &Path, relative: &str) -> Result<Vec<FileItem>, WorkspaceError> {
        let mut entries: Vec<(String, bool)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            entries.push((name, is_dir));
        }
        entries.sort_by(|a, b| (!a.1, a.0.to_lowercase()).cmp(&(!b.1, b.0.to_lowercase())));

        let mut items = Vec::with_capacity(entries.len());
        for (name, is_dir) in entries {
            let child_rel = if relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", relative.trim_end_matches('/'), name)
            };
            let children = if is_dir {
                Some(self.list_tree_at(&dir.join(&name), &child_rel)?)
            } else {
                None
            };
            items.push(FileItem {
                name,
                path: child_rel,
                is_dir,
                children,
            });
        }
        Ok(items)
    }

    /// Per-path write lock so concurrent actions within a run cannot
    /// interleave edits to the same file.
    pub async fn lock_path(&self, relative: &str) -> Result<OwnedMutexGuard<()>, WorkspaceError> {
        let full = self.resolve(relative)?;
        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks.entry(full).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}

/// Stable hex digest of UTF-8 text, used for FileChange before/after hashes.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn resolve_rejects_traversal_and_absolute_paths() {
        let (_dir, ws) = workspace();
        assert!(matches!(
            ws.resolve("../outside.txt"),
            Err(WorkspaceError::PathEscape { .. })
        ));
        assert!(matches!(
            ws.resolve("a/../../outside.txt"),
            Err(WorkspaceError::PathEscape { .. })
        ));
        assert!(matches!(
            ws.resolve("/etc/passwd"),
            Err(WorkspaceError::PathEscape { .. })
        ));
        // Interior `..` that stays inside the root is fine.
        assert!(ws.resolve("a/b/../c.txt").is_ok());
    }

    #[tokio::test]
    async fn write_creates_parents_and_reads_back() {
        let (_dir, ws) = workspace();
        ws.write_file("src/deep/mod.rs", "pub fn f() {}\n")
            .await
            .unwrap();
        let content = ws.read_to_string("src/deep/mod.rs").await.unwrap();
        assert_eq!(content, "pub fn f() {}\n");
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(ws.root().join("src/deep"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn rename_and_delete_round_trip() {
        let (_dir, ws) = workspace();
        ws.write_file("a.txt", "hello").await.unwrap();
        ws.rename_item("a.txt", "nested/b.txt").await.unwrap();
        assert!(ws.read_to_string("nested/b.txt").await.is_ok());
        assert!(matches!(
            ws.read_to_string("a.txt").await,
            Err(WorkspaceError::NotFound { .. })
        ));
        ws.delete_item("nested/b.txt").await.unwrap();
        assert!(ws.read_to_string("nested/b.txt").await.is_err());
    }

    #[tokio::test]
    async fn tree_lists_dirs_first_and_hides_dotfiles() {
        let (_dir, ws) = workspace();
        ws.write_file("zeta.txt", "z").await.unwrap();
        ws.write_file("src/lib.rs", "").await.unwrap();
        ws.write_file(".hidden", "x").await.unwrap();
        let tree = ws.list_tree("").unwrap();
        let names: Vec<_> = tree.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["src", "zeta.txt"]);
        assert!(tree[0].children.is_some());
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let h = content_hash("hello\n");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello\n"));
        assert_ne!(h, content_hash("hello"));
    }
}
