use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::error::ApiError;

/// Directory holding one symbolic link per share.
#[derive(Clone, Debug)]
pub struct ShareStore {
    dir: PathBuf,
}

impl ShareStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Makes the directory absolute and creates it if missing.
    pub async fn provision(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = std::path::absolute(dir.as_ref())?;
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("share path {} is not a directory", dir.display()),
                ));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => fs::create_dir_all(&dir).await?,
            Err(err) => return Err(err),
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates `id -> target`; fails with `AlreadyExists` if `id` is taken.
    pub async fn create_link(&self, id: &str, target: &Path) -> io::Result<()> {
        symlink(target, &self.dir.join(id)).await
    }

    pub async fn read_link(&self, id: &str) -> io::Result<PathBuf> {
        fs::read_link(self.dir.join(id)).await
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    if fs::metadata(target).await?.is_dir() {
        fs::symlink_dir(target, link).await
    } else {
        fs::symlink_file(target, link).await
    }
}

/// Joins slash separated `segments` under `root`, rejecting anything that
/// would leave it.
pub fn resolve_under(root: &Path, segments: &[&str]) -> Result<PathBuf, ApiError> {
    let mut normalized = PathBuf::new();

    for value in segments {
        let trimmed = value.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir => return Err(ApiError::Traversal),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ApiError::BadRequest("invalid path".into()));
                }
            }
        }
    }

    Ok(root.join(normalized))
}

/// Removes a file, symlink or directory tree; a missing path is not an error.
pub async fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn provision_creates_missing_dir() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("a/b/shares");
        let store = ShareStore::provision(&dir).await.expect("provision");
        assert!(store.dir().is_absolute());
        assert!(dir.is_dir());

        // Existing directory is accepted as well.
        ShareStore::provision(&dir).await.expect("provision again");
    }

    #[tokio::test]
    async fn provision_rejects_file() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("shares");
        std::fs::write(&file, b"x").expect("write file");
        assert!(ShareStore::provision(&file).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_link_is_exclusive() {
        let temp = tempdir().expect("tempdir");
        let store = ShareStore::new(temp.path().to_path_buf());
        let target = temp.path().join("target.txt");
        std::fs::write(&target, b"x").expect("write target");

        store.create_link("id", &target).await.expect("first link");
        let err = store
            .create_link("id", &target)
            .await
            .expect_err("second link must fail");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(store.read_link("id").await.expect("read link"), target);
    }

    #[test]
    fn resolve_under_joins_segments() {
        let root = Path::new("/srv/www");
        let path = resolve_under(root, &["/uploads/", "a.txt"])
            .unwrap_or_else(|_| panic!("path should resolve"));
        assert_eq!(path, PathBuf::from("/srv/www/uploads/a.txt"));

        let path = resolve_under(root, &["/", "./docs//x"])
            .unwrap_or_else(|_| panic!("path should resolve"));
        assert_eq!(path, PathBuf::from("/srv/www/docs/x"));
    }

    #[test]
    fn resolve_under_rejects_parent() {
        let result = resolve_under(Path::new("/srv/www"), &["/uploads", "../../etc/passwd"]);
        assert!(matches!(result, Err(ApiError::Traversal)));
    }

    #[tokio::test]
    async fn remove_entry_handles_trees_and_missing() {
        let temp = tempdir().expect("tempdir");
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("nested")).expect("create tree");
        std::fs::write(tree.join("nested/file.txt"), b"x").expect("write file");

        remove_entry(&tree).await.expect("remove tree");
        assert!(!tree.exists());
        remove_entry(&tree).await.expect("missing path is fine");
    }
}
