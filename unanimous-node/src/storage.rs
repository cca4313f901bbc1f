//! Directory-backed stores.
//!
//! The coordinator keeps `<dir>/<artifact>.staged` until the decision is
//! known, then renames it to `<dir>/<artifact>` or deletes it. Participants
//! own one file per item. Every mutation is synced, directory included,
//! before it is reported done.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use unanimous::{ArtifactStore, ItemStore};

const STAGED_SUFFIX: &str = ".staged";

/// Reject names that would escape the directory.
fn file_name(name: &str) -> io::Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{name:?} is not a plain file name"),
        ));
    }
    Ok(name)
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn ignore_missing(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct DirArtifacts {
    dir: PathBuf,
}

impl DirArtifacts {
    /// Store artifacts in `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn staged(&self, artifact: &str) -> io::Result<PathBuf> {
        Ok(self.dir.join(format!("{}{STAGED_SUFFIX}", file_name(artifact)?)))
    }

    /// Where a committed artifact ends up.
    pub fn published(&self, artifact: &str) -> io::Result<PathBuf> {
        Ok(self.dir.join(file_name(artifact)?))
    }
}

impl ArtifactStore for DirArtifacts {
    fn stage(&self, artifact: &str, payload: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.staged(artifact)?)?;
        file.write_all(payload)?;
        file.sync_all()?;
        sync_dir(&self.dir)
    }

    fn publish(&self, artifact: &str) -> io::Result<()> {
        let renamed = ignore_missing(fs::rename(
            self.staged(artifact)?,
            self.published(artifact)?,
        ))?;
        if renamed {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    fn discard(&self, artifact: &str) -> io::Result<()> {
        if ignore_missing(fs::remove_file(self.staged(artifact)?))? {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }
}

/// Items are the regular files in one directory.
#[derive(Debug, Clone)]
pub struct DirItems {
    dir: PathBuf,
}

impl DirItems {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl ItemStore for DirItems {
    fn contains(&self, item: &str) -> bool {
        file_name(item).is_ok_and(|name| self.dir.join(name).is_file())
    }

    fn consume(&self, item: &str) -> io::Result<()> {
        if ignore_missing(fs::remove_file(self.dir.join(file_name(item)?)))? {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn staged_artifact_is_published_once() {
        let dir = TempDir::new().unwrap();
        let store = DirArtifacts::open(dir.path()).unwrap();

        store.stage("pic1", b"collage").unwrap();
        assert!(dir.path().join("pic1.staged").is_file());
        assert!(!dir.path().join("pic1").exists());

        store.publish("pic1").unwrap();
        store.publish("pic1").unwrap();
        assert_eq!(fs::read(dir.path().join("pic1")).unwrap(), b"collage");
        assert!(!dir.path().join("pic1.staged").exists());
    }

    #[test]
    fn discard_removes_staged_payload_only() {
        let dir = TempDir::new().unwrap();
        let store = DirArtifacts::open(dir.path()).unwrap();

        store.stage("pic1", b"collage").unwrap();
        store.discard("pic1").unwrap();
        store.discard("pic1").unwrap();
        assert!(!dir.path().join("pic1.staged").exists());
        assert!(!dir.path().join("pic1").exists());
    }

    #[test]
    fn items_are_consumed_idempotently() {
        let dir = TempDir::new().unwrap();
        let items = DirItems::open(dir.path().join("items")).unwrap();
        fs::write(dir.path().join("items/a.jpg"), b"a").unwrap();

        assert!(items.contains("a.jpg"));
        assert!(!items.contains("b.jpg"));
        items.consume("a.jpg").unwrap();
        items.consume("a.jpg").unwrap();
        assert!(!items.contains("a.jpg"));
    }

    #[test]
    fn names_cannot_leave_the_directory() {
        let dir = TempDir::new().unwrap();
        let items = DirItems::open(dir.path().join("items")).unwrap();
        fs::write(dir.path().join("secret"), b"s").unwrap();

        assert!(!items.contains("../secret"));
        assert!(!items.contains(".."));
        assert!(items.consume("../secret").is_err());
        assert!(dir.path().join("secret").exists());

        let store = DirArtifacts::open(dir.path()).unwrap();
        assert!(store.stage("a/b", b"x").is_err());
    }
}
