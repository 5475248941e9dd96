// src/sys/atomic.rs

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{MoleError, Result};

/// Replaces `path` with `contents` in one rename, so readers never observe a
/// half-written document. The temp file is created next to the target to
/// keep the rename on one filesystem.
pub async fn write_atomic(path: &Path, contents: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| MoleError::io(&parent, e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| MoleError::io(&parent, e))?;
        tmp.write_all(&contents).map_err(|e| MoleError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| MoleError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| MoleError::io(&path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| MoleError::io(".", std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("doc.json");

        write_atomic(&target, b"first".to_vec()).await.unwrap();
        write_atomic(&target, b"second".to_vec()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        // no temp files left behind
        let leftovers = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
