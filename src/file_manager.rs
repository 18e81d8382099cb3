use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TEMP_PREFIX: &str = ".part-";

/// Owns the output root. Every file lands on disk through a temporary
/// sibling that is renamed into place, so an interrupted run never leaves a
/// truncated file at a mapped path.
#[derive(Clone, Debug)]
pub struct FileManager {
    base_dir: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create base directory: {:?}", base_dir))?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Opens a temporary file next to `target`, creating parent directories.
    pub async fn begin(&self, target: &Path) -> io::Result<PendingFile> {
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(self.base_dir.as_path())
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        let (file, temp_path) = temp.into_parts();

        Ok(PendingFile {
            file: fs::File::from_std(file),
            temp_path,
            target: target.to_path_buf(),
            written: 0,
        })
    }

    pub async fn write_atomic(&self, target: &Path, content: &[u8]) -> io::Result<PathBuf> {
        let mut pending = self.begin(target).await?;
        pending.write_chunk(content).await?;
        pending.commit().await
    }

    pub async fn file_exists(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}

/// A file being written. Dropping it without [`PendingFile::commit`] deletes
/// the temporary file, leaving the target untouched.
#[derive(Debug)]
pub struct PendingFile {
    file: fs::File,
    temp_path: TempPath,
    target: PathBuf,
    written: u64,
}

impl PendingFile {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flushes and renames the temporary file onto the target path.
    pub async fn commit(self) -> io::Result<PathBuf> {
        let PendingFile {
            mut file,
            temp_path,
            target,
            ..
        } = self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp_path.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(TEMP_PREFIX))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_write_atomic_creates_directories() {
        let temp_dir = tempdir().unwrap();
        let manager = FileManager::new(temp_dir.path()).unwrap();
        let target = temp_dir.path().join("example.com/css/site.css");

        let saved = manager.write_atomic(&target, b"body{}").await.unwrap();

        assert_eq!(saved, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"body{}");
        assert!(leftover_temp_files(target.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_pending_file_leaves_no_trace() {
        let temp_dir = tempdir().unwrap();
        let manager = FileManager::new(temp_dir.path()).unwrap();
        let target = temp_dir.path().join("site/big.bin");

        {
            let mut pending = manager.begin(&target).await.unwrap();
            pending.write_chunk(b"first half of the bo").await.unwrap();
            assert_eq!(pending.bytes_written(), 20);
            // simulated failure mid-stream: never committed
        }

        assert!(!target.exists());
        assert!(leftover_temp_files(&temp_dir.path().join("site")).is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_existing_file_whole() {
        let temp_dir = tempdir().unwrap();
        let manager = FileManager::new(temp_dir.path()).unwrap();
        let target = temp_dir.path().join("index.html");

        manager.write_atomic(&target, b"<html>old</html>").await.unwrap();
        manager.write_atomic(&target, b"<html>new</html>").await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "<html>new</html>");
    }

    #[tokio::test]
    async fn test_file_exists() {
        let temp_dir = tempdir().unwrap();
        let manager = FileManager::new(temp_dir.path()).unwrap();
        let target = temp_dir.path().join("a/b.txt");

        assert!(!manager.file_exists(&target).await);
        manager.write_atomic(&target, b"x").await.unwrap();
        assert!(manager.file_exists(&target).await);
        assert!(!manager.file_exists(&temp_dir.path().join("a")).await);
    }
}
