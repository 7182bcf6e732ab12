use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};

pub const PARTIAL_SUFFIX: &str = "part";

/// A write-only temp file that only becomes visible under its final name
/// through [`StagingFile::commit`].
///
/// The temp file lives next to the target so the commit is a same-directory
/// rename. Dropping an uncommitted staging file removes the temp file.
pub struct StagingFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    written: u64,
}

impl StagingFile {
    pub async fn open(final_path: PathBuf) -> Result<Self> {
        let temp_path = temp_path_for(&final_path);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|source| DownloadError::StagingOpen {
                path: final_path.clone(),
                source,
            })?;

        debug!("Opened staging file {:?}", temp_path);

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| DownloadError::StagingWrite {
            path: self.final_path.clone(),
            source: std::io::Error::other("staging file already closed"),
        })?;

        file.write_all(data)
            .await
            .map_err(|source| DownloadError::StagingWrite {
                path: self.final_path.clone(),
                source,
            })?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flushes, optionally checks the SHA-256 of everything written, and
    /// renames the temp file over the final path. On failure the temp file
    /// is removed and the final path is left as it was.
    pub async fn commit(mut self, expected_sha256: Option<&str>) -> Result<PathBuf> {
        if let Err(e) = self.publish(expected_sha256).await {
            self.discard().await;
            return Err(e);
        }

        // Nothing left to clean up once the rename went through.
        self.temp_path = PathBuf::new();
        Ok(self.final_path.clone())
    }

    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging file {:?}: {}", self.temp_path, e);
            }
        }
        self.temp_path = PathBuf::new();
    }

    async fn publish(&mut self, expected_sha256: Option<&str>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            let synced = async {
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            if let Err(source) = synced {
                return Err(DownloadError::Commit {
                    path: self.final_path.clone(),
                    source,
                });
            }
        }

        if let Some(expected) = expected_sha256 {
            let actual = hex::encode(self.hasher.clone().finalize());
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(DownloadError::ChecksumMismatch {
                    path: self.final_path.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|source| DownloadError::Commit {
                path: self.final_path.clone(),
                source,
            })
    }
}

// Only reached when a transfer is dropped mid-flight; every handled path
// goes through `commit` or `discard` first.
impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        self.file.take();
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let id = uuid::Uuid::new_v4().simple().to_string();
    final_path.with_file_name(format!(".{}.{}.{}", name, &id[..8], PARTIAL_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn commit_publishes_complete_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");

        let mut staging = StagingFile::open(target.clone()).await.unwrap();
        staging.write(b"hello ").await.unwrap();
        assert!(!target.exists());
        staging.write(b"world").await.unwrap();
        assert_eq!(staging.written(), 11);

        let path = staging.commit(None).await.unwrap();
        assert_eq!(path, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn commit_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");
        std::fs::write(&target, b"old release").unwrap();

        let mut staging = StagingFile::open(target.clone()).await.unwrap();
        staging.write(b"new").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"old release");

        staging.commit(None).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn discard_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");

        let mut staging = StagingFile::open(target.clone()).await.unwrap();
        staging.write(b"partial").await.unwrap();
        assert_eq!(leftovers(dir.path()).len(), 1);

        staging.discard().await;
        assert!(!target.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn drop_without_commit_discards() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");

        {
            let mut staging = StagingFile::open(target.clone()).await.unwrap();
            staging.write(b"partial").await.unwrap();
        }

        assert!(!target.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn checksum_is_verified_before_commit() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");
        // sha256("abc")
        let good = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";

        let mut staging = StagingFile::open(target.clone()).await.unwrap();
        staging.write(b"abc").await.unwrap();
        staging.commit(Some(good)).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abc");

        let other = dir.path().join("other.exe");
        let mut staging = StagingFile::open(other.clone()).await.unwrap();
        staging.write(b"abd").await.unwrap();
        let err = staging.commit(Some(good)).await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!other.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_rename_removes_temp_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("setup.exe");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"").unwrap();

        let mut staging = StagingFile::open(target.clone()).await.unwrap();
        staging.write(b"data").await.unwrap();
        let err = staging.commit(None).await.unwrap_err();

        assert!(matches!(err, DownloadError::Commit { .. }));
        assert!(target.join("keep").exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn write_failure_is_not_reported_as_commit() {
        let dir = tempdir().unwrap();
        let full = std::fs::OpenOptions::new().write(true).open("/dev/full").unwrap();
        let mut staging = StagingFile {
            final_path: dir.path().join("setup.exe"),
            temp_path: dir.path().join(".setup.exe.test.part"),
            file: Some(File::from_std(full)),
            hasher: Sha256::new(),
            written: 0,
        };

        // The file writes in the background, so the error may surface one call late.
        let err = match staging.write(b"abc").await {
            Err(e) => e,
            Ok(()) => staging.write(b"def").await.unwrap_err(),
        };
        assert!(matches!(err, DownloadError::StagingWrite { .. }));
        assert!(err.to_string().contains("Failed to write downloaded data"));
    }

    #[tokio::test]
    async fn open_fails_in_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("missing").join("setup.exe");

        let err = StagingFile::open(target).await.err().unwrap();
        assert!(matches!(err, DownloadError::StagingOpen { .. }));
    }
}
