use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use storage_driver::{normalize, ByteStream, Driver, DriverError};

/// Root directory used when a driver is built without one.
pub const DEFAULT_ROOT: &str = "/tmp/registry";

/// Copy buffer for streamed writes.
const WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Storage driver over a rooted directory on the local filesystem.
///
/// Every path is joined under the configured root. The driver holds no lock
/// of its own; concurrency semantics are those of the underlying filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemDriver {
    root: Utf8PathBuf,
}

impl FilesystemDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Utf8PathBuf {
        self.root.join(normalize(path))
    }

    async fn create_parents(&self, full_path: &Utf8Path) -> Result<(), DriverError> {
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        tokio::fs::read(self.full_path(path))
            .await
            .map_err(|err| DriverError::from_io(path, err))
    }

    async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        let full_path = self.full_path(path);
        self.create_parents(&full_path).await?;
        tokio::fs::write(&full_path, contents).await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let mut file = File::open(self.full_path(path))
            .await
            .map_err(|err| DriverError::from_io(path, err))?;

        let length = file.metadata().await?.len();
        if offset > length {
            return Err(DriverError::InvalidOffset {
                path: path.to_owned(),
                offset,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(BufReader::new(file)))
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        mut source: ByteStream,
    ) -> Result<(), DriverError> {
        let position = self.resume_write_position(path).await?;
        if offset > position {
            return Err(DriverError::InvalidOffset {
                path: path.to_owned(),
                offset,
            });
        }

        let full_path = self.full_path(path);
        self.create_parents(&full_path).await?;

        let mut file = if offset == 0 {
            File::create(&full_path).await?
        } else {
            OpenOptions::new().write(true).open(&full_path).await?
        };
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; WRITE_BUFFER_SIZE];
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError> {
        match tokio::fs::metadata(self.full_path(path)).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        tokio::fs::rename(self.full_path(source), self.full_path(dest))
            .await
            .map_err(|err| DriverError::from_io(source, err))
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let full_path = self.full_path(path);
        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|err| DriverError::from_io(path, err))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full_path).await?;
        } else {
            tokio::fs::remove_file(&full_path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage_driver::ErrorKind;
    use tempfile::TempDir;

    use super::*;

    fn tempdir_driver() -> (TempDir, FilesystemDriver) {
        let dir = TempDir::new().expect("create temporary root");
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 path").to_owned();
        let driver = FilesystemDriver::new(root);
        (dir, driver)
    }

    #[tokio::test]
    async fn paths_stay_under_the_root() {
        let (_dir, driver) = tempdir_driver();
        // An "absolute" path must not escape the configured root.
        driver.put_content("/escape", b"caught").await.unwrap();
        assert!(driver.root().join("escape").exists());
    }

    #[tokio::test]
    async fn put_content_truncates_longer_values() {
        let (_dir, driver) = tempdir_driver();
        driver.put_content("blob", b"a longer value").await.unwrap();
        driver.put_content("blob", b"short").await.unwrap();
        assert_eq!(driver.get_content("blob").await.unwrap(), b"short");
    }

    #[tokio::test]
    async fn resume_position_of_missing_path_is_zero() {
        let (_dir, driver) = tempdir_driver();
        assert_eq!(driver.resume_write_position("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_is_unsupported() {
        let (_dir, driver) = tempdir_driver();
        let err = driver.list("prefix").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn delete_missing_is_path_not_found() {
        let (_dir, driver) = tempdir_driver();
        let err = driver.delete("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathNotFound);
    }
}
