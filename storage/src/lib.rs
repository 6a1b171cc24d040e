//! # Storage backends
//!
//! Configuration and unification for the in-process storage drivers.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;

pub(crate) mod filesystem;
pub(crate) mod inmemory;

#[doc(inline)]
pub use filesystem::FilesystemDriver;
#[doc(inline)]
pub use filesystem::DEFAULT_ROOT;
#[doc(inline)]
pub use inmemory::MemoryDriver;

#[doc(inline)]
pub use storage_driver::{ByteStream, Driver, DriverError, ErrorKind};

/// Parameter key selecting the filesystem driver root.
pub const ROOT_DIRECTORY_PARAMETER: &str = "RootDirectory";

/// Selects and configures a storage driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// The in-memory driver.
    Memory,

    /// The filesystem driver, rooted at `root`.
    Filesystem {
        /// Directory all paths are joined under.
        root: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Build a configuration from a driver name and the string parameter
    /// map passed to driver executables.
    ///
    /// The filesystem driver reads `RootDirectory`, defaulting to
    /// [`DEFAULT_ROOT`] when the key is absent or empty.
    pub fn from_parameters(
        driver: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Self, DriverError> {
        match driver {
            "inmemory" => Ok(StorageConfig::Memory),
            "filesystem" => {
                let root = parameters
                    .get(ROOT_DIRECTORY_PARAMETER)
                    .filter(|root| !root.is_empty())
                    .map(|root| Utf8PathBuf::from(root.as_str()))
                    .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ROOT));
                Ok(StorageConfig::Filesystem { root })
            }
            other => Err(DriverError::Unsupported(format!("driver: {other}"))),
        }
    }

    /// Construct the configured driver behind a [`Storage`] handle.
    #[tracing::instrument]
    pub fn build(self) -> Storage {
        match self {
            StorageConfig::Memory => MemoryDriver::new().into(),
            StorageConfig::Filesystem { root } => FilesystemDriver::new(root).into(),
        }
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// Shared handle over any [`Driver`], with instrumented forwarding.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver in a shared handle.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// The underlying driver, shared. `Arc<dyn Driver>` implements
    /// [`Driver`] itself, so this is what servers host.
    pub fn into_driver(self) -> ArcDriver {
        self.driver
    }

    /// Read the entire blob stored at `path`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        self.driver.get_content(path).await
    }

    /// Replace the blob at `path` with `contents`.
    #[tracing::instrument(skip(self, contents), fields(driver = self.driver.name(), len = contents.len()))]
    pub async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        self.driver.put_content(path, contents).await
    }

    /// Open a stream over the blob at `path`, starting at `offset`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        self.driver.read_stream(path, offset).await
    }

    /// Write `source` into the blob at `path`, starting at `offset`.
    #[tracing::instrument(skip(self, source), fields(driver = self.driver.name()))]
    pub async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<(), DriverError> {
        self.driver.write_stream(path, offset, source).await
    }

    /// The offset at which the next append-style write must begin.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError> {
        self.driver.resume_write_position(path).await
    }

    /// Atomically move the blob at `source` to `dest`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        self.driver.rename(source, dest).await
    }

    /// Remove the entry at `path`, or everything under `path + "/"`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn delete(&self, path: &str) -> Result<(), DriverError> {
        self.driver.delete(path).await
    }

    /// Distinct immediate children under `prefix`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        self.driver.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_select_the_driver() {
        let config = StorageConfig::from_parameters("inmemory", &BTreeMap::new()).unwrap();
        assert!(matches!(config, StorageConfig::Memory));

        let mut parameters = BTreeMap::new();
        parameters.insert(ROOT_DIRECTORY_PARAMETER.to_owned(), "/srv/blobs".to_owned());
        let config = StorageConfig::from_parameters("filesystem", &parameters).unwrap();
        match config {
            StorageConfig::Filesystem { root } => assert_eq!(root, "/srv/blobs"),
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn empty_root_falls_back_to_default() {
        let mut parameters = BTreeMap::new();
        parameters.insert(ROOT_DIRECTORY_PARAMETER.to_owned(), String::new());
        let config = StorageConfig::from_parameters("filesystem", &parameters).unwrap();
        match config {
            StorageConfig::Filesystem { root } => assert_eq!(root, DEFAULT_ROOT),
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let err = StorageConfig::from_parameters("s3", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn storage_forwards_to_the_driver() {
        let storage = StorageConfig::Memory.build();
        assert_eq!(storage.name(), "inmemory");

        storage.put_content("a/b", b"value").await.unwrap();
        assert_eq!(storage.get_content("a/b").await.unwrap(), b"value");
        assert_eq!(storage.resume_write_position("a/b").await.unwrap(), 5);
        assert_eq!(storage.list("a").await.unwrap(), vec!["a/b".to_owned()]);
    }
}
