use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;

use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use storage_driver::{normalize, ByteStream, Driver, DriverError};

/// Storage driver over a process-memory map from path to byte sequence.
///
/// Reads take the shared side of the lock, mutations the exclusive side.
/// Readers returned by `read_stream` hold a snapshot, so later writes never
/// mutate a stream already handed out.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    storage: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    /// Create an empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        let storage = self.storage.read().await;
        storage
            .get(normalize(path))
            .cloned()
            .ok_or_else(|| DriverError::PathNotFound(path.to_owned()))
    }

    async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        let mut storage = self.storage.write().await;
        storage.insert(normalize(path).to_owned(), contents.to_vec());
        Ok(())
    }

    async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let storage = self.storage.read().await;
        let contents = storage
            .get(normalize(path))
            .ok_or_else(|| DriverError::PathNotFound(path.to_owned()))?;

        if offset > contents.len() as u64 {
            return Err(DriverError::InvalidOffset {
                path: path.to_owned(),
                offset,
            });
        }

        let tail = contents[offset as usize..].to_vec();
        Ok(Box::new(Cursor::new(tail)))
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        mut source: ByteStream,
    ) -> Result<(), DriverError> {
        // Drain before taking the lock: the source may be slow (it can be a
        // live transport stream) and must be consumed on every exit.
        let mut incoming = Vec::new();
        source.read_to_end(&mut incoming).await?;
        drop(source);

        let mut storage = self.storage.write().await;
        let key = normalize(path);
        let position = storage.get(key).map(|c| c.len() as u64).unwrap_or(0);
        if offset > position {
            return Err(DriverError::InvalidOffset {
                path: path.to_owned(),
                offset,
            });
        }

        if offset == 0 {
            storage.insert(key.to_owned(), incoming);
        } else {
            let contents = storage.entry(key.to_owned()).or_default();
            contents.truncate(offset as usize);
            contents.extend_from_slice(&incoming);
        }
        Ok(())
    }

    async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(normalize(path))
            .map(|contents| contents.len() as u64)
            .unwrap_or(0))
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        let mut storage = self.storage.write().await;
        let contents = storage
            .remove(normalize(source))
            .ok_or_else(|| DriverError::PathNotFound(source.to_owned()))?;
        storage.insert(normalize(dest).to_owned(), contents);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let mut storage = self.storage.write().await;
        let key = normalize(path);
        if storage.remove(key).is_some() {
            return Ok(());
        }

        // Directory-like delete: sweep everything under `key/`.
        let prefix = format!("{key}/");
        let matched: Vec<String> = storage
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(DriverError::PathNotFound(path.to_owned()));
        }
        for sub_path in matched {
            storage.remove(&sub_path);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        tracing::trace!(%prefix, "list in-memory storage");

        let storage = self.storage.read().await;
        let parent = format!("{}/", normalize(prefix));

        let mut children = BTreeSet::new();
        for key in storage.keys() {
            if let Some(rest) = key.strip_prefix(&parent) {
                if let Some(segment) = rest.split('/').next() {
                    if !segment.is_empty() {
                        children.insert(format!("{parent}{segment}"));
                    }
                }
            }
        }

        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use storage_driver::conformance::{self, random_contents, random_path};
    use storage_driver::ErrorKind;

    use super::*;

    #[tokio::test]
    async fn leading_separator_is_ignored() {
        let driver = MemoryDriver::new();
        driver.put_content("/a/b", b"value").await.unwrap();
        assert_eq!(driver.get_content("a/b").await.unwrap(), b"value");
        driver.delete("a").await.unwrap();
        assert!(driver.get_content("/a/b").await.is_err());
    }

    #[tokio::test]
    async fn read_stream_is_a_snapshot() {
        let driver = MemoryDriver::new();
        driver.put_content("key", b"before").await.unwrap();

        let reader = driver.read_stream("key", 0).await.unwrap();
        driver.put_content("key", b"after!").await.unwrap();

        let mut contents = Vec::new();
        let mut reader = reader;
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"before");
    }

    #[tokio::test]
    async fn delete_requires_separator_boundary() {
        let driver = MemoryDriver::new();
        driver.put_content("abc", b"1").await.unwrap();
        driver.put_content("abcdef", b"2").await.unwrap();

        driver.delete("abc").await.unwrap();
        assert!(driver.get_content("abc").await.is_err());
        // A sibling sharing the prefix without a separator is untouched.
        assert_eq!(driver.get_content("abcdef").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn concurrent_disjoint_keys() {
        let driver = Arc::new(MemoryDriver::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let driver = driver.clone();
            let path = random_path(32);
            let contents = random_contents(1024);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    driver.put_content(&path, &contents).await.unwrap();
                    let received = driver.get_content(&path).await.unwrap();
                    assert_eq!(received, contents, "torn value on disjoint key");
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_shared_key_sees_a_complete_write() {
        let driver = Arc::new(MemoryDriver::new());
        let path = random_path(32);

        let values: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 4096]).collect();
        let mut tasks = Vec::new();
        for value in values.clone() {
            let driver = driver.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    driver.put_content(&path, &value).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let received = driver.get_content(&path).await.unwrap();
        assert!(
            values.contains(&received),
            "final contents must equal some complete write"
        );
    }

    #[tokio::test]
    async fn conformance() {
        let driver = MemoryDriver::new();
        conformance::check_driver(&driver).await;
        conformance::check_list(&driver).await;
    }

    #[tokio::test]
    async fn list_on_empty_prefix_is_empty() {
        let driver = MemoryDriver::new();
        let keys = driver.list("nothing").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn write_stream_mid_blob_preserves_head() {
        let driver = MemoryDriver::new();
        driver.put_content("blob", b"0123456789").await.unwrap();

        driver
            .write_stream("blob", 4, Box::new(Cursor::new(b"xy".to_vec())))
            .await
            .unwrap();

        // Bytes past the spliced tail are discarded.
        assert_eq!(driver.get_content("blob").await.unwrap(), b"0123xy");
        let err = driver
            .write_stream("blob", 7, Box::new(Cursor::new(b"z".to_vec())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOffset);
    }
}
