use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::io;

use crate::error::DriverError;

/// An owned byte stream returned by [`Driver::read_stream`] and consumed by
/// [`Driver::write_stream`].
///
/// Streams are finite and lazily consumed; dropping one releases it.
pub type ByteStream = Box<dyn io::AsyncRead + Send + Unpin + 'static>;

/// A storage driver: one backing store addressed by slash-separated paths.
///
/// Paths are rooted-relative keys. A leading `/` is ignored, so `a/b` and
/// `/a/b` address the same entry. The same contract is served in-process by
/// the concrete drivers and out-of-process by the IPC client, and both are
/// exercised by [`crate::conformance`].
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver, e.g. `"inmemory"`.
    fn name(&self) -> &'static str;

    /// Read the entire blob stored at `path`.
    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError>;

    /// Replace the blob at `path` with `contents`, creating intermediate
    /// directories as needed. Any prior value is truncated away.
    async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError>;

    /// Open a stream over the blob at `path`, starting at `offset`.
    ///
    /// An offset equal to the blob length yields an empty stream; an offset
    /// past the end fails with `ErrorKind::InvalidOffset`.
    async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError>;

    /// Write `source` into the blob at `path`, starting at `offset`.
    ///
    /// Offset 0 creates the blob, truncating any prior content. A non-zero
    /// offset must not exceed [`Driver::resume_write_position`]; content up
    /// to the offset is preserved and the blob is extended from there. The
    /// source is drained or released on every exit path.
    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<(), DriverError>;

    /// The offset at which the next append-style write must begin: the
    /// persisted length of `path`, or `Ok(0)` when the path does not exist
    /// yet, so resumable uploads can begin without a pre-check.
    async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError>;

    /// Atomically move the blob at `source` to `dest`, overwriting any
    /// existing destination.
    async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError>;

    /// Remove the entry at `path`, or, when `path` names a directory-like
    /// prefix, every entry under `path + "/"`. Fails with
    /// `ErrorKind::PathNotFound` when nothing matches.
    async fn delete(&self, path: &str) -> Result<(), DriverError>;

    /// Distinct immediate children under `prefix`, each of the form
    /// `prefix + "/" + segment`.
    ///
    /// Only the memory driver implements this today; the default fails with
    /// `ErrorKind::Unsupported`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        let _ = prefix;
        Err(DriverError::Unsupported("list".into()))
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        self.deref().put_content(path, contents).await
    }

    async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        self.deref().read_stream(path, offset).await
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        source: ByteStream,
    ) -> Result<(), DriverError> {
        self.deref().write_stream(path, offset, source).await
    }

    async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError> {
        self.deref().resume_write_position(path).await
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        self.deref().rename(source, dest).await
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        self.deref().delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        self.deref().list(prefix).await
    }
}

/// Strip the optional leading separator so `a/b` and `/a/b` address the same
/// entry in every driver.
pub fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn normalize_strips_leading_separator() {
        assert_eq!(normalize("/a/b"), "a/b");
        assert_eq!(normalize("a/b"), "a/b");
        assert_eq!(normalize("///a"), "a");
    }
}
