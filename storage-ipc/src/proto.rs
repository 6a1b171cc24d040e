//! Typed records exchanged between the parent client and the child server.
//!
//! One request variant and one response variant per contract operation, so
//! the server dispatches on the enum tag and never inspects string-keyed
//! parameter bags. Byte streams are not serialized: a record carries the id
//! of a transport stream, and the bytes flow lazily beside it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use storage_driver::DriverError;

/// Id of a record sub-channel on the transport.
pub type ChannelId = u32;

/// Id of a byte stream on the transport.
pub type StreamId = u32;

/// A request envelope: the operation and the channel the single response
/// must be sent on.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// The operation and its parameters.
    pub body: RequestBody,
    /// Where the server sends exactly one [`Response`].
    pub reply: ChannelId,
}

/// One variant per contract operation.
#[derive(Debug, Serialize, Deserialize)]
pub enum RequestBody {
    GetContent {
        path: String,
    },
    PutContent {
        path: String,
        contents: Vec<u8>,
    },
    ReadStream {
        path: String,
        offset: u64,
    },
    WriteStream {
        path: String,
        offset: u64,
        /// Stream carrying the bytes to write.
        source: StreamId,
    },
    ResumeWritePosition {
        path: String,
    },
    Rename {
        source: String,
        dest: String,
    },
    Delete {
        path: String,
    },
    List {
        prefix: String,
    },
}

impl RequestBody {
    /// Operation name, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::GetContent { .. } => "GetContent",
            RequestBody::PutContent { .. } => "PutContent",
            RequestBody::ReadStream { .. } => "ReadStream",
            RequestBody::WriteStream { .. } => "WriteStream",
            RequestBody::ResumeWritePosition { .. } => "ResumeWritePosition",
            RequestBody::Rename { .. } => "Rename",
            RequestBody::Delete { .. } => "Delete",
            RequestBody::List { .. } => "List",
        }
    }
}

/// One variant per contract operation, mirroring [`RequestBody`].
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    GetContent(Result<Vec<u8>, WireError>),
    PutContent(Result<(), WireError>),
    /// On success, the stream the blob bytes arrive on.
    ReadStream(Result<StreamId, WireError>),
    WriteStream(Result<(), WireError>),
    ResumeWritePosition(Result<u64, WireError>),
    Rename(Result<(), WireError>),
    Delete(Result<(), WireError>),
    List(Result<Vec<String>, WireError>),
}

impl Response {
    /// Operation name, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Response::GetContent(_) => "GetContent",
            Response::PutContent(_) => "PutContent",
            Response::ReadStream(_) => "ReadStream",
            Response::WriteStream(_) => "WriteStream",
            Response::ResumeWritePosition(_) => "ResumeWritePosition",
            Response::Rename(_) => "Rename",
            Response::Delete(_) => "Delete",
            Response::List(_) => "List",
        }
    }
}

/// A [`DriverError`] in wire form. The kind survives the boundary, so the
/// parent can distinguish a missing path from a bad offset without parsing
/// message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireError {
    PathNotFound { path: String },
    InvalidOffset { path: String, offset: u64 },
    Io { message: String },
    Transport { message: String },
    Protocol { message: String },
    Lifecycle { message: String },
    Unsupported { operation: String },
}

impl From<DriverError> for WireError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::PathNotFound(path) => WireError::PathNotFound { path },
            DriverError::InvalidOffset { path, offset } => {
                WireError::InvalidOffset { path, offset }
            }
            DriverError::Io(err) => WireError::Io {
                message: err.to_string(),
            },
            DriverError::Transport(message) => WireError::Transport { message },
            DriverError::Protocol(message) => WireError::Protocol { message },
            DriverError::Lifecycle(message) => WireError::Lifecycle { message },
            DriverError::Unsupported(operation) => WireError::Unsupported { operation },
        }
    }
}

impl From<WireError> for DriverError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PathNotFound { path } => DriverError::PathNotFound(path),
            WireError::InvalidOffset { path, offset } => {
                DriverError::InvalidOffset { path, offset }
            }
            WireError::Io { message } => DriverError::Io(io::Error::other(message)),
            WireError::Transport { message } => DriverError::Transport(message),
            WireError::Protocol { message } => DriverError::Protocol(message),
            WireError::Lifecycle { message } => DriverError::Lifecycle(message),
            WireError::Unsupported { operation } => DriverError::Unsupported(operation),
        }
    }
}

/// Read-only adapter around a raw stream crossing the process boundary.
///
/// Reads and close pass through; any write attempt fails instead of
/// panicking.
#[derive(Debug)]
pub struct ReadOnly<R> {
    inner: R,
}

impl<R> ReadOnly<R> {
    /// Wrap `inner`, keeping only its read half usable.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadOnly<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: Unpin> AsyncWrite for ReadOnly<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "write unsupported",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use storage_driver::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn error_kind_survives_the_wire() {
        let original = DriverError::InvalidOffset {
            path: "a/b".into(),
            offset: 42,
        };
        let wire = WireError::from(original);
        let encoded = bincode::serialize(&wire).unwrap();
        let decoded: WireError = bincode::deserialize(&encoded).unwrap();
        let restored = DriverError::from(decoded);

        assert_eq!(restored.kind(), ErrorKind::InvalidOffset);
        match restored {
            DriverError::InvalidOffset { path, offset } => {
                assert_eq!(path, "a/b");
                assert_eq!(offset, 42);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_reads_but_rejects_writes() {
        let mut shim = ReadOnly::new(std::io::Cursor::new(b"payload".to_vec()));

        let err = shim.write_all(b"nope").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        let mut contents = Vec::new();
        shim.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"payload");
    }
}
