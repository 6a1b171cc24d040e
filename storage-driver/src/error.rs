use std::io;

/// Categorizes driver errors by their semantic meaning, independent of the
/// backing store and of whether the driver runs in-process or behind the
/// IPC boundary.
///
/// The RPC layer preserves the kind across the wire, so callers can match on
/// it rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The target path does not exist for an operation that requires it.
    PathNotFound,

    /// A stream offset beyond the persisted length of the path.
    InvalidOffset,

    /// Underlying storage or OS failure; the message preserves the cause.
    Io,

    /// RPC framing or channel failure. The session is effectively poisoned
    /// and should be stopped and discarded.
    Transport,

    /// Unknown request type or malformed payload at the server.
    Protocol,

    /// Operation called in the wrong session state.
    Lifecycle,

    /// The driver does not implement this operation.
    Unsupported,
}

/// Error type shared by every driver implementation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// See [`ErrorKind::PathNotFound`]. Carries the offending path.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// See [`ErrorKind::InvalidOffset`].
    #[error("invalid offset {offset} for path: {path}")]
    InvalidOffset {
        /// The path being read or written.
        path: String,
        /// The rejected offset.
        offset: u64,
    },

    /// See [`ErrorKind::Io`].
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// See [`ErrorKind::Transport`].
    #[error("transport error: {0}")]
    Transport(String),

    /// See [`ErrorKind::Protocol`].
    #[error("protocol error: {0}")]
    Protocol(String),

    /// See [`ErrorKind::Lifecycle`].
    #[error("session lifecycle error: {0}")]
    Lifecycle(String),

    /// See [`ErrorKind::Unsupported`]. Carries the operation name.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// The semantic category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::PathNotFound(_) => ErrorKind::PathNotFound,
            DriverError::InvalidOffset { .. } => ErrorKind::InvalidOffset,
            DriverError::Io(_) => ErrorKind::Io,
            DriverError::Transport(_) => ErrorKind::Transport,
            DriverError::Protocol(_) => ErrorKind::Protocol,
            DriverError::Lifecycle(_) => ErrorKind::Lifecycle,
            DriverError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Whether this error indicates a missing path.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::PathNotFound
    }

    /// Map an [`io::Error`] for `path`, folding `NotFound` into
    /// [`DriverError::PathNotFound`] and passing everything else through as
    /// [`DriverError::Io`].
    pub fn from_io(path: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            DriverError::PathNotFound(path.to_owned())
        } else {
            DriverError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let not_found = DriverError::PathNotFound("a/b".into());
        let offset = DriverError::InvalidOffset {
            path: "a/b".into(),
            offset: 7,
        };
        assert_eq!(not_found.kind(), ErrorKind::PathNotFound);
        assert_eq!(offset.kind(), ErrorKind::InvalidOffset);
        assert_ne!(not_found.kind(), offset.kind());
    }

    #[test]
    fn io_not_found_folds_into_path_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(DriverError::from_io("x", err).is_not_found());

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(DriverError::from_io("x", err).kind(), ErrorKind::Io);
    }
}
