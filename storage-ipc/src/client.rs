//! Parent-side client for an out-of-process storage driver.
//!
//! The client spawns the driver executable with a socket pair, hands the
//! child its end at file descriptor 3, and then speaks the typed protocol
//! of [`crate::proto`] over a client-mode transport. To callers it is just
//! another [`Driver`].

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

use storage_driver::{ByteStream, Driver, DriverError};

use crate::proto::{ReadOnly, Request, RequestBody, Response};
use crate::server::CHILD_SOCKET_FD;
use crate::transport::{ChannelSender, StreamWriter, Transport, CHUNK_SIZE};

/// Client construction options.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    binary_dir: Option<PathBuf>,
}

impl ClientOptions {
    /// Start from the defaults: no binary directory configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory searched first for driver executables. Without it,
    /// resolution starts beside the current executable.
    pub fn binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = Some(dir.into());
        self
    }
}

/// Locate the driver executable `name`: the configured binary directory,
/// then the directory of the current executable, then the `PATH`.
fn resolve_executable(name: &str, options: &ClientOptions) -> Result<PathBuf, DriverError> {
    if let Some(dir) = &options.binary_dir {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(DriverError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("driver executable not found: {name}"),
    )))
}

#[derive(Debug)]
enum State {
    New { binary: PathBuf, parameters: String },
    Started(Session),
    Stopped,
}

#[derive(Debug)]
struct Session {
    child: Child,
    transport: Transport,
    /// The single durable request channel; sends are serialized through the
    /// mutex so concurrent callers interleave whole records.
    requests: Arc<Mutex<ChannelSender>>,
}

/// A session with one out-of-process driver.
///
/// Lifecycle: created → [`DriverClient::start`] → operations →
/// [`DriverClient::stop`]. Operations in any other state fail with a
/// lifecycle error, as does a second `start` or a second `stop`. A stopped
/// client is not reusable.
#[derive(Debug)]
pub struct DriverClient {
    state: RwLock<State>,
}

impl DriverClient {
    /// Prepare a client for the driver executable `name`, passing it
    /// `parameters` as a JSON string map. No process is spawned until
    /// [`DriverClient::start`].
    pub fn new(name: &str, parameters: &BTreeMap<String, String>) -> Result<Self, DriverError> {
        Self::with_options(name, parameters, ClientOptions::default())
    }

    /// [`DriverClient::new`] with explicit [`ClientOptions`].
    pub fn with_options(
        name: &str,
        parameters: &BTreeMap<String, String>,
        options: ClientOptions,
    ) -> Result<Self, DriverError> {
        let binary = resolve_executable(name, &options)?;
        let parameters = serde_json::to_string(parameters)
            .map_err(|err| DriverError::Protocol(format!("encode parameters: {err}")))?;
        Ok(Self {
            state: RwLock::new(State::New { binary, parameters }),
        })
    }

    /// Spawn the child and bring the transport up. On failure every
    /// partially acquired resource is released and the client remains
    /// startable.
    pub async fn start(&self) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        let (binary, parameters) = match &*state {
            State::New { binary, parameters } => (binary.clone(), parameters.clone()),
            State::Started(_) => {
                return Err(DriverError::Lifecycle("session already started".into()))
            }
            State::Stopped => return Err(DriverError::Lifecycle("session stopped".into())),
        };

        tracing::debug!(binary = %binary.display(), "starting driver child");
        let session = bootstrap(&binary, &parameters).await?;
        *state = State::Started(session);
        Ok(())
    }

    /// Tear the session down: close the request channel, then the transport
    /// and its socket, then kill the child. The first failure is reported;
    /// later steps still run. Outstanding calls observe the transport
    /// closing as an error. A second `stop` is a lifecycle error.
    pub async fn stop(&self) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        let session = match std::mem::replace(&mut *state, State::Stopped) {
            State::Started(session) => session,
            fresh @ State::New { .. } => {
                *state = fresh;
                return Err(DriverError::Lifecycle("session not started".into()));
            }
            State::Stopped => {
                return Err(DriverError::Lifecycle("session already stopped".into()))
            }
        };
        drop(state);

        let Session {
            mut child,
            transport,
            requests,
        } = session;

        drop(requests);
        let transport_result = transport.close().await;
        let kill_result = child.kill().await.map_err(DriverError::from);

        transport_result?;
        kill_result
    }

    /// Snapshot the started session's handles. The state lock is released
    /// before any I/O, so a `stop` can always proceed and fail outstanding
    /// calls through the transport.
    async fn session(&self) -> Result<(Transport, Arc<Mutex<ChannelSender>>), DriverError> {
        let state = self.state.read().await;
        match &*state {
            State::Started(session) => {
                Ok((session.transport.clone(), session.requests.clone()))
            }
            State::New { .. } => Err(DriverError::Lifecycle("session not started".into())),
            State::Stopped => Err(DriverError::Lifecycle("session stopped".into())),
        }
    }

    /// Issue one request on the durable channel and wait for its single
    /// typed response on a fresh reply channel.
    async fn call(&self, body: RequestBody) -> Result<Response, DriverError> {
        let (transport, requests) = self.session().await?;
        roundtrip(&transport, &requests, body).await
    }
}

fn closed_early() -> DriverError {
    DriverError::Transport("connection closed before response".into())
}

fn unexpected(response: Response) -> DriverError {
    DriverError::Protocol(format!("unexpected response: {}", response.name()))
}

async fn roundtrip(
    transport: &Transport,
    requests: &Mutex<ChannelSender>,
    body: RequestBody,
) -> Result<Response, DriverError> {
    let (reply, mut receiver) = transport.response_channel();
    {
        let requests = requests.lock().await;
        requests.send(&Request { body, reply }).await?;
    }
    receiver.recv::<Response>().await?.ok_or_else(closed_early)
}

async fn bootstrap(binary: &Path, parameters: &str) -> Result<Session, DriverError> {
    let (parent_io, child_io) = std::os::unix::net::UnixStream::pair()?;
    let child_end: OwnedFd = child_io.into();
    let raw_fd = child_end.as_raw_fd();

    let mut command = Command::new(binary);
    command
        .arg(parameters)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // The child's socket end must land at descriptor 3 with CLOEXEC clear;
    // dup2 clears the flag, the fcntl branch covers the fd already being 3.
    unsafe {
        command.pre_exec(move || {
            if raw_fd == CHILD_SOCKET_FD {
                let flags = libc::fcntl(raw_fd, libc::F_GETFD);
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::fcntl(raw_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(raw_fd, CHILD_SOCKET_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    // The parent's copy of the child end must close for EOF to propagate.
    drop(child_end);

    match connect(parent_io) {
        Ok((transport, requests)) => Ok(Session {
            child,
            transport,
            requests: Arc::new(Mutex::new(requests)),
        }),
        Err(err) => {
            let _ = child.kill().await;
            Err(err)
        }
    }
}

fn connect(
    parent_io: std::os::unix::net::UnixStream,
) -> Result<(Transport, ChannelSender), DriverError> {
    parent_io.set_nonblocking(true)?;
    let io = UnixStream::from_std(parent_io)?;
    let transport = Transport::client(io);
    let requests = transport.open_channel()?;
    Ok((transport, requests))
}

/// Copy the caller's stream onto the outbound transport stream. Returns a
/// local read failure, if any; the writer is always finished or dropped
/// (resetting the stream) so the server's reply is never stalled.
async fn pump_source(source: &mut ByteStream, mut writer: StreamWriter) -> Option<DriverError> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => {
                let _ = writer.finish();
                return None;
            }
            Ok(read) => {
                // A reset here means the server already failed the request;
                // its typed response carries the real error.
                if writer.write_chunk(&buffer[..read]).await.is_err() {
                    return None;
                }
            }
            Err(err) => return Some(DriverError::Io(err)),
        }
    }
}

#[async_trait::async_trait]
impl Driver for DriverClient {
    fn name(&self) -> &'static str {
        "ipc"
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        match self
            .call(RequestBody::GetContent { path: path.into() })
            .await?
        {
            Response::GetContent(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }

    async fn put_content(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        match self
            .call(RequestBody::PutContent {
                path: path.into(),
                contents: contents.to_vec(),
            })
            .await?
        {
            Response::PutContent(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }

    async fn read_stream(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        let (transport, requests) = self.session().await?;

        let response = roundtrip(
            &transport,
            &requests,
            RequestBody::ReadStream {
                path: path.into(),
                offset,
            },
        )
        .await?;

        match response {
            Response::ReadStream(Ok(stream)) => {
                let reader = transport.take_stream(stream);
                Ok(Box::new(ReadOnly::new(reader)) as ByteStream)
            }
            Response::ReadStream(Err(err)) => Err(err.into()),
            other => Err(unexpected(other)),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
        mut source: ByteStream,
    ) -> Result<(), DriverError> {
        let (transport, requests) = self.session().await?;

        let (reply, mut receiver) = transport.response_channel();
        let (stream, writer) = transport.open_stream();
        {
            let requests = requests.lock().await;
            requests
                .send(&Request {
                    body: RequestBody::WriteStream {
                        path: path.into(),
                        offset,
                        source: stream,
                    },
                    reply,
                })
                .await?;
        }

        let source_error = pump_source(&mut source, writer).await;

        let result = match receiver.recv::<Response>().await?.ok_or_else(closed_early)? {
            Response::WriteStream(result) => result.map_err(DriverError::from),
            other => Err(unexpected(other)),
        };

        match source_error {
            // The caller's stream failed locally; the content is incomplete
            // regardless of what the server reported.
            Some(err) => Err(err),
            None => result,
        }
    }

    async fn resume_write_position(&self, path: &str) -> Result<u64, DriverError> {
        match self
            .call(RequestBody::ResumeWritePosition { path: path.into() })
            .await?
        {
            Response::ResumeWritePosition(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        match self
            .call(RequestBody::Rename {
                source: source.into(),
                dest: dest.into(),
            })
            .await?
        {
            Response::Rename(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), DriverError> {
        match self.call(RequestBody::Delete { path: path.into() }).await? {
            Response::Delete(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        match self
            .call(RequestBody::List {
                prefix: prefix.into(),
            })
            .await?
        {
            Response::List(result) => result.map_err(Into::into),
            other => Err(unexpected(other)),
        }
    }
}
