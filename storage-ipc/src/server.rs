//! Child-side hosting of a storage driver.
//!
//! A driver executable opens the socket inherited at file descriptor 3,
//! builds a server-mode transport over it, and serves request channels
//! until the parent tears the connection down.

use std::collections::BTreeMap;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use storage_driver::{ByteStream, Driver, DriverError};

use crate::proto::{ReadOnly, Request, RequestBody, Response};
use crate::transport::{ChannelReceiver, StreamWriter, Transport, CHUNK_SIZE};

/// Descriptor slot where a driver executable finds its end of the socket
/// pair.
pub const CHILD_SOCKET_FD: RawFd = 3;

/// Decode the parameter map a driver executable receives as `argv[1]`: a
/// JSON object of string keys and string values. A missing argument is an
/// empty map.
pub fn parameters_from_args() -> Result<BTreeMap<String, String>, DriverError> {
    match std::env::args().nth(1) {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|err| DriverError::Protocol(format!("invalid parameter map: {err}"))),
        None => Ok(BTreeMap::new()),
    }
}

/// Open the socket inherited from the parent at [`CHILD_SOCKET_FD`].
///
/// # Safety contract
///
/// Callable once per process, from a driver executable spawned by the
/// parent-side client; the descriptor must not be otherwise in use.
pub fn inherited_socket() -> Result<UnixStream, DriverError> {
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(CHILD_SOCKET_FD) };
    stream
        .set_nonblocking(true)
        .map_err(|err| DriverError::Transport(format!("inherited socket: {err}")))?;
    UnixStream::from_std(stream)
        .map_err(|err| DriverError::Transport(format!("inherited socket: {err}")))
}

/// Serve `driver` over the socket inherited from the parent. Returns once
/// the parent closes the transport.
pub async fn serve<D>(driver: D) -> Result<(), DriverError>
where
    D: Driver + 'static,
{
    serve_on(inherited_socket()?, driver).await
}

/// Serve `driver` over an already-connected socket.
pub async fn serve_on<D>(socket: UnixStream, driver: D) -> Result<(), DriverError>
where
    D: Driver + 'static,
{
    let transport = Transport::server(socket);
    let driver = Arc::new(driver);
    tracing::info!(driver = driver.name(), "storage driver serving");

    while let Some(channel) = transport.accept_channel().await {
        tokio::spawn(serve_channel(transport.clone(), channel, driver.clone()));
    }

    tracing::info!("transport closed; shutting down");
    Ok(())
}

/// Read requests off one sub-channel, dispatching each concurrently.
async fn serve_channel<D>(transport: Transport, mut channel: ChannelReceiver, driver: Arc<D>)
where
    D: Driver + 'static,
{
    loop {
        match channel.recv::<Request>().await {
            Ok(Some(request)) => {
                tracing::debug!(operation = request.body.name(), "received request");
                tokio::spawn(dispatch(transport.clone(), driver.clone(), request));
            }
            Ok(None) => break,
            // A payload that does not decode as a known request is fatal to
            // this channel, not to the session.
            Err(err) => {
                tracing::error!(%err, "malformed request; closing channel");
                break;
            }
        }
    }
}

/// Invoke the driver for one request and send exactly one typed response.
async fn dispatch<D>(transport: Transport, driver: Arc<D>, request: Request)
where
    D: Driver + 'static,
{
    let reply = transport.reply_sender(request.reply);
    let response = match request.body {
        RequestBody::GetContent { path } => {
            Response::GetContent(driver.get_content(&path).await.map_err(Into::into))
        }
        RequestBody::PutContent { path, contents } => Response::PutContent(
            driver
                .put_content(&path, &contents)
                .await
                .map_err(Into::into),
        ),
        RequestBody::ReadStream { path, offset } => {
            match driver.read_stream(&path, offset).await {
                Ok(reader) => {
                    let (id, writer) = transport.open_stream();
                    tokio::spawn(pump_blob(reader, writer));
                    Response::ReadStream(Ok(id))
                }
                Err(err) => Response::ReadStream(Err(err.into())),
            }
        }
        RequestBody::WriteStream {
            path,
            offset,
            source,
        } => {
            let reader = ReadOnly::new(transport.take_stream(source));
            let result = driver.write_stream(&path, offset, Box::new(reader)).await;
            Response::WriteStream(result.map_err(Into::into))
        }
        RequestBody::ResumeWritePosition { path } => Response::ResumeWritePosition(
            driver.resume_write_position(&path).await.map_err(Into::into),
        ),
        RequestBody::Rename { source, dest } => {
            Response::Rename(driver.rename(&source, &dest).await.map_err(Into::into))
        }
        RequestBody::Delete { path } => {
            Response::Delete(driver.delete(&path).await.map_err(Into::into))
        }
        RequestBody::List { prefix } => {
            Response::List(driver.list(&prefix).await.map_err(Into::into))
        }
    };

    if let Err(err) = reply.send(&response).await {
        tracing::debug!(%err, "response channel lost");
    }
}

/// Copy a driver reader onto an outbound stream. A driver read failure is
/// surfaced to the parent at read time; a parent reset stops the copy.
async fn pump_blob(mut reader: ByteStream, mut writer: StreamWriter) {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                let _ = writer.finish();
                return;
            }
            Ok(read) => {
                if writer.write_chunk(&buffer[..read]).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = writer.fail(&err.to_string());
                return;
            }
        }
    }
}
