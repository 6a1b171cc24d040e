//! Multiplexed message transport over a single stream socket.
//!
//! The parent and child each hold one end of a socket pair. On top of it,
//! this module provides lightweight sub-channels carrying typed records, and
//! live byte streams with credit-based flow control, so a large payload on
//! one stream cannot starve unrelated channels.
//!
//! Wire format: every frame is a 9-byte header (kind as `u8`, channel or
//! stream id as big-endian `u32`, payload length as big-endian `u32`)
//! followed by the payload. Record payloads are bincode; stream payloads are
//! raw bytes in chunks of at most 32 KiB.
//!
//! Ids share one space: the parent allocates odd ids and the child even ids,
//! so the two sides never collide without coordination.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use storage_driver::DriverError;

/// Stream payloads travel in chunks of at most this size.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Bytes a stream sender may have in flight before the receiver grants more.
const INITIAL_WINDOW: u64 = 256 * 1024;

/// Upper bound on a single frame payload, a guard against corrupt headers.
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    /// Announce a new inbound record channel.
    Open = 1,
    /// A record payload on a channel.
    Message = 2,
    /// Raw bytes on a stream.
    Data = 3,
    /// End of a stream; a non-empty payload is an error message surfaced to
    /// the reader.
    Fin = 4,
    /// Flow-control credit grant, in bytes, for a stream.
    Window = 5,
    /// Abandon a stream from either side.
    Reset = 6,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Open),
            2 => Some(FrameKind::Message),
            3 => Some(FrameKind::Data),
            4 => Some(FrameKind::Fin),
            5 => Some(FrameKind::Window),
            6 => Some(FrameKind::Reset),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    id: u32,
    payload: Bytes,
}

impl Frame {
    fn new(kind: FrameKind, id: u32) -> Self {
        Frame {
            kind,
            id,
            payload: Bytes::new(),
        }
    }

    fn with_payload(kind: FrameKind, id: u32, payload: Bytes) -> Self {
        Frame { kind, id, payload }
    }

    fn window(id: u32, credit: u32) -> Self {
        Frame::with_payload(
            FrameKind::Window,
            id,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

async fn read_frame(io: &mut OwnedReadHalf) -> io::Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    match io.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let kind = FrameKind::from_u8(header[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind: {}", header[0]),
        )
    })?;
    let id = u32::from_be_bytes(header[1..5].try_into().expect("4 header bytes"));
    let length = u32::from_be_bytes(header[5..9].try_into().expect("4 header bytes"));
    if length > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized frame: {length} bytes"),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    io.read_exact(&mut payload).await?;
    Ok(Some(Frame::with_payload(kind, id, payload.into())))
}

#[derive(Debug)]
enum StreamEvent {
    Data(Bytes),
    End,
    Failed(String),
    Reset,
}

#[derive(Debug, Default)]
struct Routing {
    /// Record channels by id, both accepted request channels and locally
    /// registered response channels.
    messages: HashMap<u32, mpsc::Sender<Bytes>>,
    /// Inbound stream buffers by id.
    streams: HashMap<u32, mpsc::Sender<StreamEvent>>,
    /// Streams the reader task buffered before anyone claimed them.
    pending: HashMap<u32, mpsc::Receiver<StreamEvent>>,
    /// Outbound stream windows by id, credited by peer `Window` frames.
    windows: HashMap<u32, Arc<SendWindow>>,
    /// Inbound streams dropped before the peer finished sending; frames for
    /// these ids are discarded until the peer's `Fin` or `Reset` arrives.
    tombstones: HashSet<u32>,
}

#[derive(Debug, Default)]
struct WindowState {
    available: u64,
    reset: bool,
    closed: bool,
}

#[derive(Debug)]
struct SendWindow {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl SendWindow {
    fn new() -> Self {
        SendWindow {
            state: Mutex::new(WindowState {
                available: INITIAL_WINDOW,
                reset: false,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn credit(&self, bytes: u64) {
        let mut state = self.state.lock().expect("window lock");
        state.available += bytes;
        self.notify.notify_one();
    }

    fn mark_reset(&self) {
        self.state.lock().expect("window lock").reset = true;
        self.notify.notify_one();
    }

    fn mark_closed(&self) {
        self.state.lock().expect("window lock").closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct Shared {
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    routing: Mutex<Routing>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Shared {
    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(2, Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: Frame) -> io::Result<()> {
        self.data_tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed"))
    }

    fn send_control(&self, frame: Frame) -> io::Result<()> {
        self.control_tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed"))
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DriverError::Transport("transport closed".into()))
        } else {
            Ok(())
        }
    }

    /// Claim the inbound stream `id`, or install a buffer for it if the
    /// reader task has not seen it yet.
    fn claim_stream(&self, id: u32) -> mpsc::Receiver<StreamEvent> {
        let mut routing = self.routing.lock().expect("routing lock");
        if let Some(rx) = routing.pending.remove(&id) {
            return rx;
        }
        let (tx, rx) = mpsc::channel(16);
        routing.streams.insert(id, tx);
        rx
    }

    /// Drop every routed channel and stream so their holders observe the
    /// transport as closed. Idempotent.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let mut routing = self.routing.lock().expect("routing lock");
        routing.messages.clear();
        routing.streams.clear();
        routing.pending.clear();
        routing.tombstones.clear();
        for window in routing.windows.values() {
            window.mark_closed();
        }
        routing.windows.clear();
    }
}

/// One endpoint of the multiplexed connection.
///
/// Cloning is shallow; all clones drive the same connection.
#[derive(Debug, Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChannelReceiver>>>,
    tasks: Arc<Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>>,
}

impl Transport {
    /// Parent-side endpoint; allocates odd ids.
    pub fn client(io: UnixStream) -> Transport {
        Transport::new(io, 1)
    }

    /// Child-side endpoint; allocates even ids.
    pub fn server(io: UnixStream) -> Transport {
        Transport::new(io, 2)
    }

    fn new(io: UnixStream, first_id: u32) -> Transport {
        let (read_half, write_half) = io.into_split();
        let (data_tx, data_rx) = mpsc::channel(32);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(16);

        let shared = Arc::new(Shared {
            data_tx,
            control_tx,
            routing: Mutex::new(Routing::default()),
            next_id: AtomicU32::new(first_id),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(run_reader(read_half, shared.clone(), accept_tx));
        let writer = tokio::spawn(run_writer(write_half, data_rx, control_rx, shared.clone()));

        Transport {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            tasks: Arc::new(Mutex::new(Some((reader, writer)))),
        }
    }

    /// Open a new outbound record channel, announcing it to the peer.
    pub fn open_channel(&self) -> Result<ChannelSender, DriverError> {
        self.shared.ensure_open()?;
        let id = self.shared.allocate_id();
        self.shared
            .send_control(Frame::new(FrameKind::Open, id))
            .map_err(|err| DriverError::Transport(err.to_string()))?;
        Ok(ChannelSender {
            id,
            shared: self.shared.clone(),
        })
    }

    /// Wait for the peer to open a record channel. Returns `None` once the
    /// connection is down.
    pub async fn accept_channel(&self) -> Option<ChannelReceiver> {
        self.accept_rx.lock().await.recv().await
    }

    /// Register a fresh one-shot response channel. The returned id travels
    /// inside a request; the peer sends the response record onto it.
    pub fn response_channel(&self) -> (u32, ChannelReceiver) {
        let id = self.shared.allocate_id();
        let (tx, rx) = mpsc::channel(1);
        self.shared
            .routing
            .lock()
            .expect("routing lock")
            .messages
            .insert(id, tx);
        (
            id,
            ChannelReceiver {
                id,
                rx,
                shared: self.shared.clone(),
            },
        )
    }

    /// A sender onto a channel the peer registered (a request's reply id).
    pub fn reply_sender(&self, id: u32) -> ChannelSender {
        ChannelSender {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Allocate an outbound byte stream. The id travels inside a record; the
    /// peer claims the other end with [`Transport::take_stream`].
    pub fn open_stream(&self) -> (u32, StreamWriter) {
        let id = self.shared.allocate_id();
        let window = Arc::new(SendWindow::new());
        self.shared
            .routing
            .lock()
            .expect("routing lock")
            .windows
            .insert(id, window.clone());
        (
            id,
            StreamWriter {
                id,
                window,
                shared: self.shared.clone(),
                finished: false,
            },
        )
    }

    /// Claim the inbound byte stream `id` referenced by a received record.
    pub fn take_stream(&self, id: u32) -> StreamReader {
        let rx = self.shared.claim_stream(id);
        StreamReader {
            id,
            rx,
            shared: self.shared.clone(),
            chunk: Bytes::new(),
            state: ReadState::Open,
        }
    }

    /// Tear down the connection: all sub-channels and streams, both
    /// directions. Safe to call more than once.
    pub async fn close(&self) -> Result<(), DriverError> {
        let tasks = self.tasks.lock().expect("tasks lock").take();
        if let Some((reader, writer)) = tasks {
            reader.abort();
            writer.abort();
            let _ = reader.await;
            let _ = writer.await;
        }
        self.shared.fail_all();
        Ok(())
    }
}

async fn run_writer(
    mut io: OwnedWriteHalf,
    mut data_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) {
    loop {
        // Control frames (opens, credit grants, stream teardown) jump the
        // data queue so credit can never deadlock behind bulk payloads.
        let frame = tokio::select! {
            biased;
            frame = control_rx.recv() => frame,
            frame = data_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = io.write_all(&frame.encode()).await {
            tracing::debug!(%err, "transport write failed");
            break;
        }
    }
    shared.fail_all();
}

async fn run_reader(
    mut io: OwnedReadHalf,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<ChannelReceiver>,
) {
    loop {
        match read_frame(&mut io).await {
            Ok(Some(frame)) => {
                if route_frame(frame, &shared, &accept_tx).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%err, "transport read failed");
                break;
            }
        }
    }
    shared.fail_all();
}

/// Dispatch one inbound frame. `Err` means an unrecoverable framing problem
/// and tears the connection down.
async fn route_frame(
    frame: Frame,
    shared: &Arc<Shared>,
    accept_tx: &mpsc::Sender<ChannelReceiver>,
) -> Result<(), ()> {
    match frame.kind {
        FrameKind::Open => {
            let (tx, rx) = mpsc::channel(16);
            shared
                .routing
                .lock()
                .expect("routing lock")
                .messages
                .insert(frame.id, tx);
            let receiver = ChannelReceiver {
                id: frame.id,
                rx,
                shared: shared.clone(),
            };
            accept_tx.send(receiver).await.map_err(|_| ())?;
        }
        FrameKind::Message => {
            let sender = shared
                .routing
                .lock()
                .expect("routing lock")
                .messages
                .get(&frame.id)
                .cloned();
            match sender {
                // The holder may be gone; a record for a dropped channel is
                // stale, not fatal.
                Some(tx) => {
                    let _ = tx.send(frame.payload).await;
                }
                None => tracing::trace!(id = frame.id, "record for unknown channel"),
            }
        }
        FrameKind::Data | FrameKind::Fin => {
            let event = match frame.kind {
                FrameKind::Data => StreamEvent::Data(frame.payload),
                _ if frame.payload.is_empty() => StreamEvent::End,
                _ => StreamEvent::Failed(String::from_utf8_lossy(&frame.payload).into_owned()),
            };
            let finished = !matches!(event, StreamEvent::Data(_));
            let sender = {
                let mut routing = shared.routing.lock().expect("routing lock");
                if routing.tombstones.contains(&frame.id) {
                    if finished {
                        routing.tombstones.remove(&frame.id);
                        routing.streams.remove(&frame.id);
                    }
                    return Ok(());
                }
                match routing.streams.get(&frame.id) {
                    Some(tx) => tx.clone(),
                    None => {
                        let (tx, rx) = mpsc::channel(16);
                        routing.streams.insert(frame.id, tx.clone());
                        routing.pending.insert(frame.id, rx);
                        tx
                    }
                }
            };
            let _ = sender.send(event).await;
        }
        FrameKind::Window => {
            let Ok(credit) = <[u8; 4]>::try_from(frame.payload.as_ref()) else {
                tracing::error!(id = frame.id, "malformed credit grant");
                return Err(());
            };
            let window = shared
                .routing
                .lock()
                .expect("routing lock")
                .windows
                .get(&frame.id)
                .cloned();
            if let Some(window) = window {
                window.credit(u32::from_be_bytes(credit) as u64);
            }
        }
        FrameKind::Reset => {
            let pending_tx = {
                let mut routing = shared.routing.lock().expect("routing lock");
                if let Some(window) = routing.windows.remove(&frame.id) {
                    // Peer abandoned a stream we are sending.
                    window.mark_reset();
                    None
                } else if routing.tombstones.remove(&frame.id) {
                    routing.streams.remove(&frame.id);
                    None
                } else {
                    // Peer abandoned a stream we are receiving.
                    routing.streams.get(&frame.id).cloned()
                }
            };
            if let Some(tx) = pending_tx {
                let _ = tx.send(StreamEvent::Reset).await;
            }
        }
    }
    Ok(())
}

/// Sending half of a record channel.
#[derive(Debug)]
pub struct ChannelSender {
    id: u32,
    shared: Arc<Shared>,
}

impl ChannelSender {
    /// Serialize and send one record.
    pub async fn send<M: Serialize>(&self, message: &M) -> Result<(), DriverError> {
        let payload =
            bincode::serialize(message).map_err(|err| DriverError::Protocol(err.to_string()))?;
        self.shared
            .send_frame(Frame::with_payload(
                FrameKind::Message,
                self.id,
                payload.into(),
            ))
            .await
            .map_err(|err| DriverError::Transport(err.to_string()))
    }
}

/// Receiving half of a record channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl ChannelReceiver {
    /// Receive and decode one record. `Ok(None)` means the channel (or the
    /// whole connection) is finished.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, DriverError> {
        match self.rx.recv().await {
            Some(payload) => bincode::deserialize(&payload)
                .map(Some)
                .map_err(|err| DriverError::Protocol(err.to_string())),
            None => Ok(None),
        }
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        self.shared
            .routing
            .lock()
            .expect("routing lock")
            .messages
            .remove(&self.id);
    }
}

/// Sending half of a byte stream.
#[derive(Debug)]
pub struct StreamWriter {
    id: u32,
    window: Arc<SendWindow>,
    shared: Arc<Shared>,
    finished: bool,
}

impl StreamWriter {
    /// Send `data`, splitting into chunks and waiting for credit as needed.
    ///
    /// Fails with `BrokenPipe` once the peer has reset the stream.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let granted = self.reserve(rest.len()).await?;
            let frame = Frame::with_payload(
                FrameKind::Data,
                self.id,
                Bytes::copy_from_slice(&rest[..granted]),
            );
            self.shared.send_frame(frame).await?;
            rest = &rest[granted..];
        }
        Ok(())
    }

    /// Signal a clean end of stream.
    pub fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        self.unregister();
        self.shared.send_control(Frame::new(FrameKind::Fin, self.id))
    }

    /// End the stream with an error the peer observes at read time.
    pub fn fail(&mut self, message: &str) -> io::Result<()> {
        self.finished = true;
        self.unregister();
        self.shared.send_control(Frame::with_payload(
            FrameKind::Fin,
            self.id,
            Bytes::copy_from_slice(message.as_bytes()),
        ))
    }

    fn unregister(&self) {
        self.shared
            .routing
            .lock()
            .expect("routing lock")
            .windows
            .remove(&self.id);
    }

    async fn reserve(&self, want: usize) -> io::Result<usize> {
        loop {
            {
                let mut state = self.window.state.lock().expect("window lock");
                if state.reset {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream reset by peer",
                    ));
                }
                if state.closed {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "transport closed",
                    ));
                }
                if state.available > 0 {
                    let granted = want.min(state.available as usize).min(CHUNK_SIZE);
                    state.available -= granted as u64;
                    return Ok(granted);
                }
            }
            self.window.notify.notified().await;
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.unregister();
            let _ = self
                .shared
                .send_control(Frame::new(FrameKind::Reset, self.id));
        }
    }
}

#[derive(Debug)]
enum ReadState {
    Open,
    Eof,
    Failed(String),
    Reset,
}

/// Receiving half of a byte stream; an [`AsyncRead`] fed by the connection.
///
/// Credit is granted back to the sender as the consumer drains, bounding the
/// bytes buffered for an unread stream. Dropping an unfinished reader resets
/// the stream so the sender stops.
#[derive(Debug)]
pub struct StreamReader {
    id: u32,
    rx: mpsc::Receiver<StreamEvent>,
    shared: Arc<Shared>,
    chunk: Bytes,
    state: ReadState,
}

impl StreamReader {
    fn grant(&self, bytes: usize) {
        let _ = self
            .shared
            .send_control(Frame::window(self.id, bytes as u32));
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.chunk.is_empty() {
                let take = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..take]);
                this.chunk.advance(take);
                this.grant(take);
                return Poll::Ready(Ok(()));
            }

            match &this.state {
                ReadState::Open => {}
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Failed(message) => {
                    return Poll::Ready(Err(io::Error::other(message.clone())))
                }
                ReadState::Reset => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset by peer",
                    )))
                }
            }

            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::Data(bytes))) => this.chunk = bytes,
                Poll::Ready(Some(StreamEvent::End)) => this.state = ReadState::Eof,
                Poll::Ready(Some(StreamEvent::Failed(message))) => {
                    this.state = ReadState::Failed(message)
                }
                Poll::Ready(Some(StreamEvent::Reset)) => this.state = ReadState::Reset,
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "transport closed",
                    )))
                }
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        let mut routing = self.shared.routing.lock().expect("routing lock");
        if matches!(self.state, ReadState::Open) {
            // The peer may still be sending; discard until its Fin or Reset.
            routing.tombstones.insert(self.id);
            drop(routing);
            let _ = self
                .shared
                .send_control(Frame::new(FrameKind::Reset, self.id));
        } else {
            routing.streams.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        value: String,
        stream: Option<u32>,
    }

    fn pair() -> (Transport, Transport) {
        let (left, right) = UnixStream::pair().expect("socket pair");
        (Transport::client(left), Transport::server(right))
    }

    #[tokio::test]
    async fn record_round_trip() {
        let (client, server) = pair();

        let sender = client.open_channel().unwrap();
        sender
            .send(&Ping {
                value: "hello".into(),
                stream: None,
            })
            .await
            .unwrap();

        let mut channel = server.accept_channel().await.expect("accepted channel");
        let received: Ping = channel.recv().await.unwrap().expect("one record");
        assert_eq!(received.value, "hello");
    }

    #[tokio::test]
    async fn response_channels_are_independent() {
        let (client, server) = pair();

        let sender = client.open_channel().unwrap();
        let (reply_a, mut rx_a) = client.response_channel();
        let (reply_b, mut rx_b) = client.response_channel();
        assert_ne!(reply_a, reply_b);

        sender
            .send(&Ping {
                value: "a".into(),
                stream: Some(reply_a),
            })
            .await
            .unwrap();
        sender
            .send(&Ping {
                value: "b".into(),
                stream: Some(reply_b),
            })
            .await
            .unwrap();

        let mut channel = server.accept_channel().await.expect("accepted channel");
        let first: Ping = channel.recv().await.unwrap().expect("first");
        let second: Ping = channel.recv().await.unwrap().expect("second");

        // Reply out of order; each response lands on its own channel.
        server
            .reply_sender(second.stream.unwrap())
            .send(&"for b")
            .await
            .unwrap();
        server
            .reply_sender(first.stream.unwrap())
            .send(&"for a")
            .await
            .unwrap();

        assert_eq!(rx_a.recv::<String>().await.unwrap().unwrap(), "for a");
        assert_eq!(rx_b.recv::<String>().await.unwrap().unwrap(), "for b");
    }

    #[tokio::test]
    async fn stream_round_trip_exceeding_the_window() {
        let (client, server) = pair();

        // 1 MiB forces several rounds of credit.
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let (id, mut writer) = client.open_stream();
        let sender = client.open_channel().unwrap();
        sender
            .send(&Ping {
                value: "incoming".into(),
                stream: Some(id),
            })
            .await
            .unwrap();

        let send = {
            let payload = payload.clone();
            tokio::spawn(async move {
                writer.write_chunk(&payload).await.unwrap();
                writer.finish().unwrap();
            })
        };

        let mut channel = server.accept_channel().await.expect("accepted channel");
        let record: Ping = channel.recv().await.unwrap().expect("record");
        let mut reader = server.take_stream(record.stream.unwrap());

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        send.await.unwrap();
    }

    #[tokio::test]
    async fn fin_with_payload_surfaces_as_read_error() {
        let (client, server) = pair();

        let (id, mut writer) = client.open_stream();
        let sender = client.open_channel().unwrap();
        sender
            .send(&Ping {
                value: "broken".into(),
                stream: Some(id),
            })
            .await
            .unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.fail("storage exploded").unwrap();

        let mut channel = server.accept_channel().await.expect("accepted channel");
        let record: Ping = channel.recv().await.unwrap().expect("record");
        let mut reader = server.take_stream(record.stream.unwrap());

        let mut received = Vec::new();
        let err = reader.read_to_end(&mut received).await.unwrap_err();
        assert!(err.to_string().contains("storage exploded"));
    }

    #[tokio::test]
    async fn dropping_a_reader_resets_the_sender() {
        let (client, server) = pair();

        let (id, mut writer) = client.open_stream();
        let sender = client.open_channel().unwrap();
        sender
            .send(&Ping {
                value: "abandoned".into(),
                stream: Some(id),
            })
            .await
            .unwrap();

        let mut channel = server.accept_channel().await.expect("accepted channel");
        let record: Ping = channel.recv().await.unwrap().expect("record");
        drop(server.take_stream(record.stream.unwrap()));

        // The writer eventually observes the reset once its credit runs out.
        let payload = vec![0u8; CHUNK_SIZE];
        let err = loop {
            if let Err(err) = writer.write_chunk(&payload).await {
                break err;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn close_fails_outstanding_receivers() {
        let (client, server) = pair();

        let (_reply, mut rx) = client.response_channel();
        client.close().await.unwrap();
        assert!(rx.recv::<String>().await.unwrap().is_none());

        // The peer sees the connection go down too.
        assert!(server.accept_channel().await.is_none());
    }
}
