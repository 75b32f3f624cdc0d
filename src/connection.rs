//! One peer connection: the state machine, the message assembler, and the
//! reader task that drives both.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::close::CloseCode;
use crate::frame::{self, FrameHeader, Opcode};
use crate::handshake;
use crate::transport::Transport;
use crate::utf8::{Utf8State, Utf8Validator};
use crate::{DataKind, Error, Handler, Role};

/// Protocol timers. The defaults are the usual 30 seconds.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// How long the opening handshake may take, measured from dial
    /// completion.
    pub handshake: Duration,
    /// How long a fragmented message may stay incomplete.
    pub message: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(30),
            message: Duration::from_secs(30),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshake = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Handshake,
            1 => State::Open,
            2 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// One WebSocket peer connection.
///
/// Shared between the owning endpoint and the connection's reader task.
/// Clone the `Arc` to retain a connection beyond a callback.
pub struct Connection {
    role: Role,
    state: AtomicU8,
    close_sent: AtomicBool,
    close_delivered: AtomicBool,
    // absent until the transport exists, i.e. while a client is still dialing
    writer: Mutex<Option<WriteHalf<Transport>>>,
    shutdown: Notify,
    peer_addr: OnceLock<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
    user_data: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Connection {
    /// Server side: transport accepted, upgrade not yet performed.
    pub(crate) fn accept(
        transport: Transport,
        handler: Arc<dyn Handler>,
        timeouts: Timeouts,
    ) -> (Arc<Connection>, Reader) {
        let peer_addr = transport.peer_addr().ok();
        let local_addr = transport.local_addr().ok();
        let (read, write) = tokio::io::split(transport);
        let connection = Arc::new(Connection::new(Role::Server, State::Handshake, Some(write)));
        if let Some(addr) = peer_addr {
            let _ = connection.peer_addr.set(addr);
        }
        if let Some(addr) = local_addr {
            let _ = connection.local_addr.set(addr);
        }
        let reader = Reader {
            connection: connection.clone(),
            handler,
            read,
            buf: BytesMut::new(),
            pending: None,
            timeouts,
        };
        (connection, reader)
    }

    /// Client side: the connection exists before the dial so a failed
    /// handshake still has something to report `on_close` against.
    pub(crate) fn opening(
        handler: Arc<dyn Handler>,
        timeouts: Timeouts,
    ) -> (Arc<Connection>, Opening) {
        let connection = Arc::new(Connection::new(Role::Client, State::Handshake, None));
        let opening = Opening {
            connection: connection.clone(),
            handler,
            timeouts,
        };
        (connection, opening)
    }

    fn new(role: Role, state: State, writer: Option<WriteHalf<Transport>>) -> Connection {
        Connection {
            role,
            state: AtomicU8::new(state as u8),
            close_sent: AtomicBool::new(false),
            close_delivered: AtomicBool::new(false),
            writer: Mutex::new(writer),
            shutdown: Notify::new(),
            peer_addr: OnceLock::new(),
            local_addr: OnceLock::new(),
            user_data: OnceLock::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// False only once the connection reached its terminal state.
    pub fn is_connected(&self) -> bool {
        self.state() != State::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr.get().copied()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Stores a value on the connection. The slot is set once; a second call
    /// hands the value back as the error.
    pub fn set_user_data(
        &self,
        data: Box<dyn Any + Send + Sync>,
    ) -> Result<(), Box<dyn Any + Send + Sync>> {
        self.user_data.set(data)
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.user_data.get().map(|data| &**data)
    }

    /// Sends one complete data message in a single frame.
    pub async fn send(&self, kind: DataKind, data: &[u8]) -> Result<(), Error> {
        self.send_data(kind.opcode(), true, data).await
    }

    /// Opens a fragmented message. Follow up with
    /// [`send_fragmented_cont`](Connection::send_fragmented_cont). Fragments
    /// of two messages must not be interleaved on one connection.
    pub async fn send_fragmented_start(&self, kind: DataKind, data: &[u8]) -> Result<(), Error> {
        self.send_data(kind.opcode(), false, data).await
    }

    /// Continues a fragmented message; `fin` marks the last fragment.
    pub async fn send_fragmented_cont(&self, fin: bool, data: &[u8]) -> Result<(), Error> {
        self.send_data(Opcode::Continuation, fin, data).await
    }

    async fn send_data(&self, opcode: Opcode, fin: bool, data: &[u8]) -> Result<(), Error> {
        if self.state() != State::Open {
            return Err(Error::NotConnected);
        }
        self.write_frame(opcode, fin, data).await
    }

    /// Starts the closing handshake. An invalid `code` is never put on the
    /// wire; a protocol error close is sent in its place.
    pub async fn close(&self, code: CloseCode) -> Result<(), Error> {
        let code = if code.is_valid() {
            code
        } else {
            warn!("close code {} must not be sent, using 1002 instead", code);
            CloseCode::PROTOCOL_ERROR
        };
        self.start_close(code).await
    }

    pub(crate) async fn start_close(&self, code: CloseCode) -> Result<(), Error> {
        if self.state() == State::Closed {
            return Ok(());
        }
        self.set_state(State::Closing);
        let result = if !self.close_sent.swap(true, Ordering::SeqCst) {
            self.write_frame(Opcode::Close, true, &code.to_be_bytes()).await
        } else {
            Ok(())
        };
        // wake the reader so it can drain the peer's reply and finish up
        self.shutdown.notify_one();
        result
    }

    /// Writes one frame, masked when this endpoint is the client. The frame
    /// is a single contiguous buffer and goes out under the writer lock, so
    /// concurrent sends never interleave inside a frame.
    pub(crate) async fn write_frame(
        &self,
        opcode: Opcode,
        fin: bool,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mask = match self.role {
            Role::Client => Some(new_mask_key()?),
            Role::Server => None,
        };
        let frame = frame::encode(opcode, fin, mask, payload);
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn write_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown_transport(&self) {
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = writer.shutdown().await;
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

fn new_mask_key() -> Result<[u8; 4], Error> {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key)?;
    Ok(key)
}

/// A fragmented data message in progress. At most one per connection.
struct Pending {
    kind: DataKind,
    payload: Vec<u8>,
    utf8: Utf8Validator,
    since: Instant,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// A client connection that is still dialing and upgrading. Turns into a
/// [`Reader`] once the transport is up, or reports `on_close` if it never
/// gets there.
pub(crate) struct Opening {
    connection: Arc<Connection>,
    handler: Arc<dyn Handler>,
    timeouts: Timeouts,
}

impl Opening {
    /// Binds the connected transport; `initial` holds whatever bytes
    /// followed the handshake response.
    pub(crate) async fn ready(self, transport: Transport, initial: BytesMut) -> Reader {
        if let Ok(addr) = transport.peer_addr() {
            let _ = self.connection.peer_addr.set(addr);
        }
        if let Ok(addr) = transport.local_addr() {
            let _ = self.connection.local_addr.set(addr);
        }
        let (read, write) = tokio::io::split(transport);
        *self.connection.writer.lock().await = Some(write);
        self.connection.set_state(State::Open);
        Reader {
            connection: self.connection,
            handler: self.handler,
            read,
            buf: initial,
            pending: None,
            timeouts: self.timeouts,
        }
    }

    /// The dial or handshake failed: terminal state, `on_close`, no frame.
    pub(crate) async fn fail(self) {
        self.connection.set_state(State::Closed);
        if !self.connection.close_delivered.swap(true, Ordering::SeqCst) {
            self.handler.on_close(&self.connection).await;
        }
    }
}

/// The per-connection reader task: accumulates transport bytes, runs the
/// frame loop, and dispatches callbacks.
pub(crate) struct Reader {
    connection: Arc<Connection>,
    handler: Arc<dyn Handler>,
    read: ReadHalf<Transport>,
    buf: BytesMut,
    pending: Option<Pending>,
    timeouts: Timeouts,
}

impl Reader {
    pub(crate) async fn run(mut self) {
        if self.connection.state() == State::Handshake {
            match timeout(self.timeouts.handshake, self.server_handshake()).await {
                Ok(Ok(())) => {
                    self.connection.set_state(State::Open);
                    self.handler.on_open(&self.connection).await;
                }
                Ok(Err(err)) => {
                    debug!("handshake with {:?} failed: {}", self.connection.peer_addr(), err);
                    return self.finish().await;
                }
                Err(_) => {
                    debug!("handshake with {:?} timed out", self.connection.peer_addr());
                    return self.finish().await;
                }
            }
        }

        if let Err(err) = self.read_loop().await {
            match err.close_code() {
                Some(code) => {
                    warn!(
                        "closing {:?} with {}: {}",
                        self.connection.peer_addr(),
                        code,
                        err
                    );
                    let _ = self.connection.start_close(code).await;
                }
                None => debug!("connection {:?} done: {}", self.connection.peer_addr(), err),
            }
        }
        self.finish().await;
    }

    async fn finish(self) {
        self.connection.set_state(State::Closed);
        self.connection.shutdown_transport().await;
        if !self.connection.close_delivered.swap(true, Ordering::SeqCst) {
            self.handler.on_close(&self.connection).await;
        }
    }

    async fn server_handshake(&mut self) -> Result<(), Error> {
        loop {
            if let Some((request, consumed)) = handshake::parse_request(&self.buf)? {
                self.buf.advance(consumed);
                debug!(
                    "upgrade request for {} from {:?}",
                    request.resource,
                    self.connection.peer_addr()
                );
                let response = handshake::response_for(&request.key);
                return self.connection.write_raw(response.as_bytes()).await;
            }
            if self.read.read_buf(&mut self.buf).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn read_loop(&mut self) -> Result<(), Error> {
        loop {
            if self.process_buffer().await? == Flow::Stop {
                return Ok(());
            }
            let read = tokio::select! {
                read = self.read.read_buf(&mut self.buf) => Some(read?),
                _ = self.connection.shutdown.notified() => None,
            };
            match read {
                // a local close wants the reader to wind down
                None => return self.drain_close_echo().await,
                Some(0) => {
                    if self.connection.state() == State::Closing {
                        return Ok(());
                    }
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                Some(_) => {
                    if let Some(pending) = &self.pending {
                        if pending.since.elapsed() >= self.timeouts.message {
                            self.pending = None;
                            return Err(Error::MessageTimeout);
                        }
                    }
                }
            }
        }
    }

    /// Handles every fully buffered frame at the front of the accumulator.
    async fn process_buffer(&mut self) -> Result<Flow, Error> {
        while let Some((header, header_len)) = FrameHeader::parse(&self.buf)? {
            self.check_mask_rule(&header)?;
            if header.opcode.is_control() {
                if !header.fin {
                    return Err(Error::FragmentedControl);
                }
                if header.payload_len > frame::MAX_CONTROL_PAYLOAD {
                    return Err(Error::OversizedControl);
                }
            }

            let payload_len = usize::try_from(header.payload_len).map_err(|_| Error::NoMemory)?;
            let frame_len = header_len.checked_add(payload_len).ok_or(Error::NoMemory)?;
            if self.buf.len() < frame_len {
                return Ok(Flow::Continue);
            }

            let mut payload = Vec::new();
            payload
                .try_reserve_exact(payload_len)
                .map_err(|_| Error::NoMemory)?;
            payload.extend_from_slice(&self.buf[header_len..frame_len]);
            self.buf.advance(frame_len);
            if let Some(key) = header.mask {
                frame::apply_mask(&mut payload, key);
            }

            if self.handle_frame(&header, payload).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// A server must receive masked frames, a client unmasked ones. Checked
    /// on the raw header before any payload is touched.
    fn check_mask_rule(&self, header: &FrameHeader) -> Result<(), Error> {
        let expect_masked = self.connection.role == Role::Server;
        if header.mask.is_some() != expect_masked {
            return Err(Error::BadMask);
        }
        Ok(())
    }

    async fn handle_frame(&mut self, header: &FrameHeader, payload: Vec<u8>) -> Result<Flow, Error> {
        if self.connection.state() == State::Closing && header.opcode != Opcode::Close {
            // only the close reply matters now
            return Ok(Flow::Continue);
        }
        match header.opcode {
            Opcode::Text => self.on_data(DataKind::Text, header.fin, payload).await?,
            Opcode::Binary => self.on_data(DataKind::Binary, header.fin, payload).await?,
            Opcode::Continuation => self.on_continuation(header.fin, payload).await?,
            Opcode::Ping => {
                debug!("ping, {} bytes, answering", payload.len());
                self.connection.write_frame(Opcode::Pong, true, &payload).await?;
            }
            Opcode::Pong => {
                // we never send pings, so any pong is unsolicited
                debug!("pong, {} bytes, dropped", payload.len());
            }
            Opcode::Close => return self.on_close_frame(payload).await,
        }
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, kind: DataKind, fin: bool, payload: Vec<u8>) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::InterleavedMessage);
        }
        let mut utf8 = Utf8Validator::new();
        if kind == DataKind::Text {
            match utf8.feed(&payload) {
                Utf8State::Fail => return Err(Error::InvalidUtf8),
                Utf8State::Busy if fin => return Err(Error::InvalidUtf8),
                _ => {}
            }
        }
        if fin {
            self.handler.on_message(&self.connection, kind, payload).await;
        } else {
            self.pending = Some(Pending {
                kind,
                payload,
                utf8,
                since: Instant::now(),
            });
        }
        Ok(())
    }

    async fn on_continuation(&mut self, fin: bool, payload: Vec<u8>) -> Result<(), Error> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(Error::StrayContinuation);
        };
        pending
            .payload
            .try_reserve(payload.len())
            .map_err(|_| Error::NoMemory)?;
        pending.payload.extend_from_slice(&payload);
        if pending.kind == DataKind::Text {
            match pending.utf8.feed(&payload) {
                Utf8State::Fail => return Err(Error::InvalidUtf8),
                Utf8State::Busy if fin => return Err(Error::InvalidUtf8),
                _ => {}
            }
        }
        if fin {
            if let Some(done) = self.pending.take() {
                self.handler
                    .on_message(&self.connection, done.kind, done.payload)
                    .await;
            }
        }
        Ok(())
    }

    async fn on_close_frame(&mut self, payload: Vec<u8>) -> Result<Flow, Error> {
        let code = match payload.len() {
            0 => None,
            1 => return Err(Error::BadCloseLength),
            _ => {
                let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_valid() {
                    return Err(Error::InvalidCloseCode(code.0));
                }
                let mut utf8 = Utf8Validator::new();
                if utf8.feed(&payload[2..]) != Utf8State::Ok {
                    return Err(Error::InvalidUtf8);
                }
                Some(code)
            }
        };
        debug!(
            "close frame from {:?}, code {:?}",
            self.connection.peer_addr(),
            code
        );
        self.connection.set_state(State::Closing);
        if !self.connection.close_sent.swap(true, Ordering::SeqCst) {
            let echo = code.unwrap_or(CloseCode::NORMAL);
            let _ = self
                .connection
                .write_frame(Opcode::Close, true, &echo.to_be_bytes())
                .await;
        }
        Ok(Flow::Stop)
    }

    /// After a locally initiated close: keep reading only to see the peer's
    /// close reply (or EOF), discarding everything else.
    async fn drain_close_echo(&mut self) -> Result<(), Error> {
        debug!("draining {:?} for a close reply", self.connection.peer_addr());
        let _ = timeout(self.timeouts.message, async {
            loop {
                loop {
                    match FrameHeader::parse(&self.buf) {
                        Ok(Some((header, header_len))) => {
                            let Ok(payload_len) = usize::try_from(header.payload_len) else {
                                return;
                            };
                            let Some(frame_len) = header_len.checked_add(payload_len) else {
                                return;
                            };
                            if self.buf.len() < frame_len {
                                break;
                            }
                            self.buf.advance(frame_len);
                            if header.opcode == Opcode::Close {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => return,
                    }
                }
                match self.read.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        Ok(())
    }
}
