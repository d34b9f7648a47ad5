//! Connection engine
//!
//! Owns the lifecycle of a single WebSocket connection: connect sequence,
//! the worker thread that reads frames and keeps the link alive, control
//! frame handling, the closing handshake, and callback dispatch.
//!
//! Concurrency model: one worker thread per connection reads exclusively;
//! every outbound frame (user sends, pongs, pings, close) is encoded and
//! written under a single send lock, so frames never interleave on the
//! wire. The worker wakes at least every 200ms to observe the stop flag
//! and heartbeat timers.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{encode_frame, Frame, FrameDecoder, OpCode};
use crate::handshake;
use crate::mask::generate_mask;
use crate::transport::{ReadHalf, RecvOutcome, Transport, WriteHalf};
use crate::url::Url;
use crate::{Config, MAX_FRAME_HEADER_SIZE, SMALL_PAYLOAD_MAX};

/// Receive slice; bounds worker reaction time to stop and heartbeat ticks
const RECV_SLICE: Duration = Duration::from_millis(200);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No connection
    Closed = 0,
    /// Connect sequence in progress
    Connecting = 1,
    /// Handshake complete, frames flowing
    Open = 2,
    /// Closing handshake in progress
    Closing = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            1 => State::Connecting,
            2 => State::Open,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

type OnOpen = Box<dyn Fn() + Send + Sync>;
type OnText = Box<dyn Fn(&str) + Send + Sync>;
type OnBinary = Box<dyn Fn(&[u8]) + Send + Sync>;
type OnClose = Box<dyn Fn(Option<&CloseReason>) + Send + Sync>;
type OnError = Box<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_open: Option<OnOpen>,
    on_text: Option<OnText>,
    on_binary: Option<OnBinary>,
    on_close: Option<OnClose>,
    on_error: Option<OnError>,
}

/// State shared between the owning client and its worker thread
struct Shared {
    config: Config,
    state: AtomicU8,
    stop: AtomicBool,
    /// The close callback fires at most once per connect cycle
    close_fired: AtomicBool,
    /// Register callbacks before `connect`; the lock exists so late
    /// registration is merely discouraged rather than undefined
    callbacks: RwLock<Callbacks>,
    /// Send lock; also the writer's home while connected
    writer: Mutex<Option<WriteHalf>>,
    /// When a ping went out and the pong is still due
    ping_pending: Mutex<Option<Instant>>,
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn cas_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Encode one masked frame and write it under the send lock
    fn send_frame(&self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(Error::NotOpen)?;
        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + payload.len());
        encode_frame(&mut buf, opcode, payload, fin, Some(generate_mask()));
        writer.send_all(&buf)
    }

    fn send_data(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.state() != State::Open {
            return Err(Error::NotOpen);
        }
        match &self.config.transform {
            Some(transform) => {
                let transformed = transform.compress(payload)?;
                self.send_frame(opcode, &transformed, true)
            }
            None => self.send_frame(opcode, payload, true),
        }
    }

    fn send_close(&self, code: u16, reason: &str) -> Result<()> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        self.send_frame(OpCode::Close, &payload, true)
    }

    fn mark_ping_sent(&self) {
        let mut pending = self.ping_pending.lock();
        if pending.is_none() {
            *pending = Some(Instant::now());
        }
    }

    fn close_transport(&self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.close();
        }
    }

    fn emit_open(&self) {
        if let Some(cb) = &self.callbacks.read().on_open {
            cb();
        }
    }

    fn emit_text(&self, text: &str) {
        if let Some(cb) = &self.callbacks.read().on_text {
            cb(text);
        }
    }

    fn emit_binary(&self, data: &[u8]) {
        if let Some(cb) = &self.callbacks.read().on_binary {
            cb(data);
        }
    }

    fn emit_error(&self, err: &Error) {
        if let Some(cb) = &self.callbacks.read().on_error {
            cb(err);
        }
    }

    fn emit_close(&self, reason: Option<&CloseReason>) {
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = &self.callbacks.read().on_close {
            cb(reason);
        }
    }
}

/// Blocking WebSocket client driving a single connection
///
/// The client owns the connection; dropping it disconnects. Send methods
/// take `&self` and may be called from any thread while the connection is
/// open; each call writes one whole frame atomically with respect to all
/// other senders and the worker.
pub struct WebSocketClient {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WebSocketClient {
    /// Create a client with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: AtomicU8::new(State::Closed as u8),
                stop: AtomicBool::new(false),
                close_fired: AtomicBool::new(false),
                callbacks: RwLock::new(Callbacks::default()),
                writer: Mutex::new(None),
                ping_pending: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Current connection state
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Called once when the connection reaches OPEN
    pub fn on_open(&mut self, cb: impl Fn() + Send + Sync + 'static) {
        self.shared.callbacks.write().on_open = Some(Box::new(cb));
    }

    /// Called for each complete text message, from the worker thread
    pub fn on_text(&mut self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.callbacks.write().on_text = Some(Box::new(cb));
    }

    /// Called for each complete binary message, from the worker thread
    pub fn on_binary(&mut self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.callbacks.write().on_binary = Some(Box::new(cb));
    }

    /// Called once when the connection reaches CLOSED, with the peer's
    /// close reason when one was received
    pub fn on_close(&mut self, cb: impl Fn(Option<&CloseReason>) + Send + Sync + 'static) {
        self.shared.callbacks.write().on_close = Some(Box::new(cb));
    }

    /// Called when the worker detects a failure after OPEN; the close
    /// callback still follows
    pub fn on_error(&mut self, cb: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared.callbacks.write().on_error = Some(Box::new(cb));
    }

    /// Connect to a `ws://` or `wss://` URL and start the worker.
    ///
    /// Blocks for up to the configured deadline across TCP connect, TLS,
    /// and the upgrade exchange. On success the state is OPEN and the open
    /// callback has fired; on failure the state is back to CLOSED and the
    /// outcome is returned without any callback.
    pub fn connect(&mut self, url: &str) -> Result<()> {
        if !self.shared.cas_state(State::Closed, State::Connecting) {
            return Err(Error::NotOpen);
        }
        // A previous cycle's worker has exited by now; reap the handle.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        match self.establish(url) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.close_transport();
                self.shared.set_state(State::Closed);
                Err(e)
            }
        }
    }

    fn establish(&mut self, url: &str) -> Result<()> {
        let url = Url::parse(url)?;
        if self.shared.config.extensions.contains_key("permessage-deflate") {
            return Err(Error::BadArgument(
                "permessage-deflate requires RSV1 negotiation, which the framing \
                 layer does not perform",
            ));
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.shared.config.timeout_ms);
        debug!(host = %url.host, port = url.port, secure = url.scheme.is_secure(), "connecting");

        let mut transport =
            Transport::connect(&url.host, url.port, url.scheme.is_secure(), deadline)?;
        let leftover = handshake::perform(&mut transport, &url, &self.shared.config, deadline)?;

        let (reader, writer) = transport.into_split();
        *self.shared.writer.lock() = Some(writer);
        *self.shared.ping_pending.lock() = None;
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.close_fired.store(false, Ordering::SeqCst);

        self.shared.set_state(State::Open);
        self.shared.emit_open();

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ws-worker".into())
            .spawn(move || worker_loop(shared, reader, leftover));
        match handle {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The reader went down with the failed spawn; surface the
                // close since OPEN was already observed.
                self.shared.close_transport();
                self.shared.set_state(State::Closed);
                self.shared.emit_close(None);
                Err(Error::Transport(format!("spawn worker: {e}")))
            }
        }
    }

    /// Send one final TEXT frame
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.shared.send_data(OpCode::Text, text.as_bytes())
    }

    /// Send one final BINARY frame
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.shared.send_data(OpCode::Binary, data)
    }

    /// Send a PING carrying up to 125 bytes of payload
    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > SMALL_PAYLOAD_MAX {
            return Err(Error::BadArgument("ping payload over 125 bytes"));
        }
        if self.shared.state() != State::Open {
            return Err(Error::NotOpen);
        }
        self.shared.send_frame(OpCode::Ping, payload, true)?;
        self.shared.mark_ping_sent();
        Ok(())
    }

    /// Close the connection.
    ///
    /// Initiates the closing handshake when open, then waits for the worker
    /// to exit and closes the transport. The close callback fires exactly
    /// once per connect cycle, here or from the worker, whichever is first.
    pub fn disconnect(&mut self) {
        let state = self.shared.state();
        if state == State::Closed {
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
            return;
        }

        if self.shared.cas_state(State::Open, State::Closing)
            && self.shared.send_close(CloseReason::NORMAL, "").is_err()
        {
            trace!("close frame could not be sent");
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.shared.close_transport();
        self.shared.set_state(State::Closed);
        self.shared.emit_close(None);
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reassembles fragmented data messages by concatenation
struct MessageAssembler {
    opcode: Option<OpCode>,
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageAssembler {
    fn new(max_message_size: usize) -> Self {
        Self {
            opcode: None,
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed one data frame; returns a complete message when one finishes
    fn push(&mut self, frame: Frame) -> Result<Option<(OpCode, Bytes)>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.opcode.is_some() {
                    return Err(Error::Protocol(
                        "data frame interleaved with fragmented message",
                    ));
                }
                if frame.fin {
                    return Ok(Some((frame.opcode, frame.payload)));
                }
                if frame.payload.len() > self.max_message_size {
                    return Err(Error::Protocol("fragmented message too large"));
                }
                self.opcode = Some(frame.opcode);
                self.buf.clear();
                self.buf.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let opcode = self
                    .opcode
                    .ok_or(Error::Protocol("continuation without a message in progress"))?;
                if self.buf.len() + frame.payload.len() > self.max_message_size {
                    return Err(Error::Protocol("fragmented message too large"));
                }
                self.buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.opcode = None;
                    Ok(Some((opcode, self.buf.split().freeze())))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }
}

enum LoopControl {
    Continue,
    PeerClosed(Option<CloseReason>),
}

fn worker_loop(shared: Arc<Shared>, mut reader: ReadHalf, leftover: Bytes) {
    let decoder = FrameDecoder::new(shared.config.max_frame_size);
    let mut assembler = MessageAssembler::new(shared.config.max_message_size);
    let mut recv_buf = BytesMut::with_capacity(8 * 1024);
    let mut tmp = [0u8; 4096];
    let mut last_ping = Instant::now();
    let mut peer_close: Option<CloseReason> = None;
    let mut failure: Option<Error> = None;

    // Frame bytes that rode in behind the upgrade response.
    if !leftover.is_empty() {
        recv_buf.extend_from_slice(&leftover);
        match drain_frames(&shared, &decoder, &mut recv_buf, &mut assembler) {
            Ok(LoopControl::Continue) => {}
            Ok(LoopControl::PeerClosed(reason)) => peer_close = reason,
            Err(e) => failure = Some(e),
        }
    }

    while failure.is_none() && !shared.stop.load(Ordering::SeqCst) {
        let interval = shared.config.ping_interval_ms;
        if interval > 0 && last_ping.elapsed() >= Duration::from_millis(interval) {
            trace!("heartbeat ping");
            if let Err(e) = shared.send_frame(OpCode::Ping, b"", true) {
                if shared.state() == State::Open {
                    failure = Some(e);
                }
                break;
            }
            shared.mark_ping_sent();
            last_ping = Instant::now();
        }

        let pong_timeout = shared.config.pong_timeout_ms;
        if pong_timeout > 0 {
            let expired = match *shared.ping_pending.lock() {
                Some(sent) => sent.elapsed() >= Duration::from_millis(pong_timeout),
                None => false,
            };
            if expired {
                failure = Some(Error::Timeout("pong not received in time"));
                break;
            }
        }

        match reader.recv_some(&mut tmp, RECV_SLICE) {
            Ok(RecvOutcome::Idle) => continue,
            Ok(RecvOutcome::Closed) => {
                if shared.state() == State::Open {
                    failure = Some(Error::Transport("connection closed by peer".into()));
                }
                break;
            }
            Ok(RecvOutcome::Data(n)) => {
                recv_buf.extend_from_slice(&tmp[..n]);
                match drain_frames(&shared, &decoder, &mut recv_buf, &mut assembler) {
                    Ok(LoopControl::Continue) => {}
                    Ok(LoopControl::PeerClosed(reason)) => {
                        peer_close = reason;
                        break;
                    }
                    Err(e) => {
                        if shared.state() == State::Open {
                            failure = Some(e);
                        }
                        break;
                    }
                }
            }
            Err(e) => {
                if shared.state() == State::Open {
                    failure = Some(e);
                }
                break;
            }
        }
    }

    if let Some(err) = &failure {
        warn!("connection failed: {err}");
        shared.emit_error(err);
        if matches!(err, Error::Protocol(_)) {
            let _ = shared.send_close(CloseReason::PROTOCOL_ERROR, "");
        }
    }

    shared.cas_state(State::Open, State::Closing);
    shared.close_transport();
    shared.set_state(State::Closed);
    shared.emit_close(peer_close.as_ref());
    debug!("worker exited");
}

/// Decode and dispatch every complete frame currently buffered
fn drain_frames(
    shared: &Shared,
    decoder: &FrameDecoder,
    recv_buf: &mut BytesMut,
    assembler: &mut MessageAssembler,
) -> Result<LoopControl> {
    while let Some(frame) = decoder.decode(recv_buf)? {
        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if let Some((opcode, payload)) = assembler.push(frame)? {
                    deliver(shared, opcode, payload)?;
                }
            }
            OpCode::Ping => {
                trace!(len = frame.payload.len(), "ping received, answering");
                shared.send_frame(OpCode::Pong, &frame.payload, true)?;
            }
            OpCode::Pong => {
                trace!("pong received");
                *shared.ping_pending.lock() = None;
            }
            OpCode::Close => {
                let reason = frame.parse_close()?;
                debug!(code = reason.as_ref().map(|r| r.code), "peer sent close");
                if shared.cas_state(State::Open, State::Closing) {
                    let code = reason.as_ref().map_or(CloseReason::NORMAL, |r| r.code);
                    let _ = shared.send_close(code, "");
                }
                shared.stop.store(true, Ordering::SeqCst);
                return Ok(LoopControl::PeerClosed(reason));
            }
        }
    }
    Ok(LoopControl::Continue)
}

/// Run the inbound transform and hand a complete message to its callback
fn deliver(shared: &Shared, opcode: OpCode, payload: Bytes) -> Result<()> {
    let payload = match &shared.config.transform {
        Some(transform) => Bytes::from(transform.decompress(&payload)?),
        None => payload,
    };
    match opcode {
        OpCode::Text => {
            let text = std::str::from_utf8(&payload)
                .map_err(|_| Error::Protocol("text message is not valid UTF-8"))?;
            shared.emit_text(text);
        }
        OpCode::Binary => shared.emit_binary(&payload),
        _ => {}
    }
    Ok(())
}
