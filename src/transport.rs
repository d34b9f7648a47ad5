//! Blocking TCP/TLS transport
//!
//! Connect uses a bounded deadline per address candidate (std performs the
//! non-blocking connect and readiness wait internally). Steady-state I/O is
//! blocking with short read slices so the protocol engine can interleave
//! heartbeats and stop checks without an async runtime.
//!
//! After the handshake the transport splits into a read half owned by the
//! worker and a write half serialized by the engine's send lock. Both halves
//! share one stream behind a mutex; the read half waits for readiness on the
//! raw socket first, so the lock is never held across an idle slice and
//! writers are not stalled behind a read.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use native_tls::{HandshakeError, TlsConnector, TlsStream};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Result of a sliced read
#[derive(Debug)]
pub enum RecvOutcome {
    /// `n` bytes were read into the caller's buffer
    Data(usize),
    /// The slice elapsed with nothing to read
    Idle,
    /// The peer closed the connection
    Closed,
}

enum Stream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Stream {
    fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn close_stream(raw: &TcpStream, io: &Mutex<Stream>) {
    if let Stream::Tls(tls) = &mut *io.lock() {
        let _ = tls.shutdown();
    }
    let _ = raw.shutdown(Shutdown::Both);
}

/// A connected transport, not yet split
pub struct Transport {
    reader: ReadHalf,
    writer: WriteHalf,
}

impl Transport {
    /// Resolve `host:port` and connect the first reachable candidate before
    /// `deadline`, then upgrade to TLS when requested (SNI is the host
    /// as-is; certificate verification follows the connector defaults).
    pub fn connect(host: &str, port: u16, use_tls: bool, deadline: Instant) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("resolve {host}: {e}")))?
            .collect();

        let mut last_err = Error::Transport(format!("no addresses for {host}"));
        let mut connected = None;
        for addr in addrs {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(Error::Timeout("tcp connect"));
            };
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => {
                    debug!(%addr, "tcp connected");
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    trace!(%addr, "connect candidate failed: {e}");
                    last_err = if e.kind() == io::ErrorKind::TimedOut {
                        Error::Timeout("tcp connect")
                    } else {
                        Error::Transport(format!("connect {addr}: {e}"))
                    };
                }
            }
        }
        let Some(tcp) = connected else {
            return Err(last_err);
        };
        let _ = tcp.set_nodelay(true);

        let raw = tcp
            .try_clone()
            .map_err(|e| Error::Transport(format!("clone socket: {e}")))?;

        let stream = if use_tls {
            // Bound the TLS handshake by the read timeout; mid-handshake
            // interruptions are retried until the deadline.
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout("tls handshake"))?;
            raw.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .map_err(|e| Error::Transport(e.to_string()))?;

            let connector =
                TlsConnector::new().map_err(|e| Error::Tls(format!("tls init: {e}")))?;
            let mut pending = connector.connect(host, tcp);
            let tls = loop {
                match pending {
                    Ok(stream) => break stream,
                    Err(HandshakeError::Failure(e)) => {
                        return Err(Error::Tls(format!("tls handshake: {e}")))
                    }
                    Err(HandshakeError::WouldBlock(mid)) => {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout("tls handshake"));
                        }
                        pending = mid.handshake();
                    }
                }
            };
            debug!(host, "tls session established");
            Stream::Tls(tls)
        } else {
            Stream::Plain(tcp)
        };

        let io = Arc::new(Mutex::new(stream));
        let raw_writer = raw
            .try_clone()
            .map_err(|e| Error::Transport(format!("clone socket: {e}")))?;

        Ok(Self {
            reader: ReadHalf {
                raw,
                io: Arc::clone(&io),
            },
            writer: WriteHalf {
                raw: raw_writer,
                io,
            },
        })
    }

    /// Write the whole buffer
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer.send_all(data)
    }

    /// Wait up to `timeout` for data and read what is available
    pub fn recv_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<RecvOutcome> {
        self.reader.recv_some(buf, timeout)
    }

    /// Best-effort TLS shutdown then socket close; safe to call repeatedly
    pub fn close(&self) {
        self.writer.close();
    }

    /// Split into the worker-owned read half and the serialized write half
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.reader, self.writer)
    }
}

/// Read half; the connection worker is its sole user
pub struct ReadHalf {
    raw: TcpStream,
    io: Arc<Mutex<Stream>>,
}

impl ReadHalf {
    /// Wait up to `timeout` for data, then read what is available.
    ///
    /// Returns `Idle` when the slice elapses so the caller can run periodic
    /// work between slices. TLS reads that surface transient
    /// want-read/want-write conditions count as `Idle` too.
    pub fn recv_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<RecvOutcome> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.raw
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Transport(format!("set read timeout: {e}")))?;

        // Readiness wait on the raw socket, outside the stream lock.
        let mut probe = [0u8; 1];
        match self.raw.peek(&mut probe) {
            Ok(0) => return Ok(RecvOutcome::Closed),
            Ok(_) => {}
            Err(e) if is_transient(&e) => return Ok(RecvOutcome::Idle),
            Err(e) => return Err(Error::Transport(format!("read failed: {e}"))),
        }

        let mut io = self.io.lock();
        let mut total = match io.read(buf) {
            Ok(0) => return Ok(RecvOutcome::Closed),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(RecvOutcome::Idle),
            Err(e) => return Err(Error::Transport(format!("read failed: {e}"))),
        };

        // OpenSSL may hold further decrypted records internally, invisible
        // to a socket readiness check. Drain them now with a short timeout
        // or they would sit unread until more bytes arrive on the wire.
        if io.is_tls() && total < buf.len() {
            let _ = self.raw.set_read_timeout(Some(Duration::from_millis(1)));
            while total < buf.len() {
                match io.read(&mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(_) => break,
                }
            }
        }

        Ok(RecvOutcome::Data(total))
    }
}

/// Write half; every write happens under the shared stream lock
pub struct WriteHalf {
    raw: TcpStream,
    io: Arc<Mutex<Stream>>,
}

impl WriteHalf {
    /// Write the whole buffer, retrying transient interruptions
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock();
        let mut written = 0;
        while written < data.len() {
            match io.write(&data[written..]) {
                Ok(0) => {
                    return Err(Error::Transport("connection closed during write".into()));
                }
                Ok(n) => written += n,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(Error::Transport(format!("write failed: {e}"))),
            }
        }
        Ok(())
    }

    /// Best-effort TLS shutdown then socket close; safe to call repeatedly
    pub fn close(&self) {
        close_stream(&self.raw, &self.io);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn deadline_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn connect_refused_is_transport_error() {
        // Port 1 is essentially never listening on loopback.
        let result = Transport::connect("127.0.0.1", 1, false, deadline_ms(1_000));
        assert!(matches!(result, Err(Error::Transport(_)) | Err(Error::Timeout(_))));
    }

    #[test]
    fn resolve_failure_is_transport_error() {
        let result = Transport::connect("host.invalid.", 80, false, deadline_ms(1_000));
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn recv_times_out_then_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(80));
            peer.write_all(b"late").unwrap();
            // Hold the socket open until the client has read.
            thread::sleep(Duration::from_millis(200));
        });

        let mut transport =
            Transport::connect("127.0.0.1", addr.port(), false, deadline_ms(1_000)).unwrap();
        let mut buf = [0u8; 64];

        match transport.recv_some(&mut buf, Duration::from_millis(20)).unwrap() {
            RecvOutcome::Idle => {}
            other => panic!("expected Idle, got {other:?}"),
        }

        loop {
            match transport.recv_some(&mut buf, Duration::from_millis(200)).unwrap() {
                RecvOutcome::Data(n) => {
                    assert_eq!(&buf[..n], b"late");
                    break;
                }
                RecvOutcome::Idle => continue,
                RecvOutcome::Closed => panic!("unexpected close"),
            }
        }
        server.join().unwrap();
    }

    #[test]
    fn recv_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        });

        let mut transport =
            Transport::connect("127.0.0.1", addr.port(), false, deadline_ms(1_000)).unwrap();
        server.join().unwrap();

        let mut buf = [0u8; 16];
        loop {
            match transport.recv_some(&mut buf, Duration::from_millis(100)).unwrap() {
                RecvOutcome::Closed => break,
                RecvOutcome::Idle => continue,
                RecvOutcome::Data(_) => panic!("no data was sent"),
            }
        }
    }

    #[test]
    fn send_all_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut received = vec![0u8; 5];
            peer.read_exact(&mut received).unwrap();
            received
        });

        let mut transport =
            Transport::connect("127.0.0.1", addr.port(), false, deadline_ms(1_000)).unwrap();
        transport.send_all(b"hello").unwrap();
        assert_eq!(server.join().unwrap(), b"hello");
        transport.close();
        transport.close(); // idempotent
    }
}
