//! Byte transports for the HTTP/1.1 engine.
//!
//! [`MemoryTransport`] is an in-memory duplex pipe: the full engine runs over
//! it without a socket, and tests hold the peer end directly. [`TcpTransport`]
//! adapts a non-blocking [`std::net::TcpStream`]. Both are polled by the pool
//! loop; neither ever blocks.

use crate::conn::{ConnectAttempt, ConnectError, ConnectProgress, ConnectionFactory};
use crate::engine::EngineConnection;
use crate::types::{SlotId, Time};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its writing side.
    Eof,
}

/// A non-blocking bidirectional byte stream.
pub trait ByteTransport {
    /// Reads available bytes into `buf`.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Writes as many bytes as currently fit. `Ok(0)` means "would block".
    fn try_write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Closes the writing side gracefully.
    fn close(&mut self);

    /// Tears the transport down immediately.
    fn abort(&mut self);
}

// =============================================================================
// MemoryTransport
// =============================================================================

/// One direction of the in-memory pipe.
#[derive(Debug, Default)]
struct PipeHalf {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex byte pipe.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: Arc<Mutex<PipeHalf>>,
    outgoing: Arc<Mutex<PipeHalf>>,
}

impl MemoryTransport {
    /// Creates a connected pair of pipe ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(PipeHalf::default()));
        let b_to_a = Arc::new(Mutex::new(PipeHalf::default()));
        (
            Self {
                incoming: Arc::clone(&b_to_a),
                outgoing: Arc::clone(&a_to_b),
            },
            Self {
                incoming: a_to_b,
                outgoing: b_to_a,
            },
        )
    }

    /// True once the peer closed its writing side and the buffer is drained.
    #[must_use]
    pub fn peer_closed(&self) -> bool {
        let half = self.incoming.lock();
        half.closed && half.buf.is_empty()
    }
}

impl ByteTransport for MemoryTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut half = self.incoming.lock();
        if half.buf.is_empty() {
            return Ok(if half.closed {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            });
        }
        let mut n = 0;
        while n < buf.len() {
            match half.buf.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(ReadOutcome::Data(n))
    }

    fn try_write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut half = self.outgoing.lock();
        if half.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        half.buf.extend(bytes);
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.outgoing.lock().closed = true;
    }

    fn abort(&mut self) {
        self.outgoing.lock().closed = true;
        self.incoming.lock().closed = true;
    }
}

/// Hands out server-side pipe ends for connections made by a
/// [`MemoryConnector`].
#[derive(Debug, Default, Clone)]
pub struct MemoryListener {
    pending: Arc<Mutex<VecDeque<MemoryTransport>>>,
}

impl MemoryListener {
    /// Creates an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the server end of the next established connection.
    pub fn accept(&self) -> Option<MemoryTransport> {
        self.pending.lock().pop_front()
    }

    /// A factory producing engine connections piped to this listener.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Connection factory over in-memory pipes.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pending: Arc<Mutex<VecDeque<MemoryTransport>>>,
}

/// An already-established in-memory connect.
pub struct MemoryConnectAttempt {
    conn: Option<EngineConnection<MemoryTransport>>,
}

impl ConnectAttempt for MemoryConnectAttempt {
    type Conn = EngineConnection<MemoryTransport>;

    fn poll(&mut self, _now: Time) -> ConnectProgress<Self::Conn> {
        match self.conn.take() {
            Some(conn) => ConnectProgress::Ready(conn),
            None => ConnectProgress::Failed(ConnectError::Refused(
                "memory connect polled twice".into(),
            )),
        }
    }
}

impl ConnectionFactory for MemoryConnector {
    type Conn = EngineConnection<MemoryTransport>;
    type Attempt = MemoryConnectAttempt;

    fn connect(&mut self, slot: SlotId, _now: Time) -> MemoryConnectAttempt {
        let (client, server) = MemoryTransport::pair();
        tracing::trace!(%slot, "memory connect");
        self.pending.lock().push_back(server);
        MemoryConnectAttempt {
            conn: Some(EngineConnection::new(client)),
        }
    }
}

// =============================================================================
// TcpTransport
// =============================================================================

/// Engine transport over a non-blocking TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps a stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ByteTransport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn try_write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.stream.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }

    fn abort(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Connection factory dialing a fixed address over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector for the given address.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_millis(250),
        }
    }

    /// Overrides the per-attempt connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// A TCP connect attempt, resolved on first poll.
pub struct TcpConnectAttempt {
    addr: SocketAddr,
    timeout: Duration,
    done: bool,
}

impl ConnectAttempt for TcpConnectAttempt {
    type Conn = EngineConnection<TcpTransport>;

    fn poll(&mut self, _now: Time) -> ConnectProgress<Self::Conn> {
        if self.done {
            return ConnectProgress::Failed(ConnectError::Refused(
                "tcp connect polled twice".into(),
            ));
        }
        self.done = true;
        match TcpStream::connect_timeout(&self.addr, self.timeout) {
            Ok(stream) => match TcpTransport::new(stream) {
                Ok(transport) => ConnectProgress::Ready(EngineConnection::new(transport)),
                Err(e) => ConnectProgress::Failed(ConnectError::Io(e)),
            },
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                ConnectProgress::Failed(ConnectError::TimedOut)
            }
            Err(e) => ConnectProgress::Failed(ConnectError::Io(e)),
        }
    }
}

impl ConnectionFactory for TcpConnector {
    type Conn = EngineConnection<TcpTransport>;
    type Attempt = TcpConnectAttempt;

    fn connect(&mut self, slot: SlotId, _now: Time) -> TcpConnectAttempt {
        tracing::trace!(%slot, addr = %self.addr, "tcp connect");
        TcpConnectAttempt {
            addr: self.addr,
            timeout: self.connect_timeout,
            done: false,
        }
    }
}
