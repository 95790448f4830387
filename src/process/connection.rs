//! Control-socket plumbing: bounded handshake reads, the line reader thread, and writes.

use crate::protocol::{self, ControlMessage};
use crossbeam_channel::Sender;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

/// Longest handshake line accepted before the peer is considered hostile.
const MAX_HANDSHAKE_LINE_BYTES: usize = 64 * 1024;
/// Longest control line accepted from an attached child.
const MAX_CONTROL_LINE_BYTES: usize = 1024 * 1024;

/// Result of one [`read_bounded_line`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    /// `buf` ends with a newline.
    Line,
    /// The peer closed; `buf` holds any partial trailing line.
    Eof,
    /// More than the limit arrived without a newline.
    TooLong,
}

/// Append one line to `buf`, never buffering more than `limit + 1` bytes.
fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    loop {
        let budget = (limit + 1).saturating_sub(buf.len()) as u64;
        match reader.by_ref().take(budget).read_until(b'\n', buf) {
            Ok(_) if buf.ends_with(b"\n") => return Ok(LineRead::Line),
            Ok(_) if buf.len() > limit => return Ok(LineRead::TooLong),
            Ok(_) => return Ok(LineRead::Eof),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Readiness notifications produced by a connection's reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One complete line (newline stripped).
    Line(String),
    /// The peer closed the socket or the read failed.
    Closed,
}

/// An accepted control connection.
///
/// The reader keeps whatever bytes arrived after the handshake line, so handing
/// the connection to a wrapper loses nothing that was already received.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.writer.peer_addr().ok())
            .finish()
    }
}

/// Why an inbound connection was not matched to a launch.
#[derive(Debug)]
pub enum HandshakeError {
    /// No complete line within the bound.
    Timeout,
    /// Socket error during the handshake.
    Io(io::Error),
    /// The line did not decode.
    Protocol(protocol::ProtocolError),
    /// A well-formed message other than `proc-id-info`.
    UnexpectedMethod(String),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "handshake timed out"),
            Self::Io(err) => write!(f, "handshake i/o failed: {err}"),
            Self::Protocol(err) => write!(f, "handshake rejected: {err}"),
            Self::UnexpectedMethod(method) => write!(
                f,
                "unexpected `{method}` at the handshake stage, expected `{}`",
                protocol::METHOD_PROC_ID_INFO
            ),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl Connection {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Read the handshake line within `timeout` and check it is `proc-id-info`.
    pub fn read_handshake(&mut self, timeout: Duration) -> Result<ControlMessage, HandshakeError> {
        let line = self.read_line_within(timeout)?;
        let message = protocol::decode(&line).map_err(HandshakeError::Protocol)?;
        if message.method != protocol::METHOD_PROC_ID_INFO {
            return Err(HandshakeError::UnexpectedMethod(message.method));
        }
        Ok(message)
    }

    fn read_line_within(&mut self, timeout: Duration) -> Result<String, HandshakeError> {
        if timeout.is_zero() {
            return Err(HandshakeError::Timeout);
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(HandshakeError::Io)?;
        let mut buf = Vec::new();
        match read_bounded_line(&mut self.reader, &mut buf, MAX_HANDSHAKE_LINE_BYTES) {
            Ok(LineRead::Line) => {}
            Ok(LineRead::Eof) => {
                return Err(HandshakeError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed before the handshake",
                )))
            }
            Ok(LineRead::TooLong) => {
                return Err(HandshakeError::Io(io::Error::new(
                    ErrorKind::InvalidData,
                    "handshake line too long",
                )))
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(HandshakeError::Timeout)
            }
            Err(err) => return Err(HandshakeError::Io(err)),
        }
        self.reader
            .get_ref()
            .set_read_timeout(None)
            .map_err(HandshakeError::Io)?;
        String::from_utf8(buf).map_err(|err| {
            HandshakeError::Protocol(protocol::ProtocolError::Malformed(err.to_string()))
        })
    }

    /// Split into a writer and a reader thread that forwards lines through `notify`.
    ///
    /// `wrap` turns each socket event into the caller's event type so the reader can
    /// feed a shared queue.
    pub fn start_reading<E, F>(self, notify: Sender<E>, wrap: F) -> ConnectionWriter
    where
        E: Send + 'static,
        F: Fn(SocketEvent) -> E + Send + 'static,
    {
        let Connection { mut reader, writer } = self;
        let spawn_result = thread::Builder::new()
            .name("runsup-control-reader".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                loop {
                    match read_bounded_line(&mut reader, &mut buf, MAX_CONTROL_LINE_BYTES) {
                        Ok(LineRead::Line) => {
                            let line = String::from_utf8_lossy(&buf)
                                .trim_end_matches(['\n', '\r'])
                                .to_string();
                            buf.clear();
                            if line.is_empty() {
                                continue;
                            }
                            if notify.send(wrap(SocketEvent::Line(line))).is_err() {
                                return;
                            }
                        }
                        // A partial trailing line at EOF has nothing complete to deliver.
                        Ok(LineRead::Eof) | Err(_) => break,
                        Ok(LineRead::TooLong) => {
                            tracing::warn!(limit = MAX_CONTROL_LINE_BYTES, "control line too long; closing");
                            break;
                        }
                    }
                }
                let _ = notify.send(wrap(SocketEvent::Closed));
            });
        if let Err(err) = spawn_result {
            tracing::error!(error = %err, "cannot spawn control reader thread");
        }
        ConnectionWriter {
            stream: Some(writer),
        }
    }

    /// Close both directions, ignoring errors.
    pub fn close(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// Write half of an attached connection.
#[derive(Debug)]
pub struct ConnectionWriter {
    stream: Option<TcpStream>,
}

impl ConnectionWriter {
    /// Send one encoded line.
    pub fn send(&mut self, line: &str) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection detached"));
        };
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }

    /// Whether the socket is still attached.
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Shut the socket down; the reader thread then observes EOF and exits.
    pub fn detach(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for ConnectionWriter {
    fn drop(&mut self) {
        self.detach();
    }
}
