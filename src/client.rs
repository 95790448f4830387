//! Child side of the control protocol.
//!
//! A redirected runnee (or the wrapper that launches it) dials the supervisor,
//! identifies itself with `proc-id-info`, waits for `prologue-continue`, then
//! streams stdio until it reports its exit code.

use crate::lock::lock_or_recover;
use crate::protocol::{self, ControlMessage};
use serde_json::json;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure on the child side of the channel.
#[derive(Debug)]
pub enum ClientError {
    /// Socket failure.
    Io(io::Error),
    /// Undecodable supervisor line.
    Protocol(protocol::ProtocolError),
    /// Nothing arrived within the wait bound.
    Timeout,
    /// The supervisor closed the connection.
    Closed,
    /// A message arrived that the current step does not expect.
    Unexpected(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "control channel i/o failed: {err}"),
            Self::Protocol(err) => write!(f, "{err}"),
            Self::Timeout => write!(f, "timed out waiting for the supervisor"),
            Self::Closed => write!(f, "supervisor closed the control channel"),
            Self::Unexpected(method) => write!(f, "unexpected `{method}` from the supervisor"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Cloneable write half; safe to share between stdio pump threads.
#[derive(Clone)]
pub struct ClientSender {
    correlation_id: Arc<str>,
    stream: Arc<Mutex<TcpStream>>,
}

impl ClientSender {
    fn send(&self, method: &str, params: serde_json::Map<String, serde_json::Value>) -> io::Result<()> {
        let line = protocol::encode(method, &self.correlation_id, params);
        let mut stream = lock_or_recover(&self.stream, "client sender");
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }

    pub fn send_stdout(&self, text: &str) -> io::Result<()> {
        self.send(protocol::METHOD_STDOUT, protocol::params([("text", json!(text))]))
    }

    pub fn send_stderr(&self, text: &str) -> io::Result<()> {
        self.send(protocol::METHOD_STDERR, protocol::params([("text", json!(text))]))
    }

    /// Ask the supervisor for a line of input; the answer arrives as a `stdin` message.
    pub fn send_input_request(&self, prompt: &str, echo: bool) -> io::Result<()> {
        self.send(
            protocol::METHOD_STDIN,
            protocol::params([("prompt", json!(prompt)), ("echo", json!(echo))]),
        )
    }

    pub fn send_exit_code(&self, code: i32) -> io::Result<()> {
        self.send(
            protocol::METHOD_EPILOGUE_EXIT_CODE,
            protocol::params([("exitCode", json!(code))]),
        )
    }

    /// Send a raw line, bypassing the encoder.
    pub fn send_raw(&self, line: &str) -> io::Result<()> {
        let mut stream = lock_or_recover(&self.stream, "client sender");
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }

    /// Close the connection in both directions.
    pub fn shutdown(&self) {
        let stream = lock_or_recover(&self.stream, "client sender");
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Buffered read half that keeps partial lines across timed-out reads.
pub struct ClientReader {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
}

impl ClientReader {
    /// Next supervisor message; `None` timeout blocks indefinitely.
    pub fn next_message(&mut self, timeout: Option<Duration>) -> Result<ControlMessage, ClientError> {
        self.reader.get_ref().set_read_timeout(timeout)?;
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let raw = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&raw);
                    if line.trim().is_empty() {
                        continue;
                    }
                    return protocol::decode(&line).map_err(ClientError::Protocol);
                }
                Ok(_) => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ClientError::Timeout)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ClientError::Io(err)),
            }
        }
    }

    /// Wait for a specific method, failing on anything else.
    pub fn expect(&mut self, method: &str, timeout: Option<Duration>) -> Result<ControlMessage, ClientError> {
        let message = self.next_message(timeout)?;
        if message.method != method {
            return Err(ClientError::Unexpected(message.method));
        }
        Ok(message)
    }
}

/// Connected child-side endpoint.
pub struct RunClient {
    sender: ClientSender,
    reader: ClientReader,
}

impl RunClient {
    /// Dial the supervisor on loopback and send the handshake.
    pub fn connect(port: u16, correlation_id: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let client = Self {
            sender: ClientSender {
                correlation_id: Arc::from(correlation_id),
                stream: Arc::new(Mutex::new(stream)),
            },
            reader: ClientReader {
                reader,
                pending: Vec::new(),
            },
        };
        client
            .sender
            .send(protocol::METHOD_PROC_ID_INFO, serde_json::Map::new())?;
        Ok(client)
    }

    pub fn sender(&self) -> &ClientSender {
        &self.sender
    }

    pub fn reader(&mut self) -> &mut ClientReader {
        &mut self.reader
    }

    /// Block until the supervisor releases the prologue.
    pub fn wait_for_continue(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.reader
            .expect(protocol::METHOD_PROLOGUE_CONTINUE, Some(timeout))
            .map(|_| ())
    }

    /// Request a line of input and wait for the supervisor's answer.
    pub fn request_input(&mut self, prompt: &str, echo: bool) -> Result<String, ClientError> {
        self.sender.send_input_request(prompt, echo)?;
        let reply = self.reader.expect(protocol::METHOD_STDIN, None)?;
        reply
            .str_param("input")
            .map(ToString::to_string)
            .map_err(ClientError::Protocol)
    }

    /// Report the exit code and wait for the supervisor's `epilogue-exit`.
    pub fn finish(&mut self, code: i32, timeout: Duration) -> Result<(), ClientError> {
        self.sender.send_exit_code(code)?;
        loop {
            let message = self.reader.next_message(Some(timeout))?;
            if message.method == protocol::METHOD_EPILOGUE_EXIT {
                return Ok(());
            }
        }
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (ClientSender, ClientReader) {
        (self.sender, self.reader)
    }
}
