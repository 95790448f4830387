//! Loopback control listener: accepts children dialing back and performs the handshake.

use crate::error::SupervisorError;
use crate::process::{Connection, HandshakeError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on receiving the `proc-id-info` line from a fresh connection.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of one inbound connection, delivered to the control thread.
#[derive(Debug)]
pub(crate) enum ListenerEvent {
    /// Valid `proc-id-info`; the registry decides whether the id is known.
    Handshake {
        correlation_id: String,
        connection: Connection,
    },
    /// The peer sent something that is not a control message at all.
    Unsolicited(String),
}

pub(crate) struct ControlListener {
    port: u16,
    events: Receiver<ListenerEvent>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ControlListener {
    /// Bind an ephemeral loopback port and start accepting.
    pub(crate) fn bind() -> Result<Self, SupervisorError> {
        let listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).map_err(SupervisorError::Bind)?;
        listener.set_nonblocking(true).map_err(SupervisorError::Bind)?;
        let port = listener.local_addr().map_err(SupervisorError::Bind)?.port();

        let (tx, events) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("runsup-accept".to_string())
            .spawn(move || accept_loop(listener, tx, thread_shutdown))
            .map_err(SupervisorError::Bind)?;
        debug!(port, "control listener bound");
        Ok(Self {
            port,
            events,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn events(&self) -> &Receiver<ListenerEvent> {
        &self.events
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, tx: Sender<ListenerEvent>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name("runsup-handshake".to_string())
                    .spawn(move || handshake(stream, peer, &tx));
                if let Err(err) = spawned {
                    warn!(%peer, error = %err, "cannot spawn handshake thread; dropping connection");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("control listener stopped");
}

fn handshake(stream: TcpStream, peer: SocketAddr, tx: &Sender<ListenerEvent>) {
    let mut connection = match Connection::new(stream) {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%peer, error = %err, "cannot prepare inbound connection");
            return;
        }
    };
    match connection.read_handshake(HANDSHAKE_READ_TIMEOUT) {
        Ok(message) => {
            let event = ListenerEvent::Handshake {
                correlation_id: message.correlation_id,
                connection,
            };
            // A closed queue means the manager is gone; the connection drops with the event.
            let _ = tx.send(event);
        }
        Err(HandshakeError::Protocol(err)) => {
            connection.close();
            let _ = tx.send(ListenerEvent::Unsolicited(format!(
                "Unsolicited connection to the run manager ({err}). Ignoring..."
            )));
        }
        Err(err) => {
            warn!(%peer, error = %err, "handshake failed; closing connection");
            connection.close();
        }
    }
}
