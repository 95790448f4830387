//! One supervised child process: spawn, control-channel routing, and kill escalation.

mod connection;
mod descendant;
mod wrapper;

pub use connection::{Connection, ConnectionWriter, HandshakeError, SocketEvent};
pub use descendant::{NoProcessTable, ProcessTable, ProcessTag, SystemProcessTable};
pub use wrapper::RemoteProcessWrapper;

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use uuid::Uuid;

/// How long `stop()` waits after SIGTERM before escalating to SIGKILL.
pub const BRUTAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);
/// Upper bound on waiting for the OS to report a killed or finished child.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Mint a fresh correlation id for one launch.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Numeric exit status: the exit code, or `128 + signal` for a signal death.
pub fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Lifecycle phase of a wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Redirected child spawned, handshake not seen yet.
    Prologue,
    /// Handshake matched; the control channel is live.
    Running,
    /// Non-redirected child; tracked only for reaping.
    Detached,
    /// Final state. Nothing leaves it.
    Terminated,
}

impl ProcessState {
    /// Lowercase label for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prologue => "prologue",
            Self::Running => "running",
            Self::Detached => "detached",
            Self::Terminated => "terminated",
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishCode {
    /// Exit code reported by the child or the OS.
    Exited(i32),
    /// Stopped by the supervisor.
    Killed,
    /// Control connection lost.
    Disconnected,
}

impl FinishCode {
    /// Raw sentinel for [`FinishCode::Killed`].
    pub const KILLED: i32 = -1_000_000;
    /// Raw sentinel for [`FinishCode::Disconnected`].
    pub const DISCONNECTED: i32 = -2_000_000;

    /// Finish code for an exit status reported by a child.
    ///
    /// `None` when the value does not fit an `i32` or falls in the band reserved
    /// for the sentinels (at or below [`FinishCode::KILLED`]).
    pub fn from_reported(code: i64) -> Option<Self> {
        i32::try_from(code)
            .ok()
            .filter(|code| *code > Self::KILLED)
            .map(Self::Exited)
    }

    /// Integer form; sentinels are far outside any OS exit status range.
    pub fn raw(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Killed => Self::KILLED,
            Self::Disconnected => Self::DISCONNECTED,
        }
    }
}

impl fmt::Display for FinishCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Killed => f.write_str("killed"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Something a wrapper observed that its owner must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    /// Child stdout chunk.
    Stdout(String),
    /// Child stderr chunk.
    Stderr(String),
    /// Child asked for a line of input.
    InputRequest {
        /// Prompt to display.
        prompt: String,
        /// Whether typed characters should be echoed.
        echo: bool,
    },
    /// The run is over. Emitted at most once per wrapper.
    Finished(FinishCode),
}

/// Event emitted by the wrapper owning `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    /// Launch the event belongs to.
    pub correlation_id: String,
    /// What happened.
    pub kind: ProcessEventKind,
}

/// Socket readiness notification tagged with its launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketNotice {
    /// Launch owning the socket.
    pub correlation_id: String,
    /// Line or close.
    pub event: SocketEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn correlation_ids_are_unique() {
        let ids: HashSet<String> = (0..256).map(|_| new_correlation_id()).collect();
        assert_eq!(ids.len(), 256);
        let id = new_correlation_id();
        let parsed = Uuid::parse_str(&id).expect("correlation id is a uuid");
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn sentinels_are_negative_and_distinct() {
        assert!(FinishCode::Killed.raw() < 0);
        assert!(FinishCode::Disconnected.raw() < 0);
        assert_ne!(FinishCode::Killed.raw(), FinishCode::Disconnected.raw());
        assert_eq!(FinishCode::Exited(0).raw(), 0);
        assert_eq!(FinishCode::Exited(-9).to_string(), "exit code -9");
    }

    #[cfg(unix)]
    #[test]
    fn signal_deaths_use_the_shell_encoding() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_status_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_status_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
        assert_eq!(exit_status_code(ExitStatus::from_raw(libc::SIGTERM)), 143);
    }

    #[test]
    fn reported_codes_never_collide_with_sentinels() {
        assert_eq!(FinishCode::from_reported(0), Some(FinishCode::Exited(0)));
        assert_eq!(FinishCode::from_reported(-15), Some(FinishCode::Exited(-15)));
        assert_eq!(FinishCode::from_reported(i64::from(FinishCode::KILLED)), None);
        assert_eq!(FinishCode::from_reported(i64::from(FinishCode::DISCONNECTED)), None);
        assert_eq!(FinishCode::from_reported(i64::from(i32::MAX) + 1), None);
    }
}
