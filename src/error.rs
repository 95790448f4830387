//! Error taxonomy shared by the codec, the process wrapper, and the run manager.

use crate::protocol::ProtocolError;
use std::io;

/// Errors surfaced synchronously to callers of the supervisor API.
#[derive(Debug)]
pub enum SupervisorError {
    /// The command builder refused to produce a command line.
    CommandBuild(String),
    /// The OS refused to create the child process.
    Spawn {
        /// Rendered command line that failed to start.
        command_line: String,
        /// Underlying OS error.
        source: io::Error,
    },
    /// A control message could not be decoded or encoded.
    Protocol(ProtocolError),
    /// A wrapper operation was called in a state that does not allow it.
    InvalidState {
        /// Operation that was rejected.
        operation: &'static str,
        /// State the wrapper was in.
        state: &'static str,
    },
    /// The loopback control listener could not be bound.
    Bind(io::Error),
    /// Control-channel I/O failed.
    Io(io::Error),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandBuild(reason) => write!(f, "cannot build command: {reason}"),
            Self::Spawn {
                command_line,
                source,
            } => write!(f, "failed to spawn `{command_line}`: {source}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::InvalidState { operation, state } => {
                write!(f, "{operation} is not allowed in the {state} state")
            }
            Self::Bind(err) => write!(f, "cannot bind the control listener: {err}"),
            Self::Io(err) => write!(f, "control channel i/o failed: {err}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Protocol(err) => Some(err),
            Self::Bind(err) | Self::Io(err) => Some(err),
            Self::CommandBuild(_) | Self::InvalidState { .. } => None,
        }
    }
}

impl From<ProtocolError> for SupervisorError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<io::Error> for SupervisorError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
