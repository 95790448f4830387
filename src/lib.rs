//! Out-of-process script run supervisor with a loopback JSON-lines control channel.

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod host;
mod lock;
pub mod manager;
pub mod process;
pub mod process_signal;
pub mod protocol;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use client::{ClientError, ClientReader, ClientSender, RunClient};
pub use command::ClientCommandBuilder;
pub use config::{ConfigError, SupervisorConfig};
pub use error::SupervisorError;
pub use host::{
    CommandBuilder, ConsoleHandle, ConsoleReuse, ConsoleSink, ControlEndpoint, Environment,
    LaunchCommand, RunKind, RunParameters, SettingsProvider, WorkingDir,
};
pub use manager::RunManager;
pub use process::{FinishCode, ProcessState};
pub use protocol::{ControlMessage, ProtocolError};
