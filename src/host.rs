//! Collaborator contracts the supervisor consumes from its host application.
//!
//! The run manager never renders anything and never persists settings itself:
//! consoles, run parameters, and command lines all come through these traits.

use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// What a launch does with the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Plain execution.
    Run,
    /// Execution under a profiler.
    Profile,
    /// Execution under a debugger.
    Debug,
}

impl RunKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Profile => "profile",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Console widget reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsoleReuse {
    /// Always create a fresh console.
    NoReuse,
    /// Reuse an idle console of the same kind, keeping its content.
    Reuse,
    /// Reuse an idle console of the same kind after clearing it.
    #[default]
    ClearAndReuse,
}

/// Where the child process starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkingDir {
    /// Directory containing the script.
    #[default]
    ScriptLocation,
    /// A fixed directory.
    Specific(PathBuf),
}

impl WorkingDir {
    /// Resolve the directory for `script`.
    pub fn resolve(&self, script: &Path) -> PathBuf {
        match self {
            Self::ScriptLocation => script
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            Self::Specific(dir) => dir.clone(),
        }
    }
}

/// Environment handed to the child.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    /// Inherit the supervisor's environment unchanged.
    #[default]
    Inherit,
    /// Inherit and then apply overrides.
    InheritWith(BTreeMap<String, String>),
    /// Start from an empty environment.
    Specific(BTreeMap<String, String>),
}

/// Per-script run parameters owned by the settings provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParameters {
    /// Tunnel stdio through the control channel.
    pub redirected: bool,
    /// Working directory choice.
    pub working_dir: WorkingDir,
    /// Script arguments.
    pub arguments: Vec<String>,
    /// Environment policy.
    pub environment: Environment,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            redirected: true,
            working_dir: WorkingDir::default(),
            arguments: Vec::new(),
            environment: Environment::default(),
        }
    }
}

/// Loopback endpoint a redirected child dials back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    /// Listener port on 127.0.0.1.
    pub port: u16,
    /// Correlation id the child must present in its handshake.
    pub correlation_id: String,
}

/// Fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Executable.
    pub program: String,
    /// Arguments after the executable.
    pub args: Vec<String>,
    /// Environment policy applied on spawn.
    pub environment: Environment,
    /// Working directory.
    pub working_dir: PathBuf,
}

impl LaunchCommand {
    /// Shell-quoted rendering for logs and diagnostics.
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

/// Builds the command line for a launch.
pub trait CommandBuilder {
    /// `endpoint` is present only for redirected launches.
    fn build_command(
        &self,
        kind: RunKind,
        script: &Path,
        params: &RunParameters,
        endpoint: Option<&ControlEndpoint>,
    ) -> Result<LaunchCommand, SupervisorError>;
}

/// Settings the supervisor reads on each launch.
pub trait SettingsProvider {
    /// Console reuse policy.
    fn console_reuse(&self) -> ConsoleReuse;
    /// Run parameters for `script`.
    fn run_parameters(&self, script: &Path) -> RunParameters;
}

/// Opaque handle to a console widget owned by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsoleHandle(pub u64);

/// Output surface for redirected runs.
///
/// All calls happen on the thread that owns the run manager.
pub trait ConsoleSink {
    /// Create a console for a new run.
    fn create_console(&mut self, kind: RunKind, correlation_id: &str) -> ConsoleHandle;
    /// An idle console is being handed to a new run.
    fn reuse_console(&mut self, handle: ConsoleHandle, correlation_id: &str);
    /// Drop the console content.
    fn clear(&mut self, handle: ConsoleHandle);
    /// Supervisor-originated message.
    fn append_message(&mut self, handle: ConsoleHandle, text: &str);
    /// Child stdout chunk.
    fn append_stdout(&mut self, handle: ConsoleHandle, text: &str);
    /// Child stderr chunk.
    fn append_stderr(&mut self, handle: ConsoleHandle, text: &str);
    /// The child asked for a line of input.
    fn prompt_input(&mut self, handle: ConsoleHandle, prompt: &str, echo: bool);
    /// The run owning this console is over.
    fn notify_finished(&mut self, handle: ConsoleHandle, tooltip: &str);
    /// Diagnostics not tied to any console (e.g. unsolicited connections).
    fn status_message(&mut self, _text: &str) {}
}
