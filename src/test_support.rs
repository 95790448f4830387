//! Fakes for the host collaborators, shared by unit tests across modules.

use crate::error::SupervisorError;
use crate::host::{
    CommandBuilder, ConsoleHandle, ConsoleReuse, ConsoleSink, ControlEndpoint, Environment,
    LaunchCommand, RunKind, RunParameters, SettingsProvider,
};
use crate::lock::lock_or_recover;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Launches a fixed argv regardless of the script, recording the endpoint it saw.
pub(crate) struct ArgvBuilder {
    argv: Vec<String>,
    pub(crate) endpoints: Mutex<Vec<Option<ControlEndpoint>>>,
}

impl ArgvBuilder {
    pub(crate) fn new(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(ToString::to_string).collect(),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    #[cfg(unix)]
    pub(crate) fn sleep(seconds: u32) -> Self {
        Self::new(&["sleep", &seconds.to_string()])
    }
}

impl CommandBuilder for ArgvBuilder {
    fn build_command(
        &self,
        _kind: RunKind,
        _script: &Path,
        _params: &RunParameters,
        endpoint: Option<&ControlEndpoint>,
    ) -> Result<LaunchCommand, SupervisorError> {
        lock_or_recover(&self.endpoints, "argv builder").push(endpoint.cloned());
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| SupervisorError::CommandBuild("empty argv".to_string()))?;
        Ok(LaunchCommand {
            program: program.clone(),
            args: args.to_vec(),
            environment: Environment::Inherit,
            working_dir: PathBuf::from("."),
        })
    }
}

/// Settings with fixed answers.
pub(crate) struct FixedSettings {
    pub(crate) reuse: ConsoleReuse,
    pub(crate) redirected: bool,
}

impl SettingsProvider for FixedSettings {
    fn console_reuse(&self) -> ConsoleReuse {
        self.reuse
    }

    fn run_parameters(&self, _script: &Path) -> RunParameters {
        RunParameters {
            redirected: self.redirected,
            ..RunParameters::default()
        }
    }
}

/// One observable console call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCall {
    Created(ConsoleHandle, RunKind),
    Reused(ConsoleHandle),
    Cleared(ConsoleHandle),
    Message(ConsoleHandle, String),
    Stdout(ConsoleHandle, String),
    Stderr(ConsoleHandle, String),
    Prompt(ConsoleHandle, String, bool),
    Finished(ConsoleHandle, String),
    Status(String),
}

/// Console sink that records every call; clones share the same log.
#[derive(Clone, Default)]
pub(crate) struct RecordingConsole {
    calls: Arc<Mutex<Vec<ConsoleCall>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl RecordingConsole {
    pub(crate) fn calls(&self) -> Vec<ConsoleCall> {
        lock_or_recover(&self.calls, "recording console").clone()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConsoleCall::Message(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ConsoleCall) {
        lock_or_recover(&self.calls, "recording console").push(call);
    }
}

impl ConsoleSink for RecordingConsole {
    fn create_console(&mut self, kind: RunKind, _correlation_id: &str) -> ConsoleHandle {
        let handle = {
            let mut next = lock_or_recover(&self.next_handle, "recording console");
            *next += 1;
            ConsoleHandle(*next)
        };
        self.record(ConsoleCall::Created(handle, kind));
        handle
    }

    fn reuse_console(&mut self, handle: ConsoleHandle, _correlation_id: &str) {
        self.record(ConsoleCall::Reused(handle));
    }

    fn clear(&mut self, handle: ConsoleHandle) {
        self.record(ConsoleCall::Cleared(handle));
    }

    fn append_message(&mut self, handle: ConsoleHandle, text: &str) {
        self.record(ConsoleCall::Message(handle, text.to_string()));
    }

    fn append_stdout(&mut self, handle: ConsoleHandle, text: &str) {
        self.record(ConsoleCall::Stdout(handle, text.to_string()));
    }

    fn append_stderr(&mut self, handle: ConsoleHandle, text: &str) {
        self.record(ConsoleCall::Stderr(handle, text.to_string()));
    }

    fn prompt_input(&mut self, handle: ConsoleHandle, prompt: &str, echo: bool) {
        self.record(ConsoleCall::Prompt(handle, prompt.to_string(), echo));
    }

    fn notify_finished(&mut self, handle: ConsoleHandle, tooltip: &str) {
        self.record(ConsoleCall::Finished(handle, tooltip.to_string()));
    }

    fn status_message(&mut self, text: &str) {
        self.record(ConsoleCall::Status(text.to_string()));
    }
}
