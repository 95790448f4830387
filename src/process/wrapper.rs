use super::connection::{Connection, ConnectionWriter, SocketEvent};
use super::descendant::{ProcessTable, ProcessTag};
use super::{
    exit_status_code, FinishCode, ProcessEvent, ProcessEventKind, ProcessState, SocketNotice,
    BRUTAL_SHUTDOWN_TIMEOUT, GRACEFUL_SHUTDOWN_TIMEOUT,
};
use crate::error::SupervisorError;
use crate::host::{CommandBuilder, ControlEndpoint, Environment, RunKind, RunParameters};
#[cfg(unix)]
use crate::process_signal::signal_group_then_pid;
use crate::process_signal::terminate_with_escalation;
use crate::protocol::{self, ControlMessage};
use crossbeam_channel::Sender;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Owns one child process and, once the handshake matched, its control socket.
///
/// Every method runs on the manager's control thread. Outcomes are reported as
/// [`ProcessEvent`]s on the owner's queue rather than handled inline, so the owner
/// may react to `Finished` after `stop()` has fully returned.
pub struct RemoteProcessWrapper {
    correlation_id: String,
    script: PathBuf,
    redirected: bool,
    server_port: u16,
    state: ProcessState,
    child: Option<Child>,
    connection: Option<ConnectionWriter>,
    exit_code: Option<i32>,
    finished: bool,
    events: Sender<ProcessEvent>,
    process_table: Arc<dyn ProcessTable + Sync>,
}

impl std::fmt::Debug for RemoteProcessWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcessWrapper")
            .field("correlation_id", &self.correlation_id)
            .field("script", &self.script)
            .field("redirected", &self.redirected)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

impl RemoteProcessWrapper {
    /// Create a wrapper; nothing is spawned until [`RemoteProcessWrapper::start`].
    pub fn new(
        correlation_id: String,
        script: PathBuf,
        redirected: bool,
        server_port: u16,
        events: Sender<ProcessEvent>,
        process_table: Arc<dyn ProcessTable + Sync>,
    ) -> Self {
        let state = if redirected {
            ProcessState::Prologue
        } else {
            ProcessState::Detached
        };
        Self {
            correlation_id,
            script,
            redirected,
            server_port,
            state,
            child: None,
            connection: None,
            exit_code: None,
            finished: false,
            events,
            process_table,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn is_redirected(&self) -> bool {
        self.redirected
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// OS exit status collected by [`RemoteProcessWrapper::wait_detached`] or a reap.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Spawn the child from the command builder's result.
    pub fn start(
        &mut self,
        kind: RunKind,
        builder: &dyn CommandBuilder,
        params: &RunParameters,
    ) -> Result<(), SupervisorError> {
        if self.child.is_some() || self.state == ProcessState::Terminated {
            return Err(SupervisorError::InvalidState {
                operation: "start",
                state: self.state.as_str(),
            });
        }
        let endpoint = self.redirected.then(|| ControlEndpoint {
            port: self.server_port,
            correlation_id: self.correlation_id.clone(),
        });
        let launch = builder.build_command(kind, &self.script, params, endpoint.as_ref())?;
        let command_line = launch.command_line();

        let mut command = Command::new(&launch.program);
        command.args(&launch.args).current_dir(&launch.working_dir);
        match &launch.environment {
            Environment::Inherit => {}
            Environment::InheritWith(overrides) => {
                command.envs(overrides);
            }
            Environment::Specific(vars) => {
                command.env_clear().envs(vars);
            }
        }
        if self.redirected {
            // The runnee's stdio is tunneled over the control channel.
            command.stdin(Stdio::null());
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
        }

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command_line: command_line.clone(),
            source,
        })?;
        debug!(
            correlation_id = %self.correlation_id,
            pid = child.id(),
            kind = %kind,
            command_line = %command_line,
            "spawned child"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Hand over the matched control connection and release the child from its prologue.
    pub fn attach_connection(
        &mut self,
        connection: Connection,
        notify: Sender<SocketNotice>,
    ) -> Result<(), SupervisorError> {
        if self.state != ProcessState::Prologue || self.connection.is_some() {
            let state = self.state.as_str();
            connection.close();
            return Err(SupervisorError::InvalidState {
                operation: "attach_connection",
                state,
            });
        }
        let correlation_id = self.correlation_id.clone();
        let writer = connection.start_reading(notify, move |event| SocketNotice {
            correlation_id: correlation_id.clone(),
            event,
        });
        self.connection = Some(writer);
        self.state = ProcessState::Running;
        self.send(protocol::METHOD_PROLOGUE_CONTINUE, serde_json::Map::new());
        Ok(())
    }

    /// Route a readiness notification from this wrapper's reader thread.
    pub fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Line(line) => self.handle_line(&line),
            SocketEvent::Closed => self.on_disconnected(),
        }
    }

    fn handle_line(&mut self, line: &str) {
        if self.state != ProcessState::Running {
            return;
        }
        let message = match protocol::decode(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(correlation_id = %self.correlation_id, error = %err, "ignoring client line");
                return;
            }
        };
        if message.correlation_id != self.correlation_id {
            warn!(
                correlation_id = %self.correlation_id,
                received = %message.correlation_id,
                method = %message.method,
                "ignoring message for another launch"
            );
            return;
        }
        if let Err(err) = self.dispatch(&message) {
            warn!(correlation_id = %self.correlation_id, error = %err, "ignoring client message");
        }
    }

    fn dispatch(&mut self, message: &ControlMessage) -> Result<(), protocol::ProtocolError> {
        match message.method.as_str() {
            protocol::METHOD_EPILOGUE_EXIT_CODE => {
                let code = FinishCode::from_reported(message.int_param("exitCode")?).ok_or(
                    protocol::ProtocolError::InvalidParam {
                        method: message.method.clone(),
                        key: "exitCode",
                    },
                )?;
                self.send(protocol::METHOD_EPILOGUE_EXIT, serde_json::Map::new());
                self.state = ProcessState::Terminated;
                self.emit_finished(code);
            }
            protocol::METHOD_STDOUT => {
                let text = message.str_param("text")?.to_string();
                self.emit(ProcessEventKind::Stdout(text));
            }
            protocol::METHOD_STDERR => {
                let text = message.str_param("text")?.to_string();
                self.emit(ProcessEventKind::Stderr(text));
            }
            protocol::METHOD_STDIN => {
                let prompt = message.str_param("prompt")?.to_string();
                let echo = message.bool_param("echo")?;
                self.emit(ProcessEventKind::InputRequest { prompt, echo });
            }
            other => {
                debug!(correlation_id = %self.correlation_id, method = other, "unrecognized method");
            }
        }
        Ok(())
    }

    /// Forward a collected input line to the child.
    pub fn user_input(&mut self, text: &str) {
        if self.state != ProcessState::Running {
            return;
        }
        self.send(
            protocol::METHOD_STDIN,
            protocol::params([("input", json!(text))]),
        );
    }

    /// Best-effort termination. Idempotent; `Finished(Killed)` is emitted at most once
    /// and never after another finish was already reported.
    pub fn stop(&mut self) {
        self.detach_connection();
        self.kill();
        self.state = ProcessState::Terminated;
        self.emit_finished(FinishCode::Killed);
    }

    fn on_disconnected(&mut self) {
        if self.state != ProcessState::Running {
            return;
        }
        debug!(correlation_id = %self.correlation_id, "control connection closed");
        self.detach_connection();
        self.kill();
        self.state = ProcessState::Terminated;
        self.emit_finished(FinishCode::Disconnected);
    }

    /// Non-blocking reap for detached children; true once the OS process is gone.
    pub fn wait_detached(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_status_code(status));
                self.child = None;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(correlation_id = %self.correlation_id, error = %err, "detached wait failed");
                self.child = None;
                true
            }
        }
    }

    /// Wait (bounded) for a child that reported its exit code; kill it if it lingers.
    pub fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match wait_for_exit(child, GRACEFUL_SHUTDOWN_TIMEOUT) {
                Some(status) => {
                    self.exit_code = Some(exit_status_code(status));
                    self.child = None;
                }
                None => {
                    warn!(
                        correlation_id = %self.correlation_id,
                        "child lingered after reporting its exit code"
                    );
                    self.kill();
                }
            }
        }
        self.detach_connection();
    }

    fn send(&mut self, method: &str, params: serde_json::Map<String, serde_json::Value>) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let line = protocol::encode(method, &self.correlation_id, params);
        if let Err(err) = connection.send(&line) {
            warn!(correlation_id = %self.correlation_id, method, error = %err, "control send failed");
        }
    }

    fn detach_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.detach();
        }
    }

    fn tag(&self) -> Option<ProcessTag> {
        self.redirected.then(|| ProcessTag {
            port: self.server_port,
            correlation_id: self.correlation_id.clone(),
        })
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            terminate_child(child, &self.correlation_id);
        }

        if let Some(tag) = self.tag() {
            let mut previous = None;
            while let Some(pid) = self.process_table.find_descendant_by_tag(&tag) {
                if previous == Some(pid) {
                    error!(correlation_id = %self.correlation_id, pid, "runnee survived kill");
                    break;
                }
                debug!(correlation_id = %self.correlation_id, pid, "killing tagged runnee");
                if let Err(err) = terminate_with_escalation(pid, BRUTAL_SHUTDOWN_TIMEOUT) {
                    warn!(correlation_id = %self.correlation_id, pid, error = %err, "kill failed");
                }
                previous = Some(pid);
            }
        }

        if let Some(child) = self.child.as_mut() {
            match wait_for_exit(child, GRACEFUL_SHUTDOWN_TIMEOUT) {
                Some(status) => self.exit_code = Some(exit_status_code(status)),
                None => error!(
                    correlation_id = %self.correlation_id,
                    pid = child.id(),
                    "child did not exit after kill"
                ),
            }
        }
        self.child = None;
    }

    fn emit(&self, kind: ProcessEventKind) {
        let event = ProcessEvent {
            correlation_id: self.correlation_id.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(correlation_id = %self.correlation_id, "event queue closed");
        }
    }

    fn emit_finished(&mut self, code: FinishCode) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(ProcessEventKind::Finished(code));
    }
}

/// SIGTERM the child (group first), give it the brutal grace, then SIGKILL.
fn terminate_child(child: &mut Child, correlation_id: &str) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    let pid = child.id() as i32;
    #[cfg(unix)]
    {
        if let Err(err) = signal_group_then_pid(pid, libc::SIGTERM) {
            warn!(correlation_id, pid, error = %err, "SIGTERM failed");
        }
        if wait_for_exit(child, BRUTAL_SHUTDOWN_TIMEOUT).is_some() {
            return;
        }
        if let Err(err) = signal_group_then_pid(pid, libc::SIGKILL) {
            warn!(correlation_id, pid, error = %err, "SIGKILL failed");
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = child.kill() {
            warn!(correlation_id, pid, error = %err, "kill failed");
        }
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => {
                debug!(pid = child.id(), error = %err, "try_wait failed");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests;
