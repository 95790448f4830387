//! Run registry: launches wrappers, matches handshakes, drives timers and consoles.

mod console_pool;
mod listener;
mod timers;

pub use listener::HANDSHAKE_READ_TIMEOUT;

use crate::error::SupervisorError;
use crate::host::{
    CommandBuilder, ConsoleHandle, ConsoleReuse, ConsoleSink, RunKind, SettingsProvider,
};
use crate::process::{
    new_correlation_id, FinishCode, ProcessEvent, ProcessEventKind, ProcessState, ProcessTable,
    RemoteProcessWrapper, SocketNotice, SystemProcessTable,
};
use console_pool::ConsolePool;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use listener::{ControlListener, ListenerEvent};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use timers::SupervisoryTimer;
use tracing::{debug, error, info, warn};

/// Time a redirected child has to dial back before it is killed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Reap poll period for non-redirected children.
pub const DETACHED_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Prologue watch period.
pub const PROLOGUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const KILL_ALL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_ALL_LIMIT: Duration = Duration::from_secs(10);

const PROLOGUE_TIMEOUT_MESSAGE: &str = "Timeout: the process did not start; killing the process.";

/// One tracked launch.
#[derive(Debug)]
struct RunProcessEntry {
    kind: RunKind,
    wrapper: RemoteProcessWrapper,
    console: Option<ConsoleHandle>,
}

/// Redirected launch still waiting for its handshake.
#[derive(Debug)]
struct PrologueWatchEntry {
    correlation_id: String,
    started: Instant,
}

/// Owns every live launch and the control listener they dial back to.
///
/// Single-threaded by contract: the owner drives it with [`RunManager::pump`]
/// (or [`RunManager::tick`] for simulated time). Background threads only feed
/// channels; every state transition happens on the owner's thread.
pub struct RunManager {
    listener: ControlListener,
    entries: Vec<RunProcessEntry>,
    prologue_watch: Vec<PrologueWatchEntry>,
    consoles: ConsolePool,
    console_sink: Box<dyn ConsoleSink>,
    settings: Box<dyn SettingsProvider>,
    command_builder: Box<dyn CommandBuilder>,
    process_table: Arc<dyn ProcessTable + Sync>,
    events_tx: Sender<ProcessEvent>,
    events_rx: Receiver<ProcessEvent>,
    socket_tx: Sender<SocketNotice>,
    socket_rx: Receiver<SocketNotice>,
    finished_tx: Sender<(String, FinishCode)>,
    finished_rx: Receiver<(String, FinishCode)>,
    prologue_timer: SupervisoryTimer,
    detached_timer: SupervisoryTimer,
}

impl RunManager {
    /// Bind the loopback listener and start accepting connections.
    pub fn new(
        settings: Box<dyn SettingsProvider>,
        command_builder: Box<dyn CommandBuilder>,
        console_sink: Box<dyn ConsoleSink>,
    ) -> Result<Self, SupervisorError> {
        let listener = ControlListener::bind()?;
        let (events_tx, events_rx) = unbounded();
        let (socket_tx, socket_rx) = unbounded();
        let (finished_tx, finished_rx) = unbounded();
        info!(port = listener.port(), "run manager listening");
        Ok(Self {
            listener,
            entries: Vec::new(),
            prologue_watch: Vec::new(),
            consoles: ConsolePool::default(),
            console_sink,
            settings,
            command_builder,
            process_table: Arc::new(SystemProcessTable),
            events_tx,
            events_rx,
            socket_tx,
            socket_rx,
            finished_tx,
            finished_rx,
            prologue_timer: SupervisoryTimer::new(PROLOGUE_POLL_INTERVAL),
            detached_timer: SupervisoryTimer::new(DETACHED_POLL_INTERVAL),
        })
    }

    /// Replace the OS process table used for the descendant fallback.
    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable + Sync>) -> Self {
        self.process_table = table;
        self
    }

    /// Loopback port redirected children dial back to.
    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// `(correlation_id, code)` for every launch that finished, in order.
    pub fn finished_events(&self) -> Receiver<(String, FinishCode)> {
        self.finished_rx.clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn redirected_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.wrapper.is_redirected())
            .count()
    }

    pub fn is_tracked(&self, correlation_id: &str) -> bool {
        self.position(correlation_id).is_some()
    }

    pub fn state_of(&self, correlation_id: &str) -> Option<ProcessState> {
        self.entry(correlation_id).map(|entry| entry.wrapper.state())
    }

    /// Console assigned to a redirected launch.
    pub fn console_of(&self, correlation_id: &str) -> Option<ConsoleHandle> {
        self.entry(correlation_id).and_then(|entry| entry.console)
    }

    /// Whether timers still have work; a host may stop pumping when this is false
    /// and nothing is tracked.
    pub fn has_pending_timers(&self) -> bool {
        self.prologue_timer.is_armed() || self.detached_timer.is_armed()
    }

    /// Launch `script` with the redirection mode from its run parameters.
    pub fn run(&mut self, script: &Path, kind: RunKind) -> Result<String, SupervisorError> {
        let redirected = self.settings.run_parameters(script).redirected;
        self.launch(script, kind, redirected)
    }

    /// Register and start a launch; returns its correlation id.
    ///
    /// Spawn failures are reported on the launch's console (if any), the entry is
    /// dropped and no timer is armed.
    pub fn launch(
        &mut self,
        script: &Path,
        kind: RunKind,
        redirected: bool,
    ) -> Result<String, SupervisorError> {
        let correlation_id = new_correlation_id();
        let mut params = self.settings.run_parameters(script);
        params.redirected = redirected;

        let wrapper = RemoteProcessWrapper::new(
            correlation_id.clone(),
            script.to_path_buf(),
            redirected,
            self.listener.port(),
            self.events_tx.clone(),
            Arc::clone(&self.process_table),
        );
        let console = if redirected {
            let handle = self.assign_console(kind, &correlation_id);
            self.console_sink
                .append_message(handle, &format!("Starting {}...", script.display()));
            Some(handle)
        } else {
            None
        };
        self.entries.push(RunProcessEntry {
            kind,
            wrapper,
            console,
        });

        let index = self.entries.len() - 1;
        let started = self.entries[index]
            .wrapper
            .start(kind, self.command_builder.as_ref(), &params);
        if let Err(err) = started {
            self.entries.pop();
            match console {
                Some(handle) => self
                    .console_sink
                    .append_message(handle, &format!("Failed to start: {err}")),
                None => error!(%correlation_id, error = %err, "failed to start detached run"),
            }
            return Err(err);
        }

        let now = Instant::now();
        if redirected {
            self.prologue_watch.push(PrologueWatchEntry {
                correlation_id: correlation_id.clone(),
                started: now,
            });
            self.prologue_timer.arm_if_idle(now);
        } else {
            self.detached_timer.arm_if_idle(now);
        }
        debug!(%correlation_id, kind = %kind, redirected, script = %script.display(), "launch accepted");
        Ok(correlation_id)
    }

    /// Stop one redirected launch. Unknown and detached ids are ignored.
    pub fn kill(&mut self, correlation_id: &str) {
        let Some(index) = self.position(correlation_id) else {
            debug!(correlation_id, "kill for unknown run");
            return;
        };
        let entry = &mut self.entries[index];
        if !entry.wrapper.is_redirected() {
            return;
        }
        entry.wrapper.stop();
        self.drain_process_events();
    }

    /// Stop every redirected launch and wait until none is tracked.
    ///
    /// Entries that are still present when the bound expires are removed anyway.
    pub fn kill_all(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            if entry.wrapper.is_redirected() {
                entry.wrapper.stop();
            }
        }
        let deadline = Instant::now() + KILL_ALL_LIMIT;
        loop {
            self.drain();
            if self.redirected_count() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                let leftovers: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|entry| entry.wrapper.is_redirected())
                    .map(|entry| entry.wrapper.correlation_id().to_string())
                    .collect();
                for correlation_id in leftovers {
                    error!(%correlation_id, "run still tracked after kill_all; removing");
                    if let Some(index) = self.position(&correlation_id) {
                        self.finish_entry(index, FinishCode::Killed);
                    }
                }
                break;
            }
            thread::sleep(KILL_ALL_POLL_INTERVAL);
        }
    }

    /// Forward a line typed into a launch's console.
    pub fn user_input(&mut self, correlation_id: &str, text: &str) {
        match self.position(correlation_id) {
            Some(index) => self.entries[index].wrapper.user_input(text),
            None => debug!(correlation_id, "input for unknown run"),
        }
    }

    /// The host closed a console; never hand it out again.
    pub fn console_closed(&mut self, handle: ConsoleHandle) {
        self.consoles.remove(handle);
        for entry in &mut self.entries {
            if entry.console == Some(handle) {
                entry.console = None;
            }
        }
    }

    /// Wait up to `timeout` for activity, handle everything queued, then run due timers.
    ///
    /// Returns the number of events handled.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let wait = [self.prologue_timer.deadline(), self.detached_timer.deadline()]
            .into_iter()
            .flatten()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(timeout, Duration::min);

        let listener_rx = self.listener.events().clone();
        let socket_rx = self.socket_rx.clone();
        let events_rx = self.events_rx.clone();
        let mut handled = 0;
        select! {
            recv(listener_rx) -> event => {
                if let Ok(event) = event {
                    self.handle_listener_event(event);
                    handled += 1;
                }
            }
            recv(socket_rx) -> notice => {
                if let Ok(notice) = notice {
                    self.handle_socket_notice(notice);
                    handled += 1;
                }
            }
            recv(events_rx) -> event => {
                if let Ok(event) = event {
                    self.handle_process_event(event);
                    handled += 1;
                }
            }
            default(wait) => {}
        }
        handled += self.drain();
        self.tick(Instant::now());
        handled
    }

    /// Run the timers against `now`. Tests pass simulated time here.
    pub fn tick(&mut self, now: Instant) {
        if self.prologue_timer.fire_if_due(now) && self.check_prologues(now) {
            self.prologue_timer.arm_if_idle(now);
        }
        if self.detached_timer.fire_if_due(now) && self.poll_detached() {
            self.detached_timer.arm_if_idle(now);
        }
        self.drain_process_events();
    }

    fn drain(&mut self) -> usize {
        let mut handled = self.drain_process_events();
        loop {
            if let Ok(notice) = self.socket_rx.try_recv() {
                self.handle_socket_notice(notice);
            } else if let Ok(event) = self.listener.events().try_recv() {
                self.handle_listener_event(event);
            } else {
                break;
            }
            handled += 1 + self.drain_process_events();
        }
        handled
    }

    fn drain_process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_process_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Handshake {
                correlation_id,
                connection,
            } => {
                let Some(index) = self.position(&correlation_id) else {
                    warn!(%correlation_id, "handshake for unknown run; closing");
                    connection.close();
                    self.console_sink.status_message(&format!(
                        "Unsolicited connection to the run manager with unknown id {correlation_id}. Ignoring..."
                    ));
                    return;
                };
                let entry = &mut self.entries[index];
                match entry
                    .wrapper
                    .attach_connection(connection, self.socket_tx.clone())
                {
                    Ok(()) => {
                        if let Some(handle) = entry.console {
                            self.console_sink.append_message(handle, "Started");
                        }
                    }
                    Err(err) => warn!(%correlation_id, error = %err, "rejected handshake"),
                }
            }
            ListenerEvent::Unsolicited(text) => {
                warn!(diagnostic = %text, "unsolicited connection");
                self.console_sink.status_message(&text);
            }
        }
    }

    fn handle_socket_notice(&mut self, notice: SocketNotice) {
        match self.position(&notice.correlation_id) {
            Some(index) => self.entries[index].wrapper.handle_socket_event(notice.event),
            None => debug!(correlation_id = %notice.correlation_id, "socket notice for finished run"),
        }
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        let Some(index) = self.position(&event.correlation_id) else {
            debug!(correlation_id = %event.correlation_id, "event for finished run");
            return;
        };
        let console = self.entries[index].console;
        match event.kind {
            ProcessEventKind::Stdout(text) => {
                if let Some(handle) = console {
                    self.console_sink.append_stdout(handle, &text);
                }
            }
            ProcessEventKind::Stderr(text) => {
                if let Some(handle) = console {
                    self.console_sink.append_stderr(handle, &text);
                }
            }
            ProcessEventKind::InputRequest { prompt, echo } => {
                if let Some(handle) = console {
                    self.console_sink.prompt_input(handle, &prompt, echo);
                }
            }
            ProcessEventKind::Finished(code) => self.finish_entry(index, code),
        }
    }

    fn finish_entry(&mut self, index: usize, code: FinishCode) {
        let mut entry = self.entries.remove(index);
        let correlation_id = entry.wrapper.correlation_id().to_string();
        if matches!(code, FinishCode::Exited(_)) {
            entry.wrapper.reap();
        }
        if let Some(handle) = entry.console {
            let (message, tooltip) = finish_texts(code);
            self.console_sink.append_message(handle, &message);
            self.console_sink.notify_finished(handle, &tooltip);
        }
        self.prologue_watch
            .retain(|watch| watch.correlation_id != correlation_id);
        info!(%correlation_id, kind = %entry.kind, code = code.raw(), "run finished");
        // Observers are optional; a dropped receiver is fine.
        let _ = self.finished_tx.send((correlation_id, code));
    }

    /// Kill launches whose handshake is overdue; true while others still wait.
    fn check_prologues(&mut self, now: Instant) -> bool {
        let entries = &self.entries;
        let mut expired = Vec::new();
        let mut waiting = false;
        self.prologue_watch.retain(|watch| {
            let in_prologue = entries.iter().any(|entry| {
                entry.wrapper.correlation_id() == watch.correlation_id
                    && entry.wrapper.state() == ProcessState::Prologue
            });
            if !in_prologue {
                return false;
            }
            if now.saturating_duration_since(watch.started) > HANDSHAKE_TIMEOUT {
                expired.push(watch.correlation_id.clone());
                return false;
            }
            waiting = true;
            true
        });

        for correlation_id in expired {
            let Some(index) = self.position(&correlation_id) else {
                continue;
            };
            warn!(%correlation_id, "handshake timed out; killing");
            if let Some(handle) = self.entries[index].console {
                self.console_sink
                    .append_message(handle, PROLOGUE_TIMEOUT_MESSAGE);
            }
            self.entries[index].wrapper.stop();
        }
        waiting
    }

    /// Reap finished detached children; true while some are still running.
    fn poll_detached(&mut self) -> bool {
        let mut pending = false;
        let mut reaped = Vec::new();
        for entry in &mut self.entries {
            if entry.wrapper.is_redirected() {
                continue;
            }
            if entry.wrapper.wait_detached() {
                reaped.push(entry.wrapper.correlation_id().to_string());
            } else {
                pending = true;
            }
        }
        for correlation_id in reaped {
            if let Some(index) = self.position(&correlation_id) {
                let code = self.entries[index].wrapper.exit_code().unwrap_or(-1);
                self.finish_entry(index, FinishCode::Exited(code));
            }
        }
        pending
    }

    fn assign_console(&mut self, kind: RunKind, correlation_id: &str) -> ConsoleHandle {
        let policy = self.settings.console_reuse();
        let entries = &self.entries;
        let idle = self.consoles.find_idle(kind, policy, |owner| {
            entries
                .iter()
                .any(|entry| entry.wrapper.correlation_id() == owner)
        });
        match idle {
            Some(handle) => {
                self.console_sink.reuse_console(handle, correlation_id);
                if policy == ConsoleReuse::ClearAndReuse {
                    self.console_sink.clear(handle);
                }
                self.consoles.assign(handle, correlation_id);
                handle
            }
            None => {
                let handle = self.console_sink.create_console(kind, correlation_id);
                // Never handed out again, so not worth remembering.
                if policy != ConsoleReuse::NoReuse {
                    self.consoles.insert(handle, kind, correlation_id);
                }
                handle
            }
        }
    }

    fn position(&self, correlation_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.wrapper.correlation_id() == correlation_id)
    }

    fn entry(&self, correlation_id: &str) -> Option<&RunProcessEntry> {
        self.entries
            .iter()
            .find(|entry| entry.wrapper.correlation_id() == correlation_id)
    }
}

impl Drop for RunManager {
    fn drop(&mut self) {
        if self.redirected_count() > 0 {
            self.kill_all();
        }
    }
}

/// Console message and tooltip for a finish code.
fn finish_texts(code: FinishCode) -> (String, String) {
    match code {
        FinishCode::Killed => ("Script killed".to_string(), "killed".to_string()),
        FinishCode::Disconnected => (
            "Connection lost to the script process".to_string(),
            "connection lost".to_string(),
        ),
        FinishCode::Exited(value) => (
            format!("Script finished with exit code {value}"),
            format!("finished, exit code {value}"),
        ),
    }
}
