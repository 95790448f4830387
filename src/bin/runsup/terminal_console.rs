//! Console sink that writes a single run's output to the terminal.

#[cfg(unix)]
use crossterm::tty::IsTty;
use runsup::{ConsoleHandle, ConsoleSink, RunKind};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Set while a no-echo prompt has turned terminal echo off.
static ECHO_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Supervisor messages go to stderr with a prefix; runnee stdio goes to the
/// matching terminal stream unchanged.
pub(crate) struct TerminalConsole<O: Write, E: Write> {
    out: O,
    err: E,
    next_handle: u64,
}

impl TerminalConsole<io::Stdout, io::Stderr> {
    pub(crate) fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> TerminalConsole<O, E> {
    pub(crate) fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            next_handle: 0,
        }
    }

    fn write_out(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn write_err(&mut self, text: &str) {
        let _ = self.err.write_all(text.as_bytes());
        let _ = self.err.flush();
    }
}

impl<O: Write, E: Write> ConsoleSink for TerminalConsole<O, E> {
    fn create_console(&mut self, kind: RunKind, correlation_id: &str) -> ConsoleHandle {
        self.next_handle += 1;
        debug!(kind = %kind, correlation_id, handle = self.next_handle, "console created");
        ConsoleHandle(self.next_handle)
    }

    fn reuse_console(&mut self, handle: ConsoleHandle, correlation_id: &str) {
        debug!(handle = handle.0, correlation_id, "console reused");
    }

    fn clear(&mut self, _handle: ConsoleHandle) {}

    fn append_message(&mut self, _handle: ConsoleHandle, text: &str) {
        self.write_err(&format!("[runsup] {text}\n"));
    }

    fn append_stdout(&mut self, _handle: ConsoleHandle, text: &str) {
        self.write_out(text);
    }

    fn append_stderr(&mut self, _handle: ConsoleHandle, text: &str) {
        self.write_err(text);
    }

    fn prompt_input(&mut self, _handle: ConsoleHandle, prompt: &str, echo: bool) {
        self.write_out(prompt);
        if !echo && set_stdin_echo(false) {
            ECHO_SUPPRESSED.store(true, Ordering::SeqCst);
        }
    }

    fn notify_finished(&mut self, handle: ConsoleHandle, tooltip: &str) {
        debug!(handle = handle.0, tooltip, "console finished");
    }

    fn status_message(&mut self, text: &str) {
        self.write_err(&format!("[runsup] {text}\n"));
    }
}

/// Turn echo back on after a hidden line was read.
pub(crate) fn restore_echo() {
    if ECHO_SUPPRESSED.swap(false, Ordering::SeqCst) {
        set_stdin_echo(true);
        eprintln!();
    }
}

/// Toggle ECHO on the controlling terminal; false when stdin is not a tty.
///
/// Only ECHO changes: canonical line input and output processing stay as they
/// are, so the input thread keeps reading whole lines.
#[cfg(unix)]
fn set_stdin_echo(enabled: bool) -> bool {
    if !io::stdin().is_tty() {
        return false;
    }
    // SAFETY: termios is a plain C struct filled by tcgetattr before use, and both
    // calls only touch the stdin file descriptor, which outlives this call.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(libc::STDIN_FILENO, &mut termios) != 0 {
            return false;
        }
        termios.c_lflag = with_echo(termios.c_lflag, enabled);
        libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios) == 0
    }
}

#[cfg(unix)]
fn with_echo(lflag: libc::tcflag_t, enabled: bool) -> libc::tcflag_t {
    if enabled {
        lflag | libc::ECHO
    } else {
        lflag & !libc::ECHO
    }
}

#[cfg(not(unix))]
fn set_stdin_echo(_enabled: bool) -> bool {
    false
}
