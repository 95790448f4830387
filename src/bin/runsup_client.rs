//! `runsup-client`: the wrapper a redirected launch runs.
//!
//! Dials the supervisor, waits for `prologue-continue`, runs the real command with
//! piped stdio, and tunnels everything over the control channel.
//!
//! # Architecture
//!
//! - Main thread: spawns the runnee, waits for its exit, reports the exit code
//! - Stdout/stderr pumps: forward output chunks as `stdout`/`stderr` messages
//! - Control reader: writes `stdin` replies into the runnee and watches for `epilogue-exit`

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use runsup::process::exit_status_code;
use runsup::process_signal::terminate_with_escalation;
use runsup::protocol;
use runsup::telemetry::{init_tracing, LogConfig};
use runsup::{ClientError, ClientReader, ClientSender, RunClient};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitCode, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const CONTINUE_TIMEOUT: Duration = Duration::from_secs(15);
const EPILOGUE_TIMEOUT: Duration = Duration::from_secs(5);
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_GRACE: Duration = Duration::from_millis(200);
const PUMP_BUFFER_BYTES: usize = 4096;
/// Exit code reported when the runnee could not be started.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, Parser)]
#[command(name = "runsup-client", about = "Redirect a command's stdio to a runsup supervisor")]
struct Args {
    /// Supervisor control port on 127.0.0.1
    #[arg(long)]
    port: u16,

    /// Correlation id assigned by the supervisor
    #[arg(long)]
    procuuid: String,

    /// Write a JSON trace log (see RUNSUP_TRACE_LOG)
    #[arg(long, env = "RUNSUP_LOGS", default_value_t = false)]
    logs: bool,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug)]
enum ControlEvent {
    EpilogueExit,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&LogConfig {
        logs: args.logs,
        no_logs: false,
    });
    match run(&args) {
        Ok(code) => ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1)),
        Err(err) => {
            eprintln!("runsup-client: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<i32> {
    let mut client = RunClient::connect(args.port, &args.procuuid)
        .with_context(|| format!("connecting to the supervisor on port {}", args.port))?;
    client
        .wait_for_continue(CONTINUE_TIMEOUT)
        .context("waiting for prologue-continue")?;
    let (sender, reader) = client.into_split();

    let (program, program_args) = args
        .command
        .split_first()
        .context("missing command after `--`")?;
    let mut child = match Command::new(program)
        .args(program_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let _ = sender.send_stderr(&format!("runsup-client: cannot start `{program}`: {err}\n"));
            let (control_tx, control_rx) = unbounded();
            spawn_control_reader(reader, None, control_tx)?;
            report_exit(&sender, &control_rx, SPAWN_FAILURE_EXIT_CODE)?;
            return Ok(SPAWN_FAILURE_EXIT_CODE);
        }
    };
    debug!(pid = child.id(), program = %program, "runnee started");

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pump(stdout, sender.clone(), OutputStream::Stdout)?);
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pump(stderr, sender.clone(), OutputStream::Stderr)?);
    }
    let (control_tx, control_rx) = unbounded();
    spawn_control_reader(reader, child.stdin.take(), control_tx)?;

    let code = match wait_for_child(&mut child, &control_rx)? {
        Some(code) => code,
        None => {
            // Supervisor went away; nobody is left to report to.
            terminate(&mut child);
            return Ok(1);
        }
    };
    for pump in pumps {
        let _ = pump.join();
    }
    report_exit(&sender, &control_rx, code)?;
    Ok(code)
}

/// Exit code once the runnee exits, or `None` if the control channel closed first.
fn wait_for_child(child: &mut Child, control: &Receiver<ControlEvent>) -> Result<Option<i32>> {
    loop {
        if let Some(status) = child.try_wait().context("waiting for the runnee")? {
            return Ok(Some(exit_status_code(status)));
        }
        match control.recv_timeout(CHILD_POLL_INTERVAL) {
            Ok(ControlEvent::Closed) | Err(RecvTimeoutError::Disconnected) => return Ok(None),
            Ok(ControlEvent::EpilogueExit) | Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn report_exit(sender: &ClientSender, control: &Receiver<ControlEvent>, code: i32) -> Result<()> {
    sender
        .send_exit_code(code)
        .context("reporting the exit code")?;
    match control.recv_timeout(EPILOGUE_TIMEOUT) {
        Ok(ControlEvent::EpilogueExit) => Ok(()),
        Ok(ControlEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
            bail!("supervisor closed the channel before epilogue-exit")
        }
        Err(RecvTimeoutError::Timeout) => bail!("no epilogue-exit from the supervisor"),
    }
}

fn terminate(child: &mut Child) {
    if let Err(err) = terminate_with_escalation(child.id() as i32, KILL_GRACE) {
        warn!(pid = child.id(), error = %err, "cannot terminate runnee");
    }
    let _ = child.wait();
}

fn spawn_pump<R>(source: R, sender: ClientSender, stream: OutputStream) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("runsup-client-{stream:?}").to_lowercase())
        .spawn(move || pump_output(source, &sender, stream))
        .context("spawning output pump")
}

fn pump_output<R: Read>(mut source: R, sender: &ClientSender, stream: OutputStream) {
    let mut buf = [0_u8; PUMP_BUFFER_BYTES];
    let mut decoder = Utf8Chunker::default();
    loop {
        let read = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(?stream, error = %err, "output pump read failed");
                break;
            }
        };
        let text = decoder.push(&buf[..read]);
        if !text.is_empty() && send_chunk(sender, stream, &text).is_err() {
            return;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = send_chunk(sender, stream, &rest);
    }
}

fn send_chunk(sender: &ClientSender, stream: OutputStream, text: &str) -> io::Result<()> {
    match stream {
        OutputStream::Stdout => sender.send_stdout(text),
        OutputStream::Stderr => sender.send_stderr(text),
    }
}

fn spawn_control_reader(
    mut reader: ClientReader,
    mut stdin: Option<ChildStdin>,
    events: Sender<ControlEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name("runsup-client-control".to_string())
        .spawn(move || loop {
            match reader.next_message(None) {
                Ok(message) if message.method == protocol::METHOD_STDIN => {
                    let input = message.str_param("input").unwrap_or_default();
                    if let Some(pipe) = stdin.as_mut() {
                        if let Err(err) = writeln!(pipe, "{input}").and_then(|()| pipe.flush()) {
                            debug!(error = %err, "runnee stdin closed");
                            stdin = None;
                        }
                    }
                }
                Ok(message) if message.method == protocol::METHOD_EPILOGUE_EXIT => {
                    let _ = events.send(ControlEvent::EpilogueExit);
                    return;
                }
                Ok(message) => debug!(method = %message.method, "ignoring supervisor message"),
                Err(ClientError::Protocol(err)) => warn!(error = %err, "undecodable supervisor line"),
                Err(err) => {
                    debug!(error = %err, "control channel closed");
                    let _ = events.send(ControlEvent::Closed);
                    return;
                }
            }
        })
        .context("spawning control reader")?;
    Ok(())
}

/// Splits a byte stream into valid UTF-8 text without breaking multi-byte sequences.
#[derive(Debug, Default)]
struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    /// Decoded text so far; invalid bytes become U+FFFD and only a trailing
    /// incomplete sequence is held back.
    fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.carry;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => break,
                    }
                }
            }
        }
        let pending = rest.to_vec();
        self.carry = pending;
        text
    }

    fn finish(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.carry)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_holds_back_split_multibyte_sequence() {
        let mut chunker = Utf8Chunker::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(chunker.push(&bytes[..2]), "h");
        assert_eq!(chunker.push(&bytes[2..]), "éllo");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(chunker.push(&[0xe2, 0x82]), "");
        assert_eq!(chunker.finish(), "\u{fffd}");
    }

    #[test]
    fn chunker_keeps_split_sequence_after_invalid_byte() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[b'a', 0xff, 0xc3]), "a\u{fffd}");
        assert_eq!(chunker.push(&[0xa9]), "\u{e9}");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn args_require_command_after_separator() {
        let parsed = Args::try_parse_from(["runsup-client", "--port", "1", "--procuuid", "x", "--", "sh", "-c", "true"])
            .expect("parse");
        assert_eq!(parsed.command, ["sh", "-c", "true"]);
        assert!(Args::try_parse_from(["runsup-client", "--port", "1", "--procuuid", "x"]).is_err());
    }
}
