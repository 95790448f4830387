//! `runsup` entrypoint: runs one script under the supervisor with a terminal console.
//!
//! # Architecture
//!
//! - Control thread (main): owns the `RunManager` and pumps its events
//! - Input thread: reads terminal lines and hands them to the control thread
//! - Background threads inside the manager: accept loop, handshakes, socket readers

mod cli;
mod signals;
mod terminal_console;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use runsup::telemetry::init_tracing;
use runsup::{ClientCommandBuilder, FinishCode, ProcessState, RunManager, SupervisorConfig};
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::Cli;
use crate::terminal_console::{restore_echo, TerminalConsole};

const PUMP_INTERVAL: Duration = Duration::from_millis(50);
/// Process exit code when the run was killed or lost its connection.
const ABNORMAL_EXIT_CODE: u8 = 1;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_config());
    match run(&cli) {
        Ok(code) => ExitCode::from(process_exit_code(code)),
        Err(err) => {
            eprintln!("runsup: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<FinishCode> {
    let mut config = SupervisorConfig::load(cli.config.as_deref()).context("loading config")?;
    cli.apply_to(&mut config);

    let builder = match &cli.client {
        Some(client) => ClientCommandBuilder::new(client),
        None => ClientCommandBuilder::sibling_client().context("locating runsup-client")?,
    }
    .with_interpreter(config.interpreter.clone());

    let mut manager = RunManager::new(
        Box::new(config),
        Box::new(builder),
        Box::new(TerminalConsole::stdio()),
    )
    .context("starting the run manager")?;
    signals::install_shutdown_handler()?;

    let finished = manager.finished_events();
    let correlation_id = manager
        .run(cli.script(), cli.kind.into())
        .with_context(|| format!("launching {}", cli.script().display()))?;
    info!(%correlation_id, port = manager.port(), "script launched");
    // Detached scripts read the terminal themselves.
    let input = match manager.console_of(&correlation_id) {
        Some(_) => Some(spawn_input_thread()?),
        None => None,
    };

    loop {
        if signals::take_shutdown() {
            debug!("shutdown requested");
            manager.kill_all();
        }
        manager.pump(PUMP_INTERVAL);
        // Lines typed before the handshake wait in the channel.
        if let Some(input) = &input {
            if manager.state_of(&correlation_id) == Some(ProcessState::Running) {
                while let Ok(line) = input.try_recv() {
                    manager.user_input(&correlation_id, &line);
                }
            }
        }
        while let Ok((finished_id, code)) = finished.try_recv() {
            if finished_id == correlation_id {
                return Ok(code);
            }
        }
    }
}

/// Terminal lines without their trailing newline. Ends quietly at EOF.
fn spawn_input_thread() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("runsup-input".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                restore_echo();
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning input thread")?;
    Ok(rx)
}

fn process_exit_code(code: FinishCode) -> u8 {
    match code {
        FinishCode::Exited(value) => u8::try_from(value.rem_euclid(256)).unwrap_or(ABNORMAL_EXIT_CODE),
        FinishCode::Killed | FinishCode::Disconnected => ABNORMAL_EXIT_CODE,
    }
}
