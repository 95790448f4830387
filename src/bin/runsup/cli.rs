//! CLI flag schema for running one script under the supervisor.

use clap::{ArgAction, Parser, ValueEnum};
use runsup::telemetry::LogConfig;
use runsup::{ConsoleReuse, RunKind, SupervisorConfig, WorkingDir};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub(crate) enum KindArg {
    #[default]
    Run,
    Profile,
    Debug,
}

impl From<KindArg> for RunKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Run => RunKind::Run,
            KindArg::Profile => RunKind::Profile,
            KindArg::Debug => RunKind::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ReuseArg {
    NoReuse,
    Reuse,
    ClearAndReuse,
}

impl From<ReuseArg> for ConsoleReuse {
    fn from(reuse: ReuseArg) -> Self {
        match reuse {
            ReuseArg::NoReuse => ConsoleReuse::NoReuse,
            ReuseArg::Reuse => ConsoleReuse::Reuse,
            ReuseArg::ClearAndReuse => ConsoleReuse::ClearAndReuse,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "runsup", version, about = "Run a script under an out-of-process supervisor")]
pub(crate) struct Cli {
    /// Script to run
    pub(crate) script: PathBuf,

    /// Arguments passed to the script, after `--`
    #[arg(last = true)]
    pub(crate) args: Vec<String>,

    /// Launch kind
    #[arg(long, value_enum, default_value_t = KindArg::Run)]
    pub(crate) kind: KindArg,

    /// Interpreter placed before the script (e.g. "python3 -u")
    #[arg(long, env = "RUNSUP_INTERPRETER")]
    pub(crate) interpreter: Option<String>,

    /// Run without stdio redirection; the supervisor only reaps the process
    #[arg(long, action = ArgAction::SetTrue)]
    pub(crate) detached: bool,

    /// Working directory (defaults to the script's directory)
    #[arg(long)]
    pub(crate) cwd: Option<PathBuf>,

    /// Console reuse policy override
    #[arg(long, value_enum)]
    pub(crate) console_reuse: Option<ReuseArg>,

    /// Path to the runsup-client binary (defaults to the one next to runsup)
    #[arg(long, env = "RUNSUP_CLIENT")]
    pub(crate) client: Option<PathBuf>,

    /// Config file (defaults to ~/.config/runsup/config.toml)
    #[arg(long, env = "RUNSUP_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Write a JSON trace log (see RUNSUP_TRACE_LOG)
    #[arg(long, env = "RUNSUP_LOGS", default_value_t = false)]
    pub(crate) logs: bool,

    /// Disable all logging, overriding --logs
    #[arg(long, default_value_t = false)]
    pub(crate) no_logs: bool,
}

impl Cli {
    pub(crate) fn log_config(&self) -> LogConfig {
        LogConfig {
            logs: self.logs,
            no_logs: self.no_logs,
        }
    }

    /// Fold command-line overrides into the loaded settings for this script.
    pub(crate) fn apply_to(&self, config: &mut SupervisorConfig) {
        if let Some(reuse) = self.console_reuse {
            config.console_reuse = reuse.into();
        }
        if self.interpreter.is_some() {
            config.interpreter = self.interpreter.clone();
        }
        let mut params = runsup::SettingsProvider::run_parameters(&*config, &self.script);
        if self.detached {
            params.redirected = false;
        }
        if let Some(cwd) = &self.cwd {
            params.working_dir = WorkingDir::Specific(cwd.clone());
        }
        if !self.args.is_empty() {
            params.arguments = self.args.clone();
        }
        config.set_run_parameters(&self.script, params);
    }

    pub(crate) fn script(&self) -> &Path {
        &self.script
    }
}
