//! Persistent supervisor settings: console reuse and per-script run parameters.
//!
//! Settings live in `~/.config/runsup/config.toml`. A missing file is not an
//! error; every field has a default.

use crate::host::{ConsoleReuse, RunParameters, SettingsProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Failure to read or parse a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Parse(msg) => write!(f, "TOML parse error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// On-disk settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Console reuse policy for redirected runs.
    pub console_reuse: ConsoleReuse,
    /// Interpreter command placed before the script, e.g. `"python3 -u"`.
    pub interpreter: Option<String>,
    /// Parameters for scripts without an override.
    pub run: RunParameters,
    /// Overrides keyed by the script path as written on launch.
    pub scripts: BTreeMap<String, RunParameters>,
}

/// Default config location (`~/.config/runsup/config.toml`).
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("runsup").join("config.toml"))
}

impl SupervisorConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Load `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(format!("{}: {err}", path.display()))),
        }
    }

    /// Load from `path` when given, else from [`config_path`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match config_path() {
                Some(path) => Self::load_from(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Replace the parameters used for `script`.
    pub fn set_run_parameters(&mut self, script: &Path, params: RunParameters) {
        self.scripts.insert(script_key(script), params);
    }
}

fn script_key(script: &Path) -> String {
    script.display().to_string()
}

impl SettingsProvider for SupervisorConfig {
    fn console_reuse(&self) -> ConsoleReuse {
        self.console_reuse
    }

    fn run_parameters(&self, script: &Path) -> RunParameters {
        self.scripts
            .get(&script_key(script))
            .cloned()
            .unwrap_or_else(|| self.run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Environment, WorkingDir};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_path(suffix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("runsup-config-{suffix}-{nanos}.toml"))
    }

    #[test]
    fn empty_text_gives_defaults() {
        let config = SupervisorConfig::parse("").expect("parse");
        assert_eq!(config, SupervisorConfig::default());
        assert_eq!(config.console_reuse, ConsoleReuse::ClearAndReuse);
        assert!(config.run.redirected);
    }

    #[test]
    fn parses_policy_and_script_overrides() {
        let text = r#"
console_reuse = "no-reuse"
interpreter = "python3 -u"

[run]
arguments = ["--verbose"]

[scripts."tools/gen.py"]
redirected = false
working_dir = { specific = "/srv" }
environment = { inherit-with = { MODE = "fast" } }
"#;
        let config = SupervisorConfig::parse(text).expect("parse");
        assert_eq!(config.console_reuse(), ConsoleReuse::NoReuse);
        assert_eq!(config.interpreter.as_deref(), Some("python3 -u"));

        let default_params = config.run_parameters(Path::new("main.py"));
        assert!(default_params.redirected);
        assert_eq!(default_params.arguments, vec!["--verbose".to_string()]);

        let overridden = config.run_parameters(Path::new("tools/gen.py"));
        assert!(!overridden.redirected);
        assert_eq!(overridden.working_dir, WorkingDir::Specific(PathBuf::from("/srv")));
        assert_eq!(
            overridden.environment,
            Environment::InheritWith(BTreeMap::from([("MODE".to_string(), "fast".to_string())]))
        );
    }

    #[test]
    fn rejects_unknown_reuse_policy() {
        let err = SupervisorConfig::parse("console_reuse = \"sometimes\"").expect_err("invalid");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = unique_path("missing");
        assert_eq!(
            SupervisorConfig::load_from(&path).expect("defaults"),
            SupervisorConfig::default()
        );
    }

    #[test]
    fn saved_overrides_load_back() {
        let path = unique_path("saved");
        let mut config = SupervisorConfig::default();
        config.set_run_parameters(
            Path::new("a.py"),
            RunParameters {
                redirected: false,
                ..RunParameters::default()
            },
        );
        std::fs::write(&path, config.to_toml().expect("serialize")).expect("write");
        let loaded = SupervisorConfig::load(Some(&path)).expect("load");
        let _ = std::fs::remove_file(&path);
        assert!(!loaded.run_parameters(Path::new("a.py")).redirected);
        assert!(loaded.run_parameters(Path::new("b.py")).redirected);
    }

    #[test]
    fn config_path_ends_with_runsup_config() {
        if let Some(path) = config_path() {
            assert!(path.ends_with("runsup/config.toml") || path.ends_with("runsup\\config.toml"));
        }
    }
}
