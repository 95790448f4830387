//! Default command builder: redirected launches go through `runsup-client`.

use crate::error::SupervisorError;
use crate::host::{CommandBuilder, ControlEndpoint, LaunchCommand, RunKind, RunParameters};
use std::path::{Path, PathBuf};

/// Name of the client wrapper binary shipped next to `runsup`.
pub const CLIENT_BINARY: &str = "runsup-client";

/// Builds `<client> --port P --procuuid ID -- [interpreter] script args` for
/// redirected launches and `[interpreter] script args` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommandBuilder {
    client: PathBuf,
    interpreter: Option<String>,
}

impl ClientCommandBuilder {
    pub fn new(client: impl Into<PathBuf>) -> Self {
        Self {
            client: client.into(),
            interpreter: None,
        }
    }

    /// Client binary located next to the running executable.
    pub fn sibling_client() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe()?;
        let name = format!("{CLIENT_BINARY}{}", std::env::consts::EXE_SUFFIX);
        Ok(Self::new(exe.with_file_name(name)))
    }

    /// Interpreter command line, split with shell rules (`"python3 -u"`).
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn client(&self) -> &Path {
        &self.client
    }

    fn runnee_argv(&self, script: &Path, params: &RunParameters) -> Result<Vec<String>, SupervisorError> {
        let mut argv = match &self.interpreter {
            Some(interpreter) => shell_words::split(interpreter).map_err(|err| {
                SupervisorError::CommandBuild(format!("invalid interpreter `{interpreter}`: {err}"))
            })?,
            None => Vec::new(),
        };
        argv.push(script.display().to_string());
        argv.extend(params.arguments.iter().cloned());
        Ok(argv)
    }
}

impl CommandBuilder for ClientCommandBuilder {
    fn build_command(
        &self,
        _kind: RunKind,
        script: &Path,
        params: &RunParameters,
        endpoint: Option<&ControlEndpoint>,
    ) -> Result<LaunchCommand, SupervisorError> {
        let runnee = self.runnee_argv(script, params)?;
        let (program, args) = match endpoint {
            Some(endpoint) => {
                let mut args = vec![
                    "--port".to_string(),
                    endpoint.port.to_string(),
                    "--procuuid".to_string(),
                    endpoint.correlation_id.clone(),
                    "--".to_string(),
                ];
                args.extend(runnee);
                (self.client.display().to_string(), args)
            }
            None => {
                let mut runnee = runnee.into_iter();
                let program = runnee
                    .next()
                    .ok_or_else(|| SupervisorError::CommandBuild("empty command".to_string()))?;
                (program, runnee.collect())
            }
        };
        Ok(LaunchCommand {
            program,
            args,
            environment: params.environment.clone(),
            working_dir: params.working_dir.resolve(script),
        })
    }
}
