use std::fmt;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Executable '{0}' was not found in PATH")]
    NotFound(String),
    #[error("Failed to spawn '{0}': {1}")]
    Spawn(String, std::io::Error),
    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("'{program}' exited with status {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Timeout waiting for port {port} to open on {host} after {waited_ms} ms.")]
    Timeout {
        port: u16,
        host: String,
        waited_ms: u128,
    },
}

/// A command line to run, with optional text fed to its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// A background process. Implementations kill the process when dropped.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;
    /// False once the process has exited or been killed.
    fn is_alive(&mut self) -> bool;
    async fn kill(&mut self) -> Result<(), ProcessError>;
}

/// Runs external command-line tools on behalf of the services.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion and captures stdout and stderr.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    /// Runs attached to the user's terminal. Only the exit status is reported.
    async fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError>;

    /// Like `output`, but a non-zero exit becomes `ProcessError::Failed`.
    async fn checked_output(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let output = self.output(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ProcessError::Failed {
                program: spec.program.clone(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}
