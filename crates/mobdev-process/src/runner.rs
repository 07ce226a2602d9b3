use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use mobdev_traits::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError, ProcessHandle};

/// Finds `program` on `PATH`. Paths containing a separator are checked as given.
pub fn resolve_executable(program: &str) -> Result<PathBuf, ProcessError> {
    which::which(program).map_err(|_| ProcessError::NotFound(program.to_string()))
}

fn build_command(spec: &CommandSpec) -> Result<Command, ProcessError> {
    let program = resolve_executable(&spec.program)?;
    let mut cmd = Command::new(program);
    cmd.args(&spec.args);
    Ok(cmd)
}

/// A background process started by [`TokioCommandRunner::spawn`].
pub struct TokioProcessHandle {
    program: String,
    child: Child,
    finished: bool,
}

impl Drop for TokioProcessHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        info!("Terminating {} process...", self.program);
        if let Err(e) = self.child.start_kill() {
            error!("Failed to kill {} subprocess: {}", self.program, e);
        }
    }
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        if self.finished {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} exited with {}", self.program, status);
                self.finished = true;
                false
            }
            Err(e) => {
                error!("Failed to poll {} process: {}", self.program, e);
                false
            }
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        if self.finished {
            return Ok(());
        }
        self.child.kill().await?;
        self.finished = true;
        debug!("{} process stopped", self.program);
        Ok(())
    }
}

pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut cmd = build_command(spec)?;
        cmd.stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running command: {}", spec);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::Spawn(spec.program.clone(), e))?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(input.as_bytes()).await {
                    Ok(()) => {}
                    // The child closed stdin early; report its exit status instead.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        debug!("{} closed stdin before reading it all", spec.program);
                    }
                    Err(e) => return Err(e.into()),
                }
                // Dropping stdin closes the pipe so the child sees EOF.
            }
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(status = ?result.status, "{} finished", spec.program);
        Ok(result)
    }

    async fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut cmd = build_command(spec)?;
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        info!("Running interactive command: {}", spec);

        let status = cmd
            .status()
            .await
            .map_err(|e| ProcessError::Spawn(spec.program.clone(), e))?;

        Ok(CommandOutput {
            status: status.code(),
            ..Default::default()
        })
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut cmd = build_command(spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        info!("Spawning background command: {}", spec);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::Spawn(spec.program.clone(), e))?;

        Ok(Box::new(TokioProcessHandle {
            program: spec.program.clone(),
            child,
            finished: false,
        }))
    }
}
