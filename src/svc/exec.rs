//! # Execution module
//!
//! This module provides an abstraction to run external programs with a
//! cancellation token and its implementation on top of [`tokio::process`].

use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to spawn program '{0}', {1}")]
    Spawn(String, io::Error),
    #[error("failed to wait for program '{0}', {1}")]
    Wait(String, io::Error),
    #[error("program '{program}' exited with code {code:?}, {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("execution has been cancelled")]
    Cancelled,
    #[error("execution did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}

impl Error {
    /// returns if the error is due to the cancellation of the execution
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// -----------------------------------------------------------------------------
// Output structure

/// standard streams captured from a successful execution
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

// -----------------------------------------------------------------------------
// Executor trait

/// run a named program with arguments, an implementation must give up and
/// return [`Error::Cancelled`] as soon as the token is cancelled.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Output, Error>;
}

// -----------------------------------------------------------------------------
// Process structure

/// [`Executor`] which spawns a child process, the child is killed if the
/// execution is cancelled or runs out of time.
#[derive(Clone, Default, Debug)]
pub struct Process {
    timeout: Option<Duration>,
}

impl Process {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Output, Error> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Spawn(program.to_string(), err))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| Error::Wait(program.to_string(), err))?;

        if !output.status.success() {
            return Err(Error::Exit {
                program: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Output {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[async_trait]
impl Executor for Process {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, cancel, args)))]
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Output, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(program = program, "Spawn external program");
        let execution = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.spawn(program, args))
                    .await
                    .map_err(|_| Error::DeadlineExceeded(timeout))?,
                None => self.spawn(program, args).await,
            }
        };

        // dropping the execution future drops the child which kills it
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(program = program, "Execution cancelled, kill external program");
                Err(Error::Cancelled)
            }
            result = execution => result,
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
