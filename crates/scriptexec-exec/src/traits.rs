//! Runner trait

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::stream::BoxedWriter;

/// Upper bound on each teardown step in [`Runner::close`]
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Channel open, nothing executed yet
    Constructed,
    /// Script is executing
    Started,
    /// Script finished, successfully or not
    Completed,
    /// Resources released; the runner cannot be used again
    Closed,
}

/// One-shot execution of a rendered script
///
/// Drive a runner in one sequence: construct, attach writers or take pipes,
/// then either [`Runner::run`] or [`Runner::start`] followed by
/// [`Runner::wait`], and finally [`Runner::close`].
#[async_trait]
pub trait Runner: Send {
    /// Send stdout to `writer` (replaces an earlier pipe for stdout)
    fn set_stdout_writer(&mut self, writer: BoxedWriter);

    /// Send stderr to `writer` (replaces an earlier pipe for stderr)
    fn set_stderr_writer(&mut self, writer: BoxedWriter);

    /// Stream stdout as it is produced
    ///
    /// Only for use with `start`/`wait`. Read the pipe before or concurrently
    /// with `wait`; it reaches EOF once the script exits.
    ///
    /// # Errors
    /// Returns `RunnerError::PipeSetup` if the runner already started or the
    /// pipe was already taken
    fn stdout_pipe(&mut self) -> Result<DuplexStream, RunnerError>;

    /// Stream stderr as it is produced, see [`Runner::stdout_pipe`]
    ///
    /// # Errors
    /// Returns `RunnerError::PipeSetup` if the runner already started or the
    /// pipe was already taken
    fn stderr_pipe(&mut self) -> Result<DuplexStream, RunnerError>;

    /// Start and wait in one call
    ///
    /// # Errors
    /// Returns `RunnerError::ExecutionFailed` if the script exits non-zero or
    /// the channel fails
    async fn run(&mut self) -> Result<(), RunnerError>;

    /// Begin execution without waiting for it to complete
    ///
    /// # Errors
    /// Returns `RunnerError::StartFailed` or `RunnerError::Spawn` if the
    /// channel cannot begin executing
    async fn start(&mut self) -> Result<(), RunnerError>;

    /// Wait for a started execution to complete
    ///
    /// The exit code is updated before this returns, on every path.
    ///
    /// # Errors
    /// Returns `RunnerError::WaitFailed` if the script exits non-zero, is
    /// cancelled, or the channel fails
    async fn wait(&mut self) -> Result<(), RunnerError>;

    /// Terminate execution if still running and release the channel
    ///
    /// Idempotent; teardown failures are logged, not returned.
    async fn close(&mut self);

    /// Last known exit code, -1 until the script reports one
    fn exit_code(&self) -> i32;

    /// Current lifecycle state
    fn state(&self) -> RunnerState;

    /// Token that aborts an in-flight execution when cancelled
    fn cancellation_token(&self) -> CancellationToken;

    /// Backend name for logging
    fn runner_type(&self) -> &'static str;
}
