//! Error types for scriptexec-exec

use scriptexec_script::ScriptError;
use thiserror::Error;

/// Errors that can occur while building or driving a runner
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    /// Script could not be parsed or rendered
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Connection descriptor has no recognised `type`
    #[error("unknown connection type: {0:?}")]
    UnknownConnectionType(String),

    /// Connection descriptor fields are missing or malformed
    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    /// Failed to reach the remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote host rejected the credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Known-hosts store unusable, or host key not trusted
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// Remote session could not be opened on an established connection
    #[error("cannot open session: {0}")]
    SessionOpen(String),

    /// Local process could not be created
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Output pipe could not be provided
    #[error("cannot create pipe: {0}")]
    PipeSetup(String),

    /// Execution could not begin
    #[error("cannot start runner: {0}")]
    StartFailed(String),

    /// Started execution did not complete successfully
    #[error("runner failed with exit code {exit_code}: {reason}")]
    WaitFailed {
        /// Exit code, -1 when the script never reported one
        exit_code: i32,
        /// What went wrong
        reason: String,
    },

    /// Synchronous run did not complete successfully
    #[error("cannot execute runner (exit code {exit_code}): {reason}")]
    ExecutionFailed {
        /// Exit code, -1 when the script never reported one
        exit_code: i32,
        /// What went wrong
        reason: String,
    },

    /// Operation not allowed in the runner's current state
    #[error("invalid runner state: {0}")]
    InvalidState(String),
}

impl RunnerError {
    /// Exit code carried by this error
    ///
    /// Only execution failures carry the script's own status; everything
    /// else happened before the script could finish and reports -1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::WaitFailed { exit_code, .. }
            | RunnerError::ExecutionFailed { exit_code, .. } => *exit_code,
            _ => -1,
        }
    }

    /// Check if the remote channel could not be established
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RunnerError::ConnectionFailed(_)
                | RunnerError::AuthenticationFailed(_)
                | RunnerError::HostKey(_)
        )
    }

    /// Rewrap a start or wait failure as the error `run` reports
    pub(crate) fn into_execution(self) -> Self {
        match self {
            RunnerError::WaitFailed { exit_code, reason } => {
                RunnerError::ExecutionFailed { exit_code, reason }
            }
            RunnerError::StartFailed(reason) | RunnerError::Spawn(reason) => {
                RunnerError::ExecutionFailed {
                    exit_code: -1,
                    reason,
                }
            }
            other => other,
        }
    }
}
