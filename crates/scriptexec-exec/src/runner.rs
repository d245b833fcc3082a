//! Backend dispatch and the one-call `run` helper

use scriptexec_script::ScriptSource;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::connection::Connection;
use crate::error::RunnerError;
use crate::local::LocalRunner;
use crate::ssh::SshRunner;
use crate::stream::BoxedWriter;
use crate::traits::Runner;

/// Optional sinks for [`run`]; unset streams are discarded
#[derive(Default)]
pub struct RunOutput {
    /// Destination for stdout
    pub stdout: Option<BoxedWriter>,
    /// Destination for stderr
    pub stderr: Option<BoxedWriter>,
}

impl RunOutput {
    /// Discard both streams
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send stdout to `writer`
    #[must_use]
    pub fn with_stdout(mut self, writer: BoxedWriter) -> Self {
        self.stdout = Some(writer);
        self
    }

    /// Send stderr to `writer`
    #[must_use]
    pub fn with_stderr(mut self, writer: BoxedWriter) -> Self {
        self.stderr = Some(writer);
        self
    }
}

/// Build the runner for `connection`, rendering `script` with `arguments`
///
/// A script that failed to build is reported before any process is spawned
/// or host dialed.
///
/// # Errors
/// Returns the script's stored error, or the backend's construction error
#[instrument(skip_all, fields(connection = connection.kind()))]
pub async fn new<S, T>(
    connection: &Connection,
    script: &S,
    arguments: &T,
) -> Result<Box<dyn Runner>, RunnerError>
where
    S: ScriptSource + ?Sized,
    T: Serialize + ?Sized,
{
    let script = script.script()?;
    debug!(script = %script.name(), "creating runner");

    match connection {
        Connection::Local(_) => Ok(Box::new(LocalRunner::new(script, arguments)?)),
        Connection::Ssh(ssh) => Ok(Box::new(SshRunner::new(ssh, script, arguments).await?)),
    }
}

/// Build a runner, execute it to completion and close it
///
/// # Errors
/// Returns construction errors unchanged, or `RunnerError::ExecutionFailed`
/// carrying the exit code if the script fails
pub async fn run<S, T>(
    connection: &Connection,
    script: &S,
    arguments: &T,
    output: RunOutput,
) -> Result<(), RunnerError>
where
    S: ScriptSource + ?Sized,
    T: Serialize + ?Sized,
{
    let mut runner = new(connection, script, arguments).await?;

    if let Some(stdout) = output.stdout {
        runner.set_stdout_writer(stdout);
    }
    if let Some(stderr) = output.stderr {
        runner.set_stderr_writer(stderr);
    }

    let result = runner.run().await;
    runner.close().await;
    result
}
