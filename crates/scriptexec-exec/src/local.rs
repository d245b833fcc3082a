//! Local script execution using `tokio::process`

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use scriptexec_script::Script;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::error::RunnerError;
use crate::stream::{BoxedWriter, OutputTarget, pump};
use crate::traits::{CLOSE_TIMEOUT, Runner, RunnerState};

/// Runs a script as a local child process
///
/// The shell from the script's [`Script::argv`] is spawned and the rendered
/// script is written to its stdin.
pub struct LocalRunner {
    command: String,
    argv: Vec<String>,
    /// Rendered script, consumed on start
    stdin: Option<Vec<u8>>,
    stdout: OutputTarget,
    stderr: OutputTarget,
    child: Option<Child>,
    /// Stdin writer and output pumps
    tasks: Vec<JoinHandle<std::io::Result<()>>>,
    cancel: CancellationToken,
    state: RunnerState,
    exit_code: i32,
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl LocalRunner {
    /// Render `script` with `arguments` and prepare the process, ready to start
    ///
    /// # Errors
    /// Returns `RunnerError::Script` if rendering fails, or
    /// `RunnerError::Spawn` if the script's shell yields no command
    pub fn new<T: Serialize + ?Sized>(script: &Script, arguments: &T) -> Result<Self, RunnerError> {
        let stdin = script.render(arguments)?;
        let argv = script.argv();
        if argv.is_empty() {
            return Err(RunnerError::Spawn(format!(
                "script {:?} has an empty shell command",
                script.name()
            )));
        }

        let command = script.command();
        debug!(script = %script.name(), command = %command, "prepared local runner");

        Ok(Self {
            command,
            argv,
            stdin: Some(stdin),
            stdout: OutputTarget::default(),
            stderr: OutputTarget::default(),
            child: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            state: RunnerState::Constructed,
            exit_code: -1,
        })
    }

    /// Command line the script is executed with
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    fn output_stdio(target: &OutputTarget) -> Stdio {
        match target {
            OutputTarget::Discard => Stdio::null(),
            OutputTarget::Writer(_) | OutputTarget::Pipe(_) => Stdio::piped(),
        }
    }

    fn spawn(&mut self) -> Result<(), RunnerError> {
        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Self::output_stdio(&self.stdout))
            .stderr(Self::output_stdio(&self.stderr))
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.argv[0])))?;

        if let (Some(mut stdin), Some(script)) = (child.stdin.take(), self.stdin.take()) {
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let feed = async {
                    stdin.write_all(&script).await?;
                    stdin.shutdown().await
                };
                tokio::select! {
                    () = cancel.cancelled() => Ok(()),
                    result = feed => result,
                }
            }));
        }
        if let Some(stdout) = child.stdout.take() {
            let target = std::mem::take(&mut self.stdout);
            self.tasks.push(tokio::spawn(pump(stdout, target, self.cancel.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            let target = std::mem::take(&mut self.stderr);
            self.tasks.push(tokio::spawn(pump(stderr, target, self.cancel.clone())));
        }

        self.child = Some(child);
        Ok(())
    }

    /// Wait for the stdin writer and output pumps
    async fn join_tasks(&mut self) -> Result<(), String> {
        let mut failure = None;
        for task in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                // The script may exit without reading all of its input
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => failure = Some(format!("stream copy failed: {e}")),
                Err(e) => failure = Some(format!("stream task failed: {e}")),
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn check_startable(&self) -> Result<(), RunnerError> {
        match self.state {
            RunnerState::Constructed => Ok(()),
            RunnerState::Closed => Err(RunnerError::InvalidState("runner is closed".to_string())),
            RunnerState::Started | RunnerState::Completed => {
                Err(RunnerError::InvalidState("runner already started".to_string()))
            }
        }
    }

    fn finish(
        &mut self,
        status: Option<ExitStatus>,
        stream_failure: Option<String>,
    ) -> Result<(), RunnerError> {
        self.state = RunnerState::Completed;

        let (exit_code, reason) = match (status, stream_failure) {
            (None, _) => (-1, "cancelled".to_string()),
            (Some(status), _) if !status.success() => {
                let code = status.code().unwrap_or(-1);
                (code, status.to_string())
            }
            (Some(_), Some(reason)) => (-1, reason),
            (Some(_), None) => {
                self.exit_code = 0;
                debug!(command = %self.command, "script completed");
                return Ok(());
            }
        };

        self.exit_code = exit_code;
        error!(command = %self.command, exit_code, reason = %reason, "script failed");
        Err(RunnerError::WaitFailed { exit_code, reason })
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn set_stdout_writer(&mut self, writer: BoxedWriter) {
        if self.state == RunnerState::Constructed {
            self.stdout = OutputTarget::Writer(writer);
        } else {
            warn!(state = ?self.state, "ignoring stdout writer set after start");
        }
    }

    fn set_stderr_writer(&mut self, writer: BoxedWriter) {
        if self.state == RunnerState::Constructed {
            self.stderr = OutputTarget::Writer(writer);
        } else {
            warn!(state = ?self.state, "ignoring stderr writer set after start");
        }
    }

    fn stdout_pipe(&mut self) -> Result<DuplexStream, RunnerError> {
        if self.state != RunnerState::Constructed {
            return Err(RunnerError::PipeSetup("stdout pipe requested after start".to_string()));
        }
        self.stdout.pipe("stdout")
    }

    fn stderr_pipe(&mut self) -> Result<DuplexStream, RunnerError> {
        if self.state != RunnerState::Constructed {
            return Err(RunnerError::PipeSetup("stderr pipe requested after start".to_string()));
        }
        self.stderr.pipe("stderr")
    }

    #[instrument(skip(self), level = "debug")]
    async fn run(&mut self) -> Result<(), RunnerError> {
        if self.stdout.is_pipe() || self.stderr.is_pipe() {
            self.exit_code = -1;
            return Err(RunnerError::PipeSetup(
                "output pipes require start and wait".to_string(),
            ));
        }

        self.start().await.map_err(RunnerError::into_execution)?;
        self.wait().await.map_err(RunnerError::into_execution)
    }

    #[instrument(skip(self), level = "debug")]
    async fn start(&mut self) -> Result<(), RunnerError> {
        self.check_startable()?;

        debug!(command = %self.command, "starting local script");

        if let Err(e) = self.spawn() {
            self.exit_code = -1;
            error!(command = %self.command, error = %e, "cannot start runner");
            return Err(e);
        }

        self.state = RunnerState::Started;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn wait(&mut self) -> Result<(), RunnerError> {
        match self.state {
            RunnerState::Started => {}
            RunnerState::Constructed => {
                return Err(RunnerError::InvalidState("runner not started".to_string()));
            }
            RunnerState::Completed => {
                return Err(RunnerError::InvalidState("runner already waited".to_string()));
            }
            RunnerState::Closed => {
                return Err(RunnerError::InvalidState("runner is closed".to_string()));
            }
        }

        let Some(child) = self.child.as_mut() else {
            return Err(RunnerError::InvalidState("runner has no process".to_string()));
        };

        let status = tokio::select! {
            () = self.cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill after cancellation failed");
                }
                None
            }
            status = child.wait() => match status {
                Ok(status) => Some(status),
                Err(e) => {
                    self.exit_code = -1;
                    self.state = RunnerState::Completed;
                    return Err(RunnerError::WaitFailed {
                        exit_code: -1,
                        reason: format!("cannot wait for process: {e}"),
                    });
                }
            },
        };

        let stream_failure = self.join_tasks().await.err();
        self.finish(status, stream_failure)
    }

    async fn close(&mut self) {
        if self.state == RunnerState::Closed {
            return;
        }

        self.cancel.cancel();

        if let Some(mut child) = self.child.take() {
            if self.state == RunnerState::Started {
                debug!(command = %self.command, "terminating running script");
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "process already gone");
                }
            }
            match timeout(CLOSE_TIMEOUT, child.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to reap process"),
                Err(_) => warn!(timeout = ?CLOSE_TIMEOUT, "process did not exit"),
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.stdin = None;
        self.stdout = OutputTarget::Discard;
        self.stderr = OutputTarget::Discard;
        self.state = RunnerState::Closed;
        debug!(command = %self.command, "local runner closed");
    }

    fn exit_code(&self) -> i32 {
        self.exit_code
    }

    fn state(&self) -> RunnerState {
        self.state
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn runner_type(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::stream::SharedBuffer;

    fn sh(code: &str) -> Script {
        Script::parse("test", "sh", code).unwrap()
    }

    fn no_args() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_run_success() {
        let script = sh("echo {{.Msg}}\n");
        let mut runner = LocalRunner::new(&script, &HashMap::from([("Msg", "hello")])).unwrap();
        let stdout = SharedBuffer::new();
        runner.set_stdout_writer(stdout.writer());

        runner.run().await.unwrap();

        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.state(), RunnerState::Completed);
        assert_eq!(stdout.to_string_lossy().trim(), "hello");
        runner.close().await;
    }

    #[tokio::test]
    async fn test_run_failure() {
        let mut runner = LocalRunner::new(&sh("exit 42\n"), &no_args()).unwrap();

        let err = runner.run().await.unwrap_err();

        assert!(matches!(err, RunnerError::ExecutionFailed { exit_code: 42, .. }));
        assert_eq!(runner.exit_code(), 42);
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let mut runner = LocalRunner::new(&sh("echo error >&2\n"), &no_args()).unwrap();
        let stderr = SharedBuffer::new();
        runner.set_stderr_writer(stderr.writer());

        runner.run().await.unwrap();

        assert_eq!(stderr.to_string_lossy().trim(), "error");
    }

    #[tokio::test]
    async fn test_start_wait_with_pipes() {
        let mut runner =
            LocalRunner::new(&sh("echo out\necho err >&2\nexit 3\n"), &no_args()).unwrap();
        let mut stdout = runner.stdout_pipe().unwrap();
        let mut stderr = runner.stderr_pipe().unwrap();

        runner.start().await.unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        stderr.read_to_string(&mut err).await.unwrap();
        let result = runner.wait().await;

        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert!(matches!(result, Err(RunnerError::WaitFailed { exit_code: 3, .. })));
        assert_eq!(runner.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_run_rejects_pipes() {
        let mut runner = LocalRunner::new(&sh("true\n"), &no_args()).unwrap();
        let _stdout = runner.stdout_pipe().unwrap();

        assert!(matches!(runner.run().await, Err(RunnerError::PipeSetup(_))));
        assert_eq!(runner.exit_code(), -1);
    }

    #[tokio::test]
    async fn test_pipe_after_start() {
        let mut runner = LocalRunner::new(&sh("true\n"), &no_args()).unwrap();
        runner.start().await.unwrap();

        assert!(matches!(runner.stdout_pipe(), Err(RunnerError::PipeSetup(_))));
        runner.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let script = Script::parse("bad", "/nonexistent/shell", "true").unwrap();
        let mut runner = LocalRunner::new(&script, &no_args()).unwrap();

        let err = runner.start().await.unwrap_err();

        assert!(matches!(err, RunnerError::Spawn(_)));
        assert_eq!(runner.exit_code(), -1);
        runner.close().await;
    }

    #[tokio::test]
    async fn test_render_failure() {
        let err = LocalRunner::new(&sh("ls {{.Path}}"), &no_args()).unwrap_err();
        assert!(matches!(err, RunnerError::Script(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let mut runner = LocalRunner::new(&sh("true\n"), &no_args()).unwrap();
        assert!(matches!(runner.wait().await, Err(RunnerError::InvalidState(_))));

        runner.start().await.unwrap();
        assert!(matches!(runner.start().await, Err(RunnerError::InvalidState(_))));
        runner.wait().await.unwrap();
        assert!(matches!(runner.wait().await, Err(RunnerError::InvalidState(_))));

        runner.close().await;
        assert!(matches!(runner.start().await, Err(RunnerError::InvalidState(_))));
        assert_eq!(runner.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut runner = LocalRunner::new(&sh("true\n"), &no_args()).unwrap();
        runner.close().await;
        runner.close().await;
        assert_eq!(runner.state(), RunnerState::Closed);
        assert_eq!(runner.exit_code(), -1);
    }

    #[tokio::test]
    async fn test_close_terminates_running_script() {
        let mut runner = LocalRunner::new(&sh("sleep 30\n"), &no_args()).unwrap();
        runner.start().await.unwrap();

        let started = Instant::now();
        runner.close().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(runner.exit_code(), -1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let mut runner = LocalRunner::new(&sh("sleep 30\n"), &no_args()).unwrap();
        let token = runner.cancellation_token();
        runner.start().await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = runner.wait().await.unwrap_err();

        assert!(matches!(err, RunnerError::WaitFailed { exit_code: -1, .. }));
        assert_eq!(runner.exit_code(), -1);
        runner.close().await;
    }
}
