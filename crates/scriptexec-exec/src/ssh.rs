//! SSH script execution using russh crate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::{Channel, ChannelMsg, Disconnect, Sig, client};
use scriptexec_script::Script;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::SshConnection;
use crate::error::RunnerError;
use crate::known_hosts::HostKeyPolicy;
use crate::stream::{BoxedWriter, OutputTarget};
use crate::traits::{CLOSE_TIMEOUT, Runner, RunnerState};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    policy: HostKeyPolicy,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.policy.accepts(server_public_key);
        if !accepted {
            warn!(
                host = %self.host,
                fingerprint = %server_public_key.fingerprint(ssh_key::HashAlg::Sha256),
                "server host key is not in known hosts"
            );
        }
        Ok(accepted)
    }
}

/// What the session reported by the time it closed
#[derive(Debug, Default)]
struct SessionOutcome {
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    failure: Option<String>,
    cancelled: bool,
}

impl SessionOutcome {
    /// Exit code and failure reason, `None` on success
    fn failure(&self) -> Option<(i32, String)> {
        if self.cancelled {
            return Some((-1, "cancelled".to_string()));
        }
        if let Some(failure) = &self.failure {
            return Some((-1, failure.clone()));
        }
        match (self.exit_status, &self.exit_signal) {
            (Some(0), _) => None,
            (Some(status), _) => Some((
                i32::try_from(status).unwrap_or(i32::MAX),
                format!("exit status {status}"),
            )),
            (None, Some(signal)) => Some((-1, format!("terminated by signal {signal}"))),
            (None, None) => Some((-1, "session closed without exit status".to_string())),
        }
    }
}

/// Runs a script in an SSH session
///
/// Construction connects, authenticates with a password and opens the
/// session; [`Runner::start`] executes the script's command in it and streams
/// the rendered script as the session's stdin.
pub struct SshRunner {
    command: String,
    address: String,
    /// Bound on waiting for the server to accept the command
    reply_timeout: Duration,
    /// Rendered script, consumed on start
    stdin: Option<Vec<u8>>,
    stdout: OutputTarget,
    stderr: OutputTarget,
    session: Option<client::Handle<SshClientHandler>>,
    /// Session channel until start hands it to the driver task
    channel: Option<Channel<client::Msg>>,
    driver: Option<JoinHandle<SessionOutcome>>,
    stdin_task: Option<JoinHandle<std::io::Result<()>>>,
    cancel: CancellationToken,
    state: RunnerState,
    exit_code: i32,
}

impl std::fmt::Debug for SshRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRunner")
            .field("address", &self.address)
            .field("command", &self.command)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl SshRunner {
    /// Render `script`, connect to the host and open a session, ready to start
    ///
    /// # Errors
    /// - `RunnerError::Script` if rendering fails
    /// - `RunnerError::HostKey` if the known-hosts file is unusable or the
    ///   server key is not trusted
    /// - `RunnerError::ConnectionFailed` if the host cannot be reached
    /// - `RunnerError::AuthenticationFailed` if the password is rejected
    /// - `RunnerError::SessionOpen` if no session can be opened
    #[instrument(skip(connection, script, arguments), fields(host = %connection.host))]
    pub async fn new<T: Serialize + ?Sized>(
        connection: &SshConnection,
        script: &Script,
        arguments: &T,
    ) -> Result<Self, RunnerError> {
        let stdin = script.render(arguments)?;
        let command = script.command();
        let address = connection.address();

        let policy = HostKeyPolicy::resolve(connection)?;
        let session = connect(connection, policy).await?;

        let channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(host = %connection.host, error = %e, "cannot open session");
                disconnect(&session, &address).await;
                return Err(RunnerError::SessionOpen(e.to_string()));
            }
        };

        debug!(host = %connection.host, command = %command, "prepared ssh runner");

        Ok(Self {
            command,
            address,
            reply_timeout: connection.connect_timeout(),
            stdin: Some(stdin),
            stdout: OutputTarget::default(),
            stderr: OutputTarget::default(),
            session: Some(session),
            channel: Some(channel),
            driver: None,
            stdin_task: None,
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

    /// Remote `host:port`
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
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

    async fn exec(&mut self) -> Result<(), RunnerError> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| RunnerError::InvalidState("session already used".to_string()))?;

        if let Err(e) = channel.exec(true, self.command.as_str()).await {
            // Keep the channel so close() can release it
            self.channel = Some(channel);
            return Err(RunnerError::StartFailed(e.to_string()));
        }

        let reply = timeout(self.reply_timeout, exec_reply(&mut channel, &self.cancel)).await;
        let pending = match reply {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => {
                self.channel = Some(channel);
                return Err(e);
            }
            Err(_) => {
                self.channel = Some(channel);
                return Err(RunnerError::StartFailed(format!(
                    "no reply to exec request after {:?}",
                    self.reply_timeout
                )));
            }
        };

        let (stdin_done, stdin_done_rx) = oneshot::channel();
        let mut writer = Box::pin(channel.make_writer());
        let script = self.stdin.take().unwrap_or_default();
        let cancel = self.cancel.clone();
        self.stdin_task = Some(tokio::spawn(async move {
            let feed = async {
                writer.write_all(&script).await?;
                writer.flush().await
            };
            let result = tokio::select! {
                () = cancel.cancelled() => Ok(()),
                result = feed => result,
            };
            let _ = stdin_done.send(());
            result
        }));

        self.driver = Some(tokio::spawn(drive(
            channel,
            pending,
            std::mem::take(&mut self.stdout),
            std::mem::take(&mut self.stderr),
            stdin_done_rx,
            self.cancel.clone(),
        )));
        Ok(())
    }
}

/// Wait for the server to accept an exec request
///
/// Messages that arrive ahead of the reply are returned for the driver.
async fn exec_reply(
    channel: &mut Channel<client::Msg>,
    cancel: &CancellationToken,
) -> Result<Vec<ChannelMsg>, RunnerError> {
    let mut pending = Vec::new();
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => {
                return Err(RunnerError::StartFailed("cancelled".to_string()));
            }
            msg = channel.wait() => msg,
        };
        match msg {
            Some(ChannelMsg::Success) => return Ok(pending),
            Some(ChannelMsg::Failure) => {
                return Err(RunnerError::StartFailed(
                    "remote host rejected the command".to_string(),
                ));
            }
            Some(ChannelMsg::Close) | None => {
                return Err(RunnerError::StartFailed(
                    "channel closed before the command started".to_string(),
                ));
            }
            Some(msg) => pending.push(msg),
        }
    }
}

/// Dial, verify the host key and authenticate
async fn connect(
    connection: &SshConnection,
    policy: HostKeyPolicy,
) -> Result<client::Handle<SshClientHandler>, RunnerError> {
    let address = connection.address();

    info!(
        host = %connection.host,
        port = connection.port,
        user = %connection.user,
        "connecting to SSH"
    );

    let config = Arc::new(client::Config::default());
    let handler = SshClientHandler {
        host: connection.host.clone(),
        policy,
    };

    let dial = client::connect(config, (connection.host.as_str(), connection.port), handler);
    let mut session = match timeout(connection.connect_timeout(), dial).await {
        Ok(Ok(session)) => session,
        Ok(Err(russh::Error::UnknownKey)) => {
            error!(host = %connection.host, "host key verification failed");
            return Err(RunnerError::HostKey(format!(
                "host key for {address} is not trusted"
            )));
        }
        Ok(Err(e)) => {
            error!(host = %connection.host, error = %e, "cannot dial host");
            return Err(RunnerError::ConnectionFailed(format!("{address}: {e}")));
        }
        Err(_) => {
            error!(host = %connection.host, timeout = ?connection.connect_timeout(), "dial timed out");
            return Err(RunnerError::ConnectionFailed(format!(
                "{address}: timed out after {:?}",
                connection.connect_timeout()
            )));
        }
    };

    let auth = match session
        .authenticate_password(connection.user.as_str(), connection.password.as_str())
        .await
    {
        Ok(auth) => auth,
        Err(e) => {
            disconnect(&session, &address).await;
            return Err(RunnerError::AuthenticationFailed(e.to_string()));
        }
    };
    if !auth.success() {
        disconnect(&session, &address).await;
        return Err(RunnerError::AuthenticationFailed(format!(
            "password rejected for user {}",
            connection.user
        )));
    }

    info!(host = %connection.host, "SSH connected and authenticated");
    Ok(session)
}

async fn disconnect(session: &client::Handle<SshClientHandler>, address: &str) {
    let result = timeout(
        CLOSE_TIMEOUT,
        session.disconnect(Disconnect::ByApplication, "", "English"),
    )
    .await;

    match result {
        Ok(Ok(())) => info!(address, "SSH disconnected"),
        Ok(Err(e)) => warn!(address, error = %e, "SSH disconnect failed"),
        Err(_) => warn!(address, timeout = ?CLOSE_TIMEOUT, "SSH disconnect timed out"),
    }
}

/// Forward one chunk unless cancelled while the sink is full
async fn forward(target: &mut OutputTarget, data: &[u8], cancel: &CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = target.write_chunk(data) => {}
    }
}

/// Where the remote script's output goes and what it reported
struct SessionSinks {
    stdout: OutputTarget,
    stderr: OutputTarget,
    outcome: SessionOutcome,
}

impl SessionSinks {
    /// Apply one session message; false once the channel is finished
    async fn route(&mut self, msg: Option<ChannelMsg>, cancel: &CancellationToken) -> bool {
        match msg {
            Some(ChannelMsg::Data { data }) => forward(&mut self.stdout, &data, cancel).await,
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                forward(&mut self.stderr, &data, cancel).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.outcome.exit_status = Some(exit_status);
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            }) => {
                let signal = format!("{signal_name:?} {error_message}");
                self.outcome.exit_signal = Some(signal.trim().to_string());
            }
            Some(ChannelMsg::Failure) => {
                self.outcome.failure = Some("remote host rejected the command".to_string());
                return false;
            }
            Some(ChannelMsg::Close) | None => return false,
            _ => {}
        }
        true
    }
}

/// Route session messages to the output targets until the channel closes
async fn drive(
    mut channel: Channel<client::Msg>,
    pending: Vec<ChannelMsg>,
    stdout: OutputTarget,
    stderr: OutputTarget,
    mut stdin_done: oneshot::Receiver<()>,
    cancel: CancellationToken,
) -> SessionOutcome {
    let mut sinks = SessionSinks {
        stdout,
        stderr,
        outcome: SessionOutcome::default(),
    };
    let mut open = true;
    for msg in pending {
        if !sinks.route(Some(msg), &cancel).await {
            open = false;
            break;
        }
    }

    let mut stdin_open = true;
    while open {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("terminating remote script");
                if let Err(e) = channel.signal(Sig::TERM).await {
                    debug!(error = %e, "failed to signal remote script");
                }
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "failed to close channel");
                }
                sinks.outcome.cancelled = true;
                open = false;
            }
            _ = &mut stdin_done, if stdin_open => {
                stdin_open = false;
                if let Err(e) = channel.eof().await {
                    debug!(error = %e, "failed to send stdin EOF");
                }
            }
            msg = channel.wait() => open = sinks.route(msg, &cancel).await,
        }
    }

    sinks.stdout.finish().await;
    sinks.stderr.finish().await;
    sinks.outcome
}

#[async_trait]
impl Runner for SshRunner {
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

    #[instrument(skip(self), fields(host = %self.address))]
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

    #[instrument(skip(self), fields(host = %self.address))]
    async fn start(&mut self) -> Result<(), RunnerError> {
        self.check_startable()?;

        debug!(command = %self.command, "starting remote script");

        if let Err(e) = self.exec().await {
            self.exit_code = -1;
            error!(host = %self.address, error = %e, "cannot start runner");
            return Err(e);
        }

        self.state = RunnerState::Started;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.address))]
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

        let Some(driver) = self.driver.take() else {
            return Err(RunnerError::InvalidState("runner has no session".to_string()));
        };
        self.state = RunnerState::Completed;

        let outcome = driver.await.unwrap_or_else(|e| SessionOutcome {
            failure: Some(format!("session task failed: {e}")),
            ..SessionOutcome::default()
        });

        // The session is over; a writer still blocked on the window never completes
        if let Some(task) = self.stdin_task.take() {
            if task.is_finished() {
                match task.await {
                    Ok(Err(e)) => debug!(error = %e, "stdin copy ended early"),
                    Err(e) => debug!(error = %e, "stdin task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                debug!(host = %self.address, "remote script exited before reading all of stdin");
                task.abort();
            }
        }

        match outcome.failure() {
            None => {
                self.exit_code = 0;
                debug!(host = %self.address, "remote script completed");
                Ok(())
            }
            Some((exit_code, reason)) => {
                self.exit_code = exit_code;
                error!(host = %self.address, exit_code, reason = %reason, "remote script failed");
                Err(RunnerError::WaitFailed { exit_code, reason })
            }
        }
    }

    async fn close(&mut self) {
        if self.state == RunnerState::Closed {
            return;
        }

        // A running driver answers cancellation by signalling TERM and closing the channel
        self.cancel.cancel();

        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if timeout(CLOSE_TIMEOUT, driver).await.is_err() {
                warn!(host = %self.address, timeout = ?CLOSE_TIMEOUT, "session did not stop");
                abort.abort();
            }
        }
        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            match timeout(CLOSE_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "failed to close unused channel"),
                Err(_) => debug!("closing unused channel timed out"),
            }
        }
        if let Some(session) = self.session.take() {
            disconnect(&session, &self.address).await;
        }

        self.stdin = None;
        self.stdout = OutputTarget::Discard;
        self.stderr = OutputTarget::Discard;
        self.state = RunnerState::Closed;
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
        "ssh"
    }
}

impl Drop for SshRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
