/*!
 * Shell-session transport: one authenticated remote command session per
 * device, reused across calls, with one-shot exec and interactive shell modes.
 *
 * The SSH library sits behind [`ShellDialer`], [`ShellSession`] and
 * [`ShellChannel`]; the production implementation lives in
 * [`crate::transport::ssh`].
 */
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleetlink_core::config::TransportConfig;
use fleetlink_core::utils::{with_timeout, Deadline};

use crate::connector::{CommandResult, ConnectionState, StateCell};
use crate::descriptor::DeviceDescriptor;
use crate::error::{ConnectorError, ErrorKind, Result};

/// Characters that end a network-OS prompt
pub const PROMPT_CHARS: [char; 3] = ['#', '>', '$'];

/// Paging-disable command sent before interactive commands
pub const DEFAULT_PAGING_COMMAND: &str = "terminal length 0";

/// One event read from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on the standard output stream
    Stdout(Vec<u8>),
    /// Bytes on the standard error stream
    Stderr(Vec<u8>),
    /// The remote side closed the channel
    Closed,
}

/// A single exec or shell channel on an established session
#[async_trait]
pub trait ShellChannel: Send {
    /// Write bytes to the channel's input
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Next event; `None` once the channel is gone
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Close the channel, best effort
    async fn close(&mut self);
}

/// An authenticated session able to multiplex channels
#[async_trait]
pub trait ShellSession: Send + Sync + fmt::Debug {
    /// Open a channel executing `command`
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ShellChannel>>;

    /// Open a PTY shell channel
    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>>;

    /// Terminate the session
    async fn close(&self) -> Result<()>;

    /// True once the remote side or the network ended the session
    fn is_closed(&self) -> bool;
}

/// Establishes sessions
#[async_trait]
pub trait ShellDialer: Send + Sync + fmt::Debug {
    /// Connect and authenticate
    async fn dial(&self, target: &ShellTarget) -> Result<Arc<dyn ShellSession>>;
}

/// Where and as whom to open a session
#[derive(Clone)]
pub struct ShellTarget {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
}

impl ShellTarget {
    /// Build a target from a descriptor, defaulting to port 22
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Result<Self> {
        Ok(Self {
            host: descriptor.require_host()?.to_string(),
            port: descriptor.port.unwrap_or(22),
            username: descriptor.require_username()?.to_string(),
            password: descriptor.password_or_empty().to_string(),
        })
    }
}

impl fmt::Debug for ShellTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// How `execute_command` drives the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMode {
    /// One exec channel per command
    Exec,
    /// PTY shell with prompt detection
    Interactive,
}

impl ShellMode {
    /// `extra.shellMode = "interactive"` selects interactive mode
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        match descriptor.extra_str("shellMode") {
            Some(mode) if mode.eq_ignore_ascii_case("interactive") => ShellMode::Interactive,
            _ => ShellMode::Exec,
        }
    }
}

/// Shell transport bound to one device
#[derive(Debug)]
pub struct ShellTransport {
    target: ShellTarget,
    dialer: Arc<dyn ShellDialer>,
    session: Mutex<Option<Arc<dyn ShellSession>>>,
    state: StateCell,
    timeout: Duration,
    prompt_grace: Duration,
    paging_command: String,
    mode: ShellMode,
}

impl ShellTransport {
    /// Create a transport; nothing is dialed until first use
    pub fn new(
        target: ShellTarget,
        dialer: Arc<dyn ShellDialer>,
        state: StateCell,
        config: &TransportConfig,
    ) -> Self {
        Self {
            target,
            dialer,
            session: Mutex::new(None),
            state,
            timeout: config.shell_timeout(),
            prompt_grace: config.prompt_grace(),
            paging_command: DEFAULT_PAGING_COMMAND.to_string(),
            mode: ShellMode::Exec,
        }
    }

    /// Override the paging-disable command
    pub fn with_paging_command<S: Into<String>>(mut self, command: S) -> Self {
        self.paging_command = command.into();
        self
    }

    /// Choose how `execute_command` runs commands
    pub fn with_mode(mut self, mode: ShellMode) -> Self {
        self.mode = mode;
        self
    }

    /// The mode `execute_command` uses
    pub fn mode(&self) -> ShellMode {
        self.mode
    }

    /// Shared connection state.
    ///
    /// A session that closed on its own (idle timeout, remote hangup) is
    /// dropped here so the state reads `Disconnected` without waiting for
    /// the next command. Skipped while an operation holds the session.
    pub fn state(&self) -> ConnectionState {
        if let Ok(mut guard) = self.session.try_lock() {
            if guard.as_ref().is_some_and(|session| session.is_closed()) {
                debug!("Session to {} closed while idle", self.target.host);
                *guard = None;
                self.state.set(ConnectionState::Disconnected);
            }
        }
        self.state.get()
    }

    /// Establish the session if there is none
    pub async fn connect(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    /// Close the session, if any
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!("Closing session to {} failed: {}", self.target.host, e);
            }
        }
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    async fn session(&self) -> Result<Arc<dyn ShellSession>> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("Session to {} was closed, reconnecting", self.target.host);
            *guard = None;
            self.state.set(ConnectionState::Disconnected);
        }

        debug!("Dialing {}:{} as {}", self.target.host, self.target.port, self.target.username);
        let dialed = with_timeout(
            self.timeout,
            &format!("SSH connect to {}:{}", self.target.host, self.target.port),
            self.dialer.dial(&self.target),
        )
        .await;

        match dialed {
            Ok(session) => {
                info!("Shell session established to {}:{}", self.target.host, self.target.port);
                *guard = Some(session.clone());
                self.state.set(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                warn!("Shell session to {} failed: {}", self.target.host, e);
                self.state.set(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Clear the handle if the session died underneath an operation
    async fn note_failure(&self, session: &Arc<dyn ShellSession>) {
        if session.is_closed() {
            let mut guard = self.session.lock().await;
            if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
                *guard = None;
                self.state.set(ConnectionState::Disconnected);
            }
        }
    }

    /// Run `command` on an exec channel.
    ///
    /// Resolves with stdout, or stderr when stdout is empty, once the channel
    /// closes. Fails with `Timeout` naming the command if it does not.
    pub async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let session = self.session().await?;
        let bound = timeout.unwrap_or(self.timeout);

        let result = with_timeout(bound, &format!("Command '{}'", command), async {
            let mut channel = session.open_exec(command).await?;
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            while let Some(event) = channel.next_event().await {
                match event {
                    ChannelEvent::Stdout(data) => stdout.extend_from_slice(&data),
                    ChannelEvent::Stderr(data) => stderr.extend_from_slice(&data),
                    ChannelEvent::Closed => break,
                }
            }

            let output = if stdout.is_empty() { stderr } else { stdout };
            Ok::<_, ConnectorError>(String::from_utf8_lossy(&output).into_owned())
        })
        .await;

        if let Err(e) = &result {
            if e.kind() != ErrorKind::Timeout {
                self.note_failure(&session).await;
            }
        }
        result
    }

    /// Run `command` in an interactive PTY shell.
    ///
    /// Disables paging, waits for the prompt (the grace period is only an
    /// upper bound), writes the command and completes on a trailing prompt
    /// character or when the channel closes. Returns the text received after
    /// the command was written.
    pub async fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let session = self.session().await?;
        let bound = timeout.unwrap_or(self.timeout);

        let result = with_timeout(bound, &format!("Shell command '{}'", command), async {
            let mut channel = session.open_shell().await?;

            channel
                .write(format!("{}\n", self.paging_command).as_bytes())
                .await?;
            if self.await_prompt(channel.as_mut()).await {
                return Err(ConnectorError::transport(format!(
                    "Shell on {} closed before '{}' was sent",
                    self.target.host, command
                )));
            }

            channel.write(format!("{}\n", command).as_bytes()).await?;

            let mut output = String::new();
            while let Some(event) = channel.next_event().await {
                match event {
                    ChannelEvent::Stdout(data) | ChannelEvent::Stderr(data) => {
                        output.push_str(&String::from_utf8_lossy(&data));
                        if ends_with_prompt(&output) && has_content_after_echo(&output, command) {
                            break;
                        }
                    }
                    ChannelEvent::Closed => break,
                }
            }
            channel.close().await;

            Ok::<_, ConnectorError>(strip_echo(&output, command))
        })
        .await;

        if let Err(e) = &result {
            if e.kind() != ErrorKind::Timeout {
                self.note_failure(&session).await;
            }
        }
        result
    }

    /// Consume output until the paging command has been echoed and a prompt
    /// follows, or the grace bound passes. Returns true if the channel closed.
    async fn await_prompt(&self, channel: &mut dyn ShellChannel) -> bool {
        let deadline = Deadline::new(self.prompt_grace);
        let mut seen = String::new();

        loop {
            tokio::select! {
                event = channel.next_event() => match event {
                    Some(ChannelEvent::Stdout(data)) | Some(ChannelEvent::Stderr(data)) => {
                        seen.push_str(&String::from_utf8_lossy(&data));
                        if seen.contains(&self.paging_command) && ends_with_prompt(&seen) {
                            return false;
                        }
                    }
                    Some(ChannelEvent::Closed) | None => return true,
                },
                _ = deadline.wait() => {
                    debug!("No prompt from {} within {:?}, sending command", self.target.host, self.prompt_grace);
                    return false;
                }
            }
        }
    }

    /// Run one command in the configured mode and shape the outcome
    pub async fn execute_command(&self, device: &fleetlink_core::types::Id, command: &str) -> CommandResult {
        let started = Instant::now();
        let outcome = match self.mode {
            ShellMode::Exec => self.exec(command, None).await,
            ShellMode::Interactive => self.shell(command, None).await,
        };
        CommandResult::capture(device, command, started, outcome)
    }
}

/// True if the text, ignoring trailing whitespace, ends in a prompt character
pub fn ends_with_prompt(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .is_some_and(|c| PROMPT_CHARS.contains(&c))
}

fn has_content_after_echo(output: &str, command: &str) -> bool {
    let trimmed = output.trim_start();
    match trimmed.strip_prefix(command) {
        Some(rest) => !rest.trim().is_empty(),
        None => true,
    }
}

fn strip_echo(output: &str, command: &str) -> String {
    let trimmed = output.trim_start();
    match trimmed.strip_prefix(command) {
        Some(rest) => rest.trim_start_matches(['\r', '\n']).to_string(),
        None => output.to_string(),
    }
}
