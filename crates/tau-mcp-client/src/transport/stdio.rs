//! Pipe binding: a spawned server process speaking one JSON envelope per line.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
};
use tokio_stream::wrappers::LinesStream;

use super::{
    ConnectOutcome, HandshakeMode, InboundFrame, InboundFrames, McpTransport, SendReceipt,
    TransportKind,
};
use crate::{envelope::Envelope, error::McpClientError};

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StdioTransportConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl StdioTransportConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Default)]
struct StdioProcess {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct StdioTransport {
    config: StdioTransportConfig,
    stdin: AsyncMutex<Option<ChildStdin>>,
    process: AsyncMutex<StdioProcess>,
}

impl StdioTransport {
    pub fn new(config: StdioTransportConfig) -> Self {
        Self {
            config,
            stdin: AsyncMutex::new(None),
            process: AsyncMutex::new(StdioProcess::default()),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn handshake_mode(&self) -> HandshakeMode {
        HandshakeMode::Correlated
    }

    async fn connect(
        &self,
        _proposed_session_id: Option<&str>,
    ) -> Result<ConnectOutcome, McpClientError> {
        let mut process = self.process.lock().await;
        if process.child.is_some() {
            return Err(McpClientError::transport(format!(
                "mcp server command '{}' is already running",
                self.config.command
            )));
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = self.config.cwd.as_ref() {
            command.current_dir(cwd);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        let mut child = command.spawn().map_err(|error| {
            McpClientError::transport(format!(
                "failed to spawn mcp server command '{}': {error}",
                self.config.command
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpClientError::transport(format!(
                "failed to open stdin for mcp server command '{}'",
                self.config.command
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpClientError::transport(format!(
                "failed to open stdout for mcp server command '{}'",
                self.config.command
            ))
        })?;
        if let Some(stderr) = child.stderr.take() {
            let command_name = self.config.command.clone();
            process.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command_name, stderr = %line, "mcp server stderr");
                }
            }));
        }

        tracing::debug!(
            command = %self.config.command,
            pid = child.id().unwrap_or_default(),
            "spawned mcp server process"
        );
        *self.stdin.lock().await = Some(stdin);
        process.stdout = Some(stdout);
        process.child = Some(child);
        Ok(ConnectOutcome::default())
    }

    async fn send(
        &self,
        envelope: &Envelope,
        _session_id: Option<&str>,
    ) -> Result<SendReceipt, McpClientError> {
        let mut line = envelope.encode();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or_else(|| {
            McpClientError::transport(format!(
                "mcp server command '{}' is not running",
                self.config.command
            ))
        })?;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|error| {
            McpClientError::transport(format!(
                "failed to write request to mcp server command '{}': {error}",
                self.config.command
            ))
        })?;
        Ok(SendReceipt::written())
    }

    async fn inbound(&self, _session_id: Option<&str>) -> Result<InboundFrames, McpClientError> {
        let stdout = self.process.lock().await.stdout.take().ok_or_else(|| {
            McpClientError::transport(format!(
                "stdout of mcp server command '{}' is unavailable",
                self.config.command
            ))
        })?;
        let lines = LinesStream::new(BufReader::new(stdout).lines()).map(|line| {
            line.map(InboundFrame::line).map_err(|error| {
                McpClientError::transport(format!("failed to read mcp server stdout: {error}"))
            })
        });
        Ok(lines.boxed())
    }

    async fn close(&self) -> Result<(), McpClientError> {
        // Dropping stdin delivers EOF, which well-behaved servers treat as shutdown.
        self.stdin.lock().await.take();
        let mut process = self.process.lock().await;
        process.stdout.take();
        let Some(mut child) = process.child.take() else {
            return Ok(());
        };
        let grace = Duration::from_millis(self.config.shutdown_timeout_ms);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.config.command, %status, "mcp server process exited");
            }
            Ok(Err(error)) => {
                tracing::warn!(command = %self.config.command, %error, "failed to wait for mcp server process");
            }
            Err(_) => {
                tracing::warn!(
                    command = %self.config.command,
                    grace_ms = self.config.shutdown_timeout_ms,
                    "mcp server process did not exit; killing"
                );
                child.kill().await.map_err(|error| {
                    McpClientError::transport(format!(
                        "failed to kill mcp server command '{}': {error}",
                        self.config.command
                    ))
                })?;
            }
        }
        if let Some(task) = process.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}
