use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::info;

use super::ChannelError;

/// One live byte stream to a scan host. The optional child handle keeps a
/// spawned host alive exactly as long as the connection; dropping it kills
/// the process.
pub struct Connection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Option<Child>,
}

/// How connections come into being. The manager calls `connect` lazily and
/// again after every disconnect; transports must hand out a fresh stream
/// each time.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn connect(&self) -> Result<Connection, ChannelError>;

    /// Shown in logs and connection-failure prompts.
    fn describe(&self) -> String;
}

/// Spawns the scan host executable and talks over its stdio, the way
/// browsers launch native messaging hosts.
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: PathBuf) -> Self {
        ProcessTransport { program, args: vec![] }
    }

    pub fn with_args(program: PathBuf, args: Vec<String>) -> Self {
        ProcessTransport { program, args }
    }
}

#[async_trait]
impl ServiceTransport for ProcessTransport {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::Connect(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Connect("scan host stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Connect("scan host stdout unavailable".into()))?;

        info!(host = %self.program.display(), pid = child.id(), "scan host spawned");
        Ok(Connection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    fn describe(&self) -> String {
        self.program.display().to_string()
    }
}

/// In-memory transport for tests. Each `connect` produces a fresh duplex
/// pair and pushes the host-side end to whoever holds the receiver,
/// typically a task running `scanhost_proto::runtime::serve`.
pub struct DuplexTransport {
    host_ends: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DuplexTransport { host_ends: tx }, rx)
    }
}

#[async_trait]
impl ServiceTransport for DuplexTransport {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        let (warden_side, host_side) = tokio::io::duplex(64 * 1024);
        self.host_ends
            .send(host_side)
            .map_err(|_| ChannelError::Connect("no scan host listening".into()))?;
        let (reader, writer) = tokio::io::split(warden_side);
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }

    fn describe(&self) -> String {
        "in-memory duplex".to_string()
    }
}
