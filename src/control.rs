//! Control socket: runtime commands for the running init process.
//!
//! Newline-delimited JSON over a Unix stream socket. The server side is
//! accepted and answered inside the main loop; the client side is what
//! the binary uses in telinit mode.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Default path for the control socket.
pub const DEFAULT_SOCKET: &str = "/run/primus/control.sock";

/// Commands accepted on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Change runlevel; 0 and 6 delegate to the shutdown path.
    Runlevel { level: u8 },
    /// Re-parse configuration and apply the diff.
    Reload,
    /// Per-service status report.
    Status,
    /// Start a service by name.
    Start { name: String },
    /// Stop a service by name.
    Stop { name: String },
    /// Restart a service by name.
    Restart { name: String },
    /// Power off the system.
    Poweroff,
    /// Reboot the system.
    Reboot,
    /// Halt the system.
    Halt,
}

/// Reply to a control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Ok { message: String },
    Err { message: String },
    Status { services: Vec<SvcStatus> },
}

/// One service in a status reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcStatus {
    pub ident: String,
    pub kind: String,
    pub state: String,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restarts: u32,
    pub description: Option<String>,
}

/// Server end, owned by the init process.
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_SOCKET)
    }

    /// Bind and listen. Replaces a stale socket file from a previous
    /// incarnation.
    pub fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o660);
        std::fs::set_permissions(&self.socket_path, permissions)?;

        info!(path = %self.socket_path.display(), "control socket listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept one connection. Pends forever when not started, so it can
    /// sit in a `select!` before the socket is up.
    pub async fn accept(&self) -> Result<UnixStream> {
        let Some(listener) = self.listener.as_ref() else {
            std::future::pending::<()>().await;
            unreachable!();
        };
        let (stream, _addr) = listener.accept().await?;
        debug!("accepted control connection");
        Ok(stream)
    }

    /// Read one command from a connection.
    pub async fn read_command(stream: &mut UnixStream) -> Result<Command> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let command: Command = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("failed to parse command: {}", e)))?;
        debug!(command = ?command, "received control command");
        Ok(command)
    }

    /// Write a reply to a connection.
    pub async fn write_reply(stream: &mut UnixStream, reply: &Reply) -> Result<()> {
        let json = serde_json::to_string(reply)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove control socket");
            }
        }
    }
}

/// Client end, used by telinit mode.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_SOCKET)
    }

    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "cannot connect to {}: {}. Is init running?",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// Send one command, wait for the reply.
    pub async fn send(&self, command: Command) -> Result<Reply> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let reply: Reply = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("failed to parse reply: {}", e)))?;
        Ok(reply)
    }
}
