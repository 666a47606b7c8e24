//! Local Service Bridge
//!
//! Talks to an optional helper process that runs a more capable proxy
//! engine locally. At most one helper connection is held at a time;
//! starting again tears the previous one down first.
//!
//! # Wire protocol
//!
//! Messages are JSON documents framed native-messaging style: a 32-bit
//! little-endian length followed by that many bytes of UTF-8 JSON.
//!
//! ```text
//! → {"command": "start-service", "config": {...}}
//! ← {"status": "success"}
//! ← {"status": "error", "error": "..."}
//! ```
//!
//! Replies are reported as toasts only; the bridge never touches the
//! connection state.

use crate::event::Notifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest frame accepted in either direction
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Local SOCKS port the helper listens on
pub const LOCAL_SERVICE_PORT: u16 = 10828;

pub const STARTING_NOTICE: &str = "Attempting to start local proxy service...";
pub const STARTED_NOTICE: &str = "Local proxy service started successfully.";
pub const UNREACHABLE_NOTICE: &str =
    "Error: Could not connect to local proxy service. Please ensure the native application is installed.";

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to launch helper: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("Helper closed the connection")]
    Closed,

    #[error("Invalid service configuration: {0}")]
    InvalidConfig(String),
}

/// Outbound helper command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum HelperCommand {
    StartService { config: Value },
}

/// Inbound helper reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HelperReply {
    Success,
    Error {
        #[serde(default)]
        error: Option<String>,
    },
}

/// One live connection to the helper
#[async_trait]
pub trait HelperPort: Send {
    async fn send(&mut self, command: &HelperCommand) -> Result<(), BridgeError>;

    /// Next raw reply; `None` once the helper has gone away
    async fn recv(&mut self) -> Result<Option<Value>, BridgeError>;
}

/// Opens helper connections
#[async_trait]
pub trait HelperConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn HelperPort>, BridgeError>;
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(BridgeError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BridgeError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Helper launched as a child process, spoken to over stdio
#[derive(Debug, Clone)]
pub struct NativeHostConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl NativeHostConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

struct NativePort {
    // Held so the child is killed when the port is dropped
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

#[async_trait]
impl HelperPort for NativePort {
    async fn send(&mut self, command: &HelperCommand) -> Result<(), BridgeError> {
        write_frame(&mut self.stdin, command).await
    }

    async fn recv(&mut self) -> Result<Option<Value>, BridgeError> {
        read_frame(&mut self.stdout).await
    }
}

#[async_trait]
impl HelperConnector for NativeHostConnector {
    async fn connect(&self) -> Result<Box<dyn HelperPort>, BridgeError> {
        info!("Launching helper {}", self.program.display());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(BridgeError::Spawn)?;

        let stdin = child.stdin.take().ok_or(BridgeError::Closed)?;
        let stdout = child.stdout.take().ok_or(BridgeError::Closed)?;

        Ok(Box::new(NativePort {
            _child: child,
            stdin,
            stdout,
        }))
    }
}

/// Configuration document handed to the helper
#[derive(Debug, Clone, PartialEq)]
pub struct LocalServiceConfig(Value);

impl LocalServiceConfig {
    /// Wrap an arbitrary document
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Local SOCKS inbound forwarding to a VLESS server over WebSocket/TLS
    pub fn vless(server: &str, token: &str) -> Result<Self, BridgeError> {
        let server = server.trim();
        let token = token.trim();
        if server.is_empty() {
            return Err(BridgeError::InvalidConfig("server address is empty".into()));
        }
        if token.is_empty() {
            return Err(BridgeError::InvalidConfig("token is empty".into()));
        }

        Ok(Self(json!({
            "inbounds": [{
                "tag": "socks",
                "port": LOCAL_SERVICE_PORT,
                "listen": "127.0.0.1",
                "protocol": "socks",
                "sniffing": {
                    "enabled": true,
                    "destOverride": ["http", "tls", "quic", "fakedns", "fakedns+others"],
                    "routeOnly": true
                },
                "settings": {
                    "auth": "noauth",
                    "udp": true,
                    "allowTransparent": false
                }
            }],
            "outbounds": [{
                "tag": "proxy",
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": server,
                        "port": 1001,
                        "users": [{
                            "id": token,
                            "email": "t@t.tt",
                            "security": "auto",
                            "encryption": "none"
                        }]
                    }]
                },
                "streamSettings": {
                    "network": "ws",
                    "security": "tls",
                    "tlsSettings": {
                        "allowInsecure": true,
                        "fingerprint": "chrome"
                    },
                    "wsSettings": {
                        "path": "/SE",
                        "headers": {
                            "User-Agent": "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:90.0) Gecko/20100101 Firefox/90.0"
                        }
                    }
                },
                "mux": {
                    "enabled": true,
                    "concurrency": 8
                }
            }]
        })))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// The single held helper connection
struct Held {
    generation: u64,
    listener: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    held: Option<Held>,
    generation: u64,
}

/// Bridge to the local helper
#[derive(Clone)]
pub struct LocalServiceBridge {
    connector: Arc<dyn HelperConnector>,
    notifier: Notifier,
    slot: Arc<Mutex<Slot>>,
}

impl LocalServiceBridge {
    pub fn new(connector: Arc<dyn HelperConnector>, notifier: Notifier) -> Self {
        Self {
            connector,
            notifier,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Whether a helper connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.held.is_some()
    }

    /// Connect to the helper and ask it to start the service
    ///
    /// The helper's answer arrives later and is reported as a toast.
    pub async fn start(&self, config: LocalServiceConfig) -> Result<(), BridgeError> {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.held.take() {
            info!("Helper already connected, reconnecting");
            previous.listener.abort();
        }

        let mut port = match self.connector.connect().await {
            Ok(port) => port,
            Err(e) => {
                error!("Failed to connect to helper: {}", e);
                self.notifier.toast(UNREACHABLE_NOTICE);
                return Err(e);
            }
        };

        let command = HelperCommand::StartService {
            config: config.into_value(),
        };
        if let Err(e) = port.send(&command).await {
            error!("Failed to send start command: {}", e);
            self.notifier.toast(UNREACHABLE_NOTICE);
            return Err(e);
        }
        self.notifier.toast(STARTING_NOTICE);

        slot.generation += 1;
        let generation = slot.generation;
        let listener = tokio::spawn(Self::listen(port, generation, self.notifier.clone(), self.slot.clone()));
        slot.held = Some(Held { generation, listener });
        Ok(())
    }

    /// Drop the held connection, if any
    pub async fn disconnect(&self) {
        if let Some(held) = self.slot.lock().await.held.take() {
            debug!("Disconnecting helper (generation {})", held.generation);
            held.listener.abort();
        }
    }

    async fn listen(mut port: Box<dyn HelperPort>, generation: u64, notifier: Notifier, slot: Arc<Mutex<Slot>>) {
        loop {
            match port.recv().await {
                Ok(Some(message)) => {
                    debug!("Helper message: {}", message);
                    match serde_json::from_value::<HelperReply>(message) {
                        Ok(HelperReply::Success) => notifier.toast(STARTED_NOTICE),
                        Ok(HelperReply::Error { error }) => notifier.toast(format!(
                            "Local proxy service failed to start: {}",
                            error.as_deref().unwrap_or("unknown error")
                        )),
                        Err(e) => {
                            warn!("Unrecognised helper reply: {}", e);
                            notifier.toast("Local proxy service failed to start: unrecognised reply");
                        }
                    }
                }
                Ok(None) => {
                    info!("Helper disconnected");
                    break;
                }
                Err(e) => {
                    warn!("Helper connection error: {}", e);
                    break;
                }
            }
        }

        // A replacement connection may already own the slot
        let mut slot = slot.lock().await;
        if slot.held.as_ref().is_some_and(|h| h.generation == generation) {
            slot.held = None;
        }
    }
}
