//! Transports underneath the RPC client
//!
//! Two shapes are supported:
//! * a persistent socket, where frames flow both ways and inbound frames are
//!   delivered on a channel ([`FrameSender`] + receiver)
//! * a plain request/response channel ([`RequestChannel`]), call-only

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Outbound half of a persistent socket
#[async_trait]
pub trait FrameSender: Send + Sync {
    async fn send_frame(&self, frame: &Value) -> AgentResult<()>;

    /// Shut the socket down. Inbound delivery ends afterwards.
    async fn close(&self) {}
}

/// Request/response channel for transports without push
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Post one request body and return the reply body
    async fn post(&self, body: &Value, timeout: Duration) -> AgentResult<Value>;
}

/// Read one length-prefixed JSON frame. `Ok(None)` on a clean disconnect.
pub async fn read_frame<R>(reader: &mut R) -> AgentResult<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(AgentError::Transport(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut bytes = vec![0u8; len];
    match reader.read_exact(&mut bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> AgentResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(AgentError::Transport(format!(
            "Frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Persistent TCP transport using u32 length-prefixed JSON frames
pub struct TcpSocketTransport {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: JoinHandle<()>,
}

impl TcpSocketTransport {
    /// Connect and start the reader task. Inbound frames arrive on the
    /// returned receiver, which closes when the peer disconnects.
    pub async fn connect(addr: &str) -> AgentResult<(Arc<Self>, mpsc::UnboundedReceiver<Value>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        info!("[+] connected to {}", addr);

        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("[-] socket closed by peer");
                        break;
                    }
                    Err(AgentError::Serialization(e)) => {
                        warn!("[-] dropping malformed frame: {}", e);
                    }
                    Err(e) => {
                        error!("[-] socket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let transport = Arc::new(Self {
            writer: Mutex::new(Some(write_half)),
            reader_task,
        });
        Ok((transport, rx))
    }
}

#[async_trait]
impl FrameSender for TcpSocketTransport {
    async fn send_frame(&self, frame: &Value) -> AgentResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| AgentError::Transport("socket is closed".into()))?;
        write_frame(writer, frame).await
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown: {}", e);
            }
        }
        self.reader_task.abort();
    }
}

/// HTTP request/response channel
pub struct HttpChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChannel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RequestChannel for HttpChannel {
    async fn post(&self, body: &Value, timeout: Duration) -> AgentResult<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(format!("POST {} timed out", self.endpoint))
                } else {
                    AgentError::Transport(format!("POST {} failed: {}", self.endpoint, e))
                }
            })?;
        response
            .json::<Value>()
            .await
            .map_err(|e| AgentError::Transport(format!("Invalid response body: {}", e)))
    }
}
