//! Link to the host process.
//!
//! A [`Link`] is an outbound [`FrameSink`] plus a receiver of raw inbound
//! frame bodies. Socket links run one reader task and one writer task; the
//! inbound receiver yields `None` once the peer goes away, which is the only
//! liveness signal the client needs.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{ClientConfig, Endpoint};
use crate::error::ClientError;
use crate::ipc::framing::{read_frame, write_frame};
use crate::protocol::Frame;

/// Opens links to the host. Swappable so tests can run without sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> Result<Link, ClientError>;
}

/// Outbound side of a link.
///
/// Sending never waits: a full queue is reported as busy rather than
/// stalling the caller or the dispatch task.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<String>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let body = frame.encode()?;
        trace!(kind = frame.kind(), "-> {}", body);
        self.tx.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ClientError::Transport("outbound queue busy".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ClientError::Transport("link closed".to_string())
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Aborts the reader task when the link is dropped.
///
/// The writer task is left to drain: it stops on its own once every
/// `FrameSink` clone is gone, so a final Disconnect still gets flushed.
#[derive(Debug, Default)]
pub struct LinkTasks {
    reader: Option<JoinHandle<()>>,
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

/// An open link.
#[derive(Debug)]
pub struct Link {
    pub sink: FrameSink,
    pub inbound: mpsc::Receiver<String>,
    pub tasks: LinkTasks,
}

impl Link {
    /// Run a link over any buffered reader and writer pair.
    pub fn from_stream<R, W>(mut reader: R, mut writer: W, queue: usize) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let queue = queue.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(queue);
        let (in_tx, in_rx) = mpsc::channel::<String>(queue);

        tokio::spawn(async move {
            while let Some(body) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &body).await {
                    debug!("Link writer stopped: {}", e);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(body)) => {
                        trace!("<- {}", body);
                        if in_tx.send(body).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Link closed by peer");
                        break;
                    }
                    Err(e) => {
                        debug!("Link reader stopped: {}", e);
                        break;
                    }
                }
            }
        });

        Link {
            sink: FrameSink::new(out_tx),
            inbound: in_rx,
            tasks: LinkTasks {
                reader: Some(reader_task),
            },
        }
    }

    /// In-process link with the far end handed back to the caller.
    pub fn memory(queue: usize) -> (Link, MemoryPeer) {
        let queue = queue.max(1);
        let (out_tx, out_rx) = mpsc::channel(queue);
        let (in_tx, in_rx) = mpsc::channel(queue);
        let link = Link {
            sink: FrameSink::new(out_tx),
            inbound: in_rx,
            tasks: LinkTasks::default(),
        };
        let peer = MemoryPeer {
            outbound: out_rx,
            inbound: in_tx,
        };
        (link, peer)
    }
}

/// Far end of a [`Link::memory`] link.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames the client sent.
    pub outbound: mpsc::Receiver<String>,
    /// Push frames to the client.
    pub inbound: mpsc::Sender<String>,
}

impl MemoryPeer {
    /// Next frame from the client, decoded.
    pub async fn recv(&mut self) -> Option<Frame> {
        let body = self.outbound.recv().await?;
        Frame::decode(&body).ok()
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let body = frame.encode()?;
        self.inbound
            .send(body)
            .await
            .map_err(|_| ClientError::Transport("link closed".to_string()))
    }

    pub async fn send_raw(&self, body: impl Into<String>) -> Result<(), ClientError> {
        self.inbound
            .send(body.into())
            .await
            .map_err(|_| ClientError::Transport("link closed".to_string()))
    }
}

/// Connects over the configured Unix socket or TCP endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl SocketConnector {
    async fn connect_unix(path: &Path, config: &ClientConfig) -> Result<Link, ClientError> {
        let budget = config.connect_timeout();
        let stream = timeout(budget, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout(budget))??;
        let (read_half, write_half) = stream.into_split();
        Ok(Link::from_stream(
            BufReader::new(read_half),
            write_half,
            config.outbound_queue,
        ))
    }

    async fn connect_tcp(addr: &str, config: &ClientConfig) -> Result<Link, ClientError> {
        let budget = config.connect_timeout();
        let stream = timeout(budget, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(budget))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Link::from_stream(
            BufReader::new(read_half),
            write_half,
            config.outbound_queue,
        ))
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, config: &ClientConfig) -> Result<Link, ClientError> {
        debug!(endpoint = %config.endpoint, "Connecting to host");
        match &config.endpoint {
            Endpoint::Unix(path) => Self::connect_unix(path, config).await,
            Endpoint::Tcp(addr) => Self::connect_tcp(addr, config).await,
        }
    }
}
