//! TCP listener with newline-delimited JSON framing, one task per
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Both ends of the connection a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(bind_addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let local = match stream.local_addr() {
                                Ok(local) => local,
                                Err(e) => {
                                    warn!(peer = %remote, error = %e, "No local address for connection");
                                    continue;
                                }
                            };
                            debug!(peer = %remote, "Client connected");

                            let handler = self.handler.clone();
                            let peer = Peer { remote, local };
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, handler).await {
                                    debug!(peer = %remote, error = %e, "Connection error");
                                }
                                debug!(peer = %remote, "Client disconnected");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: Peer,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(peer = %peer.remote, error = msg, "Invalid request");
                    let id = request.id.clone().unwrap_or(serde_json::Value::Null);
                    Response::invalid_request(id)
                } else if request.is_notification() {
                    debug!(peer = %peer.remote, method = %request.method, "Notification received");
                    handler.handle(request, peer).await;
                    continue;
                } else {
                    handler.handle(request, peer).await
                }
            }
            Err(e) => {
                warn!(peer = %peer.remote, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
    }

    Ok(())
}
