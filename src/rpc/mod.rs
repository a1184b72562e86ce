//! JSON-RPC 2.0 over TCP.
//!
//! - `protocol`: request/response types
//! - `transport`: listener with newline-delimited JSON framing
//! - `methods`: dispatch to the door
//! - `client`: outbound calls and notifications

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{NFS_ERROR, NOT_FOUND, Request, Response, RpcError};
pub use transport::Peer;

pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(ctx)).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
