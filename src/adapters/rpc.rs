//! Collaborators reached over JSON-RPC: the pool manager that selects pools
//! and starts movers, and the pools that get kill messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::messaging::{BusError, CellPath, DoorMessage, MessageBus};
use crate::core::selection::{MoverStart, PoolSelector, RetryPolicy, SelectionError, SelectionRequest};
use crate::rpc::{ClientError, RpcClient};

pub const SELECT_METHOD: &str = "pool.select_and_start";

pub struct RpcPoolManager {
    client: RpcClient,
}

impl RpcPoolManager {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: RpcClient::new(addr),
        }
    }
}

/// Errors carrying a backend `rc` keep their cause; a manager that cannot be
/// reached counts as no pool online.
fn selection_error(err: ClientError) -> SelectionError {
    match err {
        ClientError::Rpc(e) => {
            let rc = e
                .data
                .as_ref()
                .and_then(|d| d.get("rc"))
                .and_then(Value::as_i64)
                .and_then(|rc| i32::try_from(rc).ok());
            match rc {
                Some(rc) => SelectionError::from_rc(rc, e.message),
                None => SelectionError::Other {
                    rc: e.code,
                    message: e.message,
                },
            }
        }
        other => SelectionError::NoPoolOnline(other.to_string()),
    }
}

#[async_trait]
impl PoolSelector for RpcPoolManager {
    async fn select_and_start(
        &self,
        request: &SelectionRequest,
        policy: &RetryPolicy,
    ) -> Result<MoverStart, SelectionError> {
        let params = serde_json::to_value(request).map_err(|e| SelectionError::Other {
            rc: -1,
            message: e.to_string(),
        })?;

        policy
            .run(|_| {
                let params = params.clone();
                async move {
                    self.client
                        .call::<MoverStart>(SELECT_METHOD, Some(params))
                        .await
                        .map_err(selection_error)
                }
            })
            .await
    }
}

/// Delivers messages as JSON-RPC notifications from a background task so
/// callers never wait on the network.
pub struct RpcMessageBus {
    routes: HashMap<String, SocketAddr>,
    queue: mpsc::UnboundedSender<(SocketAddr, DoorMessage)>,
    /// Queued or in flight; a failed delivery counts as done.
    pending: Arc<AtomicUsize>,
}

impl RpcMessageBus {
    /// Must be called inside a tokio runtime.
    pub fn spawn(routes: HashMap<String, SocketAddr>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(SocketAddr, DoorMessage)>();
        let pending = Arc::new(AtomicUsize::new(0));

        let in_flight = pending.clone();
        tokio::spawn(async move {
            while let Some((addr, message)) = rx.recv().await {
                deliver(addr, message).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            routes,
            queue,
            pending,
        }
    }
}

async fn deliver(addr: SocketAddr, message: DoorMessage) {
    let params = match serde_json::to_value(&message) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Failed to encode message");
            return;
        }
    };
    match RpcClient::new(addr).notify(message.method(), Some(params)).await {
        Ok(()) => debug!(%addr, ?message, "Message delivered"),
        Err(e) => warn!(%addr, ?message, error = %e, "Message delivery failed"),
    }
}

impl MessageBus for RpcMessageBus {
    fn notify(&self, path: &CellPath, message: DoorMessage) -> Result<(), BusError> {
        let destination = path.destination();
        let addr = self
            .routes
            .get(&destination.cell)
            .ok_or_else(|| BusError::NoRoute(destination.to_string()))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.send((*addr, message)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            BusError::Closed
        })
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
