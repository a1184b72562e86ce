use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::context::AppContext;
use crate::core::messaging::DoorEvent;
use crate::door::LayoutDoor;
use crate::rpc::RpcServer;

/// How long queued kills get to reach the pools on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    ctx: AppContext,
    events: mpsc::Receiver<DoorEvent>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, events: mpsc::Receiver<DoorEvent>) -> Self {
        Self { ctx, events }
    }

    /// Serve until ctrl-c, then kill every mover the door still owns.
    pub async fn start(self) -> Result<()> {
        info!(
            cell = %self.ctx.config.cell_name,
            simulation = self.ctx.config.simulation,
            "Layout door starting"
        );

        let server = Arc::new(
            RpcServer::bind(self.ctx.clone(), self.ctx.config.rpc_bind)
                .await
                .with_context(|| format!("Failed to bind {}", self.ctx.config.rpc_bind))?,
        );

        let rpc = server.clone();
        let rpc_task = tokio::spawn(async move {
            if let Err(e) = rpc.start().await {
                error!(error = %e, "RPC server failed");
            }
        });

        let door = self.ctx.door.clone();
        let event_task = tokio::spawn(run_events(door.clone(), self.events));

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        info!("Shutdown requested");

        server.shutdown();
        event_task.abort();
        door.shutdown();
        door.drain_messages(DRAIN_TIMEOUT).await;
        let _ = rpc_task.await;
        Ok(())
    }
}

/// Apply pool reports to the door in arrival order until every sender is
/// gone.
pub async fn run_events(door: Arc<LayoutDoor>, mut events: mpsc::Receiver<DoorEvent>) {
    while let Some(event) = events.recv().await {
        door.handle_event(event);
    }
}
