//! Layout door: the pNFS metadata server side of the front-end.
//!
//! The calls that matter are LAYOUTGET and LAYOUTRETURN; READ, WRITE and
//! COMMIT go straight to the pools.
//!
//! | NFS          | door                                        |
//! |--------------|---------------------------------------------|
//! | LAYOUTGET    | select a pool, start a mover, wait for it   |
//! | GETDEVICEINFO| resolve the device id to pool addresses     |
//! | LAYOUTRETURN | kill the mover, wait for it to go away      |
//!
//! Pool reports come in through [`LayoutDoor::handle_event`].

mod error;
mod layout;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::AppConfig;
use crate::core::device::{Device, DeviceAddr, DeviceId, LayoutType, MDS_DEVICE_ID, RoundRobinStripingPattern};
use crate::core::ledger::TransferLedger;
use crate::core::messaging::{CellPath, DoorEvent, DoorMessage, MessageBus, PoolReady, TransferFinished};
use crate::core::namespace::{FileHandle, FileKind, Inode, Namespace};
use crate::core::notifications::{NotificationChannel, TransferEvent};
use crate::core::registry::DeviceRegistry;
use crate::core::selection::{PoolSelector, RetryPolicy};
use crate::core::state::{StateHandler, StateId};
use crate::core::transfer::{IoMode, Transfer, TransferError, TransferInfo};
use crate::logging::LogThrottle;

pub use error::{NfsError, map_selection_error, status};
pub use layout::{CallContext, Layout, LayoutSegment, NFS4_UINT64_MAX};

#[derive(Debug, Clone)]
pub struct DoorOptions {
    pub cell_name: String,
    pub io_queue: Option<String>,
    pub reply_timeout: Duration,
    pub mover_kill_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub stripe_unit: u32,
}

impl From<&AppConfig> for DoorOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            cell_name: config.cell_name.clone(),
            io_queue: config.io_queue.clone(),
            reply_timeout: config.reply_timeout(),
            mover_kill_timeout: config.mover_kill_timeout(),
            retry_policy: config.retry_policy(),
            stripe_unit: config.stripe_unit,
        }
    }
}

impl Default for DoorOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    pub pool: String,
    pub device: Arc<Device>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoorInfo {
    pub cell_name: String,
    pub io_queue: Option<String>,
    pub pools: usize,
    pub active_transfers: usize,
    pub open_states: usize,
    pub uptime_secs: u64,
}

/// Result of an administrative mover kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    /// Killed through the transfer it belonged to; the transfer is gone.
    Transfer,
    /// No transfer of ours owns the mover; the kill was sent as is.
    Sent,
}

pub struct LayoutDoor {
    options: DoorOptions,
    registry: DeviceRegistry,
    ledger: TransferLedger,
    states: StateHandler,
    selector: Arc<dyn PoolSelector>,
    bus: Arc<dyn MessageBus>,
    namespace: Arc<dyn Namespace>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    started_at: Instant,
    orphan_log: LogThrottle,
}

impl LayoutDoor {
    pub fn new(
        options: DoorOptions,
        selector: Arc<dyn PoolSelector>,
        bus: Arc<dyn MessageBus>,
        namespace: Arc<dyn Namespace>,
    ) -> Self {
        Self {
            options,
            registry: DeviceRegistry::new(Arc::new(RoundRobinStripingPattern)),
            ledger: TransferLedger::new(),
            states: StateHandler::new(),
            selector,
            bus,
            namespace,
            notifier: None,
            started_at: Instant::now(),
            orphan_log: LogThrottle::new(Duration::from_secs(10)),
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn options(&self) -> &DoorOptions {
        &self.options
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub fn states(&self) -> &StateHandler {
        &self.states
    }

    /// GETDEVICEINFO. `None` means the device is unknown.
    pub fn get_device_info(&self, ctx: &CallContext, device_id: DeviceId) -> Option<DeviceAddr> {
        // metadata path: hand back the interface the client already uses
        if device_id.is_mds() {
            return Some(DeviceAddr::files(&RoundRobinStripingPattern, &[ctx.local]));
        }
        self.registry.lookup_by_id(device_id).map(|d| d.addr.clone())
    }

    /// GETDEVICELIST
    pub fn get_device_list(&self) -> Vec<DeviceId> {
        self.registry.device_ids()
    }

    /// LAYOUTGET
    ///
    /// Regular files are served by a pool; anything else goes through the
    /// door's own device. Whatever fails after a mover may have started
    /// kills that mover before the error is returned.
    pub async fn layout_get(
        &self,
        ctx: &CallContext,
        handle: &FileHandle,
        layout_type: LayoutType,
        mode: IoMode,
        state_id: StateId,
    ) -> Result<Layout, NfsError> {
        if layout_type != LayoutType::NfsV41Files {
            warn!(?layout_type, client = %ctx.remote, "Unsupported layout type requested");
            return Err(NfsError::LayoutUnavailable(format!(
                "unsupported layout type: {:?}",
                layout_type
            )));
        }
        if !self.states.contains(&state_id) {
            return Err(NfsError::BadStateId(state_id));
        }

        let inode = self.namespace.resolve(handle).await?;
        let span = info_span!("layout_get", file = %inode.id, client = %ctx.remote);

        async {
            // all non regular files are provided by the door itself
            let (transfer, device_id) = match inode.kind {
                FileKind::Special => (None, MDS_DEVICE_ID),
                FileKind::Regular => {
                    let (transfer, device) =
                        self.redirect_to_pool(ctx, &inode, mode, state_id).await?;
                    (Some(transfer), device.id)
                }
            };

            // a different state id for the layout keeps the mover as long as
            // the file is open; it goes away together with the open state
            let layout_state = match self.states.create_dependent_state(state_id) {
                Ok(id) => id,
                Err(e) => {
                    if let Some(t) = &transfer {
                        self.clean_state_and_kill_mover(t);
                    }
                    return Err(NfsError::from(e));
                }
            };

            let segment = LayoutSegment::whole_file(
                device_id,
                self.options.stripe_unit,
                inode.handle.clone(),
                mode,
            );
            debug!(device_id = %device_id, layout_state = %layout_state, "Layout granted");

            Ok::<_, NfsError>(Layout {
                return_on_close: true,
                state_id: layout_state,
                segments: vec![segment],
            })
        }
        .instrument(span)
        .await
    }

    async fn redirect_to_pool(
        &self,
        ctx: &CallContext,
        inode: &Inode,
        mode: IoMode,
        state_id: StateId,
    ) -> Result<(Arc<Transfer>, Arc<Device>), NfsError> {
        let (transfer, created) = self.ledger.get_or_create(state_id, || {
            Transfer::new(state_id, inode.clone(), mode, ctx.subject, ctx.remote)
        });

        if created {
            if mode.is_write() {
                debug!("Looking for write pool");
            } else {
                debug!("Looking for read pool");
            }

            let request =
                transfer.selection_request(self.options.io_queue.clone(), self.options.cell_name.clone());
            match transfer
                .select_pool_and_start_mover(self.selector.as_ref(), &request, &self.options.retry_policy)
                .await
            {
                Ok(start) => debug!(pool = %start.pool, mover_id = start.mover_id, "Mover started"),
                Err(e) => {
                    info!(error = %e, "Pool selection failed");
                    self.clean_state_and_kill_mover(&transfer);
                    return Err(map_selection_error(&e, mode));
                }
            }
        } else {
            debug!(state_id = %state_id, "Joining existing transfer");
        }

        match transfer.wait_for_redirect(self.options.reply_timeout).await {
            Ok(device) => {
                debug!(pool = ?transfer.pool(), device_id = %device.id, "Mover ready");
                Ok((transfer, device))
            }
            Err(e) => {
                info!(pool = ?transfer.pool(), error = %e, "No redirect from pool");
                self.clean_state_and_kill_mover(&transfer);
                // a joiner answers the way the selecting caller does
                if let Some(failure) = transfer.selection_failure() {
                    return Err(map_selection_error(&failure, mode));
                }
                Err(match e {
                    TransferError::Timeout => NfsError::LayoutTryLater("pool not ready".into()),
                    TransferError::Aborted(state) => {
                        NfsError::LayoutTryLater(format!("transfer {:?}", state).to_lowercase())
                    }
                })
            }
        }
    }

    fn clean_state_and_kill_mover(&self, transfer: &Arc<Transfer>) {
        self.ledger.remove_if_same(transfer);
        transfer.kill_mover(self.bus.as_ref());
    }

    /// LAYOUTRETURN
    ///
    /// Accepts the I/O state id or the layout state id granted for it.
    /// Returning a layout nobody holds is fine.
    pub async fn layout_return(&self, state_id: StateId) -> Result<(), NfsError> {
        let origin = self.states.origin_of(&state_id);
        let key = origin.unwrap_or(state_id);
        debug!(state_id = %state_id, "Releasing device");

        let Some(transfer) = self.ledger.get(&key) else {
            if origin.is_some() {
                self.release_layout_state(&state_id);
            }
            return Ok(());
        };

        if transfer.kill_mover(self.bus.as_ref()) {
            debug!(pool = ?transfer.pool(), mover_id = ?transfer.mover_id(), "Sent KILL");
        }

        if !transfer
            .wait_for_mover(self.options.mover_kill_timeout)
            .await
        {
            info!(
                pool = ?transfer.pool(),
                mover_id = ?transfer.mover_id(),
                "Failed to kill mover: not stopped yet"
            );
            return Err(NfsError::Delay("mover not stopped".into()));
        }

        self.ledger.remove_if_same(&transfer);
        if origin.is_some() {
            self.release_layout_state(&state_id);
        }
        Ok(())
    }

    fn release_layout_state(&self, state_id: &StateId) {
        if let Err(e) = self.states.release(state_id) {
            debug!(state_id = %state_id, error = %e, "Layout state already released");
        }
    }

    /// Open an I/O state for a client.
    pub fn open_state(&self) -> StateId {
        self.states.create_state()
    }

    /// Release an I/O state and every layout state granted for it.
    pub fn close_state(&self, state_id: StateId) -> Result<Vec<StateId>, NfsError> {
        Ok(self.states.release(&state_id)?)
    }

    pub fn handle_event(&self, event: DoorEvent) {
        match event {
            DoorEvent::PoolReady(msg) => {
                self.pool_ready(msg);
            }
            DoorEvent::TransferFinished(msg) => self.transfer_finished(msg),
        }
    }

    /// A pool reports a mover is ready.
    ///
    /// Unknown or restarted pools get a new device id. The waiting layout
    /// request, if there is one, is released, unless the report comes from a
    /// pool other than the one its mover runs on.
    pub fn pool_ready(&self, msg: PoolReady) -> Arc<Device> {
        debug!(pool = %msg.pool, "NFS mover ready");
        let device = self
            .registry
            .record_ready(&msg.pool, &msg.addresses, msg.verifier);

        match self.ledger.get(&msg.state_id) {
            Some(transfer) => {
                if !transfer.redirect(&msg.pool, device.clone()) {
                    debug!(
                        state_id = %msg.state_id,
                        pool = %msg.pool,
                        selected = ?transfer.pool(),
                        state = ?transfer.state(),
                        "Mover ready report ignored"
                    );
                }
            }
            // not started by us, e.g. before a door restart
            None => {
                if self.orphan_log.should_log() {
                    warn!(pool = %msg.pool, state_id = %msg.state_id, "Mover ready for unknown transfer");
                }
            }
        }
        device
    }

    /// A pool reports a mover is done.
    ///
    /// Reports about another mover under the same token, such as the late
    /// kill confirmation of an attempt the client has since retried, leave
    /// the current transfer alone.
    pub fn transfer_finished(&self, msg: TransferFinished) {
        debug!(state_id = %msg.state_id, pool = %msg.pool, mover_id = msg.mover_id, rc = msg.return_code, "Mover done");
        let Some(transfer) = self.ledger.get(&msg.state_id) else {
            return;
        };
        if !transfer.owns_mover(&msg.pool, msg.mover_id) {
            debug!(
                state_id = %msg.state_id,
                current = ?transfer.mover_id(),
                "Finished report for a previous mover ignored"
            );
            return;
        }
        self.ledger.remove_if_same(&transfer);

        transfer.finished(msg.return_code, &msg.message);
        self.namespace.invalidate(transfer.inode());

        if let Some(notifier) = &self.notifier {
            let info = transfer.info();
            let event = TransferEvent::Finished {
                state_id: info.state_id,
                file: info.file,
                pool: info.pool,
                mover_id: info.mover_id,
                client: info.client,
                mode: info.mode,
                return_code: msg.return_code,
                message: msg.message,
                duration_ms: (chrono::Utc::now() - info.created_at).num_milliseconds(),
            };
            let notifier = notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(event).await {
                    warn!(error = %e, "Failed to send transfer record");
                }
            });
        }
    }

    /// Pools ask whether a state id still belongs to a live client state.
    pub fn validate_mover(&self, state_id: &StateId) -> bool {
        self.states.contains(state_id)
    }

    /// Administrative mover kill by pool name and mover id.
    pub fn kill_mover(&self, pool: &str, mover_id: u32) -> KillOutcome {
        let owner = self.ledger.values().into_iter().find(|t| {
            t.pool().as_deref() == Some(pool) && t.mover_id() == Some(mover_id)
        });

        if let Some(transfer) = owner {
            transfer.kill_mover(self.bus.as_ref());
            self.ledger.remove_if_same(&transfer);
            return KillOutcome::Transfer;
        }

        let message = DoorMessage::KillMover {
            pool: pool.to_string(),
            mover_id,
        };
        if let Err(e) = self.bus.notify(&CellPath::new(pool), message) {
            warn!(pool, mover_id, error = %e, "Failed to send mover kill");
        }
        KillOutcome::Sent
    }

    /// Forget the device id of `pool`.
    pub fn reset_pool(&self, pool: &str) -> Option<Arc<Device>> {
        let removed = self.registry.remove(pool);
        if let Some(device) = &removed {
            info!(pool, device_id = %device.id, "Pool device mapping removed");
        }
        removed
    }

    pub fn pools(&self, filter: Option<&str>) -> Vec<PoolEntry> {
        self.registry
            .list()
            .into_iter()
            .filter(|(name, _)| filter.is_none_or(|f| f == name.as_str()))
            .map(|(pool, device)| PoolEntry { pool, device })
            .collect()
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        let mut list: Vec<_> = self.ledger.values().iter().map(|t| t.info()).collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub fn info(&self) -> DoorInfo {
        DoorInfo {
            cell_name: self.options.cell_name.clone(),
            io_queue: self.options.io_queue.clone(),
            pools: self.registry.len(),
            active_transfers: self.ledger.len(),
            open_states: self.states.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Kill every active mover and drop all transfers.
    pub fn shutdown(&self) {
        let transfers = self.ledger.values();
        for transfer in &transfers {
            transfer.kill_mover(self.bus.as_ref());
            self.ledger.remove_if_same(transfer);
        }
        info!(killed = transfers.len(), "Door shut down");
    }

    /// Wait up to `timeout` for queued pool messages to go out.
    pub async fn drain_messages(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.bus.pending();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Pool messages not delivered before shutdown");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
