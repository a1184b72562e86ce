//! Per-request transfer state machine.
//!
//! ```text
//! Created -> Selecting -> Started -> Redirected -> Finished | Failed | Killed
//! ```
//!
//! A transfer asks the selection service for a pool and a mover, then waits
//! for that pool to report that the mover is ready. The report arrives on a
//! different task; it is handed over through a single-slot rendezvous where
//! the first report wins and later ones are ignored. Both waits a protocol
//! call can do on a transfer, for the device and for the mover to stop, are
//! bounded by the caller.
//!
//! A transfer never removes itself from the ledger. Whoever observes a
//! terminal state does that.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::device::{Device, DeviceId};
use super::messaging::{CellPath, DoorMessage, MessageBus};
use super::namespace::Inode;
use super::selection::{MoverStart, PoolSelector, RetryPolicy, SelectionError, SelectionRequest};
use super::state::StateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    Read,
    ReadWrite,
}

impl IoMode {
    /// Decode a wire layout iomode.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Read),
            2 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Identity the I/O is performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub uid: u32,
    pub gid: u32,
}

impl Subject {
    pub const ROOT: Subject = Subject { uid: 0, gid: 0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Created,
    Selecting,
    Started,
    Redirected,
    Finished,
    Failed,
    Killed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }

    fn accepts_redirect(&self) -> bool {
        matches!(self, Self::Created | Self::Selecting | Self::Started)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("timed out waiting for pool")]
    Timeout,
    #[error("transfer is {0:?}")]
    Aborted(TransferState),
}

#[derive(Debug, Clone)]
enum Redirect {
    Pending,
    Ready(Arc<Device>),
    Closed,
}

#[derive(Debug)]
struct Progress {
    state: TransferState,
    pool: Option<String>,
    mover_id: Option<u32>,
    device: Option<Arc<Device>>,
    return_code: Option<i32>,
    error: Option<String>,
    failure: Option<SelectionError>,
}

/// Snapshot of a transfer for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub state_id: StateId,
    pub file: String,
    pub mode: IoMode,
    pub client: SocketAddr,
    pub state: TransferState,
    pub pool: Option<String>,
    pub mover_id: Option<u32>,
    pub device_id: Option<DeviceId>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct Transfer {
    state_id: StateId,
    inode: Inode,
    mode: IoMode,
    subject: Subject,
    client: SocketAddr,
    created_at: DateTime<Utc>,
    progress: Mutex<Progress>,
    redirect: watch::Sender<Redirect>,
    mover_done: watch::Sender<bool>,
    kill_sent: AtomicBool,
}

impl Transfer {
    pub fn new(
        state_id: StateId,
        inode: Inode,
        mode: IoMode,
        subject: Subject,
        client: SocketAddr,
    ) -> Self {
        let (redirect, _) = watch::channel(Redirect::Pending);
        let (mover_done, _) = watch::channel(false);

        Self {
            state_id,
            inode,
            mode,
            subject,
            client,
            created_at: Utc::now(),
            progress: Mutex::new(Progress {
                state: TransferState::Created,
                pool: None,
                mover_id: None,
                device: None,
                return_code: None,
                error: None,
                failure: None,
            }),
            redirect,
            mover_done,
            kill_sent: AtomicBool::new(false),
        }
    }

    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn state(&self) -> TransferState {
        self.progress.lock().state
    }

    pub fn pool(&self) -> Option<String> {
        self.progress.lock().pool.clone()
    }

    pub fn mover_id(&self) -> Option<u32> {
        self.progress.lock().mover_id
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.progress.lock().device.clone()
    }

    /// Why selection failed, for callers that joined the transfer.
    pub fn selection_failure(&self) -> Option<SelectionError> {
        self.progress.lock().failure.clone()
    }

    /// Whether `mover_id` on `pool` is the mover this transfer started.
    pub fn owns_mover(&self, pool: &str, mover_id: u32) -> bool {
        let p = self.progress.lock();
        p.mover_id == Some(mover_id) && p.pool.as_deref() == Some(pool)
    }

    pub fn selection_request(&self, io_queue: Option<String>, door: String) -> SelectionRequest {
        SelectionRequest {
            state_id: self.state_id,
            file: self.inode.id.clone(),
            mode: self.mode,
            subject: self.subject,
            client: self.client,
            io_queue,
            door,
        }
    }

    /// Ask the selection service for a pool and start a mover there.
    ///
    /// Only the task that created the transfer calls this.
    pub async fn select_pool_and_start_mover(
        &self,
        selector: &dyn PoolSelector,
        request: &SelectionRequest,
        policy: &RetryPolicy,
    ) -> Result<MoverStart, SelectionError> {
        {
            let mut p = self.progress.lock();
            match p.state {
                TransferState::Created => p.state = TransferState::Selecting,
                TransferState::Redirected => {}
                _ => return Err(SelectionError::Interrupted),
            }
        }

        let result = selector.select_and_start(request, policy).await;

        let mut p = self.progress.lock();
        match result {
            Ok(start) => {
                p.pool = Some(start.pool.clone());
                p.mover_id = Some(start.mover_id);
                match p.state {
                    TransferState::Selecting => p.state = TransferState::Started,
                    // the pool may answer before the selection reply does
                    TransferState::Redirected | TransferState::Finished => {}
                    // killed while selecting: the caller still owns the mover
                    TransferState::Killed => return Err(SelectionError::Interrupted),
                    other => {
                        warn!(state_id = %self.state_id, state = ?other, "Mover started in unexpected state")
                    }
                }
                Ok(start)
            }
            Err(e) => {
                if !p.state.is_terminal() {
                    p.state = TransferState::Failed;
                }
                p.error = Some(e.to_string());
                p.failure = Some(e.clone());
                self.close_redirect();
                Err(e)
            }
        }
    }

    /// Hand the pool's device to whoever waits on this transfer.
    ///
    /// Returns false if the report came too late to matter or came from a
    /// pool other than the selected one. Before selection answers any pool
    /// is taken at its word.
    pub fn redirect(&self, pool: &str, device: Arc<Device>) -> bool {
        let mut p = self.progress.lock();
        if !p.state.accepts_redirect() {
            return false;
        }
        if p.pool.as_deref().is_some_and(|selected| selected != pool) {
            return false;
        }
        p.state = TransferState::Redirected;
        p.device = Some(device.clone());
        self.redirect.send_replace(Redirect::Ready(device));
        true
    }

    /// Wait up to `timeout` for the pool's device.
    ///
    /// A timeout leaves the transfer as it is.
    pub async fn wait_for_redirect(&self, timeout: Duration) -> Result<Arc<Device>, TransferError> {
        let mut rx = self.redirect.subscribe();
        let outcome = match tokio::time::timeout(
            timeout,
            rx.wait_for(|r| !matches!(r, Redirect::Pending)),
        )
        .await
        {
            Err(_) => return Err(TransferError::Timeout),
            Ok(Ok(r)) => r.clone(),
            Ok(Err(_)) => Redirect::Closed,
        };

        match outcome {
            Redirect::Ready(device) => Ok(device),
            _ => Err(TransferError::Aborted(self.state())),
        }
    }

    /// Ask the pool to kill the mover. Does not wait for it to happen.
    ///
    /// The kill message goes out at most once per transfer; returns whether
    /// this call sent it.
    pub fn kill_mover(&self, bus: &dyn MessageBus) -> bool {
        let target = {
            let mut p = self.progress.lock();
            match p.state {
                TransferState::Finished | TransferState::Failed => return false,
                TransferState::Killed => {}
                _ => {
                    p.state = TransferState::Killed;
                    self.close_redirect();
                }
            }
            match (&p.pool, p.mover_id) {
                (Some(pool), Some(mover_id)) if !self.kill_sent.swap(true, Ordering::SeqCst) => {
                    Some((pool.clone(), mover_id))
                }
                _ => None,
            }
        };

        let Some((pool, mover_id)) = target else {
            return false;
        };

        debug!(pool = %pool, mover_id, state_id = %self.state_id, "Sending KILL");
        let message = DoorMessage::KillMover {
            pool: pool.clone(),
            mover_id,
        };
        if let Err(e) = bus.notify(&CellPath::new(&pool), message) {
            warn!(pool = %pool, mover_id, error = %e, "Failed to send mover kill");
        }
        true
    }

    /// The pool reports the mover is gone.
    pub fn finished(&self, return_code: i32, message: &str) {
        let mut p = self.progress.lock();
        if !p.state.is_terminal() {
            p.state = TransferState::Finished;
        }
        p.return_code = Some(return_code);
        if return_code != 0 && !message.is_empty() {
            p.error = Some(message.to_string());
        }
        self.close_redirect();
        self.mover_done.send_replace(true);
    }

    /// Wait up to `timeout` for the mover to be gone. A transfer that never
    /// started a mover has nothing to wait for.
    pub async fn wait_for_mover(&self, timeout: Duration) -> bool {
        if self.mover_id().is_none() {
            return true;
        }
        let mut rx = self.mover_done.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }

    pub fn info(&self) -> TransferInfo {
        let p = self.progress.lock();
        TransferInfo {
            state_id: self.state_id,
            file: self.inode.id.to_string(),
            mode: self.mode,
            client: self.client,
            state: p.state,
            pool: p.pool.clone(),
            mover_id: p.mover_id,
            device_id: p.device.as_ref().map(|d| d.id),
            return_code: p.return_code,
            error: p.error.clone(),
            created_at: self.created_at,
        }
    }

    fn close_redirect(&self) {
        self.redirect.send_if_modified(|r| {
            if matches!(r, Redirect::Pending) {
                *r = Redirect::Closed;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.progress.lock();
        write!(
            f,
            "{} : {}@{}, OS={}, cl=[{}], {:?}",
            self.inode.id,
            p.mover_id.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            p.pool.as_deref().unwrap_or("-"),
            self.state_id,
            self.client.ip(),
            p.state
        )
    }
}
