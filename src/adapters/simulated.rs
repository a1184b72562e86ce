use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::messaging::{
    BusError, CellPath, DoorEvent, DoorMessage, MessageBus, PoolReady, TransferFinished,
};
use crate::core::selection::{MoverStart, PoolSelector, RetryPolicy, SelectionError, SelectionRequest};
use crate::core::state::StateId;

/// A pool as the simulator knows it.
#[derive(Debug, Clone)]
pub struct SimPool {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
    pub verifier: u64,
}

impl SimPool {
    pub fn new(name: &str, addresses: &[&str], verifier: u64) -> Self {
        Self {
            name: name.to_string(),
            addresses: addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            verifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMover {
    pub pool: String,
    pub mover_id: u32,
    pub state_id: StateId,
}

struct SimState {
    pools: Vec<SimPool>,
    movers: HashMap<(String, u32), StateId>,
    started: Vec<SimMover>,
    kills: Vec<DoorMessage>,
    failure: Option<SelectionError>,
    auto_ready: bool,
    confirm_kills: bool,
    ready_delay: Duration,
}

struct Inner {
    state: Mutex<SimState>,
    next_pool: AtomicUsize,
    next_mover: AtomicU32,
    events: mpsc::Sender<DoorEvent>,
}

impl Inner {
    fn emit(&self, event: DoorEvent) {
        if self.events.try_send(event).is_err() {
            warn!("(Simulator) Event channel full or closed, report dropped");
        }
    }
}

/// In-process pool selection and pool messaging.
#[derive(Clone)]
pub struct SimulatedPools {
    inner: Arc<Inner>,
}

/// Drives the simulated pools from tests or the console.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl SimulatedPools {
    /// Pools report ready right away and confirm kills; use the
    /// [`Simulator`] to change that.
    pub fn new(pools: Vec<SimPool>, events: mpsc::Sender<DoorEvent>) -> (Self, Simulator) {
        let inner = Arc::new(Inner {
            state: Mutex::new(SimState {
                pools,
                movers: HashMap::new(),
                started: Vec::new(),
                kills: Vec::new(),
                failure: None,
                auto_ready: true,
                confirm_kills: true,
                ready_delay: Duration::ZERO,
            }),
            next_pool: AtomicUsize::new(0),
            next_mover: AtomicU32::new(1),
            events,
        });

        (
            Self {
                inner: inner.clone(),
            },
            Simulator { inner },
        )
    }
}

#[async_trait]
impl PoolSelector for SimulatedPools {
    async fn select_and_start(
        &self,
        request: &SelectionRequest,
        _policy: &RetryPolicy,
    ) -> Result<MoverStart, SelectionError> {
        let (pool, mover_id, ready) = {
            let mut s = self.inner.state.lock();
            if let Some(err) = &s.failure {
                return Err(err.clone());
            }
            if s.pools.is_empty() {
                return Err(SelectionError::NoPoolConfigured("no pools".into()));
            }

            let idx = self.inner.next_pool.fetch_add(1, Ordering::Relaxed) % s.pools.len();
            let pool = s.pools[idx].clone();
            let mover_id = self.inner.next_mover.fetch_add(1, Ordering::Relaxed);

            s.movers.insert((pool.name.clone(), mover_id), request.state_id);
            s.started.push(SimMover {
                pool: pool.name.clone(),
                mover_id,
                state_id: request.state_id,
            });

            let ready = s.auto_ready.then_some(s.ready_delay);
            (pool, mover_id, ready)
        };

        debug!(pool = %pool.name, mover_id, "(Simulator) Mover started");

        if let Some(delay) = ready {
            let inner = self.inner.clone();
            let report = PoolReady {
                state_id: request.state_id,
                pool: pool.name.clone(),
                addresses: pool.addresses.clone(),
                verifier: pool.verifier,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.emit(DoorEvent::PoolReady(report));
            });
        }

        Ok(MoverStart {
            pool: pool.name,
            mover_id,
        })
    }
}

impl MessageBus for SimulatedPools {
    fn notify(&self, path: &CellPath, message: DoorMessage) -> Result<(), BusError> {
        let confirm = {
            let mut s = self.inner.state.lock();
            if !s.pools.iter().any(|p| p.name == path.destination().cell) {
                return Err(BusError::NoRoute(path.destination().to_string()));
            }
            s.kills.push(message.clone());

            let DoorMessage::KillMover { pool, mover_id } = &message;
            let owner = s.movers.remove(&(pool.clone(), *mover_id));
            owner
                .filter(|_| s.confirm_kills)
                .map(|state_id| (state_id, pool.clone(), *mover_id))
        };

        if let Some((state_id, pool, mover_id)) = confirm {
            self.inner.emit(DoorEvent::TransferFinished(TransferFinished {
                state_id,
                pool,
                mover_id,
                return_code: 0,
                message: "killed".into(),
            }));
        }
        Ok(())
    }
}

impl Simulator {
    pub fn set_failure(&self, failure: Option<SelectionError>) {
        self.inner.state.lock().failure = failure;
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.inner.state.lock().auto_ready = auto_ready;
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.inner.state.lock().ready_delay = delay;
    }

    pub fn set_confirm_kills(&self, confirm: bool) {
        self.inner.state.lock().confirm_kills = confirm;
    }

    /// Simulate a pool restart: it comes back with a new verifier.
    pub fn restart_pool(&self, name: &str, verifier: u64) -> bool {
        let mut s = self.inner.state.lock();
        match s.pools.iter_mut().find(|p| p.name == name) {
            Some(pool) => {
                pool.verifier = verifier;
                true
            }
            None => false,
        }
    }

    /// Send the "mover ready" report for the mover serving `state_id`.
    pub fn report_ready(&self, state_id: StateId) -> bool {
        let report = {
            let s = self.inner.state.lock();
            let Some(mover) = s.started.iter().rev().find(|m| m.state_id == state_id) else {
                return false;
            };
            let Some(pool) = s.pools.iter().find(|p| p.name == mover.pool) else {
                return false;
            };
            PoolReady {
                state_id,
                pool: pool.name.clone(),
                addresses: pool.addresses.clone(),
                verifier: pool.verifier,
            }
        };
        self.inner.emit(DoorEvent::PoolReady(report));
        true
    }

    /// Send "transfer finished" for the latest mover serving `state_id`.
    pub fn finish(&self, state_id: StateId, return_code: i32) -> bool {
        let latest = {
            let s = self.inner.state.lock();
            s.started
                .iter()
                .rev()
                .find(|m| m.state_id == state_id)
                .map(|m| (m.pool.clone(), m.mover_id))
        };
        match latest {
            Some((pool, mover_id)) => self.finish_mover(&pool, mover_id, return_code),
            None => false,
        }
    }

    /// Send "transfer finished" for one mover, whether or not it was killed
    /// already. Late confirmations look like this.
    pub fn finish_mover(&self, pool: &str, mover_id: u32, return_code: i32) -> bool {
        let report = {
            let mut s = self.inner.state.lock();
            let Some(state_id) = s
                .started
                .iter()
                .find(|m| m.pool == pool && m.mover_id == mover_id)
                .map(|m| m.state_id)
            else {
                return false;
            };
            s.movers.remove(&(pool.to_string(), mover_id));
            TransferFinished {
                state_id,
                pool: pool.to_string(),
                mover_id,
                return_code,
                message: String::new(),
            }
        };
        self.inner.emit(DoorEvent::TransferFinished(report));
        true
    }

    pub fn started(&self) -> Vec<SimMover> {
        self.inner.state.lock().started.clone()
    }

    pub fn kills(&self) -> Vec<DoorMessage> {
        self.inner.state.lock().kills.clone()
    }

    /// Movers started and not yet killed or finished.
    pub fn running(&self) -> usize {
        self.inner.state.lock().movers.len()
    }
}
