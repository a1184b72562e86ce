//! Messages exchanged with pools.
//!
//! Pools report asynchronously: "mover ready" once a mover listens for the
//! client and "transfer finished" once it is gone. The door talks back only
//! with fire-and-forget messages addressed by a routing path.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::StateId;

/// One hop: a cell, optionally qualified by its domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub cell: String,
    pub domain: Option<String>,
}

impl CellAddress {
    pub fn new(cell: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            domain: None,
        }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}@{}", self.cell, domain),
            None => f.write_str(&self.cell),
        }
    }
}

impl FromStr for CellAddress {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, domain) = match s.split_once('@') {
            Some((cell, domain)) => (cell, Some(domain)),
            None => (s, None),
        };
        if cell.is_empty() || domain.is_some_and(str::is_empty) {
            return Err(PathError(s.to_string()));
        }
        Ok(Self {
            cell: cell.to_string(),
            domain: domain.map(str::to_string),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cell path: {0:?}")]
pub struct PathError(String);

/// Ordered list of hops with a cursor on the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellPath {
    hops: Vec<CellAddress>,
    position: usize,
}

impl CellPath {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            hops: vec![CellAddress::new(destination)],
            position: 0,
        }
    }

    pub fn hops(&self) -> usize {
        self.hops.len()
    }

    pub fn current(&self) -> &CellAddress {
        &self.hops[self.position]
    }

    pub fn destination(&self) -> &CellAddress {
        &self.hops[self.hops.len() - 1]
    }

    /// Advance to the next hop. False when already at the destination.
    pub fn next(&mut self) -> bool {
        if self.is_final_destination() {
            return false;
        }
        self.position += 1;
        true
    }

    pub fn is_first_destination(&self) -> bool {
        self.position == 0
    }

    pub fn is_final_destination(&self) -> bool {
        self.position + 1 >= self.hops.len()
    }

    /// Reverse the hops and rewind, turning a request path into a reply path.
    pub fn revert(&mut self) {
        self.hops.reverse();
        self.position = 0;
    }
}

impl FromStr for CellPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hops = s
            .split(':')
            .map(str::parse)
            .collect::<Result<Vec<CellAddress>, _>>()?;
        if hops.is_empty() {
            return Err(PathError(s.to_string()));
        }
        Ok(Self { hops, position: 0 })
    }
}

impl fmt::Display for CellPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            if i == self.position {
                write!(f, ">")?;
            }
            write!(f, "{}", hop)?;
        }
        write!(f, "]")
    }
}

/// "Mover ready" report from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReady {
    pub state_id: StateId,
    pub pool: String,
    pub addresses: Vec<SocketAddr>,
    #[serde(default)]
    pub verifier: u64,
}

/// "Transfer finished" report from a pool.
///
/// A token is reused when a client retries, so the mover the report is
/// about is named too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFinished {
    pub state_id: StateId,
    pub pool: String,
    pub mover_id: u32,
    pub return_code: i32,
    #[serde(default)]
    pub message: String,
}

/// Inbound reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoorEvent {
    PoolReady(PoolReady),
    TransferFinished(TransferFinished),
}

/// Outbound messages. None of them expects a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DoorMessage {
    KillMover { pool: String, mover_id: u32 },
}

impl DoorMessage {
    pub fn method(&self) -> &'static str {
        match self {
            Self::KillMover { .. } => "mover.kill",
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no route to {0}")]
    NoRoute(String),
    #[error("message bus closed")]
    Closed,
}

/// Fire-and-forget delivery. Implementations must not block the caller.
pub trait MessageBus: Send + Sync {
    fn notify(&self, path: &CellPath, message: DoorMessage) -> Result<(), BusError>;

    /// Messages accepted but not delivered yet.
    fn pending(&self) -> usize {
        0
    }
}
