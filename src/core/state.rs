//! Client I/O states and the layout sub-states derived from them.
//!
//! A state id is the fixed-size handle a client presents with every I/O
//! operation. The door uses it as the idempotence key for transfers. Once a
//! layout is granted the door mints a second, dependent state for it; the
//! dependent keeps a back-reference to its origin but never keeps the origin
//! alive. Releasing an origin releases all of its dependents.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const STATEID_OTHER_SIZE: usize = 12;

/// Opaque state handle: a 12 byte identifier plus a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    pub seqid: u32,
    pub other: [u8; STATEID_OTHER_SIZE],
}

impl StateId {
    pub fn new(other: [u8; STATEID_OTHER_SIZE], seqid: u32) -> Self {
        Self { seqid, other }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.other {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":{}", self.seqid)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed state id: {0}")]
pub struct ParseStateIdError(String);

impl FromStr for StateId {
    type Err = ParseStateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseStateIdError(s.to_string());
        let (hex, seqid) = s.split_once(':').ok_or_else(bad)?;
        if hex.len() != STATEID_OTHER_SIZE * 2 || !hex.is_ascii() {
            return Err(bad());
        }

        let mut other = [0u8; STATEID_OTHER_SIZE];
        for (i, byte) in other.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| bad())?;
        }
        let seqid = seqid.parse().map_err(|_| bad())?;

        Ok(Self { seqid, other })
    }
}

impl Serialize for StateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("bad state id: {0}")]
    BadStateId(StateId),
}

#[derive(Debug, Default)]
struct StateEntry {
    /// Back-reference to the state this one was derived from.
    origin: Option<StateId>,
    dependents: Vec<StateId>,
}

/// Table of live client states.
pub struct StateHandler {
    states: DashMap<StateId, StateEntry>,
    counter: AtomicU64,
    instance: [u8; 4],
}

impl Default for StateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandler {
    pub fn new() -> Self {
        let uuid = Uuid::now_v7();
        let bytes = uuid.as_bytes();
        let mut instance = [0u8; 4];
        instance.copy_from_slice(&bytes[12..16]);

        Self {
            states: DashMap::new(),
            counter: AtomicU64::new(1),
            instance,
        }
    }

    fn mint(&self) -> StateId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut other = [0u8; STATEID_OTHER_SIZE];
        other[..8].copy_from_slice(&n.to_be_bytes());
        other[8..].copy_from_slice(&self.instance);
        StateId::new(other, 1)
    }

    /// Open a new I/O state.
    pub fn create_state(&self) -> StateId {
        let id = self.mint();
        self.states.insert(id, StateEntry::default());
        debug!(state_id = %id, "State created");
        id
    }

    /// Mint a state that is released together with `origin`.
    pub fn create_dependent_state(&self, origin: StateId) -> Result<StateId, StateError> {
        let id = self.mint();
        // Publish the dependent before linking it: a release of the origin
        // either sees the link or the link fails and the dependent is undone.
        self.states.insert(
            id,
            StateEntry {
                origin: Some(origin),
                dependents: Vec::new(),
            },
        );
        match self.states.get_mut(&origin) {
            Some(mut entry) => entry.dependents.push(id),
            None => {
                self.states.remove(&id);
                return Err(StateError::BadStateId(origin));
            }
        }

        debug!(state_id = %id, origin = %origin, "Dependent state created");
        Ok(id)
    }

    pub fn contains(&self, id: &StateId) -> bool {
        self.states.contains_key(id)
    }

    /// The state `id` was derived from, if any.
    pub fn origin_of(&self, id: &StateId) -> Option<StateId> {
        self.states.get(id).and_then(|e| e.origin)
    }

    /// Release a state and, transitively, every state derived from it.
    /// Returns all released ids, `id` first.
    pub fn release(&self, id: &StateId) -> Result<Vec<StateId>, StateError> {
        let (_, entry) = self.states.remove(id).ok_or(StateError::BadStateId(*id))?;

        if let Some(origin) = entry.origin {
            if let Some(mut o) = self.states.get_mut(&origin) {
                o.dependents.retain(|d| d != id);
            }
        }

        let mut released = vec![*id];
        let mut pending = entry.dependents;
        while let Some(dep) = pending.pop() {
            match self.states.remove(&dep) {
                Some((_, e)) => {
                    released.push(dep);
                    pending.extend(e.dependents);
                }
                None => warn!(state_id = %dep, "Dependent state already released"),
            }
        }

        debug!(state_id = %id, released = released.len(), "State released");
        Ok(released)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_id_text_form_parses_back() {
        let id = StateId::new([0xab; STATEID_OTHER_SIZE], 7);
        let text = id.to_string();
        assert_eq!(text, "abababababababababababab:7");
        assert_eq!(text.parse::<StateId>().unwrap(), id);
    }

    #[test]
    fn malformed_state_id_is_rejected() {
        assert!("abab:1".parse::<StateId>().is_err());
        assert!("zzabababababababababab:1".parse::<StateId>().is_err());
        assert!("abababababababababababab".parse::<StateId>().is_err());
    }

    #[test]
    fn minted_states_are_distinct() {
        let handler = StateHandler::new();
        let a = handler.create_state();
        let b = handler.create_state();
        assert_ne!(a, b);
        assert_eq!(handler.len(), 2);
    }

    #[test]
    fn releasing_origin_releases_dependents() {
        let handler = StateHandler::new();
        let open = handler.create_state();
        let layout = handler.create_dependent_state(open).unwrap();

        assert_eq!(handler.origin_of(&layout), Some(open));

        let released = handler.release(&open).unwrap();
        assert_eq!(released, vec![open, layout]);
        assert!(!handler.contains(&layout));
        assert!(handler.is_empty());
    }

    #[test]
    fn dependent_can_be_released_alone() {
        let handler = StateHandler::new();
        let open = handler.create_state();
        let layout = handler.create_dependent_state(open).unwrap();

        handler.release(&layout).unwrap();
        assert!(handler.contains(&open));

        // origin no longer lists the released dependent
        assert_eq!(handler.release(&open).unwrap(), vec![open]);
    }

    #[test]
    fn dependent_of_unknown_state_fails() {
        let handler = StateHandler::new();
        let ghost = StateId::new([1; STATEID_OTHER_SIZE], 1);
        assert_eq!(
            handler.create_dependent_state(ghost),
            Err(StateError::BadStateId(ghost))
        );
        assert_eq!(handler.release(&ghost), Err(StateError::BadStateId(ghost)));
    }
}
