//! Routing matrix: which source feeds which slot.
//!
//! The whole slot -> source mapping is replaced atomically through an
//! [`ArcSwap`]; readers load one snapshot and use it for an entire tick, so
//! they never see a partially applied update.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};

/// Full slot -> source mapping, a total function over the slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingAssignment {
    sources: Vec<usize>,
    version: u64,
}

impl RoutingAssignment {
    /// Default mapping `slot_i -> source_(i mod M)`.
    pub fn round_robin(num_slots: usize, num_sources: usize) -> Self {
        Self {
            sources: (0..num_slots).map(|i| i % num_sources.max(1)).collect(),
            version: 0,
        }
    }

    pub fn source_for(&self, slot: usize) -> Option<usize> {
        self.sources.get(slot).copied()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.sources
    }

    /// Incremented on every applied change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Authoritative routing state shared by the controller and all selectors.
pub struct RoutingMatrix {
    num_sources: usize,
    current: ArcSwap<RoutingAssignment>,
    /// Serializes writers; readers never take it
    write_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl RoutingMatrix {
    pub fn new(num_slots: usize, num_sources: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            num_sources,
            current: ArcSwap::from_pointee(RoutingAssignment::round_robin(num_slots, num_sources)),
            write_lock: Mutex::new(()),
            changes,
        }
    }

    /// Consistent copy of the full mapping.
    pub fn snapshot(&self) -> Arc<RoutingAssignment> {
        self.current.load_full()
    }

    /// Receiver woken with the new version after every applied change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Route `slot` to `source`.
    ///
    /// Returns the previously routed source, or `None` when the slot was
    /// already routed there (no state change, no notification).
    pub fn route(&self, slot: usize, source: usize) -> Result<Option<usize>> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let current = self.current.load_full();
        if slot >= current.len() {
            return Err(Error::InvalidSlot {
                slot,
                num_slots: current.len(),
            });
        }
        if source >= self.num_sources {
            return Err(Error::InvalidSource {
                source_index: source,
                num_sources: self.num_sources,
            });
        }

        let previous = current.sources[slot];
        if previous == source {
            return Ok(None);
        }

        let mut next = (*current).clone();
        next.sources[slot] = source;
        next.version += 1;
        let version = next.version;
        self.current.store(Arc::new(next));
        self.changes.send_replace(version);

        info!("Routed slot {} from source {} to source {}", slot, previous, source);
        Ok(Some(previous))
    }
}
