//! C8 — Peer Registry: atomic, read-mostly snapshots of configured called-AEs, allowed
//! sources, and destinations (§4.8).
use crate::types::{AllowedSource, CalledAe, CalledAeTitle, CallingAeTitle, Destination};
use std::sync::{Arc, RwLock};

/// A single immutable view of the registry's contents (§3: "Immutable between reloads").
#[derive(Debug, Clone, Default)]
pub struct PeerRegistrySnapshot {
    called_aes: Vec<CalledAe>,
    allowed_sources: Vec<AllowedSource>,
    destinations: Vec<Destination>,
}

impl PeerRegistrySnapshot {
    pub fn new(
        called_aes: Vec<CalledAe>,
        allowed_sources: Vec<AllowedSource>,
        destinations: Vec<Destination>,
    ) -> Self {
        Self {
            called_aes,
            allowed_sources,
            destinations,
        }
    }

    pub fn called_ae(&self, title: &CalledAeTitle) -> Option<&CalledAe> {
        self.called_aes.iter().find(|ae| &ae.ae_title == title)
    }

    pub fn called_aes(&self) -> &[CalledAe] {
        &self.called_aes
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Whether `(calling_ae_title, host_or_ip)` matches a configured [`AllowedSource`] (§4.3
    /// rule 2).
    pub fn is_allowed_source(&self, calling_ae_title: &CallingAeTitle, host_or_ip: &str) -> bool {
        self.allowed_sources
            .iter()
            .any(|s| &s.ae_title == calling_ae_title && s.host_or_ip == host_or_ip)
    }
}

/// Holds the current [`PeerRegistrySnapshot`] behind a lock readers never block writers for
/// longer than a pointer swap (§4.8, §5 "Registry snapshots").
///
/// Mutations come from an external control plane (out of scope, §4.8); this type only exposes
/// `load`/`store`, which is the entire contract the core requires.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    current: RwLock<Arc<PeerRegistrySnapshot>>,
}

impl PeerRegistry {
    pub fn new(initial: PeerRegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Returns the current snapshot. Cheap: a read lock held only long enough to clone an `Arc`.
    pub fn load(&self) -> Arc<PeerRegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Atomically swaps in a new snapshot. Readers mid-flight keep their already-loaded `Arc`
    /// and never observe a torn view (§5).
    pub fn store(&self, snapshot: PeerRegistrySnapshot) {
        *self.current.write().unwrap() = Arc::new(snapshot);
    }
}
