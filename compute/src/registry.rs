//! Weak, non-owning resource sets for bulk teardown.
//!
//! Registering never extends a lifetime. Teardown walks whatever is still
//! alive; entries whose owners already dropped or destroyed them are skipped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::debug;

use crate::algorithm::Algorithm;
use crate::buffer::Buffer;
use crate::sequence::Sequence;

/// Something that can release its device objects, at most once.
pub trait Destroy: Send + Sync {
    fn destroy(&self);
    fn is_alive(&self) -> bool;
}

pub struct Registry<T: Destroy> {
    entries: Mutex<Vec<Weak<T>>>,
}

impl<T: Destroy> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }
}

impl<T: Destroy> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Weak<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, item: &Arc<T>) {
        self.entries().push(Arc::downgrade(item));
    }

    /// Drop entries that were released or destroyed. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|w| w.upgrade().is_some_and(|item| item.is_alive()));
        before - entries.len()
    }

    /// Destroy every live member and forget all entries. Returns how many
    /// members were actually destroyed.
    pub fn destroy_all(&self) -> usize {
        // Upgrade under the lock, destroy outside it: a destroy may drop the
        // last reference to something that touches this registry.
        let live: Vec<Arc<T>> = self.entries().drain(..).filter_map(|w| w.upgrade()).collect();
        let mut destroyed = 0;
        for item in live {
            if item.is_alive() {
                item.destroy();
                destroyed += 1;
            }
        }
        destroyed
    }

    pub fn live_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|w| w.upgrade().is_some_and(|item| item.is_alive()))
            .count()
    }
}

/// What [`ResourceRegistry::destroy_all`] tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub sequences: usize,
    pub algorithms: usize,
    pub buffers: usize,
}

/// One registry per resource kind.
#[derive(Default)]
pub struct ResourceRegistry {
    pub sequences: Registry<Sequence>,
    pub algorithms: Registry<Algorithm>,
    pub buffers: Registry<Buffer>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sequences.sweep_expired() + self.algorithms.sweep_expired() + self.buffers.sweep_expired()
    }

    /// Sequences first (they wait for in-flight work), then algorithms,
    /// then buffers.
    pub fn destroy_all(&self) -> Teardown {
        let teardown = Teardown {
            sequences: self.sequences.destroy_all(),
            algorithms: self.algorithms.destroy_all(),
            buffers: self.buffers.destroy_all(),
        };
        debug!("registry teardown: {teardown:?}");
        teardown
    }
}
