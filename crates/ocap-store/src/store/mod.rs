//! Kernel store: every persistent kernel structure mapped onto a [`KvStore`].
//!
//! The store is split into focused impl blocks:
//! - `id`: counters and endpoint id allocation
//! - `object`: kernel object records
//! - `promise`: kernel promise records and resolution
//! - `queue`: persisted FIFOs (run queue, promise queues)
//! - `clist`: per-endpoint kref/eref mappings and reachable flags
//! - `refcount`: reference counting and the maybe-free set
//! - `gc`: GC action set, reap queue, garbage collection
//! - `vat`: vat records, vat stores, termination cleanup
//! - `translators`: kernel↔endpoint reference translation

mod clist;
mod gc;
mod id;
mod object;
mod promise;
mod queue;
mod refcount;
mod translators;
mod vat;

pub use clist::CListEntry;

use std::collections::BTreeSet;

use ocap_ipc::KRef;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;
use crate::kv::KvStore;

/// Per-crank scratch state. Never persisted and never carried across cranks.
#[derive(Debug, Default)]
pub(crate) struct CrankArena {
    /// Krefs whose counts reached zero since the last collection
    pub(crate) maybe_free: BTreeSet<KRef>,
    /// Objects created by the syscall in progress, still holding their creation count
    pub(crate) fresh_exports: Vec<KRef>,
    pub(crate) in_crank: bool,
}

/// The kernel's persistent state.
pub struct KernelStore<K: KvStore> {
    /// Physical storage
    pub(crate) kv: K,
    pub(crate) arena: CrankArena,
    /// Run queue went from empty to non-empty since last taken
    pub(crate) pending_wakeup: bool,
}

impl<K: KvStore> KernelStore<K> {
    /// Wrap a key-value store. Existing contents are kept.
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            arena: CrankArena::default(),
            pending_wakeup: false,
        }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Release the underlying storage.
    pub fn into_kv(self) -> K {
        self.kv
    }

    /// Wipe all persistent state.
    pub fn reset(&mut self) {
        self.kv.clear();
        self.arena = CrankArena::default();
        self.pending_wakeup = false;
    }

    pub fn start_crank(&mut self) {
        self.arena.in_crank = true;
    }

    /// Close the crank. The arena must already have been drained.
    pub fn end_crank(&mut self) {
        if !self.arena.maybe_free.is_empty() || !self.arena.fresh_exports.is_empty() {
            warn!(
                maybe_free = self.arena.maybe_free.len(),
                fresh_exports = self.arena.fresh_exports.len(),
                "crank ended with undrained arena"
            );
        }
        self.arena = CrankArena::default();
    }

    pub fn in_crank(&self) -> bool {
        self.arena.in_crank
    }

    /// Whether the run queue became non-empty since the last call.
    pub fn take_pending_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.pending_wakeup)
    }

    /// Run queue, GC actions or reap requests outstanding.
    pub fn has_pending_work(&self) -> Result<bool, StoreError> {
        Ok(self.run_queue_length()? > 0
            || !self.get_gc_actions()?.is_empty()
            || !self.get_reap_queue()?.is_empty())
    }

    // ========================================================================
    // Encoding helpers
    // ========================================================================

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.kv.get(key) {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e.to_string())),
            None => Ok(None),
        }
    }

    pub(crate) fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)?;
        self.kv.set(key, &text);
        Ok(())
    }

    pub(crate) fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.kv.get(key) {
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| StoreError::corrupt(key, format!("not a number: {:?}", text))),
            None => Ok(None),
        }
    }

    pub(crate) fn set_u64(&mut self, key: &str, value: u64) {
        self.kv.set(key, &value.to_string());
    }
}
