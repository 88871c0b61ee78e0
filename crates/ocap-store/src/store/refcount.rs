//! Reference counting.
//!
//! Objects carry a `(reachable, recognizable)` pair; promises a single count.
//! Any count reaching zero puts the kref in the crank's maybe-free set, which
//! `collect_garbage` drains.

use std::collections::BTreeSet;

use ocap_ipc::KRef;
use tracing::trace;

use super::object::ref_count_key;
use super::promise::promise_ref_count_key;
use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::{RefCountOptions, RefCounts};

impl<K: KvStore> KernelStore<K> {
    /// Counts for an object; `{0,0}` when none are stored.
    pub fn get_object_ref_count(&self, kref: &KRef) -> Result<RefCounts, StoreError> {
        let key = ref_count_key(kref);
        let Some(value) = self.kv.get(&key) else {
            return Ok(RefCounts::default());
        };
        let counts = RefCounts::decode(&key, &value)?;
        if !counts.is_valid() {
            return Err(StoreError::InvalidRefCount {
                kref: kref.clone(),
                reachable: counts.reachable,
                recognizable: counts.recognizable,
            });
        }
        Ok(counts)
    }

    pub fn set_object_ref_count(&mut self, kref: &KRef, counts: RefCounts) -> Result<(), StoreError> {
        if !counts.is_valid() {
            return Err(StoreError::InvalidRefCount {
                kref: kref.clone(),
                reachable: counts.reachable,
                recognizable: counts.recognizable,
            });
        }
        self.kv.set(&ref_count_key(kref), &counts.encode());
        Ok(())
    }

    pub fn get_promise_ref_count(&self, kpid: &KRef) -> Result<u64, StoreError> {
        Ok(self.get_u64(&promise_ref_count_key(kpid))?.unwrap_or(0))
    }

    pub fn increment_ref_count(
        &mut self,
        kref: &KRef,
        tag: &str,
        options: RefCountOptions,
    ) -> Result<(), StoreError> {
        trace!(kref = %kref, tag, "incRef");
        if kref.is_promise() {
            self.require_promise(kref)?;
            let count = self.get_promise_ref_count(kref)?;
            self.set_u64(&promise_ref_count_key(kref), count + 1);
            return Ok(());
        }
        if options.is_export || !self.kernel_ref_exists(kref) {
            return Ok(());
        }
        let mut counts = self.get_object_ref_count(kref)?;
        if !options.only_recognizable {
            counts.reachable += 1;
        }
        counts.recognizable += 1;
        self.set_object_ref_count(kref, counts)
    }

    pub fn decrement_ref_count(
        &mut self,
        kref: &KRef,
        tag: &str,
        options: RefCountOptions,
    ) -> Result<(), StoreError> {
        trace!(kref = %kref, tag, "decRef");
        if kref.is_promise() {
            self.require_promise(kref)?;
            let count = self.get_promise_ref_count(kref)?;
            let count = count
                .checked_sub(1)
                .ok_or_else(|| StoreError::underflow(kref, tag))?;
            self.set_u64(&promise_ref_count_key(kref), count);
            if count == 0 {
                self.add_maybe_free(kref);
            }
            return Ok(());
        }
        if options.is_export || !self.kernel_ref_exists(kref) {
            return Ok(());
        }
        let mut counts = self.get_object_ref_count(kref)?;
        if !options.only_recognizable {
            counts.reachable = counts
                .reachable
                .checked_sub(1)
                .ok_or_else(|| StoreError::underflow(kref, tag))?;
        }
        counts.recognizable = counts
            .recognizable
            .checked_sub(1)
            .ok_or_else(|| StoreError::underflow(kref, tag))?;
        self.set_object_ref_count(kref, counts)?;
        if counts.reachable == 0 || counts.recognizable == 0 {
            self.add_maybe_free(kref);
        }
        Ok(())
    }

    /// Move an object's reachable count by one, leaving recognizable alone.
    pub(crate) fn adjust_reachable(&mut self, kref: &KRef, up: bool) -> Result<(), StoreError> {
        if !self.kernel_ref_exists(kref) {
            return Ok(());
        }
        let mut counts = self.get_object_ref_count(kref)?;
        counts.reachable = if up {
            counts.reachable + 1
        } else {
            counts
                .reachable
                .checked_sub(1)
                .ok_or_else(|| StoreError::underflow(kref, "reachable flag"))?
        };
        self.set_object_ref_count(kref, counts)?;
        if counts.reachable == 0 {
            self.add_maybe_free(kref);
        }
        Ok(())
    }

    fn require_promise(&self, kpid: &KRef) -> Result<(), StoreError> {
        if self.kernel_ref_exists(kpid) {
            Ok(())
        } else {
            Err(StoreError::UnknownPromise(kpid.clone()))
        }
    }

    pub fn add_maybe_free(&mut self, kref: &KRef) {
        self.arena.maybe_free.insert(kref.clone());
    }

    /// Drain the maybe-free set.
    pub fn take_maybe_free(&mut self) -> BTreeSet<KRef> {
        std::mem::take(&mut self.arena.maybe_free)
    }
}
