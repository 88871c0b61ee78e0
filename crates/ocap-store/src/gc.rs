//! GC action engine.
//!
//! Picks the next batch of GC work from the pending action set. Actions are
//! re-validated against the current store every time, so stale entries are
//! discarded instead of being delivered as no-ops.

use std::collections::{BTreeMap, BTreeSet};

use ocap_ipc::{EndpointId, KRef, VatId};
use tracing::debug;

use crate::error::StoreError;
use crate::kv::KvStore;
use crate::store::KernelStore;
use crate::types::{GcAction, GcActionType, RunQueueItem};

/// Whether `action` would still do something.
fn is_valid<K: KvStore>(store: &KernelStore<K>, vat: &VatId, action: GcActionType, kref: &KRef) -> Result<bool, StoreError> {
    let endpoint = EndpointId::Vat(vat.clone());
    match action {
        GcActionType::DropExport => {
            if !store.kernel_ref_exists(kref) {
                return Ok(false);
            }
            let counts = store.get_object_ref_count(kref)?;
            Ok(counts.reachable == 0
                && store.has_clist_entry(&endpoint, kref)
                && store.get_reachable_flag(&endpoint, kref)?)
        }
        GcActionType::RetireExport => {
            if !store.kernel_ref_exists(kref) {
                return Ok(false);
            }
            let counts = store.get_object_ref_count(kref)?;
            Ok(counts.is_zero() && store.has_clist_entry(&endpoint, kref))
        }
        GcActionType::RetireImport => Ok(store.has_clist_entry(&endpoint, kref)),
    }
}

fn batch_item(vat_id: VatId, action: GcActionType, krefs: Vec<KRef>) -> RunQueueItem {
    match action {
        GcActionType::DropExport => RunQueueItem::DropExports { vat_id, krefs },
        GcActionType::RetireExport => RunQueueItem::RetireExports { vat_id, krefs },
        GcActionType::RetireImport => RunQueueItem::RetireImports { vat_id, krefs },
    }
}

/// Select one unit of GC work, or `None` if no pending action is still valid.
///
/// Vats are visited in ascending id order and, within a vat, action types in
/// priority order (`dropExport`, `retireExport`, `retireImport`). The first
/// vat/type pair with any candidates has *all* its candidates removed from
/// the pending set; the valid ones come back as a single batch with krefs
/// sorted. When nothing is valid, the pruned set is still persisted.
pub fn process_gc_action_set<K: KvStore>(store: &mut KernelStore<K>) -> Result<Option<RunQueueItem>, StoreError> {
    let mut actions = store.get_gc_actions()?;
    if actions.is_empty() {
        return Ok(None);
    }

    let mut grouped: BTreeMap<VatId, BTreeMap<GcActionType, BTreeSet<KRef>>> = BTreeMap::new();
    for text in &actions {
        let action: GcAction = text.parse()?;
        grouped
            .entry(action.vat_id)
            .or_default()
            .entry(action.action)
            .or_default()
            .insert(action.kref);
    }

    for (vat, by_type) in grouped {
        for action in GcActionType::ALL {
            let Some(candidates) = by_type.get(&action) else {
                continue;
            };
            let mut krefs = Vec::new();
            for kref in candidates {
                if is_valid(store, &vat, action, kref)? {
                    krefs.push(kref.clone());
                }
                actions.remove(&GcAction::new(vat.clone(), action, kref.clone()).to_string());
            }
            if krefs.is_empty() {
                continue;
            }
            store.set_gc_actions(&actions)?;
            debug!(vat = %vat, action = action.as_str(), count = krefs.len(), "gc batch");
            return Ok(Some(batch_item(vat, action, krefs)));
        }
    }

    store.set_gc_actions(&actions)?;
    Ok(None)
}
