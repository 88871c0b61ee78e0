//! Kernel runtime types.

use ocap_ipc::{CapData, KRef, VatConfig, VatId};
use serde::Serialize;

/// Final value of a promise the kernel itself was waiting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseSettlement {
    Fulfilled(CapData<KRef>),
    Rejected(CapData<KRef>),
}

impl PromiseSettlement {
    pub fn new(rejected: bool, data: CapData<KRef>) -> Self {
        if rejected {
            PromiseSettlement::Rejected(data)
        } else {
            PromiseSettlement::Fulfilled(data)
        }
    }

    pub fn data(&self) -> &CapData<KRef> {
        match self {
            PromiseSettlement::Fulfilled(d) | PromiseSettlement::Rejected(d) => d,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseSettlement::Rejected(_))
    }
}

/// A vat scheduled for termination at the end of the crank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VatExit {
    pub vat_id: VatId,
    pub is_failure: bool,
    /// Rejection value for the promises the vat was deciding
    pub info: CapData<KRef>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatStatus {
    pub id: VatId,
    pub config: VatConfig,
}

/// Snapshot of kernel state for drivers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStatus {
    pub vats: Vec<VatStatus>,
    pub run_queue_length: u64,
    pub gc_actions: usize,
}
