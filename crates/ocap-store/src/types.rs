//! Persisted kernel record types.

use core::fmt;
use core::str::FromStr;

use ocap_ipc::{CapData, EndpointId, KRef, Message, VatId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Object reference counts.
///
/// Invariant: `reachable <= recognizable`. Both are unsigned, so a count can
/// never go negative; decrements that would underflow fail instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCounts {
    pub reachable: u64,
    pub recognizable: u64,
}

impl RefCounts {
    pub const fn new(reachable: u64, recognizable: u64) -> Self {
        Self {
            reachable,
            recognizable,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.reachable <= self.recognizable
    }

    pub fn is_zero(&self) -> bool {
        self.reachable == 0 && self.recognizable == 0
    }

    pub(crate) fn encode(&self) -> String {
        format!("{},{}", self.reachable, self.recognizable)
    }

    pub(crate) fn decode(key: &str, value: &str) -> Result<Self, StoreError> {
        let (r, g) = value
            .split_once(',')
            .ok_or_else(|| StoreError::corrupt(key, format!("bad refCount {:?}", value)))?;
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| StoreError::corrupt(key, format!("bad refCount {:?}", value)))
        };
        Ok(Self::new(parse(r)?, parse(g)?))
    }
}

/// How a refcount change applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCountOptions {
    /// Reference held by the owner's own export entry; objects ignore it
    pub is_export: bool,
    /// Only the recognizable count moves
    pub only_recognizable: bool,
}

impl RefCountOptions {
    pub const EXPORT: Self = Self {
        is_export: true,
        only_recognizable: false,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        }
    }

    pub fn is_resolved(&self) -> bool {
        *self != PromiseState::Unresolved
    }
}

impl FromStr for PromiseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(PromiseState::Unresolved),
            "fulfilled" => Ok(PromiseState::Fulfilled),
            "rejected" => Ok(PromiseState::Rejected),
            other => Err(format!("unknown promise state {:?}", other)),
        }
    }
}

/// Snapshot of a kernel promise record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPromise {
    pub state: PromiseState,
    /// Endpoint allowed to resolve; `None` means the kernel decides
    pub decider: Option<EndpointId>,
    /// Vats to notify on resolution, sorted
    pub subscribers: Vec<VatId>,
    /// Resolution value once settled
    pub value: Option<CapData<KRef>>,
}

/// Unit of kernel work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueItem {
    Send {
        target: KRef,
        message: Message<KRef>,
    },
    #[serde(rename_all = "camelCase")]
    Notify { vat_id: VatId, kpid: KRef },
    #[serde(rename_all = "camelCase")]
    DropExports { vat_id: VatId, krefs: Vec<KRef> },
    #[serde(rename_all = "camelCase")]
    RetireExports { vat_id: VatId, krefs: Vec<KRef> },
    #[serde(rename_all = "camelCase")]
    RetireImports { vat_id: VatId, krefs: Vec<KRef> },
    #[serde(rename_all = "camelCase")]
    BringOutYourDead { vat_id: VatId },
}

impl RunQueueItem {
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueItem::Send { .. } => "send",
            RunQueueItem::Notify { .. } => "notify",
            RunQueueItem::DropExports { .. } => "dropExports",
            RunQueueItem::RetireExports { .. } => "retireExports",
            RunQueueItem::RetireImports { .. } => "retireImports",
            RunQueueItem::BringOutYourDead { .. } => "bringOutYourDead",
        }
    }
}

/// GC action types, in processing priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcActionType {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionType {
    pub const ALL: [GcActionType; 3] = [
        GcActionType::DropExport,
        GcActionType::RetireExport,
        GcActionType::RetireImport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GcActionType::DropExport => "dropExport",
            GcActionType::RetireExport => "retireExport",
            GcActionType::RetireImport => "retireImport",
        }
    }
}

impl FromStr for GcActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dropExport" => Ok(GcActionType::DropExport),
            "retireExport" => Ok(GcActionType::RetireExport),
            "retireImport" => Ok(GcActionType::RetireImport),
            other => Err(format!("unknown gc action {:?}", other)),
        }
    }
}

/// One pending GC action, stored as `"<vat> <type> <kref>"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcAction {
    pub vat_id: VatId,
    pub action: GcActionType,
    pub kref: KRef,
}

impl GcAction {
    pub fn new(vat_id: VatId, action: GcActionType, kref: KRef) -> Self {
        Self {
            vat_id,
            action,
            kref,
        }
    }
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat_id, self.action.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(' ');
        let (Some(vat), Some(action), Some(kref), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(StoreError::corrupt("gcActions", format!("bad action {:?}", s)));
        };
        let action = action
            .parse()
            .map_err(|reason: String| StoreError::corrupt("gcActions", reason))?;
        Ok(Self {
            vat_id: vat.parse()?,
            action,
            kref: kref.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_encoding() {
        let counts = RefCounts::new(1, 2);
        assert_eq!(counts.encode(), "1,2");
        assert_eq!(RefCounts::decode("k", "1,2").unwrap(), counts);
        assert!(RefCounts::decode("k", "1").is_err());
        assert!(RefCounts::decode("k", "-1,2").is_err());
    }

    #[test]
    fn test_gc_action_string_form() {
        let action: GcAction = "v1 dropExport ko3".parse().unwrap();
        assert_eq!(action.vat_id, VatId::new(1));
        assert_eq!(action.action, GcActionType::DropExport);
        assert_eq!(action.to_string(), "v1 dropExport ko3");

        assert!("v1 dropExport".parse::<GcAction>().is_err());
        assert!("v1 explode ko3".parse::<GcAction>().is_err());
        assert!("v1 dropExport ko3 extra".parse::<GcAction>().is_err());
    }

    #[test]
    fn test_gc_priority_order() {
        assert!(GcActionType::DropExport < GcActionType::RetireExport);
        assert!(GcActionType::RetireExport < GcActionType::RetireImport);
    }

    #[test]
    fn test_run_queue_item_json() {
        let item = RunQueueItem::Notify {
            vat_id: VatId::new(2),
            kpid: KRef::promise(4),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"type":"notify","vatId":"v2","kpid":"kp4"}"#);
        let back: RunQueueItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }
}
