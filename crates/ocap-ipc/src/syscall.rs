//! Vat→kernel syscalls.
//!
//! References are in the calling vat's namespace; the kernel translates them
//! before acting.

use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, Message, Resolution};
use crate::refs::VRef;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VRef,
        message: Message<VRef>,
    },
    Subscribe {
        vpid: VRef,
    },
    Resolve {
        resolutions: Vec<Resolution<VRef>>,
    },
    Exit {
        #[serde(rename = "isFailure")]
        is_failure: bool,
        info: CapData<VRef>,
    },
    DropImports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
    AbandonExports {
        vrefs: Vec<VRef>,
    },
    // Legacy operations, always refused
    CallNow {
        target: VRef,
        method: String,
        args: CapData<VRef>,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    VatstoreGetNextKey {
        key: String,
    },
}

impl VatSyscall {
    pub fn name(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
            VatSyscall::AbandonExports { .. } => "abandonExports",
            VatSyscall::CallNow { .. } => "callNow",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
        }
    }

    /// Operations this kernel refuses without acting on.
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            VatSyscall::CallNow { .. }
                | VatSyscall::VatstoreGet { .. }
                | VatSyscall::VatstoreSet { .. }
                | VatSyscall::VatstoreDelete { .. }
                | VatSyscall::VatstoreGetNextKey { .. }
        )
    }
}

/// Kernel answer to one syscall.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum VatSyscallResult {
    Ok(Option<String>),
    Error(String),
}

impl VatSyscallResult {
    pub fn ok() -> Self {
        VatSyscallResult::Ok(None)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, VatSyscallResult::Ok(_))
    }
}
