//! Duplex transport between the kernel and one vat.
//!
//! The kernel sends numbered commands and waits for the matching reply. While
//! a command is outstanding the vat may issue syscalls; each gets its own id and
//! a `SyscallResult` answer. Frames travel over in-process channels; workers
//! that run vats out of process encode them with [`encode_frame`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::VatConfig;
use crate::delivery::VatDelivery;
use crate::error::MarshalError;
use crate::syscall::{VatSyscall, VatSyscallResult};

/// Vat store mutations made since the previous checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatCheckpoint {
    pub sets: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

impl VatCheckpoint {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum VatCommand {
    /// Start the vat with its config and persisted store contents
    #[serde(rename_all = "camelCase")]
    InitVat {
        vat_config: VatConfig,
        state: BTreeMap<String, String>,
    },
    Deliver(VatDelivery),
    Ping,
}

impl VatCommand {
    pub fn name(&self) -> &'static str {
        match self {
            VatCommand::InitVat { .. } => "initVat",
            VatCommand::Deliver(d) => d.name(),
            VatCommand::Ping => "ping",
        }
    }
}

/// Vat answer to one command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default)]
    pub checkpoint: VatCheckpoint,
    /// Set when the vat failed to carry out the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn with_checkpoint(checkpoint: VatCheckpoint) -> Self {
        Self {
            checkpoint,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            checkpoint: VatCheckpoint::default(),
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KernelToVat {
    Command { id: u64, command: VatCommand },
    SyscallResult { id: u64, result: VatSyscallResult },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VatToKernel {
    Reply { id: u64, reply: CommandReply },
    Syscall { id: u64, syscall: VatSyscall },
}

/// Kernel end of a vat transport.
#[derive(Debug)]
pub struct VatStream {
    pub tx: mpsc::UnboundedSender<KernelToVat>,
    pub rx: mpsc::UnboundedReceiver<VatToKernel>,
}

/// Vat end of a vat transport.
#[derive(Debug)]
pub struct VatPort {
    pub tx: mpsc::UnboundedSender<VatToKernel>,
    pub rx: mpsc::UnboundedReceiver<KernelToVat>,
}

/// Create a connected transport pair.
pub fn vat_stream_pair() -> (VatStream, VatPort) {
    let (to_vat, from_kernel) = mpsc::unbounded_channel();
    let (to_kernel, from_vat) = mpsc::unbounded_channel();
    (
        VatStream {
            tx: to_vat,
            rx: from_vat,
        },
        VatPort {
            tx: to_kernel,
            rx: from_kernel,
        },
    )
}

/// Encode a frame as a JSON line.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, MarshalError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, MarshalError> {
    Ok(serde_json::from_str(line.trim_end())?)
}
