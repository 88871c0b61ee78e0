//! Kernel error types

use ocap_ipc::{ConfigError, MarshalError, RefError, VatId};
use ocap_store::StoreError;
use thiserror::Error;

/// Kernel errors
#[derive(Debug, Error)]
pub enum KernelError {
    /// Store invariant violation or storage failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No such vat
    #[error("vat {0} not found")]
    VatNotFound(VatId),

    /// Vat was terminated while a request to it was in flight
    #[error("vat {0} deleted")]
    VatDeleted(VatId),

    /// Vat broke the syscall protocol
    #[error("vat {vat} protocol violation: {reason}")]
    ProtocolViolation { vat: VatId, reason: String },

    /// Syscall this kernel does not implement
    #[error("unsupported syscall {0}")]
    UnsupportedSyscall(&'static str),

    /// Vat transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad cluster or vat configuration
    #[error("config error: {0}")]
    Config(String),

    /// Vat failed to start or carry out a command
    #[error("vat {vat} failed: {reason}")]
    VatFailed { vat: VatId, reason: String },

    /// Kernel stopped before answering
    #[error("kernel shut down")]
    Shutdown,
}

impl KernelError {
    pub fn violation(vat: &VatId, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            vat: vat.clone(),
            reason: reason.into(),
        }
    }
}

impl From<RefError> for KernelError {
    fn from(e: RefError) -> Self {
        KernelError::Store(StoreError::from(e))
    }
}

impl From<ConfigError> for KernelError {
    fn from(e: ConfigError) -> Self {
        KernelError::Config(e.to_string())
    }
}

impl From<MarshalError> for KernelError {
    fn from(e: MarshalError) -> Self {
        KernelError::Transport(e.to_string())
    }
}
