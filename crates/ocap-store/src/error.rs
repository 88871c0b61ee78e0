//! Error types for the kernel store.

use ocap_ipc::{EndpointId, ERef, KRef, RefError};
use thiserror::Error;

/// Errors from store operations.
///
/// Every variant except `MissingKey` and `Serialization` is an invariant
/// violation: the store refuses the mutation instead of correcting it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Stored or supplied reference is malformed
    #[error(transparent)]
    InvalidRef(#[from] RefError),

    /// Required key is absent
    #[error("no value for required key {0}")]
    MissingKey(String),

    /// Stored value does not parse
    #[error("corrupt value for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Decrement would take a count below zero
    #[error("refCount underflow {kref} {tag}")]
    RefCountUnderflow { kref: KRef, tag: String },

    /// Counts with reachable > recognizable
    #[error("invalid refCount for {kref}: reachable {reachable} > recognizable {recognizable}")]
    InvalidRefCount {
        kref: KRef,
        reachable: u64,
        recognizable: u64,
    },

    /// Promise has no state record
    #[error("unknown kernel promise {0}")]
    UnknownPromise(KRef),

    /// Promise was already fulfilled or rejected
    #[error("{0} was already resolved")]
    AlreadyResolved(KRef),

    /// Resolver is not the promise's decider
    #[error("{endpoint} not permitted to resolve {kpid} because {reason}")]
    NotPermitted {
        endpoint: String,
        kpid: KRef,
        reason: String,
    },

    /// Endpoint has no c-list entry for a kernel reference
    #[error("{endpoint} has no mapping for {kref}")]
    UnmappedKref { endpoint: EndpointId, kref: KRef },

    /// Endpoint used an import it was never given
    #[error("{endpoint} has no mapping for {eref}")]
    UnmappedEref { endpoint: EndpointId, eref: ERef },

    /// C-list entry expected but missing in one direction
    #[error("{endpoint} c-list has no entry for {reference}")]
    MissingCListEntry {
        endpoint: EndpointId,
        reference: String,
    },

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn underflow(kref: &KRef, tag: &str) -> Self {
        Self::RefCountUnderflow {
            kref: kref.clone(),
            tag: tag.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
