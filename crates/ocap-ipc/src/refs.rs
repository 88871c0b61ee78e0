//! Reference namespaces and endpoint identifiers.
//!
//! Kernel references (`KRef`) name kernel objects (`ko<N>`) and kernel
//! promises (`kp<N>`). Endpoint references (`ERef`) name the same entities
//! from one endpoint's point of view: `o+3` is an object the endpoint
//! exported, `p-4` a promise it imported. Remote endpoints prefix their
//! references with `r` (`ro-5`, `rp+6`).
//!
//! All three forms are newtypes over `String` so they key directly into the
//! persistent store and order lexically.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RefError;

/// A vat-side reference. Vats and remotes share the same reference grammar.
pub type VRef = ERef;

/// Which namespace a reference lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefContext {
    Kernel,
    Vat,
    Remote,
}

/// What a reference designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    Object,
    Promise,
}

/// Allocation direction of an endpoint reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefDirection {
    /// `+`: allocated by the endpoint itself
    Export,
    /// `-`: allocated by the kernel on the endpoint's behalf
    Import,
}

/// Decomposed form of any reference string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefInfo {
    pub context: RefContext,
    pub kind: RefKind,
    /// `None` for kernel references
    pub direction: Option<RefDirection>,
    pub id: u64,
}

impl RefInfo {
    /// Parse any kernel or endpoint reference.
    pub fn parse(s: &str) -> Result<Self, RefError> {
        if s.is_empty() {
            return Err(RefError::Empty);
        }
        let bytes = s.as_bytes();
        if bytes[0] == b'k' {
            let kind = kind_at(s, 1)?;
            let id = parse_id(s, 2)?;
            return Ok(Self {
                context: RefContext::Kernel,
                kind,
                direction: None,
                id,
            });
        }

        let (context, start) = if bytes[0] == b'r' {
            (RefContext::Remote, 1)
        } else {
            (RefContext::Vat, 0)
        };
        let kind = kind_at(s, start)?;
        let direction = match bytes.get(start + 1) {
            Some(b'+') => RefDirection::Export,
            Some(b'-') => RefDirection::Import,
            _ => return Err(RefError::invalid(s)),
        };
        let id = parse_id(s, start + 2)?;
        Ok(Self {
            context,
            kind,
            direction: Some(direction),
            id,
        })
    }

    pub fn is_promise(&self) -> bool {
        self.kind == RefKind::Promise
    }
}

fn kind_at(s: &str, at: usize) -> Result<RefKind, RefError> {
    match s.as_bytes().get(at) {
        Some(b'o') => Ok(RefKind::Object),
        Some(b'p') => Ok(RefKind::Promise),
        _ => Err(RefError::invalid(s)),
    }
}

fn parse_id(s: &str, at: usize) -> Result<u64, RefError> {
    let digits = s.get(at..).ok_or_else(|| RefError::invalid(s))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RefError::invalid(s));
    }
    digits.parse().map_err(|_| RefError::invalid(s))
}

/// Promise check on a raw reference string of any namespace.
///
/// The kind marker sits at a fixed position: after `k` for kernel refs, after
/// the optional `r` tag for endpoint refs.
pub fn is_promise_ref(s: &str) -> bool {
    let bytes = s.as_bytes();
    let at = match bytes.first() {
        Some(b'k') | Some(b'r') => 1,
        _ => 0,
    };
    bytes.get(at) == Some(&b'p')
}

// ============================================================================
// KRef
// ============================================================================

/// Kernel reference: `ko<N>` or `kp<N>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KRef(String);

impl KRef {
    pub fn object(id: u64) -> Self {
        Self(format!("ko{}", id))
    }

    pub fn promise(id: u64) -> Self {
        Self(format!("kp{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_promise(&self) -> bool {
        self.0.as_bytes().get(1) == Some(&b'p')
    }

    pub fn is_object(&self) -> bool {
        !self.is_promise()
    }
}

impl TryFrom<String> for KRef {
    type Error = RefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let info = RefInfo::parse(&s)?;
        if info.context != RefContext::Kernel {
            return Err(RefError::WrongContext {
                reference: s,
                expected: "kernel",
            });
        }
        Ok(Self(s))
    }
}

impl FromStr for KRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<KRef> for String {
    fn from(r: KRef) -> String {
        r.0
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// ERef
// ============================================================================

/// Endpoint reference: `o+N`, `o-N`, `p+N`, `p-N`, or the `r`-tagged remote forms.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ERef(String);

impl ERef {
    /// Build an endpoint reference. `remote` adds the `r` tag.
    pub fn new(remote: bool, kind: RefKind, direction: RefDirection, id: u64) -> Self {
        let tag = if remote { "r" } else { "" };
        let k = match kind {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        };
        let d = match direction {
            RefDirection::Export => '+',
            RefDirection::Import => '-',
        };
        Self(format!("{}{}{}{}", tag, k, d, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn info(&self) -> RefInfo {
        // Validated on construction
        RefInfo::parse(&self.0).unwrap_or(RefInfo {
            context: RefContext::Vat,
            kind: RefKind::Object,
            direction: Some(RefDirection::Import),
            id: 0,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with('r')
    }

    pub fn is_promise(&self) -> bool {
        is_promise_ref(&self.0)
    }

    pub fn is_object(&self) -> bool {
        !self.is_promise()
    }

    pub fn is_export(&self) -> bool {
        self.info().direction == Some(RefDirection::Export)
    }

    pub fn is_import(&self) -> bool {
        !self.is_export()
    }
}

impl TryFrom<String> for ERef {
    type Error = RefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let info = RefInfo::parse(&s)?;
        if info.context == RefContext::Kernel {
            return Err(RefError::WrongContext {
                reference: s,
                expected: "endpoint",
            });
        }
        Ok(Self(s))
    }
}

impl FromStr for ERef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<ERef> for String {
    fn from(r: ERef) -> String {
        r.0
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ERef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Endpoint identifiers
// ============================================================================

macro_rules! endpoint_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(n: u64) -> Self {
                Self(format!(concat!($prefix, "{}"), n))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = RefError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                let digits = s
                    .strip_prefix($prefix)
                    .ok_or_else(|| RefError::InvalidEndpoint(s.clone()))?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(RefError::InvalidEndpoint(s));
                }
                Ok(Self(s))
            }
        }

        impl FromStr for $name {
            type Err = RefError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

endpoint_id!(VatId, "v");
endpoint_id!(RemoteId, "r");

/// Either side of a c-list: a local vat or a remote connection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EndpointId {
    Vat(VatId),
    Remote(RemoteId),
}

impl EndpointId {
    pub fn as_str(&self) -> &str {
        match self {
            EndpointId::Vat(v) => v.as_str(),
            EndpointId::Remote(r) => r.as_str(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, EndpointId::Remote(_))
    }

    pub fn as_vat(&self) -> Option<&VatId> {
        match self {
            EndpointId::Vat(v) => Some(v),
            EndpointId::Remote(_) => None,
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = RefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.starts_with('v') {
            VatId::try_from(s).map(EndpointId::Vat)
        } else {
            RemoteId::try_from(s).map(EndpointId::Remote)
        }
    }
}

impl FromStr for EndpointId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> String {
        match id {
            EndpointId::Vat(v) => v.into(),
            EndpointId::Remote(r) => r.into(),
        }
    }
}

impl From<VatId> for EndpointId {
    fn from(v: VatId) -> Self {
        EndpointId::Vat(v)
    }
}

impl From<RemoteId> for EndpointId {
    fn from(r: RemoteId) -> Self {
        EndpointId::Remote(r)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
