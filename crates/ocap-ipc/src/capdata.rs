//! Opaque message data and the kernel's marshalling helpers.
//!
//! A `CapData` body is text owned by the vats; the kernel only ever looks at
//! the `slots` list. The handful of bodies the kernel builds itself (method
//! calls it injects, error values it rejects promises with) use the `#`-prefixed
//! JSON encoding produced by [`kser`]. Slot references inside such a body are
//! strings: `"$<i>.Alleged: <iface>"` for objects and `"&<i>"` for promises.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::MarshalError;

/// Body plus the references it mentions, in any reference space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R> {
    pub body: String,
    pub slots: Vec<R>,
}

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Rewrite every slot, keeping the body untouched.
    pub fn try_map_slots<S, E>(
        &self,
        mut f: impl FnMut(&R) -> Result<S, E>,
    ) -> Result<CapData<S>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

/// A method invocation: `methargs` is `[method, [args...]]` and `result` is the
/// promise that will carry its answer, if the sender wants one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<R> {
    pub methargs: CapData<R>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
}

impl<R> Message<R> {
    pub fn new(methargs: CapData<R>, result: Option<R>) -> Self {
        Self { methargs, result }
    }
}

/// `(promise, rejected, data)` as carried by notify deliveries and resolve syscalls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution<R> {
    pub promise: R,
    pub rejected: bool,
    pub data: CapData<R>,
}

impl<R> Resolution<R> {
    pub fn new(promise: R, rejected: bool, data: CapData<R>) -> Self {
        Self {
            promise,
            rejected,
            data,
        }
    }
}

const BODY_PREFIX: char = '#';

/// Encode a slot-free JSON value as a body.
pub fn kser<R>(value: &Value) -> CapData<R> {
    CapData {
        body: format!("{}{}", BODY_PREFIX, value),
        slots: Vec::new(),
    }
}

/// Encode a JSON value whose slot markers refer to `slots`.
pub fn kser_with_slots<R>(value: &Value, slots: Vec<R>) -> CapData<R> {
    CapData {
        body: format!("{}{}", BODY_PREFIX, value),
        slots,
    }
}

/// The body the kernel uses to reject promises.
pub fn kser_error<R>(message: &str) -> CapData<R> {
    kser(&json!({ "#error": message, "name": "Error" }))
}

/// Slot marker for position `index` in the body.
pub fn kslot(index: usize, is_promise: bool, iface: &str) -> Value {
    if is_promise {
        Value::String(format!("&{}", index))
    } else {
        Value::String(format!("${}.Alleged: {}", index, iface))
    }
}

/// Decode a kernel-encoded body.
pub fn kunser(body: &str) -> Result<Value, MarshalError> {
    let text = body
        .strip_prefix(BODY_PREFIX)
        .ok_or(MarshalError::MissingPrefix)?;
    Ok(serde_json::from_str(text)?)
}

/// Build the `[method, args]` data of a message.
pub fn methargs<R>(method: &str, args: Vec<Value>, slots: Vec<R>) -> CapData<R> {
    kser_with_slots(&json!([method, args]), slots)
}

/// Split kernel-encoded methargs back into method name and argument list.
pub fn decode_methargs(body: &str) -> Result<(String, Vec<Value>), MarshalError> {
    match kunser(body)? {
        Value::Array(mut parts) if parts.len() == 2 => {
            let args = match parts.pop() {
                Some(Value::Array(args)) => args,
                other => return Err(MarshalError::NotMethodCall(format!("{:?}", other))),
            };
            match parts.pop() {
                Some(Value::String(method)) => Ok((method, args)),
                other => Err(MarshalError::NotMethodCall(format!("{:?}", other))),
            }
        }
        other => Err(MarshalError::NotMethodCall(other.to_string())),
    }
}

/// If the data is exactly one reference (and nothing else), return it.
///
/// Used when a promise resolves: a value that is a bare reference forwards
/// queued messages to that reference instead of splatting them.
pub fn extract_single_ref<R: Clone>(data: &CapData<R>) -> Option<R> {
    if data.slots.len() != 1 {
        return None;
    }
    match kunser(&data.body).ok()? {
        Value::String(s) if s.starts_with("$0") || s.starts_with("&0") => {
            data.slots.first().cloned()
        }
        _ => None,
    }
}
