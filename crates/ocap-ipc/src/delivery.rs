//! Kernel→vat deliveries.
//!
//! Every reference in a delivery is already in the receiving vat's namespace.

use serde::{Deserialize, Serialize};

use crate::capdata::{Message, Resolution};
use crate::refs::VRef;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    /// Invoke a method on an object the vat exported (or a promise it decides)
    Message { target: VRef, message: Message<VRef> },
    /// Promises the vat subscribed to have settled
    Notify { resolutions: Vec<Resolution<VRef>> },
    /// The kernel no longer holds reachable references to these exports
    DropExports { vrefs: Vec<VRef> },
    /// Nobody can recognize these exports any more
    RetireExports { vrefs: Vec<VRef> },
    /// The exporter retired these objects; forget the imports
    RetireImports { vrefs: Vec<VRef> },
    /// Run local garbage collection and report what was released
    BringOutYourDead,
}

impl VatDelivery {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}
