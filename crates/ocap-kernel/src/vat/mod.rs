//! Per-vat adapters: the transport handle and the syscall handler.

mod handle;
mod syscall;

pub use handle::{VatCanceller, VatHandle};
pub use syscall::VatSyscallHandler;
