//! Kernel/vat protocol for the ocap kernel.
//!
//! This crate is the single source of truth for everything that crosses the
//! boundary between the kernel and the vats it hosts:
//!
//! - **Refs**: kernel references (`ko1`, `kp2`), endpoint references (`o+3`,
//!   `p-4`, `ro-5`) and endpoint identifiers (`v1`, `r1`)
//! - **CapData**: opaque message bodies plus their reference slots, and the
//!   small marshalling helpers the kernel needs to build its own bodies
//! - **Delivery / Syscall**: the closed sets of kernel→vat deliveries and
//!   vat→kernel syscalls
//! - **Stream**: the frames exchanged over a vat's duplex transport
//! - **Config**: vat configuration records
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   KernelToVat::Command(Deliver)   ┌──────────────┐
//! │              │ ─────────────────────────────────▶│              │
//! │    Kernel    │   VatToKernel::Syscall            │     Vat      │
//! │  (KRef space)│ ◀──────────────────────────────── │ (VRef space) │
//! │              │   KernelToVat::SyscallResult      │              │
//! │              │ ─────────────────────────────────▶│              │
//! │              │   VatToKernel::Reply              │              │
//! │              │ ◀──────────────────────────────── │              │
//! └──────────────┘                                   └──────────────┘
//! ```

pub mod capdata;
pub mod config;
pub mod delivery;
pub mod error;
pub mod refs;
pub mod stream;
pub mod syscall;

pub use capdata::{
    decode_methargs, extract_single_ref, kser, kser_error, kser_with_slots, kslot, kunser,
    methargs, CapData, Message, Resolution,
};
pub use config::{VatConfig, VatSource};
pub use delivery::VatDelivery;
pub use error::{ConfigError, MarshalError, RefError};
pub use refs::{
    is_promise_ref, EndpointId, ERef, KRef, RefContext, RefDirection, RefInfo, RefKind, RemoteId,
    VRef, VatId,
};
pub use stream::{
    decode_frame, encode_frame, vat_stream_pair, CommandReply, KernelToVat, VatCheckpoint,
    VatCommand, VatPort, VatStream, VatToKernel,
};
pub use syscall::{VatSyscall, VatSyscallResult};
