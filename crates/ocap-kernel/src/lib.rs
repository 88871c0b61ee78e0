//! Object-capability kernel.
//!
//! The kernel routes messages between vats, isolated units of computation
//! that only hold references the kernel has handed them:
//!
//! - **Queue** (`queue`): run-queue wake-up, kernel-originated messages and
//!   promise resolution with decider checks
//! - **Router** (`router`): delivers run-queue items, following resolved
//!   promises and splatting messages that cannot arrive
//! - **Vat adapters** (`vat`): the transport handle and the syscall handler
//! - **Kernel** (`kernel`): the crank loop, vat lifecycle and the run loop
//! - **Handle** (`handle`): cloneable command interface to a running kernel
//!
//! # Execution Model
//!
//! Exactly one run-queue item is processed at a time ("crank"). Every store
//! mutation happens inside a crank, including those caused by syscalls a vat
//! makes while handling a delivery.
//!
//! ```text
//!   KernelHandle ──commands──▶ Kernel::run ──▶ run_crank
//!                                   │             │ next_item: gc > reap > run queue
//!                                   │             ▼
//!                                   │        KernelRouter ──deliver──▶ VatHandle ──▶ vat
//!                                   │             ▲                       │
//!                                   │             └──── VatSyscallHandler ◀┘ syscalls
//!                                   ▼
//!                            KernelStore (ocap-store)
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod queue;
pub mod router;
pub mod types;
pub mod vat;
pub mod worker;

mod kernel;

pub use config::{ClusterConfig, KernelOptions};
pub use error::KernelError;
pub use handle::{KernelCommand, KernelHandle, VatFilter};
pub use kernel::Kernel;
pub use queue::KernelQueue;
pub use router::KernelRouter;
pub use types::{KernelStatus, PromiseSettlement, VatExit, VatStatus};
pub use vat::{VatCanceller, VatHandle, VatSyscallHandler};
pub use worker::VatWorkerService;
