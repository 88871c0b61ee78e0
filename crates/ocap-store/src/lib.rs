//! Persistent kernel store for the ocap kernel.
//!
//! The store maps every durable kernel structure onto an ordered key-value
//! store:
//!
//! - **KvStore**: the physical get/set/delete/iterate contract, with an
//!   in-memory engine ([`MemoryKvStore`]) and the vat-side checkpointing
//!   store ([`VatKvStore`])
//! - **KernelStore**: c-lists, reference counts, promise table, run queue,
//!   GC action set, reap queue and vat records
//! - **GC**: [`process_gc_action_set`], the engine that picks the next unit of
//!   GC work
//!
//! # Design Principles
//!
//! 1. **Store is the source of truth**: runtime objects are rebuilt from it on
//!    restart
//! 2. **Fail, don't fix**: invariant violations return errors and leave
//!    persisted state alone
//! 3. **No globals**: all crank scratch state lives in the store instance
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         KernelStore                           │
//! │  ┌─────────┐ ┌──────────┐ ┌─────────┐ ┌────────┐ ┌──────────┐ │
//! │  │ c-lists │ │ refcounts│ │ promises│ │ queues │ │ gc / reap│ │
//! │  └─────────┘ └──────────┘ └─────────┘ └────────┘ └──────────┘ │
//! │                       CrankArena (ephemeral)                  │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 ▼
//!                      KvStore (MemoryKvStore, ...)
//! ```

pub mod error;
pub mod gc;
pub mod kv;
pub mod memory;
pub mod store;
pub mod types;
pub mod vat_kv;

pub use error::StoreError;
pub use gc::process_gc_action_set;
pub use kv::KvStore;
pub use memory::MemoryKvStore;
pub use store::{CListEntry, KernelStore};
pub use types::{
    GcAction, GcActionType, KernelPromise, PromiseState, RefCountOptions, RefCounts, RunQueueItem,
};
pub use vat_kv::VatKvStore;
