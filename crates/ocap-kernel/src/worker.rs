//! Vat worker service: where vats actually run.
//!
//! The kernel only ever sees a [`VatStream`]. Whether the worker behind it is
//! a task, a thread or another process is up to the implementation.

use std::future::Future;

use ocap_ipc::{VatConfig, VatId, VatStream};

use crate::error::KernelError;

pub trait VatWorkerService: Send {
    /// Start a vat and return the kernel end of its transport.
    fn launch(
        &mut self,
        vat_id: &VatId,
        config: &VatConfig,
    ) -> impl Future<Output = Result<VatStream, KernelError>> + Send;

    /// Stop one vat. Unknown ids are not an error.
    fn terminate(&mut self, vat_id: &VatId) -> impl Future<Output = Result<(), KernelError>> + Send;

    fn terminate_all(&mut self) -> impl Future<Output = Result<(), KernelError>> + Send;
}
