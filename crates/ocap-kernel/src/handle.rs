//! Command interface to a running kernel.
//!
//! [`Kernel::run`](crate::Kernel::run) owns the kernel; everything else talks
//! to it through a cloneable [`KernelHandle`]. Each command carries a one-shot
//! reply channel.

use ocap_ipc::{KRef, VatConfig, VatId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClusterConfig;
use crate::error::KernelError;
use crate::types::{KernelStatus, PromiseSettlement};

type Reply<T> = oneshot::Sender<Result<T, KernelError>>;

/// Selects vats for [`KernelHandle::reap_vats`].
pub type VatFilter = Box<dyn Fn(&VatId) -> bool + Send>;

pub enum KernelCommand {
    LaunchVat {
        config: VatConfig,
        reply: Reply<KRef>,
    },
    LaunchSubcluster {
        config: ClusterConfig,
        reply: Reply<Option<oneshot::Receiver<PromiseSettlement>>>,
    },
    QueueMessage {
        target: KRef,
        method: String,
        args: Vec<Value>,
        reply: Reply<oneshot::Receiver<PromiseSettlement>>,
    },
    RestartVat {
        vat_id: VatId,
        reply: Reply<()>,
    },
    TerminateVat {
        vat_id: VatId,
        reply: Reply<()>,
    },
    ReapVats {
        filter: VatFilter,
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    GetStatus {
        reply: Reply<KernelStatus>,
    },
}

impl KernelCommand {
    pub fn name(&self) -> &'static str {
        match self {
            KernelCommand::LaunchVat { .. } => "launchVat",
            KernelCommand::LaunchSubcluster { .. } => "launchSubcluster",
            KernelCommand::QueueMessage { .. } => "queueMessage",
            KernelCommand::RestartVat { .. } => "restartVat",
            KernelCommand::TerminateVat { .. } => "terminateVat",
            KernelCommand::ReapVats { .. } => "reapVats",
            KernelCommand::Reset { .. } => "reset",
            KernelCommand::GetStatus { .. } => "getStatus",
        }
    }
}

#[derive(Clone, Debug)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<KernelCommand>,
}

impl KernelHandle {
    /// A handle and the receiver to pass to `Kernel::run`.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<KernelCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> KernelCommand,
    ) -> Result<T, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| KernelError::Shutdown)?;
        rx.await.map_err(|_| KernelError::Shutdown)?
    }

    pub async fn launch_vat(&self, config: VatConfig) -> Result<KRef, KernelError> {
        self.request(|reply| KernelCommand::LaunchVat { config, reply })
            .await
    }

    /// Launch a cluster and wait for its bootstrap call, if any, to settle.
    pub async fn launch_subcluster(
        &self,
        config: ClusterConfig,
    ) -> Result<Option<PromiseSettlement>, KernelError> {
        let bootstrap = self
            .request(|reply| KernelCommand::LaunchSubcluster { config, reply })
            .await?;
        match bootstrap {
            Some(result) => Ok(Some(result.await.map_err(|_| KernelError::Shutdown)?)),
            None => Ok(None),
        }
    }

    /// Send a message from the kernel and wait for its result.
    pub async fn queue_message(
        &self,
        target: KRef,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<PromiseSettlement, KernelError> {
        let method = method.into();
        let result = self
            .request(|reply| KernelCommand::QueueMessage {
                target,
                method,
                args,
                reply,
            })
            .await?;
        result.await.map_err(|_| KernelError::Shutdown)
    }

    pub async fn restart_vat(&self, vat_id: VatId) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::RestartVat { vat_id, reply })
            .await
    }

    pub async fn terminate_vat(&self, vat_id: VatId) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::TerminateVat { vat_id, reply })
            .await
    }

    pub async fn reap_vats(
        &self,
        filter: impl Fn(&VatId) -> bool + Send + 'static,
    ) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::ReapVats {
            filter: Box::new(filter),
            reply,
        })
        .await
    }

    pub async fn reset(&self) -> Result<(), KernelError> {
        self.request(|reply| KernelCommand::Reset { reply }).await
    }

    pub async fn get_status(&self) -> Result<KernelStatus, KernelError> {
        self.request(|reply| KernelCommand::GetStatus { reply }).await
    }
}
