//! Kernel side of one vat's transport.
//!
//! A reader task owns the incoming half of the stream. Replies are routed to
//! the waiter registered under the command id; syscalls are forwarded to
//! whichever command is outstanding, so they are always handled on the crank
//! that caused them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ocap_ipc::{
    CommandReply, KernelToVat, VatCommand, VatConfig, VatDelivery, VatId, VatStream, VatSyscall,
    VatSyscallResult, VatToKernel,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::KernelError;

type ReplyWaiter = oneshot::Sender<Result<CommandReply, KernelError>>;
type PendingReplies = Arc<Mutex<BTreeMap<u64, ReplyWaiter>>>;

fn lock(pending: &PendingReplies) -> MutexGuard<'_, BTreeMap<u64, ReplyWaiter>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fail every outstanding command.
fn fail_pending(pending: &PendingReplies, err: impl Fn() -> KernelError) {
    let waiters = std::mem::take(&mut *lock(pending));
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(err()));
    }
}

async fn read_loop(
    vat_id: VatId,
    mut rx: mpsc::UnboundedReceiver<VatToKernel>,
    pending: PendingReplies,
    syscalls: mpsc::UnboundedSender<(u64, VatSyscall)>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            VatToKernel::Reply { id, reply } => match lock(&pending).remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(reply));
                }
                None => warn!(vat = %vat_id, id, "reply for unknown command"),
            },
            VatToKernel::Syscall { id, syscall } => {
                trace!(vat = %vat_id, id, syscall = syscall.name(), "syscall received");
                if syscalls.send((id, syscall)).is_err() {
                    break;
                }
            }
        }
    }
    debug!(vat = %vat_id, "vat stream closed");
    fail_pending(&pending, || {
        KernelError::Transport(format!("vat {} stream closed", vat_id))
    });
}

/// Fails a vat's in-flight commands from outside the crank that is
/// waiting on them.
#[derive(Clone)]
pub struct VatCanceller {
    vat_id: VatId,
    pending: PendingReplies,
}

impl VatCanceller {
    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    /// Every outstanding command on the vat fails with `VatDeleted`.
    /// Returns how many were waiting.
    pub fn cancel(&self) -> usize {
        let waiting = lock(&self.pending).len();
        let vat_id = self.vat_id.clone();
        fail_pending(&self.pending, || KernelError::VatDeleted(vat_id.clone()));
        waiting
    }
}

enum CommandEvent {
    Syscall(u64, VatSyscall),
    Reply(Result<CommandReply, KernelError>),
    ReaderGone,
}

pub struct VatHandle {
    vat_id: VatId,
    config: VatConfig,
    tx: mpsc::UnboundedSender<KernelToVat>,
    /// Waiters keyed by command id
    pending: PendingReplies,
    /// Syscalls from the reader task, in arrival order
    syscalls: mpsc::UnboundedReceiver<(u64, VatSyscall)>,
    reader: JoinHandle<()>,
    next_id: u64,
}

impl VatHandle {
    /// Attach to a launched vat's stream. Must be called inside a runtime.
    pub fn new(vat_id: VatId, config: VatConfig, stream: VatStream) -> Self {
        let VatStream { tx, rx } = stream;
        let pending: PendingReplies = Arc::default();
        let (syscall_tx, syscalls) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            vat_id.clone(),
            rx,
            Arc::clone(&pending),
            syscall_tx,
        ));
        Self {
            vat_id,
            config,
            tx,
            pending,
            syscalls,
            reader,
            next_id: 1,
        }
    }

    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    pub fn config(&self) -> &VatConfig {
        &self.config
    }

    pub fn canceller(&self) -> VatCanceller {
        VatCanceller {
            vat_id: self.vat_id.clone(),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Send `command` and wait for its reply, answering syscalls with
    /// `handler` as they arrive.
    pub async fn run_command<F>(
        &mut self,
        command: VatCommand,
        mut handler: F,
    ) -> Result<CommandReply, KernelError>
    where
        F: FnMut(VatSyscall) -> VatSyscallResult,
    {
        let id = self.next_id;
        self.next_id += 1;
        let name = command.name();
        let (waiter, mut reply) = oneshot::channel();
        lock(&self.pending).insert(id, waiter);
        trace!(vat = %self.vat_id, id, command = name, "send command");
        if self.tx.send(KernelToVat::Command { id, command }).is_err() {
            lock(&self.pending).remove(&id);
            return Err(KernelError::Transport(format!(
                "vat {} is not accepting commands",
                self.vat_id
            )));
        }

        loop {
            let event = tokio::select! {
                biased;
                syscall = self.syscalls.recv() => match syscall {
                    Some((syscall_id, syscall)) => CommandEvent::Syscall(syscall_id, syscall),
                    None => CommandEvent::ReaderGone,
                },
                result = &mut reply => CommandEvent::Reply(
                    result.unwrap_or_else(|_| Err(KernelError::VatDeleted(self.vat_id.clone()))),
                ),
            };
            match event {
                // Reader exits only after failing the waiters it knew about
                CommandEvent::ReaderGone => {
                    lock(&self.pending).remove(&id);
                    return reply.try_recv().unwrap_or_else(|_| {
                        Err(KernelError::Transport(format!("vat {} stream closed", self.vat_id)))
                    });
                }
                CommandEvent::Syscall(syscall_id, syscall) => {
                    let result = handler(syscall);
                    // A vat that has gone away no longer wants the answer
                    let _ = self.tx.send(KernelToVat::SyscallResult {
                        id: syscall_id,
                        result,
                    });
                }
                CommandEvent::Reply(result) => {
                    trace!(vat = %self.vat_id, id, command = name, ok = result.is_ok(), "command done");
                    return result;
                }
            }
        }
    }

    pub async fn init<F>(
        &mut self,
        state: BTreeMap<String, String>,
        handler: F,
    ) -> Result<CommandReply, KernelError>
    where
        F: FnMut(VatSyscall) -> VatSyscallResult,
    {
        let command = VatCommand::InitVat {
            vat_config: self.config.clone(),
            state,
        };
        self.run_command(command, handler).await
    }

    pub async fn deliver<F>(
        &mut self,
        delivery: VatDelivery,
        handler: F,
    ) -> Result<CommandReply, KernelError>
    where
        F: FnMut(VatSyscall) -> VatSyscallResult,
    {
        self.run_command(VatCommand::Deliver(delivery), handler).await
    }

    /// Round-trip a no-op command.
    pub async fn ping(&mut self) -> Result<(), KernelError> {
        let vat_id = self.vat_id.clone();
        self.run_command(VatCommand::Ping, |syscall| {
            VatSyscallResult::Error(format!(
                "vat {} made syscall {} during ping",
                vat_id,
                syscall.name()
            ))
        })
        .await
        .map(|_| ())
    }

    /// Stop reading from the vat and fail anything still waiting on it.
    pub fn terminate(&mut self) {
        self.reader.abort();
        let vat_id = self.vat_id.clone();
        fail_pending(&self.pending, || KernelError::VatDeleted(vat_id.clone()));
        debug!(vat = %self.vat_id, "vat handle terminated");
    }
}

impl Drop for VatHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
