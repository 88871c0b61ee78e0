//! Persisted FIFO queues.
//!
//! A queue named `q` is stored as `queue.q.head` (next index to dequeue),
//! `queue.q.tail` (next index to enqueue) and one `queue.q.<n>` entry per item.
//! The run queue is named `run`; each kernel promise has a queue named after
//! its kpid holding messages sent to it before resolution.

use ocap_ipc::{KRef, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::RunQueueItem;

const RUN_QUEUE: &str = "run";

fn head_key(name: &str) -> String {
    format!("queue.{}.head", name)
}

fn tail_key(name: &str) -> String {
    format!("queue.{}.tail", name)
}

fn item_key(name: &str, index: u64) -> String {
    format!("queue.{}.{}", name, index)
}

impl<K: KvStore> KernelStore<K> {
    fn queue_bounds(&self, name: &str) -> Result<(u64, u64), StoreError> {
        let head = self.get_u64(&head_key(name))?.unwrap_or(1);
        let tail = self.get_u64(&tail_key(name))?.unwrap_or(1);
        Ok((head, tail))
    }

    pub(crate) fn enqueue<T: Serialize>(&mut self, name: &str, item: &T) -> Result<(), StoreError> {
        let (head, tail) = self.queue_bounds(name)?;
        self.set_json(&item_key(name, tail), item)?;
        self.set_u64(&head_key(name), head);
        self.set_u64(&tail_key(name), tail + 1);
        Ok(())
    }

    pub(crate) fn dequeue<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, StoreError> {
        let (head, tail) = self.queue_bounds(name)?;
        if head >= tail {
            return Ok(None);
        }
        let key = item_key(name, head);
        let item = self
            .get_json(&key)?
            .ok_or_else(|| StoreError::MissingKey(key.clone()))?;
        self.kv.delete(&key);
        self.set_u64(&head_key(name), head + 1);
        Ok(Some(item))
    }

    pub(crate) fn queue_length(&self, name: &str) -> Result<u64, StoreError> {
        let (head, tail) = self.queue_bounds(name)?;
        Ok(tail.saturating_sub(head))
    }

    pub(crate) fn delete_queue(&mut self, name: &str) -> Result<(), StoreError> {
        let (head, tail) = self.queue_bounds(name)?;
        for index in head..tail {
            self.kv.delete(&item_key(name, index));
        }
        self.kv.delete(&head_key(name));
        self.kv.delete(&tail_key(name));
        Ok(())
    }

    // ========================================================================
    // Run queue
    // ========================================================================

    /// Append to the run queue. Counts for the item's krefs must already be held.
    pub fn enqueue_run(&mut self, item: &RunQueueItem) -> Result<(), StoreError> {
        let was_empty = self.run_queue_length()? == 0;
        self.enqueue(RUN_QUEUE, item)?;
        if was_empty {
            self.pending_wakeup = true;
        }
        Ok(())
    }

    pub fn dequeue_run(&mut self) -> Result<Option<RunQueueItem>, StoreError> {
        self.dequeue(RUN_QUEUE)
    }

    pub fn run_queue_length(&self) -> Result<u64, StoreError> {
        self.queue_length(RUN_QUEUE)
    }

    // ========================================================================
    // Promise queues
    // ========================================================================

    /// Park a message on an unresolved promise until it settles.
    pub fn enqueue_promise_message(
        &mut self,
        kpid: &KRef,
        message: &Message<KRef>,
    ) -> Result<(), StoreError> {
        self.enqueue(kpid.as_str(), message)
    }

    pub fn promise_queue_length(&self, kpid: &KRef) -> Result<u64, StoreError> {
        self.queue_length(kpid.as_str())
    }

    pub(crate) fn drain_promise_queue(&mut self, kpid: &KRef) -> Result<Vec<Message<KRef>>, StoreError> {
        let mut messages = Vec::new();
        while let Some(message) = self.dequeue(kpid.as_str())? {
            messages.push(message);
        }
        Ok(messages)
    }
}
