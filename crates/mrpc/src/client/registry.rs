//! Correlates responses with pending calls.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mrpc_proto::MessageId;
use parking_lot::{Condvar, Mutex};
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ChildTask, ExecutorHandle, OperationType};

enum SlotState {
    Pending,
    Done(Result<Value>),
    Taken,
}

/// Single-shot completion slot shared by the registry and one waiter.
///
/// Completion and retrieval serialize on the slot lock, so a completion
/// cannot race a waiter that is giving up.
pub(crate) struct CallSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl CallSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
        }
    }

    fn fulfilled(result: Result<Value>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Done(result)),
            cond: Condvar::new(),
        })
    }

    /// Deliver the result; a no-op if the slot was already fulfilled.
    fn fulfill(&self, result: Result<Value>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Done(result);
            self.cond.notify_all();
        }
    }

    fn wait_within(&self, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while matches!(*state, SlotState::Pending) {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && matches!(*state, SlotState::Pending)
            {
                return Err(Error::timeout("call did not complete in time"));
            }
        }

        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Done(result) => result,
            _ => Err(Error::precondition_not_met("call result already taken")),
        }
    }
}

struct CallEntry {
    slot: Arc<CallSlot>,
    // Aborted on drop, so canceled timers never fire.
    _timer: ChildTask<()>,
}

struct RegistryInner {
    calls: HashMap<MessageId, CallEntry>,
    next_id: u32,
}

impl RegistryInner {
    /// Monotonically increasing from 1, wrapping to 1 at overflow and
    /// skipping any id still outstanding.
    fn allocate_id(&mut self) -> MessageId {
        loop {
            let id = MessageId::from(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

/// The per-client table of outstanding calls.
pub(crate) struct CallRegistry {
    executor: ExecutorHandle,
    call_timeout: Duration,
    inner: Mutex<RegistryInner>,
}

impl CallRegistry {
    pub(crate) fn new(executor: ExecutorHandle, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            executor,
            call_timeout,
            inner: Mutex::new(RegistryInner {
                calls: HashMap::new(),
                next_id: 1,
            }),
        })
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Allocate an id and insert a fresh waiter entry with its deadline
    /// timer.
    pub(crate) fn register(self: &Arc<Self>) -> Result<(MessageId, Arc<CallSlot>)> {
        let mut inner = self.inner.lock();
        let id = inner.allocate_id();

        let slot = Arc::new(CallSlot::new());

        let registry = Arc::downgrade(self);
        let deadline = self.call_timeout;
        let timer = self.executor.spawn(OperationType::Transport, async move {
            tokio::time::sleep(deadline).await;
            if let Some(registry) = registry.upgrade() {
                registry.timeout_fire(id);
            }
            Ok(())
        });

        if inner
            .calls
            .insert(
                id,
                CallEntry {
                    slot: Arc::clone(&slot),
                    _timer: timer,
                },
            )
            .is_some()
        {
            return Err(Error::precondition_not_met(format!(
                "request id {id} is already in use"
            )));
        }

        Ok((id, slot))
    }

    /// Fulfill the waiter for `id`; a late result after timeout is dropped.
    pub(crate) fn complete(&self, id: MessageId, result: Result<Value>) {
        let entry = self.inner.lock().calls.remove(&id);
        match entry {
            Some(entry) => entry.slot.fulfill(result),
            None => trace!(%id, "Response for unknown call dropped"),
        }
    }

    /// Complete the entry with `Timeout` if it is still present.
    pub(crate) fn timeout_fire(&self, id: MessageId) {
        let entry = self.inner.lock().calls.remove(&id);
        if let Some(entry) = entry {
            debug!(%id, "Call timed out");
            entry
                .slot
                .fulfill(Err(Error::timeout("call did not complete in time")));
        }
    }

    /// Forget the entry without fulfilling; used when the waiter gave up.
    pub(crate) fn cancel(&self, id: MessageId) {
        self.inner.lock().calls.remove(&id);
    }

    /// Fulfill every pending entry with the given status.
    pub(crate) fn drain_all(&self, kind: ErrorKind, message: &str) {
        let drained: Vec<CallEntry> = {
            let mut inner = self.inner.lock();
            inner.calls.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %kind, "Draining outstanding calls");
        }
        for entry in drained {
            entry.slot.fulfill(Err(Error::new(kind, message)));
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().calls.len()
    }

    #[cfg(test)]
    fn set_next_id(&self, next_id: u32) {
        self.inner.lock().next_id = next_id;
    }
}

/// Single-shot handle to the eventual result of an asynchronous call.
pub struct CallFuture<R> {
    id: Option<MessageId>,
    slot: Arc<CallSlot>,
    registry: Weak<CallRegistry>,
    default_timeout: Duration,
    _result: core::marker::PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallFuture<R> {
    pub(crate) fn new(
        id: MessageId,
        slot: Arc<CallSlot>,
        registry: &Arc<CallRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id: Some(id),
            slot,
            registry: Arc::downgrade(registry),
            default_timeout,
            _result: core::marker::PhantomData,
        }
    }

    /// A future that is already failed; used when a call cannot even be
    /// sent.
    pub(crate) fn failed(error: Error, default_timeout: Duration) -> Self {
        Self {
            id: None,
            slot: CallSlot::fulfilled(Err(error)),
            registry: Weak::new(),
            default_timeout,
            _result: core::marker::PhantomData,
        }
    }

    /// Block until the call completes, bounded by the configured call
    /// timeout.
    pub fn get_result(self) -> Result<R> {
        let timeout = self.default_timeout;
        self.get_result_within(timeout)
    }

    /// Block for at most `timeout`; on expiry the registry entry is canceled
    /// and `Timeout` is returned.
    pub fn get_result_within(self, timeout: Duration) -> Result<R> {
        match self.slot.wait_within(timeout) {
            Ok(value) => rmpv::ext::from_value(value).map_err(|e| {
                Error::type_error(format!("result has an unexpected type: {e}"))
            }),
            Err(error) => {
                if error.kind() == ErrorKind::Timeout {
                    if let (Some(id), Some(registry)) = (self.id, self.registry.upgrade()) {
                        registry.cancel(id);
                    }
                }
                Err(error)
            }
        }
    }
}
