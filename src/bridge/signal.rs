/// One-shot abort signal, one per operation
///
/// Backed by a `tokio::sync::watch` slot that goes from `None` to
/// `Some(reason)` exactly once. The dispatch task and any number of async
/// waiters observe the same transition; script-side listeners are not called
/// directly but posted to the owning context's queue.
use crate::bridge::queue::{ContextEvent, EventSender};
use crate::config::types::AbortReason;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug)]
struct SignalInner {
    operation_id: u64,
    slot: watch::Sender<Option<AbortReason>>,
    listeners: Mutex<Vec<u64>>,
    events: EventSender,
}

#[derive(Clone, Debug)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

/// Resolve once `rx` carries a reason
pub(crate) async fn aborted(rx: &mut watch::Receiver<Option<AbortReason>>) -> AbortReason {
    loop {
        if let Some(reason) = *rx.borrow_and_update() {
            return reason;
        }
        if rx.changed().await.is_err() {
            // Sender gone without firing: the signal can never fire now
            std::future::pending::<()>().await;
        }
    }
}

impl AbortSignal {
    pub(crate) fn new(operation_id: u64, events: EventSender) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            inner: Arc::new(SignalInner {
                operation_id,
                slot,
                listeners: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.slot.borrow().is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.inner.slot.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<AbortReason>> {
        self.inner.slot.subscribe()
    }

    /// Wait until the signal fires
    pub async fn wait(&self) -> AbortReason {
        let mut rx = self.subscribe();
        aborted(&mut rx).await
    }

    /// Register a script listener (by callback slot id).
    ///
    /// Returns false if the signal already fired; like DOM listeners added
    /// after the fact, it will not be invoked.
    pub fn on_abort(&self, listener: u64) -> bool {
        let mut listeners = match self.inner.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_aborted() {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Fire the signal. Only the first call has any effect.
    pub(crate) fn trigger(&self, reason: AbortReason) -> bool {
        let fired = self.inner.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
        if !fired {
            return false;
        }

        let listeners = {
            let mut guard = match self.inner.listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for listener in listeners {
            self.inner.events.post(ContextEvent::Aborted {
                operation_id: self.inner.operation_id,
                listener,
                reason,
            });
        }
        true
    }
}
