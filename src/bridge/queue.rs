/// Context event queue
///
/// The only way bridge results reach script code. Senders are stamped with
/// the context generation they were created under; the receiving side drops
/// anything stamped with an older generation, so a late completion from a
/// previous lending can never surface in the next one.
use crate::bridge::state::OperationState;
use crate::config::types::{AbortReason, Generation, HostError, Result, INITIAL_GENERATION};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::time::{Duration, Instant};

/// Body and status of a completed operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Terminal result of an operation
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Completed(Response),
    Aborted(AbortReason),
    Failed(String),
}

impl Outcome {
    pub fn state(&self) -> OperationState {
        match self {
            Outcome::Completed(_) => OperationState::Completed,
            Outcome::Aborted(_) => OperationState::Aborted,
            Outcome::Failed(_) => OperationState::Failed,
        }
    }

    /// The script-facing view: cancellation and network failure stay distinct
    pub fn into_result(self) -> Result<Response> {
        match self {
            Outcome::Completed(response) => Ok(response),
            Outcome::Aborted(reason) => Err(HostError::Aborted(reason)),
            Outcome::Failed(message) => Err(HostError::TransportFailure(message)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionEvent {
    pub operation_id: u64,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContextEvent {
    /// Exactly one per operation
    Completion(CompletionEvent),
    /// One per registered abort listener
    Aborted {
        operation_id: u64,
        listener: u64,
        reason: AbortReason,
    },
}

#[derive(Debug)]
struct Envelope {
    generation: Generation,
    event: ContextEvent,
}

/// Posting side, handed to bridge tasks
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<Envelope>,
    generation: Generation,
}

impl EventSender {
    /// Post an event. False if the context is gone.
    pub fn post(&self, event: ContextEvent) -> bool {
        let posted = self
            .tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .is_ok();
        if !posted {
            debug!("Event for a dropped context discarded");
        }
        posted
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    generation: Generation,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            generation: INITIAL_GENERATION,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Start accepting only events stamped with `generation`
    pub fn advance(&mut self, generation: Generation) {
        self.generation = generation;
    }

    fn accept(&self, envelope: Envelope) -> Option<ContextEvent> {
        if envelope.generation == self.generation {
            Some(envelope.event)
        } else {
            debug!(
                "Dropped stale event from generation {} (now {})",
                envelope.generation, self.generation
            );
            None
        }
    }

    /// Next event without blocking
    pub fn try_next(&self) -> Option<ContextEvent> {
        while let Ok(envelope) = self.rx.try_recv() {
            if let Some(event) = self.accept(envelope) {
                return Some(event);
            }
        }
        None
    }

    /// Block up to `timeout` for the next event
    pub fn next_timeout(&self, timeout: Duration) -> Option<ContextEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(envelope) => {
                    if let Some(event) = self.accept(envelope) {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Discard everything queued. Returns how many events were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Queued events, including stale ones not yet filtered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(id: u64) -> ContextEvent {
        ContextEvent::Completion(CompletionEvent {
            operation_id: id,
            outcome: Outcome::Completed(Response::default()),
        })
    }

    #[test]
    fn test_fifo_delivery() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        sender.post(completion(2));
        sender.post(completion(1));

        assert_eq!(queue.try_next(), Some(completion(2)));
        assert_eq!(queue.try_next(), Some(completion(1)));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let mut queue = EventQueue::new();
        let old = queue.sender();
        queue.advance(INITIAL_GENERATION + 1);
        let new = queue.sender();

        old.post(completion(1));
        new.post(completion(2));
        assert_eq!(queue.try_next(), Some(completion(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_and_timeout() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        for id in 0..3 {
            sender.post(completion(id));
        }
        assert_eq!(queue.drain(), 3);
        assert_eq!(queue.next_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_outcome_errors_stay_distinct() {
        let aborted = Outcome::Aborted(AbortReason::Timeout).into_result();
        let failed = Outcome::Failed("reset".into()).into_result();
        assert_eq!(aborted.unwrap_err(), HostError::Aborted(AbortReason::Timeout));
        assert!(matches!(failed, Err(HostError::TransportFailure(_))));
    }
}
