/// Per-operation state machine
///
/// `Pending -> InFlight -> {Completed | Aborted | Failed}`, plus the direct
/// `Pending -> Aborted` edge for an abort that lands before dispatch. All
/// transitions are CAS on one atomic word, so exactly one terminal transition
/// is ever observed.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationState {
    Pending = 0,
    InFlight = 1,
    Completed = 2,
    Aborted = 3,
    Failed = 4,
}

impl OperationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => OperationState::Pending,
            1 => OperationState::InFlight,
            2 => OperationState::Completed,
            3 => OperationState::Aborted,
            _ => OperationState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Aborted | OperationState::Failed
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Pending => "pending",
            OperationState::InFlight => "in_flight",
            OperationState::Completed => "completed",
            OperationState::Aborted => "aborted",
            OperationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(OperationState::Pending as u8))
    }

    pub(crate) fn load(&self) -> OperationState {
        OperationState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Pending -> InFlight`. False means the operation was already settled
    /// (pre-abort) and must not open transport.
    pub(crate) fn begin_flight(&self) -> bool {
        self.0
            .compare_exchange(
                OperationState::Pending as u8,
                OperationState::InFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to a terminal state. Only the first caller succeeds.
    pub(crate) fn settle(&self, target: OperationState) -> bool {
        debug_assert!(target.is_terminal());
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if OperationState::from_u8(raw).is_terminal() {
                    None
                } else {
                    Some(target as u8)
                }
            })
            .is_ok()
    }
}
