//! Lifecycle state shared by the server and its workers.
//!
//! Transitions are compare-and-swap on a single atomic byte, so concurrent callers racing
//! the same transition collapse into one winner and never block.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LifecycleState {
    Disposed = 0,
    Stopped = 1,
    Stopping = 2,
    Starting = 3,
    Started = 4,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disposed => "Disposed",
            Self::Stopped => "Stopped",
            Self::Stopping => "Stopping",
            Self::Starting => "Starting",
            Self::Started => "Started",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disposed,
            1 => Self::Stopped,
            2 => Self::Stopping,
            3 => Self::Starting,
            _ => Self::Started,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub fn new(initial: LifecycleState) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    pub fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.raw.load(Ordering::SeqCst))
    }

    pub fn is(&self, state: LifecycleState) -> bool {
        self.load() == state
    }

    /// Returns `true` only for the caller that performed the transition.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves to `to` from any state except `Disposed`. Returns the previous state, or
    /// `None` when the cell was already disposed and left untouched.
    pub fn force_unless_disposed(&self, to: LifecycleState) -> Option<LifecycleState> {
        let mut current = self.raw.load(Ordering::SeqCst);
        loop {
            if current == LifecycleState::Disposed as u8 {
                return None;
            }
            match self
                .raw
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(previous) => return Some(LifecycleState::from_u8(previous)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Terminal move. Returns the previous state.
    pub fn dispose(&self) -> LifecycleState {
        LifecycleState::from_u8(
            self.raw
                .swap(LifecycleState::Disposed as u8, Ordering::SeqCst),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    Disposed { component: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed { component } => {
                write!(f, "{component} is disposed and cannot change state")
            }
        }
    }
}

impl std::error::Error for LifecycleError {}
