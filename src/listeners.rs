//! Listener registry and dispatch - the machinery every primitive shares.
//!
//! Each primitive owns exactly one [`Registry`]. Registration hands back a
//! [`ListenerId`]; removal is by id, so registering the same closure twice
//! yields two independent listeners (identity semantics, not value equality).
//!
//! # Dispatch contract
//!
//! [`Registry::dispatch`] iterates a snapshot of the listener list taken
//! before the first call. A listener may add or remove listeners (including
//! itself) mid-pass; those mutations only affect later dispatches. A listener
//! signals its own removal by returning [`Control::Unsubscribe`], which is
//! honored against the live list exactly once. Listener errors never abort
//! the pass: every remaining listener still runs, and the collected errors
//! surface afterwards - one error rethrown directly, several as
//! [`DispatchError::Aggregate`] in registration order.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use thiserror::Error;

// =============================================================================
// Listener types
// =============================================================================

/// What a listener wants done with its registration after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Stay registered.
    Keep,
    /// Remove this registration; the listener is not invoked again.
    Unsubscribe,
}

/// Result of one listener invocation. Errors are application errors; the
/// propagation machinery itself never produces them.
pub type ListenerResult = Result<Control, anyhow::Error>;

/// A registered callback. Invoked with the new value and, when the primitive
/// knows one, the previous value.
///
/// `Rc<dyn Fn>` rather than `FnMut`: dispatch is re-entrant (a listener may
/// trigger another dispatch on the same registry), so listeners keep their
/// own state behind `Cell`/`RefCell`.
pub type Listener<T> = Rc<dyn Fn(&T, Option<&T>) -> ListenerResult>;

// =============================================================================
// Errors
// =============================================================================

/// Error surfaced to the caller of `update`/`emit` after a dispatch pass.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Exactly one listener failed; its error is rethrown directly.
    #[error(transparent)]
    Listener(#[from] anyhow::Error),

    /// Two or more listeners failed, in registration order.
    #[error("{} listeners failed during one dispatch pass", .0.len())]
    Aggregate(Vec<anyhow::Error>),
}

impl DispatchError {
    /// Build from collected errors: `None` for zero, the error itself for
    /// one, an aggregate for several.
    pub fn from_errors(mut errors: Vec<anyhow::Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => Some(DispatchError::Listener(errors.remove(0))),
            _ => Some(DispatchError::Aggregate(errors)),
        }
    }

    /// Flatten into the underlying application errors.
    pub fn into_errors(self) -> Vec<anyhow::Error> {
        match self {
            DispatchError::Listener(e) => vec![e],
            DispatchError::Aggregate(errors) => errors,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Identity of one registration. Monotonic per registry, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Outcome of one dispatch pass.
#[must_use]
pub struct DispatchOutcome {
    /// Whether any listener was removed (sentinel return) during the pass.
    /// Callers use this to opportunistically tear down an emptied registry.
    pub removed_any: bool,
    /// Errors collected across the pass, if any.
    pub error: Option<DispatchError>,
}

impl DispatchOutcome {
    /// Surface the collected errors to the original `update`/`emit` caller.
    pub fn into_result(self) -> Result<(), DispatchError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Append/remove-by-identity listener list with snapshot dispatch.
///
/// Interior-mutable so a listener running inside [`Registry::dispatch`] can
/// re-enter `add`/`remove` on the same registry.
pub struct Registry<T> {
    entries: RefCell<Vec<(ListenerId, Listener<T>)>>,
    next_id: Cell<u64>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Append a listener; later registrations dispatch later.
    pub fn add(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.entries.borrow_mut().push((id, listener));
        id
    }

    /// Remove by identity. Returns whether the registration was still live.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Invoke every listener registered at the start of this pass, in
    /// registration order, with `value` and the optional previous value.
    pub fn dispatch(&self, value: &T, old: Option<&T>) -> DispatchOutcome {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self.entries.borrow().clone();
        let mut errors: Vec<anyhow::Error> = Vec::new();
        let mut removed_any = false;
        for (id, listener) in snapshot {
            match listener(value, old) {
                Ok(Control::Keep) => {}
                Ok(Control::Unsubscribe) => {
                    if self.remove(id) {
                        removed_any = true;
                    }
                }
                Err(error) => errors.push(error),
            }
        }
        DispatchOutcome {
            removed_any,
            error: DispatchError::from_errors(errors),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
