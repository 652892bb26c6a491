//! Mutable - a [`Value`] with an `update` entry point.
//!
//! `update` is the single path for caller-driven change: it runs the value's
//! own equality check first, so updating with a value equal to the current
//! one is a silent no-op. [`Mutable::local`] creates a self-contained
//! instance whose storage exists independently of listeners;
//! [`Mutable::bimap`] builds a two-way lens onto part of a larger value.

use std::cell::RefCell;
use std::rc::Rc;

use crate::listeners::{DispatchError, Listener};
use crate::source::{ReadableSource, Source, Unsubscribe};
use crate::value::Value;

/// A value writable through [`Mutable::update`].
pub struct Mutable<T: Clone + 'static> {
    value: Value<T>,
    update_fn: Rc<dyn Fn(T) -> Result<(), DispatchError>>,
}

impl<T: Clone + 'static> Clone for Mutable<T> {
    fn clone(&self) -> Self {
        Mutable {
            value: self.value.clone(),
            update_fn: self.update_fn.clone(),
        }
    }
}

impl<T: Clone + 'static> Source<T> for Mutable<T> {
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        self.value.on_emit_raw(listener)
    }

    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        self.value.on_value_raw(listener)
    }
}

impl<T: Clone + 'static> ReadableSource<T> for Mutable<T> {
    fn current(&self) -> T {
        self.value.current()
    }
}

impl<T: Clone + 'static> Mutable<T> {
    /// Self-contained mutable: its own storage, its own listener registry,
    /// no external connection.
    pub fn local(start: T, eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        let state = Rc::new(RefCell::new(start));
        let eq: Rc<dyn Fn(&T, &T) -> bool> = Rc::new(eq);
        let read_state = state.clone();
        let value = Value::derive_rc(
            eq.clone(),
            |_sink| Box::new(|| {}),
            Rc::new(move || read_state.borrow().clone()),
        );
        let sink = value.external_sink();
        let update_fn = Rc::new(move |new: T| {
            let old = state.borrow().clone();
            if eq(&old, &new) {
                return Ok(());
            }
            *state.borrow_mut() = new.clone();
            // While dormant the sink is a no-op; current() reads the storage.
            sink.force(new, old)
        });
        Mutable { value, update_fn }
    }

    /// Assemble from an existing value and an update routine - the shape of
    /// externally-derived mutables (settings backends, query parameters).
    pub fn from_parts(
        value: Value<T>,
        update: impl Fn(T) -> Result<(), DispatchError> + 'static,
    ) -> Self {
        Mutable {
            value,
            update_fn: Rc::new(update),
        }
    }

    /// Push a new value through the equality-checked dispatch path.
    pub fn update(&self, value: T) -> Result<(), DispatchError> {
        (self.update_fn)(value)
    }

    /// The read-only face of this mutable.
    pub fn value(&self) -> Value<T> {
        self.value.clone()
    }

    /// Two-way lens: reads project out of the parent, and `update(u)` runs
    /// `inject(&parent_current, &u)` back through the parent's own `update`.
    ///
    /// The projected type carries its own equality function; use one
    /// consistent with the parent's so both faces agree on what "changed"
    /// means.
    pub fn bimap<U: Clone + 'static>(
        &self,
        project: impl Fn(&T) -> U + 'static,
        inject: impl Fn(&T, &U) -> T + 'static,
        eq: impl Fn(&U, &U) -> bool + 'static,
    ) -> Mutable<U> {
        let value = self.value.map(project, eq);
        let parent = self.clone();
        let update_fn = Rc::new(move |new: U| {
            let merged = inject(&parent.current(), &new);
            parent.update(merged)
        });
        Mutable { value, update_fn }
    }
}

impl<T: Clone + PartialEq + 'static> Mutable<T> {
    /// [`Mutable::local`] pinned to structural equality.
    pub fn local_data(start: T) -> Self {
        Mutable::local(start, |a, b| a == b)
    }
}

// =============================================================================
// Tests
// =============================================================================
