//! Buffer - a readable source for values mutated in place.
//!
//! Built for large payloads (pixel planes, vertex arrays, audio blocks)
//! where replacing the value every frame would churn the allocator. The
//! buffer holds its value directly: there is no connect/disconnect lifecycle
//! and **no** automatic equality suppression - every `update`/`update_via`/
//! `updated` call notifies listeners unconditionally. Callers needing dedup
//! say so explicitly with [`Buffer::update_if`].
//!
//! Listeners observe the buffer's value by shared reference and must not
//! mutate the same buffer re-entrantly; mutate from outside the dispatch.

use std::cell::RefCell;
use std::rc::Rc;

use crate::listeners::{Control, DispatchError, Listener, Registry};
use crate::source::{noop_unsubscribe, ReadableSource, Source, Unsubscribe};

/// Holder for an in-place-mutated value.
pub struct Buffer<T: 'static> {
    state: Rc<RefCell<T>>,
    registry: Rc<Registry<T>>,
    /// Optional merge routine: folds an incoming value into the held one
    /// in place instead of replacing it.
    updater: Option<Rc<dyn Fn(&mut T, T)>>,
}

impl<T: 'static> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Buffer {
            state: self.state.clone(),
            registry: self.registry.clone(),
            updater: self.updater.clone(),
        }
    }
}

impl<T: 'static> Buffer<T> {
    pub fn new(initial: T) -> Self {
        Buffer {
            state: Rc::new(RefCell::new(initial)),
            registry: Rc::new(Registry::new()),
            updater: None,
        }
    }

    /// Buffer whose `update` merges into the held value in place.
    pub fn with_updater(initial: T, updater: impl Fn(&mut T, T) + 'static) -> Self {
        Buffer {
            state: Rc::new(RefCell::new(initial)),
            registry: Rc::new(Registry::new()),
            updater: Some(Rc::new(updater)),
        }
    }

    /// Read the held value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.borrow())
    }

    /// Replace (or merge, when an updater is configured) the held value and
    /// notify unconditionally.
    pub fn update(&self, new: T) -> Result<(), DispatchError> {
        {
            let mut state = self.state.borrow_mut();
            match &self.updater {
                Some(updater) => updater(&mut state, new),
                None => *state = new,
            }
        }
        self.updated()
    }

    /// Like [`Buffer::update`] but skipping the write and the notification
    /// when `eq` says the incoming value equals the held one. Returns whether
    /// anything happened.
    pub fn update_if(
        &self,
        new: T,
        eq: impl Fn(&T, &T) -> bool,
    ) -> Result<bool, DispatchError> {
        if eq(&self.state.borrow(), &new) {
            return Ok(false);
        }
        self.update(new)?;
        Ok(true)
    }

    /// Mutate the held value in place, then notify.
    pub fn update_via(&self, f: impl FnOnce(&mut T)) -> Result<(), DispatchError> {
        f(&mut self.state.borrow_mut());
        self.updated()
    }

    /// Notify listeners that the held value changed under them - the
    /// companion to mutating it through [`Buffer::with`]-style access or a
    /// lens injector.
    pub fn updated(&self) -> Result<(), DispatchError> {
        if self.registry.is_empty() {
            return Ok(());
        }
        let state = self.state.borrow();
        let outcome = self.registry.dispatch(&state, None);
        drop(state);
        outcome.into_result()
    }

    /// Lens onto part of the held value. The view's writes mutate the
    /// parent's value in place and then call the parent's [`Buffer::updated`].
    pub fn bimap<U: 'static>(
        &self,
        project: impl for<'a> Fn(&'a T) -> &'a U + 'static,
        project_mut: impl for<'a> Fn(&'a mut T) -> &'a mut U + 'static,
    ) -> BufferView<T, U> {
        BufferView {
            parent: self.clone(),
            project: Rc::new(project),
            project_mut: Rc::new(project_mut),
        }
    }
}

impl<T: 'static> Source<T> for Buffer<T> {
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        let id = self.registry.add(listener);
        let registry = self.registry.clone();
        Ok(Box::new(move || {
            registry.remove(id);
        }))
    }

    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        {
            let state = self.state.borrow();
            match listener(&state, None) {
                Ok(Control::Keep) => {}
                Ok(Control::Unsubscribe) => return Ok(noop_unsubscribe()),
                Err(error) => return Err(DispatchError::Listener(error)),
            }
        }
        self.on_emit_raw(listener)
    }
}

impl<T: Clone + 'static> ReadableSource<T> for Buffer<T> {
    fn current(&self) -> T {
        self.state.borrow().clone()
    }
}

// =============================================================================
// BufferView
// =============================================================================

/// Read/write lens onto part of a [`Buffer`]'s held value.
///
/// Implements the source traits for the projected type without pretending to
/// be a `Value`: like its parent, it never dedups.
pub struct BufferView<T: 'static, U: 'static> {
    parent: Buffer<T>,
    project: Rc<dyn for<'a> Fn(&'a T) -> &'a U>,
    project_mut: Rc<dyn for<'a> Fn(&'a mut T) -> &'a mut U>,
}

impl<T: 'static, U: 'static> Clone for BufferView<T, U> {
    fn clone(&self) -> Self {
        BufferView {
            parent: self.parent.clone(),
            project: self.project.clone(),
            project_mut: self.project_mut.clone(),
        }
    }
}

impl<T: 'static, U: 'static> BufferView<T, U> {
    /// Read the projected part without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&U) -> R) -> R {
        let project = &self.project;
        self.parent.with(|t| f(project(t)))
    }

    /// Overwrite the projected part in place, then notify the parent.
    pub fn update(&self, new: U) -> Result<(), DispatchError> {
        {
            let mut state = self.parent.state.borrow_mut();
            *(self.project_mut)(&mut state) = new;
        }
        self.parent.updated()
    }

    /// Mutate the projected part in place, then notify the parent.
    pub fn update_via(&self, f: impl FnOnce(&mut U)) -> Result<(), DispatchError> {
        {
            let mut state = self.parent.state.borrow_mut();
            f((self.project_mut)(&mut state));
        }
        self.parent.updated()
    }

    fn projected(&self, listener: Listener<U>) -> Listener<T> {
        let project = self.project.clone();
        Rc::new(move |value, old| listener(project(value), old.map(|o| project(o))))
    }
}

impl<T: 'static, U: 'static> Source<U> for BufferView<T, U> {
    fn on_emit_raw(&self, listener: Listener<U>) -> Result<Unsubscribe, DispatchError> {
        self.parent.on_emit_raw(self.projected(listener))
    }

    fn on_value_raw(&self, listener: Listener<U>) -> Result<Unsubscribe, DispatchError> {
        self.parent.on_value_raw(self.projected(listener))
    }
}

impl<T: 'static, U: Clone + 'static> ReadableSource<U> for BufferView<T, U> {
    fn current(&self) -> U {
        self.with(|u| u.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
