//! Value - always-readable, equality-deduped time-varying value.
//!
//! Unlike a [`Subject`](crate::subject::Subject), a `Value` answers
//! `current()` even with zero listeners: the `current` thunk supplied at
//! derivation recomputes from the underlying non-reactive source while
//! dormant, and while listened the core caches the last value so the next
//! change can be compared against it.
//!
//! The equality function is fixed at construction and used for every equality
//! test on that instance for its whole lifetime - combinators that span
//! several values (`join`, `switch`) are careful to apply each constituent's
//! own `eq` to that constituent's slot.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::trace;

use crate::listeners::{Control, DispatchError, Listener, Registry};
use crate::source::{noop_unsubscribe, Disconnect, ReadableSource, Source, Unsubscribe};

pub(crate) struct ValueCore<T: Clone + 'static> {
    registry: Registry<T>,
    eq: Rc<dyn Fn(&T, &T) -> bool>,
    connect: Box<dyn Fn(ValueSink<T>) -> Disconnect>,
    disconnect: RefCell<Option<Disconnect>>,
    /// Pure read of the underlying source; callable regardless of
    /// subscription state.
    current: Rc<dyn Fn() -> T>,
    /// `Some` iff awake. Seeded from `current` on wake, dropped on sleep.
    cached: RefCell<Option<T>>,
    /// Errors raised by listeners while the connect thunk was running.
    pending: RefCell<Vec<anyhow::Error>>,
}

/// Equality-deduped value with an always-answerable current state.
pub struct Value<T: Clone + 'static> {
    core: Rc<ValueCore<T>>,
}

impl<T: Clone + 'static> Clone for Value<T> {
    fn clone(&self) -> Self {
        Value {
            core: self.core.clone(),
        }
    }
}

/// Push handle given to a value's `connect` thunk.
pub struct ValueSink<T: Clone + 'static> {
    core: Weak<ValueCore<T>>,
}

impl<T: Clone + 'static> Clone for ValueSink<T> {
    fn clone(&self) -> Self {
        ValueSink {
            core: self.core.clone(),
        }
    }
}

impl<T: Clone + 'static> ValueSink<T> {
    /// Propagate `value` if it differs from the cached one under this
    /// value's own equality function; equal values are suppressed.
    pub fn send(&self, value: T) -> Result<(), DispatchError> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        let old = core.cached.borrow().clone();
        let Some(old) = old else {
            // Dormant: a stray send after teardown. Nothing to compare
            // against and nobody to notify.
            return Ok(());
        };
        if (core.eq)(&old, &value) {
            return Ok(());
        }
        self.force(value, old)
    }

    /// Propagate unconditionally. For callers that already applied the
    /// correct instance's equality (per-slot join, switch transitions).
    pub fn force(&self, value: T, old: T) -> Result<(), DispatchError> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        if core.cached.borrow().is_none() {
            return Ok(());
        }
        *core.cached.borrow_mut() = Some(value.clone());
        let outcome = core.registry.dispatch(&value, Some(&old));
        if outcome.removed_any && core.registry.is_empty() {
            sleep(&core);
        }
        outcome.into_result()
    }

    /// Stash an error raised while the connect thunk was running, to be
    /// surfaced from the subscribe call that triggered the wake.
    pub fn defer_error(&self, error: DispatchError) {
        if let Some(core) = self.core.upgrade() {
            core.pending.borrow_mut().extend(error.into_errors());
        }
    }
}

fn wake<T: Clone>(core: &Rc<ValueCore<T>>) -> Result<(), DispatchError> {
    trace!("value<{}> wake", std::any::type_name::<T>());
    // Seed the cache before connecting so the first upstream emission has
    // something to compare against.
    *core.cached.borrow_mut() = Some((core.current)());
    let sink = ValueSink {
        core: Rc::downgrade(core),
    };
    let disconnect = (core.connect)(sink);
    *core.disconnect.borrow_mut() = Some(disconnect);
    if core.registry.is_empty() {
        sleep(core);
    }
    match DispatchError::from_errors(core.pending.borrow_mut().drain(..).collect()) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn sleep<T: Clone>(core: &ValueCore<T>) {
    let disconnect = core.disconnect.borrow_mut().take();
    if let Some(disconnect) = disconnect {
        trace!("value<{}> dormant", std::any::type_name::<T>());
        core.cached.borrow_mut().take();
        disconnect();
    }
}

fn subscribe_core<T: Clone>(
    core: &Rc<ValueCore<T>>,
    want_value: bool,
    listener: Listener<T>,
) -> Result<Unsubscribe, DispatchError> {
    if want_value {
        // A value always has a current to hand over; if the listener retires
        // on the spot, no live subscription (and no wake) ever happens.
        let now = match &*core.cached.borrow() {
            Some(cached) => cached.clone(),
            None => (core.current)(),
        };
        match listener(&now, None) {
            Ok(Control::Keep) => {}
            Ok(Control::Unsubscribe) => return Ok(noop_unsubscribe()),
            Err(error) => return Err(DispatchError::Listener(error)),
        }
    }
    let id = core.registry.add(listener);
    if core.registry.len() == 1 {
        if let Err(error) = wake(core) {
            if core.registry.remove(id) && core.registry.is_empty() {
                sleep(core);
            }
            return Err(error);
        }
    }
    let core = Rc::clone(core);
    Ok(Box::new(move || {
        if core.registry.remove(id) && core.registry.is_empty() {
            sleep(&core);
        }
    }))
}

impl<T: Clone + 'static> Source<T> for Value<T> {
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        subscribe_core(&self.core, false, listener)
    }

    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        subscribe_core(&self.core, true, listener)
    }
}

impl<T: Clone + 'static> ReadableSource<T> for Value<T> {
    fn current(&self) -> T {
        match &*self.core.cached.borrow() {
            Some(cached) => cached.clone(),
            None => (self.core.current)(),
        }
    }
}

impl<T: Clone + 'static> Value<T> {
    /// Derive from an external source.
    ///
    /// `current` must be pure and callable while dormant; `connect` runs per
    /// 0-to-1 listener transition and pushes changes through the
    /// [`ValueSink`], which applies `eq` before notifying anyone.
    pub fn derive(
        eq: impl Fn(&T, &T) -> bool + 'static,
        connect: impl Fn(ValueSink<T>) -> Disconnect + 'static,
        current: impl Fn() -> T + 'static,
    ) -> Self {
        Self::derive_rc(Rc::new(eq), connect, Rc::new(current))
    }

    pub(crate) fn derive_rc(
        eq: Rc<dyn Fn(&T, &T) -> bool>,
        connect: impl Fn(ValueSink<T>) -> Disconnect + 'static,
        current: Rc<dyn Fn() -> T>,
    ) -> Self {
        Value {
            core: Rc::new(ValueCore {
                registry: Registry::new(),
                eq,
                connect: Box::new(connect),
                disconnect: RefCell::new(None),
                current,
                cached: RefCell::new(None),
                pending: RefCell::new(Vec::new()),
            }),
        }
    }

    /// This instance's equality function.
    pub(crate) fn eq_fn(&self) -> Rc<dyn Fn(&T, &T) -> bool> {
        self.core.eq.clone()
    }

    /// Whether two handles refer to the same underlying value. The equality
    /// function of choice for values-of-values (see [`Value::switch`]).
    pub fn same(a: &Value<T>, b: &Value<T>) -> bool {
        Rc::ptr_eq(&a.core, &b.core)
    }

    /// Sink handle for feeding this value from outside a connect thunk
    /// (mutables push through this). No-op while dormant.
    pub(crate) fn external_sink(&self) -> ValueSink<T> {
        ValueSink {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Transformed value with its own equality function.
    ///
    /// Dormant reads recompute `f(&upstream.current())` fresh; while listened
    /// the last value stays cached for the next `eq` comparison.
    pub fn map<U: Clone + 'static>(
        &self,
        f: impl Fn(&T) -> U + 'static,
        eq: impl Fn(&U, &U) -> bool + 'static,
    ) -> Value<U> {
        let source = self.clone();
        let f = Rc::new(f);
        let current_source = source.clone();
        let current_f = f.clone();
        Value::derive(
            eq,
            move |sink: ValueSink<U>| {
                let f = f.clone();
                let send_sink = sink.clone();
                let listener: Listener<T> = Rc::new(move |value, _| {
                    send_sink.send(f(value)).map_err(anyhow::Error::from)?;
                    Ok(Control::Keep)
                });
                match source.on_emit_raw(listener) {
                    Ok(remover) => remover,
                    Err(error) => {
                        sink.defer_error(error);
                        noop_unsubscribe()
                    }
                }
            },
            move || current_f(&current_source.current()),
        )
    }

    /// [`Value::map`] pinned to structural equality.
    pub fn map_data<U: Clone + PartialEq + 'static>(
        &self,
        f: impl Fn(&T) -> U + 'static,
    ) -> Value<U> {
        self.map(f, |a, b| a == b)
    }

    /// Combined vector of every input. No readiness gating - values always
    /// have a current - and per-slot change detection uses each
    /// constituent's own equality function.
    pub fn join(values: Vec<Value<T>>) -> Value<Vec<T>> {
        let slot_eqs: Vec<Rc<dyn Fn(&T, &T) -> bool>> =
            values.iter().map(|value| value.eq_fn()).collect();
        let joint_eq: Rc<dyn Fn(&Vec<T>, &Vec<T>) -> bool> = Rc::new(move |a, b| {
            a.len() == b.len()
                && slot_eqs
                    .iter()
                    .zip(a.iter().zip(b.iter()))
                    .all(|(eq, (x, y))| eq(x, y))
        });
        let current_values = values.clone();
        let current: Rc<dyn Fn() -> Vec<T>> = Rc::new(move || {
            current_values.iter().map(|value| value.current()).collect()
        });
        Value::derive_rc(
            joint_eq,
            move |sink: ValueSink<Vec<T>>| {
                let removers: Vec<Unsubscribe> = values
                    .iter()
                    .enumerate()
                    .map(|(index, value)| {
                        let all = values.clone();
                        let slot_sink = sink.clone();
                        let listener: Listener<T> = Rc::new(move |changed, _| {
                            let mut combined: Vec<T> =
                                all.iter().map(|value| value.current()).collect();
                            combined[index] = changed.clone();
                            slot_sink.send(combined).map_err(anyhow::Error::from)?;
                            Ok(Control::Keep)
                        });
                        match value.on_emit_raw(listener) {
                            Ok(remover) => remover,
                            Err(error) => {
                                sink.defer_error(error);
                                noop_unsubscribe()
                            }
                        }
                    })
                    .collect();
                Box::new(move || {
                    for remover in removers {
                        remover();
                    }
                })
            },
            current,
        )
    }

    /// Follow the value produced by `f`, re-targeting on every change of
    /// `self`. Produced values are compared by identity, so `f` returning a
    /// different handle to the same value does not re-attach.
    pub fn switch_map<U: Clone + 'static>(
        &self,
        f: impl Fn(&T) -> Value<U> + 'static,
    ) -> Value<U> {
        self.map(f, Value::same).switch()
    }
}

impl<T: Clone + 'static> Value<Value<T>> {
    /// Flatten a value-of-values, following whichever inner value the outer
    /// currently holds.
    ///
    /// On an outer change the old inner is disconnected strictly before the
    /// new inner attaches, then a synthetic transition event compares the old
    /// inner's last value against the new inner's current value *using the
    /// new inner's equality function*. Mixing equality semantics across
    /// inners is the caller's responsibility; all inners should share one.
    pub fn switch(&self) -> Value<T> {
        let outer = self.clone();
        // The flattened value's own eq comes from the inner present at
        // construction time.
        let eq = outer.current().eq_fn();
        let current_outer = outer.clone();
        let current: Rc<dyn Fn() -> T> = Rc::new(move || current_outer.current().current());
        Value::derive_rc(
            eq,
            move |sink: ValueSink<T>| {
                let inner_state: Rc<RefCell<Option<(Value<T>, Unsubscribe)>>> =
                    Rc::new(RefCell::new(None));

                let attach = {
                    let sink = sink.clone();
                    move |inner: &Value<T>| -> Result<Unsubscribe, DispatchError> {
                        let forward_sink = sink.clone();
                        let forward: Listener<T> = Rc::new(move |value, old| {
                            // The inner already applied its own eq before
                            // dispatching, so forward without re-checking.
                            match old {
                                Some(old) => forward_sink.force(value.clone(), old.clone()),
                                None => forward_sink.send(value.clone()),
                            }
                            .map_err(anyhow::Error::from)?;
                            Ok(Control::Keep)
                        });
                        inner.on_emit_raw(forward)
                    }
                };

                let first_inner = outer.current();
                match attach(&first_inner) {
                    Ok(remover) => {
                        *inner_state.borrow_mut() = Some((first_inner, remover));
                    }
                    Err(error) => sink.defer_error(error),
                }

                let state = inner_state.clone();
                let transition_sink = sink.clone();
                let outer_listener: Listener<Value<T>> = Rc::new(move |new_inner, _| {
                    let previous = state.borrow_mut().take();
                    let old_value = match previous {
                        Some((old_inner, old_remover)) => {
                            // Read the departing inner's value while its
                            // cache is still alive, then release it before
                            // touching the new inner.
                            let old_value = old_inner.current();
                            old_remover();
                            old_value
                        }
                        None => new_inner.current(),
                    };
                    let new_value = new_inner.current();
                    let remover = attach(new_inner).map_err(anyhow::Error::from)?;
                    *state.borrow_mut() = Some((new_inner.clone(), remover));
                    if !(new_inner.eq_fn())(&old_value, &new_value) {
                        transition_sink
                            .force(new_value, old_value)
                            .map_err(anyhow::Error::from)?;
                    }
                    Ok(Control::Keep)
                });
                let outer_remover = match outer.on_emit_raw(outer_listener) {
                    Ok(remover) => remover,
                    Err(error) => {
                        sink.defer_error(error);
                        noop_unsubscribe()
                    }
                };

                Box::new(move || {
                    if let Some((_, remover)) = inner_state.borrow_mut().take() {
                        remover();
                    }
                    outer_remover();
                })
            },
            current,
        )
    }
}

impl Value<bool> {
    /// Logical AND over every input. Every input is read on every change;
    /// the combination is a plain fold with no lazy short-circuit.
    pub fn and(values: Vec<Value<bool>>) -> Value<bool> {
        Value::join(values).map(|v| v.iter().all(|b| *b), |a, b| a == b)
    }

    /// Logical OR over every input, same evaluation rules as [`Value::and`].
    pub fn or(values: Vec<Value<bool>>) -> Value<bool> {
        Value::join(values).map(|v| v.iter().any(|b| *b), |a, b| a == b)
    }
}

// =============================================================================
// Tests
// =============================================================================
