//! Subject - a stream that materializes a current value while listened.
//!
//! The first [`SubjectSink::send`] after a wake establishes "occupied" state
//! and caches the value as the latest. A want-value subscriber arriving after
//! occupancy receives that cached value synchronously; one arriving before
//! occupancy only sees future emissions. When the last listener leaves, the
//! disconnect thunk runs, occupancy resets and the cached value is dropped so
//! a large stale object is never kept alive between wakes.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::trace;

use crate::listeners::{Control, DispatchError, Listener, Registry};
use crate::source::{noop_unsubscribe, Disconnect, Source, Unsubscribe};

struct SubjectCore<T: Clone + 'static> {
    registry: Registry<T>,
    connect: Box<dyn Fn(SubjectSink<T>) -> Disconnect>,
    disconnect: RefCell<Option<Disconnect>>,
    /// `Some` iff the subject is occupied. Always `None` while dormant.
    latest: RefCell<Option<T>>,
    /// Errors raised by listeners while the connect thunk was running.
    pending: RefCell<Vec<anyhow::Error>>,
}

/// Lazily-activated source with a listened-only current value.
pub struct Subject<T: Clone + 'static> {
    core: Rc<SubjectCore<T>>,
}

impl<T: Clone + 'static> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Subject {
            core: self.core.clone(),
        }
    }
}

/// Push handle given to a subject's `connect` thunk.
pub struct SubjectSink<T: Clone + 'static> {
    core: Weak<SubjectCore<T>>,
}

impl<T: Clone + 'static> Clone for SubjectSink<T> {
    fn clone(&self) -> Self {
        SubjectSink {
            core: self.core.clone(),
        }
    }
}

impl<T: Clone + 'static> SubjectSink<T> {
    /// Cache `value` as the latest (establishing occupancy on the first call
    /// after a wake) and dispatch it to every listener.
    pub fn send(&self, value: T) -> Result<(), DispatchError> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        // A send after the last listener left must not occupy the subject.
        if core.registry.is_empty() {
            return Ok(());
        }
        let old = core.latest.borrow_mut().replace(value.clone());
        let outcome = core.registry.dispatch(&value, old.as_ref());
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

fn wake<T: Clone>(core: &Rc<SubjectCore<T>>) -> Result<(), DispatchError> {
    trace!("subject<{}> wake", std::any::type_name::<T>());
    let sink = SubjectSink {
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

fn sleep<T: Clone>(core: &SubjectCore<T>) {
    let disconnect = core.disconnect.borrow_mut().take();
    if let Some(disconnect) = disconnect {
        trace!("subject<{}> dormant", std::any::type_name::<T>());
        // Reset occupancy and release the cached value before the thunk runs.
        core.latest.borrow_mut().take();
        disconnect();
    }
}

fn subscribe_core<T: Clone>(
    core: &Rc<SubjectCore<T>>,
    want_value: bool,
    listener: Listener<T>,
) -> Result<Unsubscribe, DispatchError> {
    if want_value {
        // Occupied implies awake, so this cannot race a wake below: the
        // cached delivery happens exactly when no connect-time send will.
        let cached = core.latest.borrow().clone();
        if let Some(value) = cached {
            match listener(&value, None) {
                Ok(Control::Keep) => {}
                Ok(Control::Unsubscribe) => return Ok(noop_unsubscribe()),
                Err(error) => return Err(DispatchError::Listener(error)),
            }
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

impl<T: Clone + 'static> Source<T> for Subject<T> {
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        subscribe_core(&self.core, false, listener)
    }

    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        subscribe_core(&self.core, true, listener)
    }
}

impl<T: Clone + 'static> Subject<T> {
    /// Wrap an external source. `connect` runs per 0-to-1 listener
    /// transition; values pushed through the [`SubjectSink`] occupy the
    /// subject and reach listeners.
    pub fn derive(connect: impl Fn(SubjectSink<T>) -> Disconnect + 'static) -> Self {
        Subject {
            core: Rc::new(SubjectCore {
                registry: Registry::new(),
                connect: Box::new(connect),
                disconnect: RefCell::new(None),
                latest: RefCell::new(None),
                pending: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Emit the combined values of every input, starting once all of them
    /// have emitted at least once. After that, any single input emission
    /// re-emits the full vector with that slot updated.
    pub fn join(subjects: Vec<Subject<T>>) -> Subject<Vec<T>> {
        Subject::derive(move |sink| {
            let slots: Rc<RefCell<Vec<Option<T>>>> =
                Rc::new(RefCell::new(vec![None; subjects.len()]));
            let removers: Vec<Unsubscribe> = subjects
                .iter()
                .enumerate()
                .map(|(index, subject)| {
                    let slots = slots.clone();
                    let slot_sink = sink.clone();
                    let listener: Listener<T> = Rc::new(move |value, _| {
                        slots.borrow_mut()[index] = Some(value.clone());
                        let combined: Option<Vec<T>> =
                            slots.borrow().iter().cloned().collect();
                        if let Some(values) = combined {
                            slot_sink.send(values).map_err(anyhow::Error::from)?;
                        }
                        Ok(Control::Keep)
                    });
                    match subject.on_value_raw(listener) {
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
        })
    }

    /// Follow the subject produced by `f` for the current outer value,
    /// re-targeting on every outer emission. The previous inner subscription
    /// is dropped strictly before the new inner subscribe; the outer
    /// subscription itself wants the current value, so the initial inner
    /// subject is established immediately.
    pub fn switch_map<U: Clone + 'static>(
        &self,
        f: impl Fn(&T) -> Subject<U> + 'static,
    ) -> Subject<U> {
        let outer = self.clone();
        let f = Rc::new(f);
        Subject::derive(move |sink: SubjectSink<U>| {
            let inner_remover: Rc<RefCell<Option<Unsubscribe>>> = Rc::new(RefCell::new(None));
            let f = f.clone();
            let inner_slot = inner_remover.clone();
            let outer_sink = sink.clone();
            let listener: Listener<T> = Rc::new(move |value, _| {
                if let Some(remover) = inner_slot.borrow_mut().take() {
                    remover();
                }
                let inner = f(value);
                let forward_sink = outer_sink.clone();
                let forward: Listener<U> = Rc::new(move |inner_value, _| {
                    forward_sink
                        .send(inner_value.clone())
                        .map_err(anyhow::Error::from)?;
                    Ok(Control::Keep)
                });
                let remover = inner.on_value_raw(forward).map_err(anyhow::Error::from)?;
                *inner_slot.borrow_mut() = Some(remover);
                Ok(Control::Keep)
            });
            let outer_remover = match outer.on_value_raw(listener) {
                Ok(remover) => remover,
                Err(error) => {
                    sink.defer_error(error);
                    noop_unsubscribe()
                }
            };
            let inner_remover = inner_remover.clone();
            Box::new(move || {
                if let Some(remover) = inner_remover.borrow_mut().take() {
                    remover();
                }
                outer_remover();
            })
        })
    }

    /// Map with explicit wake/dormant hooks on the derived subject - useful
    /// for tracing exactly when a derivation holds its upstream alive.
    pub fn map_trace<U: Clone + 'static>(
        &self,
        f: impl Fn(&T) -> U + 'static,
        on_wake: impl Fn() + 'static,
        on_sleep: impl Fn() + 'static,
    ) -> Subject<U> {
        let source = self.clone();
        let f = Rc::new(f);
        let on_wake = Rc::new(on_wake);
        let on_sleep = Rc::new(on_sleep);
        Subject::derive(move |sink: SubjectSink<U>| {
            on_wake();
            let f = f.clone();
            let forward_sink = sink.clone();
            let listener: Listener<T> = Rc::new(move |value, _| {
                forward_sink.send(f(value)).map_err(anyhow::Error::from)?;
                Ok(Control::Keep)
            });
            let remover = match source.on_value_raw(listener) {
                Ok(remover) => remover,
                Err(error) => {
                    sink.defer_error(error);
                    noop_unsubscribe()
                }
            };
            let on_sleep = on_sleep.clone();
            Box::new(move || {
                remover();
                on_sleep();
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
