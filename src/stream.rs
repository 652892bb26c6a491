//! Stream - fire-and-forget events with no current value.
//!
//! A stream derived from an external event source connects lazily: the
//! `connect` thunk runs when the listener count goes 0 to 1 and the
//! [`Disconnect`] it returns runs exactly once when the count falls back to
//! zero. With no listeners the external source is never touched, and a stray
//! [`Emitter::emit`] is a no-op.
//!
//! `filter`/`map` (and [`Source::map`] on any source) are pass-through
//! derivations: they wrap the underlying subscription and carry no listener
//! list or activation state of their own.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::trace;

use crate::listeners::{Control, DispatchError, Listener, Registry};
use crate::source::{noop_unsubscribe, Disconnect, Source, Unsubscribe};

/// How any stream hands out subscriptions: `(want_value, listener)`.
/// Streams have no current value, so `want_value` only matters once the
/// subscription reaches a primitive that does.
pub(crate) type SubscribeFn<T> =
    Rc<dyn Fn(bool, Listener<T>) -> Result<Unsubscribe, DispatchError>>;

/// Push-based event stream.
pub struct Stream<T: 'static> {
    subscribe: SubscribeFn<T>,
}

impl<T: 'static> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream {
            subscribe: self.subscribe.clone(),
        }
    }
}

impl<T: 'static> Source<T> for Stream<T> {
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        (self.subscribe)(false, listener)
    }

    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError> {
        (self.subscribe)(true, listener)
    }
}

// =============================================================================
// Derived stream core
// =============================================================================

struct StreamCore<T: 'static> {
    registry: Registry<T>,
    connect: Box<dyn Fn(Emitter<T>) -> Disconnect>,
    disconnect: RefCell<Option<Disconnect>>,
    /// Errors raised by listeners while the connect thunk was running; the
    /// subscribe call that triggered the wake surfaces them.
    pending: RefCell<Vec<anyhow::Error>>,
}

fn wake<T>(core: &Rc<StreamCore<T>>) -> Result<(), DispatchError> {
    trace!("stream<{}> wake", std::any::type_name::<T>());
    let emitter = Emitter {
        core: Rc::downgrade(core),
    };
    let disconnect = (core.connect)(emitter);
    *core.disconnect.borrow_mut() = Some(disconnect);
    // A listener may have unsubscribed itself mid-connect.
    if core.registry.is_empty() {
        sleep(core);
    }
    match DispatchError::from_errors(core.pending.borrow_mut().drain(..).collect()) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn sleep<T>(core: &StreamCore<T>) {
    // Option::take keeps the thunk from running twice even when teardown is
    // reached from several code paths re-entrantly.
    let disconnect = core.disconnect.borrow_mut().take();
    if let Some(disconnect) = disconnect {
        trace!("stream<{}> dormant", std::any::type_name::<T>());
        disconnect();
    }
}

fn subscribe_core<T>(
    core: &Rc<StreamCore<T>>,
    listener: Listener<T>,
) -> Result<Unsubscribe, DispatchError> {
    let id = core.registry.add(listener);
    if core.registry.len() == 1 {
        if let Err(error) = wake(core) {
            // Treat a failed wake as a failed subscribe: nothing stays
            // registered and the caller sees the listener errors.
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

/// Push handle given to a derived stream's `connect` thunk. Holds the core
/// weakly: emitting after the stream is gone is a no-op.
pub struct Emitter<T: 'static> {
    core: Weak<StreamCore<T>>,
}

impl<T: 'static> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> Emitter<T> {
    /// Forward one event to every listener.
    pub fn emit(&self, value: T) -> Result<(), DispatchError> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        if core.registry.is_empty() {
            return Ok(());
        }
        let outcome = core.registry.dispatch(&value, None);
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

impl<T: 'static> Stream<T> {
    /// Wrap an external event source.
    ///
    /// `connect` runs on every 0-to-1 listener transition and must return the
    /// thunk that undoes it; that thunk runs exactly once per 1-to-0
    /// transition. The collaborator pushes events through the [`Emitter`].
    pub fn derive(connect: impl Fn(Emitter<T>) -> Disconnect + 'static) -> Self {
        let core = Rc::new(StreamCore {
            registry: Registry::new(),
            connect: Box::new(connect),
            disconnect: RefCell::new(None),
            pending: RefCell::new(Vec::new()),
        });
        Stream {
            subscribe: Rc::new(move |_want_value, listener| subscribe_core(&core, listener)),
        }
    }

    /// Pass-through stream built directly from a subscribe function.
    pub(crate) fn from_subscribe(subscribe: SubscribeFn<T>) -> Self {
        Stream { subscribe }
    }

    /// Keep only events satisfying `pred`. Pass-through derivation.
    pub fn filter(&self, pred: impl Fn(&T) -> bool + 'static) -> Stream<T> {
        let source = self.clone();
        let pred = Rc::new(pred);
        Stream::from_subscribe(Rc::new(move |want_value, listener: Listener<T>| {
            let pred = pred.clone();
            let wrapped: Listener<T> = Rc::new(move |value, old| {
                if pred(value) {
                    listener(value, old)
                } else {
                    Ok(Control::Keep)
                }
            });
            (source.subscribe)(want_value, wrapped)
        }))
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// One stream forwarding every input's events in arrival order.
    ///
    /// Connecting subscribes to every input; disconnecting unsubscribes from
    /// all of them. No ordering holds across inputs beyond arrival order.
    pub fn merge(streams: Vec<Stream<T>>) -> Stream<T> {
        Stream::derive(move |emitter| {
            let removers: Vec<Unsubscribe> = streams
                .iter()
                .map(|stream| {
                    let forward = emitter.clone();
                    let listener: Listener<T> = Rc::new(move |value, _| {
                        forward.emit(value.clone()).map_err(anyhow::Error::from)?;
                        Ok(Control::Keep)
                    });
                    match stream.on_emit_raw(listener) {
                        Ok(remover) => remover,
                        Err(error) => {
                            emitter.defer_error(error);
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
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// A stream plus outside handles to its emitter and wake/sleep counters.
    struct Probe {
        stream: Stream<i32>,
        emitter: Rc<RefCell<Option<Emitter<i32>>>>,
        connects: Rc<Cell<usize>>,
        disconnects: Rc<Cell<usize>>,
    }

    fn probe() -> Probe {
        let emitter = Rc::new(RefCell::new(None));
        let connects = Rc::new(Cell::new(0));
        let disconnects = Rc::new(Cell::new(0));
        let emitter_in = emitter.clone();
        let connects_in = connects.clone();
        let disconnects_in = disconnects.clone();
        let stream = Stream::derive(move |e| {
            connects_in.set(connects_in.get() + 1);
            *emitter_in.borrow_mut() = Some(e);
            let disconnects = disconnects_in.clone();
            Box::new(move || disconnects.set(disconnects.get() + 1))
        });
        Probe {
            stream,
            emitter,
            connects,
            disconnects,
        }
    }

    fn emit(probe: &Probe, value: i32) {
        let emitter = probe.emitter.borrow().clone();
        if let Some(emitter) = emitter {
            emitter.emit(value).unwrap();
        }
    }

    #[test]
    fn test_connect_never_runs_without_listeners() {
        let probe = probe();
        assert_eq!(probe.connects.get(), 0, "no listener, no connect");
        assert!(probe.emitter.borrow().is_none());
    }

    #[test]
    fn test_connect_once_per_zero_to_one_transition() {
        let probe = probe();
        let a = probe.stream.on_emit(|_| {});
        let b = probe.stream.on_emit(|_| {});
        assert_eq!(probe.connects.get(), 1, "second listener reuses the link");

        a();
        assert_eq!(probe.disconnects.get(), 0, "one listener still holds it");
        b();
        assert_eq!(probe.disconnects.get(), 1, "last listener tears it down");

        let c = probe.stream.on_emit(|_| {});
        assert_eq!(probe.connects.get(), 2, "a fresh listener reconnects");
        c();
        assert_eq!(probe.disconnects.get(), 2);
    }

    #[test]
    fn test_emit_reaches_listeners_in_order() {
        let probe = probe();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();
        let _a = probe.stream.on_emit(move |v| first.borrow_mut().push(("a", *v)));
        let _b = probe.stream.on_emit(move |v| second.borrow_mut().push(("b", *v)));

        emit(&probe, 1);
        assert_eq!(*seen.borrow(), vec![("a", 1), ("b", 1)]);
    }

    #[test]
    fn test_emit_after_teardown_is_noop() {
        let probe = probe();
        let remover = probe.stream.on_emit(|_| {});
        remover();
        // The emitter survives in the test probe; the stream ignores it.
        emit(&probe, 9);
        assert_eq!(probe.disconnects.get(), 1);
    }

    #[test]
    fn test_listener_unsubscribing_itself_tears_down() {
        let probe = probe();
        let calls = Rc::new(Cell::new(0));
        let calls_in = calls.clone();
        let result = probe.stream.on_emit_raw(Rc::new(move |_, _| {
            calls_in.set(calls_in.get() + 1);
            Ok(Control::Unsubscribe)
        }));
        result.unwrap();

        emit(&probe, 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(
            probe.disconnects.get(),
            1,
            "sentinel removal of the last listener disconnects"
        );

        emit(&probe, 2);
        assert_eq!(calls.get(), 1, "no delivery after self-removal");
    }

    #[test]
    fn test_filter_and_map_pass_through() {
        let probe = probe();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let doubled_evens = probe.stream.filter(|v| v % 2 == 0).map(|v| v * 2);
        let remover = doubled_evens.on_emit(move |v| seen_in.borrow_mut().push(*v));

        assert_eq!(
            probe.connects.get(),
            1,
            "pass-through derivations share the base connection"
        );

        emit(&probe, 1);
        emit(&probe, 2);
        emit(&probe, 3);
        emit(&probe, 4);
        assert_eq!(*seen.borrow(), vec![4, 8]);

        remover();
        assert_eq!(
            probe.disconnects.get(),
            1,
            "removing the derived listener releases the base stream"
        );
    }

    #[test]
    fn test_merge_forwards_all_inputs_in_arrival_order() {
        let left = probe();
        let right = probe();
        let merged = Stream::merge(vec![left.stream.clone(), right.stream.clone()]);

        assert_eq!(left.connects.get(), 0, "merge is lazy until listened");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let remover = merged.on_emit(move |v| seen_in.borrow_mut().push(*v));
        assert_eq!(left.connects.get(), 1);
        assert_eq!(right.connects.get(), 1);

        emit(&left, 1);
        emit(&right, 10);
        emit(&left, 2);
        assert_eq!(*seen.borrow(), vec![1, 10, 2]);

        remover();
        assert_eq!(left.disconnects.get(), 1, "merge releases every input");
        assert_eq!(right.disconnects.get(), 1);
    }
}
