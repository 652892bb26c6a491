//! Source and ReadableSource - the capability traits every primitive speaks.
//!
//! [`Source`] is the subscribe-side contract: future-only registration
//! (`on_emit_raw`) versus current-and-future registration (`on_value_raw`),
//! plus every helper expressed purely in terms of those two. [`ReadableSource`]
//! adds a synchronous, always-answerable `current()`.
//!
//! # Subscription contract
//!
//! Both raw methods return the remover for the new registration. They are
//! fallible because subscribing can synchronously run application code: the
//! current-value delivery of `on_value_raw`, or a `connect` thunk sending
//! values while a derived primitive wakes. When that code errors, nothing
//! stays registered and the error surfaces from the subscribe call itself.
//! A synchronous [`Control::Unsubscribe`] return registers nothing and yields
//! a no-op remover - this is what lets `once`/`when_once` answer from the
//! current value without ever creating a live subscription.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::oneshot;

use crate::listeners::{Control, DispatchError, Listener};
use crate::stream::Stream;
use crate::subject::{Subject, SubjectSink};
use crate::value::{Value, ValueSink};

/// Cancels one subscription. Idempotent by construction (`FnOnce`).
pub type Unsubscribe = Box<dyn FnOnce()>;

/// Tears down one upstream connection. Invoked exactly once, when the owning
/// primitive's listener count returns to zero.
pub type Disconnect = Box<dyn FnOnce()>;

/// Remover for subscriptions that were never created.
pub(crate) fn noop_unsubscribe() -> Unsubscribe {
    Box::new(|| {})
}

/// Unwrap a subscribe result whose listener is known not to error.
///
/// The only error source in a subscribe call is the listener being
/// registered (it is the sole listener a 0-to-1 wake can reach), so wrapping
/// an infallible closure makes the `Err` arm unreachable.
pub(crate) fn infallible(result: Result<Unsubscribe, DispatchError>) -> Unsubscribe {
    match result {
        Ok(remover) => remover,
        Err(_) => unreachable!("infallible listener reported an error"),
    }
}

// =============================================================================
// Source
// =============================================================================

/// An object from which values can be obtained by subscribing.
pub trait Source<T: 'static> {
    /// Register for future values only.
    fn on_emit_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError>;

    /// Register for the current value - delivered synchronously when one is
    /// known - and every future value.
    fn on_value_raw(&self, listener: Listener<T>) -> Result<Unsubscribe, DispatchError>;

    /// Future values, infallible listener.
    fn on_emit(&self, f: impl Fn(&T) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        infallible(self.on_emit_raw(Rc::new(move |value, _| {
            f(value);
            Ok(Control::Keep)
        })))
    }

    /// Current value (when known) plus future values, infallible listener.
    fn on_value(&self, f: impl Fn(&T) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        infallible(self.on_value_raw(Rc::new(move |value, _| {
            f(value);
            Ok(Control::Keep)
        })))
    }

    /// Future values with their predecessors, infallible listener.
    fn on_change(&self, f: impl Fn(&T, Option<&T>) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        infallible(self.on_emit_raw(Rc::new(move |value, old| {
            f(value, old);
            Ok(Control::Keep)
        })))
    }

    /// Deliver the current-or-first value once, then unsubscribe.
    fn once(&self, f: impl FnOnce(&T) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        let slot = Cell::new(Some(f));
        infallible(self.on_value_raw(Rc::new(move |value, _| {
            if let Some(f) = slot.take() {
                f(value);
            }
            Ok(Control::Unsubscribe)
        })))
    }

    /// Deliver the first *future* value once, then unsubscribe.
    fn next(&self, f: impl FnOnce(&T) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        let slot = Cell::new(Some(f));
        infallible(self.on_emit_raw(Rc::new(move |value, _| {
            if let Some(f) = slot.take() {
                f(value);
            }
            Ok(Control::Unsubscribe)
        })))
    }

    /// Deliver every value (current included) satisfying `pred`.
    fn when(&self, pred: impl Fn(&T) -> bool + 'static, f: impl Fn(&T) + 'static) -> Unsubscribe
    where
        Self: Sized,
    {
        infallible(self.on_value_raw(Rc::new(move |value, _| {
            if pred(value) {
                f(value);
            }
            Ok(Control::Keep)
        })))
    }

    /// Deliver the first value (current included) satisfying `pred`, then
    /// unsubscribe. A satisfying current value never creates a subscription.
    fn when_once(
        &self,
        pred: impl Fn(&T) -> bool + 'static,
        f: impl FnOnce(&T) + 'static,
    ) -> Unsubscribe
    where
        Self: Sized,
    {
        let slot = Cell::new(Some(f));
        infallible(self.on_value_raw(Rc::new(move |value, _| {
            if !pred(value) {
                return Ok(Control::Keep);
            }
            if let Some(f) = slot.take() {
                f(value);
            }
            Ok(Control::Unsubscribe)
        })))
    }

    /// Eager transform of delivered values. Pass-through derivation: the
    /// produced stream has no listener list or activation state of its own.
    fn map<U: 'static>(&self, f: impl Fn(&T) -> U + 'static) -> Stream<U>
    where
        Self: Clone + Sized + 'static,
    {
        let source = self.clone();
        let f = Rc::new(f);
        Stream::from_subscribe(Rc::new(move |want_value, listener: Listener<U>| {
            let f = f.clone();
            let wrapped: Listener<T> = Rc::new(move |value, _| listener(&f(value), None));
            if want_value {
                source.on_value_raw(wrapped)
            } else {
                source.on_emit_raw(wrapped)
            }
        }))
    }

    /// Stateful accumulation into a [`Value`].
    ///
    /// The accumulator only lives while the produced Value has listeners:
    /// while dormant `current()` answers `start`, and waking again restarts
    /// the accumulation from `start`.
    fn fold<A: Clone + 'static>(
        &self,
        start: A,
        f: impl Fn(&A, &T) -> A + 'static,
        eq: impl Fn(&A, &A) -> bool + 'static,
    ) -> Value<A>
    where
        Self: Clone + Sized + 'static,
    {
        let source = self.clone();
        let f = Rc::new(f);
        let start_for_connect = start.clone();
        Value::derive(
            eq,
            move |sink: ValueSink<A>| {
                let acc = Rc::new(RefCell::new(start_for_connect.clone()));
                let f = f.clone();
                let send_sink = sink.clone();
                let listener: Listener<T> = Rc::new(move |value, _| {
                    let next = f(&acc.borrow(), value);
                    *acc.borrow_mut() = next.clone();
                    send_sink.send(next).map_err(anyhow::Error::from)?;
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
            move || start.clone(),
        )
    }
}

// =============================================================================
// ReadableSource
// =============================================================================

/// A [`Source`] whose current value can always be read synchronously.
pub trait ReadableSource<T: Clone + 'static>: Source<T> {
    /// The value right now. Never requires a live subscription.
    fn current(&self) -> T;

    /// A [`Subject`] mirroring this source: the first listener materializes
    /// `current`, after which emissions are followed.
    fn to_subject(&self) -> Subject<T>
    where
        Self: Clone + Sized + 'static,
    {
        let source = self.clone();
        Subject::derive(move |sink: SubjectSink<T>| {
            if let Err(error) = sink.send(source.current()) {
                sink.defer_error(error);
            }
            let forward_sink = sink.clone();
            let forward: Listener<T> = Rc::new(move |value, _| {
                forward_sink
                    .send(value.clone())
                    .map_err(anyhow::Error::from)?;
                Ok(Control::Keep)
            });
            match source.on_emit_raw(forward) {
                Ok(remover) => remover,
                Err(error) => {
                    sink.defer_error(error);
                    noop_unsubscribe()
                }
            }
        })
    }

    /// One-shot completion with the first value satisfying `pred`.
    ///
    /// The current value is checked synchronously *before* subscribing, so an
    /// already-satisfied state resolves without a subscription ever existing.
    /// If the subscription cannot be established the receiver is cancelled.
    fn to_future(&self, pred: impl Fn(&T) -> bool + 'static) -> oneshot::Receiver<T>
    where
        Self: Sized,
    {
        let (tx, rx) = oneshot::channel();
        let now = self.current();
        if pred(&now) {
            let _ = tx.send(now);
            return rx;
        }
        let tx = Cell::new(Some(tx));
        let result = self.on_emit_raw(Rc::new(move |value, _| {
            if !pred(value) {
                return Ok(Control::Keep);
            }
            if let Some(tx) = tx.take() {
                let _ = tx.send(value.clone());
            }
            Ok(Control::Unsubscribe)
        }));
        // Dropping the remover keeps the registration alive; it retires
        // itself via the sentinel on first match. A failed subscribe drops
        // the sender, cancelling the receiver.
        drop(result);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutable::Mutable;

    #[test]
    fn test_once_delivers_current_synchronously() {
        let count = Mutable::local_data(3);
        let seen = Rc::new(Cell::new(None));
        let seen_in = seen.clone();
        count.once(move |v| seen_in.set(Some(*v)));
        assert_eq!(seen.get(), Some(3), "current value delivered on the spot");

        // The registration retired itself, so later updates are unseen.
        count.update(4).unwrap();
        assert_eq!(seen.get(), Some(3));
    }

    #[test]
    fn test_next_skips_current() {
        let count = Mutable::local_data(3);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        count.next(move |v| seen_in.borrow_mut().push(*v));
        assert!(seen.borrow().is_empty(), "next ignores the current value");

        count.update(4).unwrap();
        count.update(5).unwrap();
        assert_eq!(*seen.borrow(), vec![4], "only the first future value lands");
    }

    #[test]
    fn test_when_filters_and_when_once_retires() {
        let count = Mutable::local_data(0);
        let evens = Rc::new(RefCell::new(Vec::new()));
        let evens_in = evens.clone();
        let _keep = count.when(|v| v % 2 == 0, move |v| evens_in.borrow_mut().push(*v));

        let first_odd = Rc::new(RefCell::new(Vec::new()));
        let first_odd_in = first_odd.clone();
        count.when_once(|v| v % 2 == 1, move |v| first_odd_in.borrow_mut().push(*v));

        count.update(1).unwrap();
        count.update(2).unwrap();
        count.update(3).unwrap();

        assert_eq!(*evens.borrow(), vec![0, 2], "when sees current and matches");
        assert_eq!(*first_odd.borrow(), vec![1], "when_once stops after first");
    }

    #[test]
    fn test_map_transforms_emissions() {
        let count = Mutable::local_data(1);
        let doubled = count.map(|v| v * 2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let _keep = doubled.on_emit(move |v| seen_in.borrow_mut().push(*v));

        count.update(2).unwrap();
        count.update(5).unwrap();
        assert_eq!(*seen.borrow(), vec![4, 10]);
    }

    #[test]
    fn test_fold_accumulates_only_while_listened() {
        let count = Mutable::local_data(0);
        let total = count.fold(0, |acc, v| acc + v, |a, b| a == b);

        assert_eq!(total.current(), 0, "dormant fold answers start");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let remover = total.on_emit(move |v| seen_in.borrow_mut().push(*v));
        count.update(2).unwrap();
        count.update(3).unwrap();
        assert_eq!(*seen.borrow(), vec![2, 5]);
        assert_eq!(total.current(), 5, "live fold answers the accumulator");

        remover();
        assert_eq!(total.current(), 0, "dormant fold forgets the accumulator");

        // Re-waking restarts from start, not from 5.
        let seen_again = Rc::new(RefCell::new(Vec::new()));
        let seen_again_in = seen_again.clone();
        let _keep = total.on_emit(move |v| seen_again_in.borrow_mut().push(*v));
        count.update(4).unwrap();
        assert_eq!(*seen_again.borrow(), vec![4], "accumulation reset to start");
    }

    #[test]
    fn test_to_future_resolves_from_current_without_subscribing() {
        let count = Mutable::local_data(10);
        let mut rx = count.to_future(|v| *v >= 10);
        assert_eq!(rx.try_recv().unwrap(), Some(10));
    }

    #[test]
    fn test_to_future_waits_for_matching_value() {
        let count = Mutable::local_data(0);
        let mut rx = count.to_future(|v| *v >= 3);
        assert_eq!(rx.try_recv().unwrap(), None, "unsatisfied, still pending");

        count.update(1).unwrap();
        assert_eq!(rx.try_recv().unwrap(), None);

        count.update(3).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(3));
    }

    #[test]
    fn test_to_subject_materializes_current() {
        let count = Mutable::local_data(7);
        let subject = count.to_subject();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let _keep = subject.on_value(move |v| seen_in.borrow_mut().push(*v));

        assert_eq!(*seen.borrow(), vec![7], "first listener materializes current");
        count.update(8).unwrap();
        assert_eq!(*seen.borrow(), vec![7, 8], "emissions are followed");
    }
}
