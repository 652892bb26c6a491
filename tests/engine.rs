//! Cross-primitive integration scenarios: the contracts collaborators
//! (element validation, texture loading, animation) actually lean on.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::anyhow;
use ember_reactive::{
    Control, DispatchError, Mutable, ReadableSource, Source, Stream, Subject, Value,
};

#[test]
fn mutable_scenario_dedup_and_old_values() {
    // update(5) -> (5, 0); update(5) -> nothing; update(7) -> (7, 5).
    let count = Mutable::local_data(0);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in = seen.clone();
    let _keep = count.on_change(move |v, old| seen_in.borrow_mut().push((*v, old.copied())));

    count.update(5).unwrap();
    count.update(5).unwrap();
    count.update(7).unwrap();
    assert_eq!(*seen.borrow(), vec![(5, Some(0)), (7, Some(5))]);
}

#[test]
fn derived_chain_wakes_and_sleeps_as_one() {
    // A two-stage derivation holds its whole upstream chain alive exactly
    // while the far end is listened.
    let connects = Rc::new(Cell::new(0));
    let disconnects = Rc::new(Cell::new(0));
    let connects_in = connects.clone();
    let disconnects_in = disconnects.clone();
    let base = Value::derive(
        |a: &i32, b: &i32| a == b,
        move |_sink| {
            connects_in.set(connects_in.get() + 1);
            let disconnects = disconnects_in.clone();
            Box::new(move || disconnects.set(disconnects.get() + 1))
        },
        || 1,
    );
    let doubled_text = base
        .map(|v| v * 2, |a, b| a == b)
        .map_data(|v| format!("{v}"));

    assert_eq!(connects.get(), 0, "nothing connects until someone listens");
    assert_eq!(doubled_text.current(), "2", "dormant reads pull through the chain");
    assert_eq!(connects.get(), 0, "reading current is not a subscription");

    let remover = doubled_text.on_emit(|_| {});
    assert_eq!(connects.get(), 1);
    remover();
    assert_eq!(disconnects.get(), 1, "teardown reaches the base of the chain");
}

#[test]
fn listener_removing_another_mid_pass_is_safe() {
    let count = Mutable::local_data(0);
    let second_calls = Rc::new(Cell::new(0));
    let third_calls = Rc::new(Cell::new(0));

    // The first listener removes the second; the second was in the snapshot
    // for the ongoing pass, so it runs once and never again.
    let second_remover: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(None));
    let second_remover_in = second_remover.clone();
    let _first = count.on_emit(move |_| {
        if let Some(remove) = second_remover_in.borrow_mut().take() {
            remove();
        }
    });
    let second_calls_in = second_calls.clone();
    *second_remover.borrow_mut() = Some(count.on_emit(move |_| {
        second_calls_in.set(second_calls_in.get() + 1);
    }));
    let third_calls_in = third_calls.clone();
    let _third = count.on_emit(move |_| third_calls_in.set(third_calls_in.get() + 1));

    count.update(1).unwrap();
    assert_eq!(second_calls.get(), 1, "snapshot protects the ongoing pass");
    assert_eq!(third_calls.get(), 1, "later listeners are not skipped");

    count.update(2).unwrap();
    assert_eq!(second_calls.get(), 1, "removed listener stays removed");
    assert_eq!(third_calls.get(), 2);
}

#[test]
fn error_aggregation_reaches_the_update_caller() {
    let count = Mutable::local_data(0);
    let middle_ran = Rc::new(Cell::new(false));
    let middle_ran_in = middle_ran.clone();

    let _a = count
        .on_emit_raw(Rc::new(|_, _| Err(anyhow!("validator rejected"))))
        .unwrap();
    let _b = count
        .on_emit_raw(Rc::new(move |_, _| {
            middle_ran_in.set(true);
            Ok(Control::Keep)
        }))
        .unwrap();
    let _c = count
        .on_emit_raw(Rc::new(|_, _| Err(anyhow!("renderer choked"))))
        .unwrap();

    let error = count.update(1).unwrap_err();
    assert!(middle_ran.get());
    match error {
        DispatchError::Aggregate(errors) => {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            assert_eq!(messages, vec!["validator rejected", "renderer choked"]);
        }
        DispatchError::Listener(_) => panic!("two failures must aggregate"),
    }
}

#[test]
fn subject_join_ordering() {
    // a emits 1, b emits "x", a emits 2: observer sees [1,"x"] then [2,"x"].
    let a_sink = Rc::new(RefCell::new(None));
    let b_sink = Rc::new(RefCell::new(None));
    let a_sink_in = a_sink.clone();
    let b_sink_in = b_sink.clone();
    let a: Subject<i64> = Subject::derive(move |sink| {
        *a_sink_in.borrow_mut() = Some(sink);
        Box::new(|| {})
    });
    let b: Subject<i64> = Subject::derive(move |sink| {
        *b_sink_in.borrow_mut() = Some(sink);
        Box::new(|| {})
    });

    let joined = Subject::join(vec![a, b]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in = seen.clone();
    let _keep = joined.on_value(move |v: &Vec<i64>| seen_in.borrow_mut().push(v.clone()));

    a_sink.borrow().as_ref().unwrap().send(1).unwrap();
    assert!(seen.borrow().is_empty(), "not ready before every input emitted");
    b_sink.borrow().as_ref().unwrap().send(10).unwrap();
    a_sink.borrow().as_ref().unwrap().send(2).unwrap();
    assert_eq!(*seen.borrow(), vec![vec![1, 10], vec![2, 10]]);
}

#[test]
fn stream_without_listeners_never_connects() {
    let connects = Rc::new(Cell::new(0));
    let connects_in = connects.clone();
    let stream: Stream<i32> = Stream::derive(move |_emitter| {
        connects_in.set(connects_in.get() + 1);
        Box::new(|| {})
    });
    // Pass-through derivations alone must not connect either.
    let _mapped = stream.filter(|v| *v > 0);
    assert_eq!(connects.get(), 0);
}

#[test]
fn switch_disconnect_strictly_precedes_connect() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let tracked = |name: &'static str, order: &Rc<RefCell<Vec<String>>>| {
        let order = order.clone();
        Value::derive(
            |a: &i32, b: &i32| a == b,
            move |_sink| {
                order.borrow_mut().push(format!("connect {name}"));
                let order = order.clone();
                Box::new(move || order.borrow_mut().push(format!("disconnect {name}")))
            },
            || 0,
        )
    };
    let v1 = tracked("v1", &order);
    let v2 = tracked("v2", &order);

    let outer = Mutable::local(v1, Value::same);
    let switched = outer.value().switch();
    let _keep = switched.on_emit(|_| {});
    assert_eq!(*order.borrow(), vec!["connect v1"]);

    outer.update(v2).unwrap();
    assert_eq!(
        *order.borrow(),
        vec!["connect v1", "disconnect v1", "connect v2"],
        "the old inner is released before the new inner attaches"
    );
}

#[test]
fn validation_pipeline_end_to_end() {
    // The shape UI element validation takes: several boolean values reduced
    // with `and`, driving a one-shot wait for validity.
    let name_ok = Mutable::local_data(false);
    let email_ok = Mutable::local_data(false);
    let form_valid = Value::and(vec![name_ok.value(), email_ok.value()]);

    let mut submitted = form_valid.to_future(|valid| *valid);
    assert_eq!(submitted.try_recv().unwrap(), None);

    name_ok.update(true).unwrap();
    assert_eq!(submitted.try_recv().unwrap(), None, "one field is not enough");

    email_ok.update(true).unwrap();
    assert_eq!(submitted.try_recv().unwrap(), Some(true));
}

#[test]
fn fold_counts_stream_events_while_listened() {
    let emitter_out = Rc::new(RefCell::new(None));
    let emitter_in = emitter_out.clone();
    let clicks: Stream<()> = Stream::derive(move |emitter| {
        *emitter_in.borrow_mut() = Some(emitter);
        Box::new(|| {})
    });
    let click_count = clicks.fold(0u32, |acc, _| acc + 1, |a, b| a == b);

    let _keep = click_count.on_emit(|_| {});
    for _ in 0..3 {
        emitter_out.borrow().as_ref().unwrap().emit(()).unwrap();
    }
    assert_eq!(click_count.current(), 3);
}
