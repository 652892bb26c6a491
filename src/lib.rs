//! # ember-reactive
//!
//! Reactive value-propagation engine: the primitives every other subsystem
//! of a UI or game engine (element validation, texture loading, entity
//! systems, animation) is built on.
//!
//! Entirely synchronous and single-threaded. "Concurrency" here means the
//! ordering and re-entrancy of synchronous callback dispatch: listeners run
//! in registration order against a snapshot, a listener may unsubscribe
//! itself (or others) mid-pass, and errors from one listener never starve
//! the rest.
//!
//! ## Primitives
//!
//! | Primitive | `current`?      | Dedups? | Upstream connection        |
//! |-----------|-----------------|---------|----------------------------|
//! | [`Stream`]  | no            | -       | lives while listened       |
//! | [`Subject`] | while listened| no      | lives while listened       |
//! | [`Value`]   | always        | by `eq` | lives while listened       |
//! | [`Mutable`] | always        | by `eq` | none (or external update)  |
//! | [`Buffer`]  | always        | no      | none (holds its value)     |
//!
//! Derived primitives wake lazily: the `connect` thunk supplied at
//! derivation runs when the listener count goes 0 to 1, and the disconnect
//! thunk it returns runs exactly once when the count falls back to 0.
//!
//! ## Example
//!
//! ```
//! use ember_reactive::{Mutable, ReadableSource, Source, Value};
//!
//! let width = Mutable::local_data(800);
//! let height = Mutable::local_data(600);
//! let area = Value::join(vec![width.value(), height.value()])
//!     .map_data(|wh| wh[0] * wh[1]);
//!
//! assert_eq!(area.current(), 480_000);
//!
//! let _watch = area.on_emit(|area| println!("resized to {area} px"));
//! width.update(1024).unwrap();
//! ```

pub mod buffer;
pub mod listeners;
pub mod mutable;
pub mod source;
pub mod stream;
pub mod subject;
pub mod value;

pub use buffer::{Buffer, BufferView};
pub use listeners::{
    Control, DispatchError, DispatchOutcome, Listener, ListenerId, ListenerResult, Registry,
};
pub use mutable::Mutable;
pub use source::{Disconnect, ReadableSource, Source, Unsubscribe};
pub use stream::{Emitter, Stream};
pub use subject::{Subject, SubjectSink};
pub use value::{Value, ValueSink};
