//! The `persistence` module journals failed dispatches.
//!
//! Message bodies are otherwise never stored by the broker; this journal
//! exists so that failures surfaced by `statistics()` can be inspected in
//! full after the fact. It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{DeadLetter, DeadLetterStore};
