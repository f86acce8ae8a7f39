//! Runtime glue for the probe
//!
//! The probe core is executor-agnostic: concurrency comes from `futures`
//! combinators and the only runtime service it needs is a timer. This module
//! provides that timer for browsers (wasm32) and native targets.

mod sleep;

pub use sleep::{ImmediateSleeper, RuntimeSleeper, SleepFuture, SleepProvider};
