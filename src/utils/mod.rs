//! Small shared helpers.

pub mod time;

pub use time::{millis_until, now_ms};
