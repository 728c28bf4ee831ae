//! Callbacks, their outcomes, and count-limited wrappers.
//!
//! A [`Callback`] is the unit that gets registered under an event name. It
//! carries an identity so it can be removed later, and returns an
//! [`Outcome`] that sync and async triggers collect.

pub(crate) mod countdown;
pub mod handler;

pub use handler::{Callback, HandlerFn, Outcome, Pending};

pub(crate) use countdown::{check_count, wrap_before, AfterHook};
