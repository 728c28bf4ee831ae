//! Name arguments, contexts and the call view handed to callbacks.
//!
//! These are the shapes every bus operation is written in terms of: a
//! [`Names`] argument that may hold one name, several space-separated
//! names or a name-to-callback map, a [`Context`] identity used for
//! removal and as the callback receiver, and the [`Call`] a callback is
//! invoked with.

pub mod context;
pub mod names;

pub use context::{Call, Context};
pub use names::{EventMap, Names};

pub(crate) use names::{resolve, Resolve};

/// The meta-event whose callbacks fire on every trigger.
///
/// Callbacks registered under this name receive the triggered name as their
/// first argument.
pub const ALL: &str = "all";
