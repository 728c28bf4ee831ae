//! # busline
//!
//! An in-process publish/subscribe event bus.
//!
//! ## Features
//!
//! - **Named events**: single names, space-separated names and name-to-callback maps
//! - **Four trigger modes**: fire-and-forget, sync-collect, async-collect and deferred
//! - **Listening ledgers**: one bus listens to another and detaches with a single call
//! - **Guards**: a registration can lock its event name against further registrations
//! - **once/before**: callbacks that remove themselves after a number of calls
//!
//! ## Quick Example
//!
//! ```rust
//! use busline::{Bus, Callback, Names};
//! use serde_json::json;
//!
//! let bus = Bus::new("app");
//! let listener = Bus::new("ui");
//!
//! // Register directly
//! bus.on("saved", Callback::new(|call| json!({ "saved": call.arg(0).cloned() })));
//!
//! // Listen on behalf of another bus
//! listener
//!     .listen_to(&bus, "saved", Callback::new(|_| json!("ui refreshed")))
//!     .unwrap();
//!
//! let results = bus.trigger_sync("saved", &[json!(1)]).unwrap();
//! assert_eq!(results.len(), 2);
//!
//! // Detach everything the listener registered
//! listener.stop_listening(None, Names::Any, None).unwrap();
//! assert_eq!(bus.callback_count(), 1);
//! ```

#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    unreachable_pub
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Name arguments, contexts and the call view
pub mod event;

/// Error types and result aliases
pub mod error;

/// Event table and registration options
pub mod registry;

/// Callbacks, outcomes and count-limited wrappers
pub mod subscription;

/// Dispatching triggers and shaping their results
pub mod dispatcher;

/// Cross-bus listening ledger
pub mod listening;

/// The main bus implementation
pub mod bus;

// Re-export commonly used types
pub use bus::{Bus, BusBuilder, BusConfig, BusProxy, BusStats, SecureBus, WeakBus};
pub use dispatcher::{Collected, DeferStats};
pub use error::{Error, Result};
pub use event::{Call, Context, EventMap, Names, ALL};
pub use listening::{Listenable, Probe};
pub use registry::{CallType, Entries, Entry, Keys, Options};
pub use subscription::{Callback, Outcome, Pending};

/// Prelude module for convenient imports
///
/// # Example
/// ```rust
/// use busline::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bus::{Bus, BusBuilder, BusConfig};
    pub use crate::dispatcher::Collected;
    pub use crate::error::{Error, Result};
    pub use crate::event::{Call, Context, EventMap, Names};
    pub use crate::registry::{CallType, Options};
    pub use crate::subscription::{Callback, Outcome};
}
