//! Event table for mapping event names to registrations.
//!
//! The table keeps, per event name, the ordered list of registrations made
//! under it. Order within a name is registration order, which is also the
//! invocation order and the order introspection exposes.

use crate::event::Context;
use crate::listening::Listening;
use crate::subscription::Callback;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub(crate) mod table;
pub(crate) use table::EventTable;

/// Hint describing how a registration expects to be triggered.
///
/// Ordered so that `Async` dominates `Sync` dominates `Unset` when options
/// of several registrations are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum CallType {
    /// No hint given
    #[default]
    Unset = 0,
    /// Expects `trigger_sync`
    Sync = 1,
    /// Expects `trigger_async`
    Async = 2,
}

impl CallType {
    /// Parse a type hint; anything but `"sync"`/`"async"` is unset
    pub fn parse(hint: &str) -> Self {
        match hint {
            "sync" => CallType::Sync,
            "async" => CallType::Async,
            _ => CallType::Unset,
        }
    }

    /// The hint string, `None` when unset
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            CallType::Unset => None,
            CallType::Sync => Some("sync"),
            CallType::Async => Some("async"),
        }
    }
}

impl From<&str> for CallType {
    fn from(hint: &str) -> Self {
        CallType::parse(hint)
    }
}

impl From<String> for CallType {
    fn from(hint: String) -> Self {
        CallType::parse(&hint)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("unset"))
    }
}

/// Registration options.
///
/// Stored by value on each registration, so later changes to a caller's
/// copy never reach a stored registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Block further registrations under the same name
    pub guard: bool,

    /// Trigger hint
    #[serde(rename = "type")]
    pub call_type: CallType,
}

impl Options {
    /// Default options: unguarded, no type hint
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guard flag
    pub fn guard(mut self, guard: bool) -> Self {
        self.guard = guard;
        self
    }

    /// Set the type hint
    pub fn call_type(mut self, call_type: impl Into<CallType>) -> Self {
        self.call_type = call_type.into();
        self
    }

    /// Parse options from JSON. Only objects are accepted; `null` gives
    /// the defaults. Inside an object a non-string `type` is unset and a
    /// non-bool `guard` is false.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self {
                guard: map.get("guard").and_then(Value::as_bool).unwrap_or(false),
                call_type: map
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(CallType::Unset, CallType::parse),
            }),
            other => Err(Error::InvalidOptions(format!(
                "expected an object, got {}",
                json_kind(other)
            ))),
        }
    }

    /// OR the guards, keep the strongest type hint
    pub fn merge(self, other: Options) -> Self {
        Self {
            guard: self.guard || other.guard,
            call_type: self.call_type.max(other.call_type),
        }
    }

    /// Normalize for storage: async callbacks always carry the async hint
    pub(crate) fn normalized(self, callback: &Callback) -> Self {
        if callback.is_async() {
            self.call_type(CallType::Async)
        } else {
            self
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One callback binding under one event name.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) callback: Callback,
    pub(crate) context: Option<Context>,
    pub(crate) options: Options,
    pub(crate) listening: Option<Arc<Listening>>,
}

impl Registration {
    /// Whether a removal for `callback`/`context` applies to this record
    pub(crate) fn matches(&self, callback: Option<&Callback>, context: Option<&Context>) -> bool {
        let callback_ok = callback.map_or(true, |cb| self.callback.matches(cb));
        let context_ok = context.map_or(true, |ctx| {
            self.context.as_ref().is_some_and(|own| own.same(ctx))
        });
        callback_ok && context_ok
    }
}

/// A row of the introspection view: one registration under one name.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The event name
    pub name: String,
    /// The registered callback (the wrapper for once/before)
    pub callback: Callback,
    /// The registration context
    pub context: Option<Context>,
    /// A copy of the stored options
    pub options: Options,
}

/// Iterator over introspection rows, taken from a snapshot of the table.
#[derive(Debug)]
pub struct Entries {
    rows: std::vec::IntoIter<Entry>,
}

impl Entries {
    pub(crate) fn new(rows: Vec<Entry>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for Entries {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Entries {}

/// Iterator over event names, one per registration.
#[derive(Debug)]
pub struct Keys {
    entries: Entries,
}

impl Keys {
    pub(crate) fn new(entries: Entries) -> Self {
        Self { entries }
    }
}

impl Iterator for Keys {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.entries.next().map(|entry| entry.name)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Keys {}
