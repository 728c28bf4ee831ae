//! Name argument shapes and the resolver that expands them.
//!
//! Every bus operation accepts a [`Names`] value. The resolver turns it into
//! one call of the supplied reducer per single event name, so that
//! space-separated names and event maps behave the same way for
//! registration, removal, triggering and listening.

use crate::event::Context;
use crate::subscription::Callback;
use std::fmt;

/// The name argument of a bus operation.
#[derive(Clone, Default)]
pub enum Names {
    /// No name given. Removal treats this as "every name"; registration and
    /// triggering treat it as nothing to do.
    #[default]
    Any,

    /// A single event name, or several separated by whitespace.
    Text(String),

    /// Event names mapped to their callbacks.
    Map(EventMap),
}

impl Names {
    /// Expand into the single names this argument refers to.
    ///
    /// `Any` expands to nothing.
    pub fn split(&self) -> Vec<String> {
        resolve(
            |mut acc: Vec<String>, name, _, _| {
                if let Some(name) = name {
                    acc.push(name.to_string());
                }
                acc
            },
            Vec::new(),
            self,
            None,
            &mut Resolve::default(),
        )
    }

    /// Whether this is the `Any` shape.
    pub fn is_any(&self) -> bool {
        matches!(self, Names::Any)
    }
}

impl From<&str> for Names {
    fn from(name: &str) -> Self {
        Names::Text(name.to_string())
    }
}

impl From<String> for Names {
    fn from(name: String) -> Self {
        Names::Text(name)
    }
}

impl From<&String> for Names {
    fn from(name: &String) -> Self {
        Names::Text(name.clone())
    }
}

impl From<EventMap> for Names {
    fn from(map: EventMap) -> Self {
        Names::Map(map)
    }
}

impl From<&Names> for Names {
    fn from(names: &Names) -> Self {
        names.clone()
    }
}

impl fmt::Debug for Names {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Names::Any => f.write_str("Any"),
            Names::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Names::Map(map) => f.debug_tuple("Map").field(&map.names()).finish(),
        }
    }
}

impl fmt::Display for Names {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Names::Any => f.write_str("*"),
            Names::Text(text) => f.write_str(text),
            Names::Map(map) => f.write_str(&map.names().join(" ")),
        }
    }
}

/// An ordered map of event names to callbacks.
///
/// ```rust
/// use busline::{Bus, Callback, EventMap};
///
/// let bus = Bus::new("ui");
/// let map = EventMap::new()
///     .with("open", Callback::new(|_| ()))
///     .with("close", Callback::new(|_| ()));
/// bus.on(map, None);
/// assert_eq!(bus.event_count(), 2);
/// ```
#[derive(Clone, Default)]
pub struct EventMap {
    entries: Vec<(String, Callback)>,
}

impl EventMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing an existing one with the same name
    pub fn with(mut self, name: impl Into<String>, callback: Callback) -> Self {
        self.insert(name, callback);
        self
    }

    /// Add an entry, replacing an existing one with the same name
    pub fn insert(&mut self, name: impl Into<String>, callback: Callback) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = callback,
            None => self.entries.push((name, callback)),
        }
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Callback)> {
        self.entries.iter().map(|(name, cb)| (name.as_str(), cb))
    }

    /// Names in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for EventMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventMap").field(&self.names()).finish()
    }
}

/// Per-call state threaded through the resolver.
#[derive(Clone, Default)]
pub(crate) struct Resolve {
    pub(crate) context: Option<Context>,
}

impl Resolve {
    pub(crate) fn with_context(context: Option<Context>) -> Self {
        Self { context }
    }
}

/// Expand `names` and fold `iteratee` over every single name.
///
/// - `Map`: when a callback is also supplied and no context is set, the
///   callback becomes the shared context for every entry. Each entry is then
///   resolved with its own callback.
/// - `Text` containing whitespace: split on runs of whitespace and resolve
///   each token with the same callback.
/// - otherwise the iteratee is called once, with `None` for `Any`.
pub(crate) fn resolve<A, F>(
    mut iteratee: F,
    acc: A,
    names: &Names,
    callback: Option<&Callback>,
    opts: &mut Resolve,
) -> A
where
    F: FnMut(A, Option<&str>, Option<&Callback>, &Resolve) -> A,
{
    resolve_inner(&mut iteratee, acc, names, callback, opts)
}

fn resolve_inner<A, F>(
    iteratee: &mut F,
    mut acc: A,
    names: &Names,
    callback: Option<&Callback>,
    opts: &mut Resolve,
) -> A
where
    F: FnMut(A, Option<&str>, Option<&Callback>, &Resolve) -> A,
{
    match names {
        Names::Map(map) => {
            if let Some(callback) = callback {
                if opts.context.is_none() {
                    opts.context = Some(Context::from(callback));
                }
            }
            for (name, entry) in map.iter() {
                acc = resolve_inner(iteratee, acc, &Names::from(name), Some(entry), opts);
            }
            acc
        }
        Names::Text(text) if text.chars().any(char::is_whitespace) => {
            for token in text.split_whitespace() {
                acc = iteratee(acc, Some(token), callback, opts);
            }
            acc
        }
        Names::Text(text) => iteratee(acc, Some(text.as_str()), callback, opts),
        Names::Any => iteratee(acc, None, callback, opts),
    }
}
