//! Ordered name-to-registrations table.

use super::{Entry, Options, Registration};
use crate::event::Context;
use crate::listening::Listening;
use crate::subscription::Callback;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Event name to ordered registration list, remembering the order in which
/// names first appeared.
#[derive(Default)]
pub(crate) struct EventTable {
    events: HashMap<String, Vec<Registration>>,
    order: Vec<String>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a registration under `name`.
    ///
    /// Returns `false` without touching the table when there is no callback.
    /// A given `listening` gains one reference and is stored on the record.
    pub(crate) fn add(
        &mut self,
        name: &str,
        callback: Option<&Callback>,
        context: Option<Context>,
        options: Options,
        listening: Option<&Arc<Listening>>,
    ) -> bool {
        let Some(callback) = callback else {
            return false;
        };

        if let Some(listening) = listening {
            listening.retain();
        }

        let registration = Registration {
            callback: callback.clone(),
            context,
            options: options.normalized(callback),
            listening: listening.cloned(),
        };

        trace!(
            event = name,
            callback_id = %callback.id(),
            guard = registration.options.guard,
            call_type = %registration.options.call_type,
            "Adding registration"
        );

        match self.events.get_mut(name) {
            Some(list) => list.push(registration),
            None => {
                self.order.push(name.to_string());
                self.events.insert(name.to_string(), vec![registration]);
            }
        }
        true
    }

    /// Remove registrations matching `callback` and `context` under `name`,
    /// or under every name when `name` is `None`.
    ///
    /// Returns the listening records of the removed registrations, paired
    /// with the name they were removed from, so the caller can release them
    /// once the table is no longer borrowed.
    pub(crate) fn remove(
        &mut self,
        name: Option<&str>,
        callback: Option<&Callback>,
        context: Option<&Context>,
    ) -> Vec<(String, Arc<Listening>)> {
        let names: Vec<String> = match name {
            Some(name) => vec![name.to_string()],
            None => self.order.clone(),
        };

        let mut released = Vec::new();
        for name in names {
            let Some(list) = self.events.remove(&name) else {
                continue;
            };

            let (removed, remaining): (Vec<_>, Vec<_>) = list
                .into_iter()
                .partition(|reg| reg.matches(callback, context));

            released.extend(
                removed
                    .into_iter()
                    .filter_map(|reg| reg.listening.map(|l| (name.clone(), l))),
            );

            if remaining.is_empty() {
                self.order.retain(|n| *n != name);
            } else {
                self.events.insert(name, remaining);
            }
        }
        released
    }

    /// Drop every registration
    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.order.clear();
    }

    /// Copy of the registrations under `name`
    pub(crate) fn snapshot(&self, name: &str) -> Vec<Registration> {
        self.events.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub(crate) fn is_guarded(&self, name: &str) -> bool {
        self.events
            .get(name)
            .is_some_and(|list| list.iter().any(|reg| reg.options.guard))
    }

    /// Combined options of every registration under `name`
    pub(crate) fn options(&self, name: &str) -> Options {
        self.events
            .get(name)
            .map(|list| {
                list.iter()
                    .fold(Options::default(), |acc, reg| acc.merge(reg.options))
            })
            .unwrap_or_default()
    }

    /// One row per registration, names in first-seen order, optionally
    /// filtered by a regular expression on the name
    pub(crate) fn rows(&self, filter: Option<&Regex>) -> Vec<Entry> {
        self.order
            .iter()
            .filter(|name| filter.map_or(true, |re| re.is_match(name)))
            .flat_map(|name| {
                self.events.get(name).into_iter().flatten().map(move |reg| Entry {
                    name: name.clone(),
                    callback: reg.callback.clone(),
                    context: reg.context.clone(),
                    options: reg.options,
                })
            })
            .collect()
    }

    pub(crate) fn event_count(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
