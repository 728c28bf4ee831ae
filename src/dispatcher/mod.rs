//! Event dispatcher for invoking registrations and shaping their results.
//!
//! A dispatch takes one resolved event name, snapshots the registrations
//! under it and under the `all` meta-event, and invokes them in order.
//! Depending on the [`Mode`] the returned values are discarded, collected
//! as they are, or folded into a single pending aggregate.

use crate::bus::Bus;
use crate::event::{Call, ALL};
use crate::registry::Registration;
use crate::subscription::{Outcome, Pending};
use crate::Result;
use futures::future::try_join_all;
use serde_json::Value;
use tracing::trace;

pub(crate) mod channel;

pub use channel::DeferStats;
pub(crate) use channel::DeferQueue;

/// How a trigger treats callback return values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Discard return values
    Fire,
    /// Collect return values as they are
    Sync,
    /// Collect return values and fold several into one pending aggregate
    Async,
}

/// The result shape of a collecting trigger: nothing, one value, or several.
#[derive(Debug, Clone, PartialEq)]
pub enum Collected<T> {
    /// No callback produced a value
    None,
    /// Exactly one value, not wrapped in a list
    One(T),
    /// Two or more values in registration order
    Many(Vec<T>),
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Collected::None
    }
}

impl<T> Collected<T> {
    /// Collapse a list: empty to `None`, one element to `One`, else `Many`
    pub fn from_vec(mut values: Vec<T>) -> Self {
        match values.len() {
            0 => Collected::None,
            1 => values.pop().map_or(Collected::None, Collected::One),
            _ => Collected::Many(values),
        }
    }

    /// Combine with a later result.
    ///
    /// None is the identity; two singles become a two-element list; a single
    /// is prepended to or appended to a list; two lists concatenate.
    pub fn merge(self, next: Collected<T>) -> Self {
        match (self, next) {
            (Collected::None, next) => next,
            (prior, Collected::None) => prior,
            (Collected::One(a), Collected::One(b)) => Collected::Many(vec![a, b]),
            (Collected::One(a), Collected::Many(mut list)) => {
                list.insert(0, a);
                Collected::Many(list)
            }
            (Collected::Many(mut list), Collected::One(b)) => {
                list.push(b);
                Collected::Many(list)
            }
            (Collected::Many(mut list), Collected::Many(more)) => {
                list.extend(more);
                Collected::Many(list)
            }
        }
    }

    /// Number of values held
    pub fn len(&self) -> usize {
        match self {
            Collected::None => 0,
            Collected::One(_) => 1,
            Collected::Many(list) => list.len(),
        }
    }

    /// Whether no value was collected
    pub fn is_none(&self) -> bool {
        matches!(self, Collected::None)
    }

    /// The single value, if exactly one was collected
    pub fn one(self) -> Option<T> {
        match self {
            Collected::One(value) => Some(value),
            _ => None,
        }
    }

    /// All values as a list
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Collected::None => Vec::new(),
            Collected::One(value) => vec![value],
            Collected::Many(list) => list,
        }
    }

    /// Map every held value
    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> Collected<U> {
        match self {
            Collected::None => Collected::None,
            Collected::One(value) => Collected::One(f(value)),
            Collected::Many(list) => Collected::Many(list.into_iter().map(f).collect()),
        }
    }
}

impl<T> From<Option<T>> for Collected<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Collected::None, Collected::One)
    }
}

impl Collected<Outcome> {
    /// Settle every outcome: await pending ones, splice lists one level,
    /// drop empties, and collapse the result.
    pub async fn settle(self) -> Result<Collected<Value>> {
        match self {
            Collected::None => Ok(Collected::None),
            Collected::One(outcome) => outcome.settle().await,
            Collected::Many(outcomes) => settle_all(outcomes).await,
        }
    }
}

/// Invoke the registrations under `name` (and `all`) on `bus`.
pub(crate) fn dispatch(
    bus: &Bus,
    mode: Mode,
    name: &str,
    args: &[Value],
) -> Result<Collected<Outcome>> {
    // Both lists are copied up front: registrations added while this pass
    // runs are not invoked by it, removed ones that were already copied are.
    let (primary, all) = {
        let table = bus.table().lock();
        (table.snapshot(name), table.snapshot(ALL))
    };

    if primary.is_empty() && all.is_empty() {
        return Ok(Collected::None);
    }

    if bus.config().trace_dispatch {
        trace!(
            bus = bus.name(),
            event = name,
            callbacks = primary.len(),
            all_callbacks = all.len(),
            ?mode,
            "Dispatching event"
        );
    }

    let mut outcomes = Vec::new();
    invoke(bus, mode, &primary, name, args, &mut outcomes)?;

    if !all.is_empty() {
        let mut all_args = Vec::with_capacity(args.len() + 1);
        all_args.push(Value::String(name.to_string()));
        all_args.extend_from_slice(args);
        invoke(bus, mode, &all, ALL, &all_args, &mut outcomes)?;
    }

    Ok(match mode {
        Mode::Fire => Collected::None,
        Mode::Sync => Collected::from_vec(outcomes),
        Mode::Async => match Collected::from_vec(outcomes) {
            Collected::Many(outcomes) => {
                Collected::One(Outcome::Pending(Pending::collected(settle_all(outcomes))))
            }
            shape => shape,
        },
    })
}

fn invoke(
    bus: &Bus,
    mode: Mode,
    registrations: &[Registration],
    name: &str,
    args: &[Value],
    outcomes: &mut Vec<Outcome>,
) -> Result<()> {
    for registration in registrations {
        let call = Call::new(bus, registration.context.as_ref(), name, args);
        let outcome = registration.callback.invoke(&call)?;
        if mode != Mode::Fire && !outcome.is_nothing() {
            outcomes.push(outcome);
        }
    }
    Ok(())
}

/// Await all outcomes (first failure wins) and flatten them.
async fn settle_all(outcomes: Vec<Outcome>) -> Result<Collected<Value>> {
    let settled = try_join_all(outcomes.into_iter().map(Outcome::settle)).await?;

    let mut values = Vec::new();
    for collected in settled {
        match collected {
            Collected::None => {}
            Collected::One(Value::Array(items)) => values.extend(items),
            Collected::One(value) => values.push(value),
            Collected::Many(items) => values.extend(items),
        }
    }
    Ok(Collected::from_vec(values))
}
