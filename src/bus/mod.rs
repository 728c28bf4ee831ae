//! The main Bus implementation.
//!
//! The Bus is the primary interface for registering callbacks, triggering
//! events and listening to other buses. It coordinates between the name
//! resolver, the event table, the dispatcher and the listening ledger.

use crate::dispatcher::{dispatch, Collected, DeferQueue, DeferStats, Mode};
use crate::event::{resolve, Context, EventMap, Names, Resolve};
use crate::listening::{Listenable, Listening, Probe, Remote};
use crate::registry::{CallType, Entries, EventTable, Keys, Options};
use crate::subscription::{check_count, wrap_before, AfterHook, Callback, Outcome};
use crate::Result;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod builder;
pub mod config;
pub mod proxy;
pub mod secure;

pub use builder::BusBuilder;
pub use config::BusConfig;
pub use proxy::BusProxy;
pub use secure::SecureBus;

struct BusInner {
    id: Uuid,
    config: BusConfig,
    table: Mutex<EventTable>,
    /// Targets this bus listens to, by target id
    listening_to: DashMap<Uuid, Arc<Listening>>,
    /// Buses listening to this one, by listener id
    listeners: DashMap<Uuid, Arc<Listening>>,
    deferred: DeferQueue,
}

/// An in-process event bus.
///
/// Cloning a `Bus` yields another handle to the same bus.
///
/// # Example
///
/// ```rust
/// use busline::{Bus, Callback, Collected};
/// use serde_json::json;
///
/// let bus = Bus::new("orders");
/// bus.on("created", Callback::new(|call| call.arg(0).cloned()));
///
/// let result = bus.trigger_sync("created", &[json!(42)]).unwrap();
/// assert_eq!(result.map(|o| o.value().cloned()), Collected::One(Some(json!(42))));
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// A non-owning handle to a [`Bus`].
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<BusInner>,
}

impl WeakBus {
    /// The bus, if it is still alive
    pub fn upgrade(&self) -> Option<Bus> {
        self.inner.upgrade().map(|inner| Bus { inner })
    }

    /// Whether both handles refer to the same bus
    pub fn ptr_eq(&self, other: &WeakBus) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(bus) => f.debug_tuple("WeakBus").field(&bus.name()).finish(),
            None => f.write_str("WeakBus(<dropped>)"),
        }
    }
}

impl Bus {
    /// Create a bus with default configuration and the given name
    pub fn new(name: impl Into<String>) -> Self {
        BusBuilder::new().name(name).build()
    }

    /// Create a new Bus builder
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub(crate) fn from_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: Uuid::new_v4(),
                config,
                table: Mutex::new(EventTable::new()),
                listening_to: DashMap::new(),
                listeners: DashMap::new(),
                deferred: DeferQueue::new(),
            }),
        }
    }

    /// The bus name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The listen id of this bus
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The configuration this bus was built with
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// A weak handle to this bus
    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn table(&self) -> &Mutex<EventTable> {
        &self.inner.table
    }

    #[cfg(test)]
    pub(crate) fn deferred(&self) -> &DeferQueue {
        &self.inner.deferred
    }

    // ----- registration -----

    /// Register `callback` under `names`.
    ///
    /// `names` may be a single name, several whitespace-separated names or
    /// an [`EventMap`]. With an event map, a callback given here becomes the
    /// context of every entry.
    pub fn on(&self, names: impl Into<Names>, callback: impl Into<Option<Callback>>) -> &Self {
        self.on_with(names, callback, None, Options::default())
    }

    /// Register with an explicit context and options.
    ///
    /// A name that is guarded already is left untouched and the whole call
    /// becomes a no-op.
    pub fn on_with(
        &self,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> &Self {
        let callback = callback.into();
        self.register(&names.into(), callback.as_ref(), context.into(), options, None);
        self
    }

    /// Add registrations to the table, unless one of the names is guarded.
    ///
    /// With a `listening`, every registration references it and this bus
    /// files it among its listeners.
    fn register(
        &self,
        names: &Names,
        callback: Option<&Callback>,
        context: Option<Context>,
        options: Options,
        listening: Option<&Arc<Listening>>,
    ) -> usize {
        let blocked = self.guarded_names(names);
        if !blocked.is_empty() {
            if self.inner.config.log_guard_violations {
                warn!(
                    bus = self.name(),
                    events = ?blocked,
                    "Registration blocked: event is guarded"
                );
            }
            return 0;
        }

        let mut opts = Resolve::with_context(context);
        let added = {
            let mut table = self.inner.table.lock();
            resolve(
                |added, name, callback, opts| {
                    let Some(name) = name else {
                        return added;
                    };
                    if table.add(name, callback, opts.context.clone(), options, listening) {
                        added + 1
                    } else {
                        added
                    }
                },
                0,
                names,
                callback,
                &mut opts,
            )
        };

        if let Some(listening) = listening.filter(|_| added > 0) {
            self.inner
                .listeners
                .insert(listening.listener_id(), listening.clone());
        }
        added
    }

    /// Remove registrations matching `names`, `callback` and `context`.
    ///
    /// Any argument left out matches everything; with all three left out
    /// the table is cleared and every bus listening to this one detaches.
    /// Removing something that is not registered is a no-op.
    pub fn off(
        &self,
        names: impl Into<Names>,
        callback: Option<&Callback>,
        context: Option<&Context>,
    ) -> &Self {
        let names = names.into();
        let mut released = Vec::new();
        let mut everything = false;

        {
            let mut table = self.inner.table.lock();
            resolve(
                |(), name, callback, opts| {
                    if name.is_none() && callback.is_none() && opts.context.is_none() {
                        everything = true;
                        table.clear();
                    } else {
                        released.extend(table.remove(name, callback, opts.context.as_ref()));
                    }
                },
                (),
                &names,
                callback,
                &mut Resolve::with_context(context.cloned()),
            );
        }

        if everything {
            let listeners: Vec<_> = self
                .inner
                .listeners
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for listening in listeners {
                listening.cleanup();
            }
        }

        for (name, listening) in released {
            listening.release(&Names::from(name), callback);
        }
        self
    }

    /// Remove every registration
    pub fn off_all(&self) -> &Self {
        self.off(Names::Any, None, None)
    }

    /// Register `callback` to run on the first trigger only
    pub fn once(&self, names: impl Into<Names>, callback: impl Into<Option<Callback>>) -> &Self {
        self.once_with(names, callback, None, Options::default())
    }

    /// [`Bus::once`] with an explicit context and options
    pub fn once_with(
        &self,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> &Self {
        self.register_before(1, names.into(), callback.into(), context.into(), options);
        self
    }

    /// Register `callback` to run on the first `count` triggers only.
    ///
    /// Fails with [`crate::Error::InvalidCount`] when `count` is zero.
    pub fn before(
        &self,
        count: usize,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
    ) -> Result<&Self> {
        self.before_with(count, names, callback, None, Options::default())
    }

    /// [`Bus::before`] with an explicit context and options
    pub fn before_with(
        &self,
        count: usize,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> Result<&Self> {
        let count = check_count(count)?;
        self.register_before(count, names.into(), callback.into(), context.into(), options);
        Ok(self)
    }

    fn register_before(
        &self,
        count: usize,
        names: Names,
        callback: Option<Callback>,
        context: Option<Context>,
        options: Options,
    ) {
        let bus = self.downgrade();
        let mut opts = Resolve::with_context(context);
        let wrapped = countdown_map(count, &names, callback.as_ref(), &mut opts, |name, key| {
            let bus = bus.clone();
            let hook: AfterHook = Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.off(name.as_str(), Some(&key), None);
                }
                Ok(())
            });
            hook
        });
        self.register(&Names::Map(wrapped), None, opts.context, options, None);
    }

    // ----- triggering -----

    /// Invoke the callbacks registered under `names`, discarding results.
    ///
    /// A callback error stops the pass and is returned.
    pub fn trigger(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.collect(Mode::Fire, &names.into(), args)?;
        Ok(self)
    }

    /// Invoke the callbacks registered under `names` and collect what they
    /// return. Pending outcomes are passed through unawaited.
    pub fn trigger_sync(&self, names: impl Into<Names>, args: &[Value]) -> Result<Collected<Outcome>> {
        self.collect(Mode::Sync, &names.into(), args)
    }

    /// Invoke the callbacks registered under `names` now and return a future
    /// of their settled results.
    ///
    /// The first failure, synchronous or pending, rejects the future.
    pub fn trigger_async(
        &self,
        names: impl Into<Names>,
        args: &[Value],
    ) -> BoxFuture<'static, Result<Collected<Value>>> {
        let collected = self.collect(Mode::Async, &names.into(), args);
        async move { collected?.settle().await }.boxed()
    }

    /// Queue a trigger of `names` for a later turn of the runtime.
    ///
    /// Deferred triggers on one bus fire in the order they were queued and
    /// cannot be cancelled. Requires a tokio runtime.
    pub fn trigger_defer(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.inner.deferred.push(self, names.into(), args.to_vec())?;
        Ok(self)
    }

    fn collect(&self, mode: Mode, names: &Names, args: &[Value]) -> Result<Collected<Outcome>> {
        resolve(
            |acc: Result<Collected<Outcome>>, name, _, _| {
                let acc = acc?;
                match name {
                    Some(name) => Ok(acc.merge(dispatch(self, mode, name, args)?)),
                    None => Ok(acc),
                }
            },
            Ok(Collected::None),
            names,
            None,
            &mut Resolve::default(),
        )
    }

    // ----- listening -----

    /// Register `callback` on `target` under `names`, on behalf of this bus.
    ///
    /// The callback's receiver is this bus. Everything registered this way
    /// can be removed with [`Bus::stop_listening`]. An error from a foreign
    /// target's `on` is returned unchanged.
    pub fn listen_to<T>(
        &self,
        target: &T,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
    ) -> Result<&Self>
    where
        T: Listenable + Clone + 'static,
    {
        self.listen(target, names.into(), callback.into())?;
        Ok(self)
    }

    /// [`Bus::listen_to`] for the first trigger only
    pub fn listen_to_once<T>(
        &self,
        target: &T,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
    ) -> Result<&Self>
    where
        T: Listenable + Clone + 'static,
    {
        self.listen_before(1, target, names.into(), callback.into())?;
        Ok(self)
    }

    /// [`Bus::listen_to`] for the first `count` triggers only
    pub fn listen_to_before<T>(
        &self,
        count: usize,
        target: &T,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
    ) -> Result<&Self>
    where
        T: Listenable + Clone + 'static,
    {
        let count = check_count(count)?;
        self.listen_before(count, target, names.into(), callback.into())?;
        Ok(self)
    }

    fn listen_before<T>(
        &self,
        count: usize,
        target: &T,
        names: Names,
        callback: Option<Callback>,
    ) -> Result<()>
    where
        T: Listenable + Clone + 'static,
    {
        let listener = self.downgrade();
        let target_id = target.listen_id();
        let wrapped = countdown_map(
            count,
            &names,
            callback.as_ref(),
            &mut Resolve::default(),
            |name, key| {
                let listener = listener.clone();
                let hook: AfterHook = Box::new(move || match listener.upgrade() {
                    Some(bus) => {
                        bus.stop_listening_ids(Some(vec![target_id]), &Names::from(name), Some(&key))
                    }
                    None => Ok(()),
                });
                hook
            },
        );
        self.listen(target, Names::Map(wrapped), None)
    }

    fn listen<T>(&self, target: &T, names: Names, callback: Option<Callback>) -> Result<()>
    where
        T: Listenable + Clone + 'static,
    {
        let compatible = match target.probe() {
            Probe::Compatible(bus) => Some(bus),
            Probe::Incompatible => None,
            Probe::Failed(e) => {
                debug!(bus = self.name(), error = %e, "Listen target probe failed, using interop mode");
                None
            }
        };

        let blocked = match &compatible {
            Some(bus) => bus.guarded_names(&names),
            None => match target.is_guarded(&names) {
                Ok(true) => names.split(),
                Ok(false) => Vec::new(),
                Err(e) => {
                    debug!(bus = self.name(), error = %e, "Guard check failed, treating as unguarded");
                    Vec::new()
                }
            },
        };
        if !blocked.is_empty() {
            if self.inner.config.log_guard_violations {
                warn!(
                    bus = self.name(),
                    target_id = %target.listen_id(),
                    events = ?blocked,
                    "listen_to blocked: event is guarded on target"
                );
            }
            return Ok(());
        }

        let target_id = target.listen_id();
        let existing = self
            .inner
            .listening_to
            .get(&target_id)
            .map(|entry| entry.value().clone())
            .filter(|listening| !listening.is_detached());
        let listening = match existing {
            Some(listening) => listening,
            None => {
                let remote = match &compatible {
                    Some(bus) => Remote::Bus(bus.downgrade()),
                    None => Remote::Foreign(Arc::new(target.clone())),
                };
                let listening = Arc::new(Listening::new(self, target_id, remote));
                self.inner.listening_to.insert(target_id, listening.clone());
                debug!(
                    bus = self.name(),
                    target_id = %target_id,
                    interop = listening.is_interop(),
                    "Listening created"
                );
                listening
            }
        };

        let context = Context::from(self);
        match listening.remote() {
            Remote::Bus(weak) => match compatible.or_else(|| weak.upgrade()) {
                Some(bus) => {
                    bus.register(&names, callback.as_ref(), Some(context), Options::default(), Some(&listening));
                }
                None => listening.cleanup(),
            },
            Remote::Foreign(foreign) => {
                if let Err(e) = foreign.on(&names, callback.as_ref(), &context) {
                    if listening.is_idle() {
                        listening.cleanup();
                    }
                    return Err(e);
                }
                listening.shadow_on(&names, callback.as_ref());
            }
        }

        if listening.is_idle() {
            listening.cleanup();
        }
        Ok(())
    }

    /// Remove registrations this bus made on other targets.
    ///
    /// Without a target every tracked target is visited. `names` and
    /// `callback` narrow the removal as in [`Bus::off`].
    pub fn stop_listening(
        &self,
        target: Option<&dyn Listenable>,
        names: impl Into<Names>,
        callback: Option<&Callback>,
    ) -> Result<&Self> {
        let ids = target.map(|target| vec![target.listen_id()]);
        self.stop_listening_ids(ids, &names.into(), callback)?;
        Ok(self)
    }

    fn stop_listening_ids(
        &self,
        ids: Option<Vec<Uuid>>,
        names: &Names,
        callback: Option<&Callback>,
    ) -> Result<()> {
        let ids = ids.unwrap_or_else(|| {
            self.inner
                .listening_to
                .iter()
                .map(|entry| *entry.key())
                .collect()
        });
        let context = Context::from(self);

        for id in ids {
            let Some(listening) = self
                .inner
                .listening_to
                .get(&id)
                .map(|entry| entry.value().clone())
            else {
                continue;
            };

            match listening.remote() {
                Remote::Bus(weak) => match weak.upgrade() {
                    Some(target) => {
                        target.off(names, callback, Some(&context));
                    }
                    None => listening.cleanup(),
                },
                Remote::Foreign(target) => {
                    target.off(names, callback, &context)?;
                    listening.release(names, callback);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn forget_listening(&self, listening: &Listening) {
        self.inner
            .listening_to
            .remove_if(&listening.target_id(), |_, held| listening.is(held));
    }

    pub(crate) fn forget_listener(&self, listening: &Listening) {
        self.inner
            .listeners
            .remove_if(&listening.listener_id(), |_, held| listening.is(held));
    }

    #[cfg(test)]
    pub(crate) fn listening_to(&self, target_id: Uuid) -> Option<Arc<Listening>> {
        self.inner
            .listening_to
            .get(&target_id)
            .map(|entry| entry.value().clone())
    }

    /// Number of targets this bus is listening to
    pub fn listening_count(&self) -> usize {
        self.inner.listening_to.len()
    }

    /// Number of buses listening to this one
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // ----- introspection -----

    /// One row per registration, in name order then registration order,
    /// optionally filtered by a pattern on the name
    pub fn entries(&self, filter: Option<&Regex>) -> Entries {
        Entries::new(self.inner.table.lock().rows(filter))
    }

    /// The name of every registration, as [`Bus::entries`] orders them
    pub fn keys(&self, filter: Option<&Regex>) -> Keys {
        Keys::new(self.entries(filter))
    }

    /// Number of distinct event names with registrations
    pub fn event_count(&self) -> usize {
        self.inner.table.lock().event_count()
    }

    /// Total number of registrations
    pub fn callback_count(&self) -> usize {
        self.inner.table.lock().callback_count()
    }

    /// Combined options of every registration under `names`
    pub fn get_options(&self, names: impl Into<Names>) -> Options {
        let names = names.into();
        let table = self.inner.table.lock();
        names
            .split()
            .iter()
            .fold(Options::default(), |acc, name| acc.merge(table.options(name)))
    }

    /// Strongest call type hint among the registrations under `names`
    pub fn get_type(&self, names: impl Into<Names>) -> CallType {
        self.get_options(names).call_type
    }

    /// Whether any of `names` holds a guarded registration
    pub fn is_guarded(&self, names: impl Into<Names>) -> bool {
        !self.guarded_names(&names.into()).is_empty()
    }

    pub(crate) fn guarded_names(&self, names: &Names) -> Vec<String> {
        let names = names.split();
        let table = self.inner.table.lock();
        names.into_iter().filter(|name| table.is_guarded(name)).collect()
    }

    /// Get statistics about the bus
    pub fn stats(&self) -> BusStats {
        let (event_count, callback_count) = {
            let table = self.inner.table.lock();
            (table.event_count(), table.callback_count())
        };
        BusStats {
            name: self.name().to_string(),
            event_count,
            callback_count,
            listening_to: self.listening_count(),
            listened_by: self.listener_count(),
            deferred: self.inner.deferred.stats(),
        }
    }
}

/// Wrap every (name, callback) pair of `names` in a countdown whose
/// exhaustion hook comes from `after`.
fn countdown_map<F>(
    count: usize,
    names: &Names,
    callback: Option<&Callback>,
    opts: &mut Resolve,
    after: F,
) -> EventMap
where
    F: Fn(String, Callback) -> AfterHook,
{
    resolve(
        |mut map: EventMap, name, callback, _| {
            if let (Some(name), Some(callback)) = (name, callback) {
                let event = name.to_string();
                let wrapper = wrap_before(count, callback, |key| after(event, key));
                map.insert(name, wrapper);
            }
            map
        },
        EventMap::new(),
        names,
        callback,
        opts,
    )
}

impl Listenable for Bus {
    fn listen_id(&self) -> Uuid {
        self.id()
    }

    fn probe(&self) -> Probe {
        Probe::Compatible(self.clone())
    }

    fn is_guarded(&self, names: &Names) -> Result<bool> {
        Ok(Bus::is_guarded(self, names))
    }

    fn on(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()> {
        self.on_with(names, callback.cloned(), context.clone(), Options::default());
        Ok(())
    }

    fn off(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()> {
        Bus::off(self, names, callback, Some(context));
        Ok(())
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("events", &self.event_count())
            .finish()
    }
}

/// Statistics about the bus
#[derive(Debug, Clone)]
pub struct BusStats {
    /// The bus name
    pub name: String,

    /// Number of distinct event names
    pub event_count: usize,

    /// Total number of registrations
    pub callback_count: usize,

    /// Number of targets this bus listens to
    pub listening_to: usize,

    /// Number of buses listening to this one
    pub listened_by: usize,

    /// Deferred trigger counters
    pub deferred: DeferStats,
}

impl fmt::Display for BusStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus '{}': {} events, {} callbacks, listening to {}, listened by {}, deferred {}",
            self.name,
            self.event_count,
            self.callback_count,
            self.listening_to,
            self.listened_by,
            self.deferred
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Call, ALL};
    use crate::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Callback, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let cb = Callback::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (cb, hits)
    }

    fn hits(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn values(collected: Collected<Outcome>) -> Collected<Option<Value>> {
        collected.map(|outcome| outcome.value().cloned())
    }

    #[test]
    fn test_multi_name_registration_and_removal() {
        let bus = Bus::new("multi");
        let (cb, calls) = counter();

        bus.on("a b", cb);
        bus.trigger("a", &[]).unwrap();
        assert_eq!(hits(&calls), 1);

        bus.trigger("a b", &[]).unwrap();
        assert_eq!(hits(&calls), 3);

        bus.off("a", None, None);
        bus.trigger("a b", &[]).unwrap();
        assert_eq!(hits(&calls), 4);
    }

    #[test]
    fn test_off_is_idempotent() {
        let bus = Bus::new("idem");
        let (cb, calls) = counter();
        let (other, _) = counter();
        let ctx = Context::new(1_u32);
        bus.on_with("x", cb.clone(), ctx.clone(), Options::default());
        bus.on("x", other);

        bus.off("x", Some(&cb), Some(&ctx));
        assert_eq!(bus.callback_count(), 1);
        bus.off("x", Some(&cb), Some(&ctx));
        assert_eq!(bus.callback_count(), 1);

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&calls), 0);
    }

    #[test]
    fn test_off_everything() {
        let bus = Bus::new("clear");
        let (cb, _) = counter();
        bus.on("x y z", cb);
        bus.off_all();
        assert_eq!(bus.event_count(), 0);
        assert_eq!(bus.callback_count(), 0);
        bus.off_all();
    }

    #[test]
    fn test_off_by_context_only() {
        let bus = Bus::new("ctx");
        let ctx = Context::new("view");
        let (cb, _) = counter();
        bus.on_with("x y", cb.clone(), ctx.clone(), Options::default());
        bus.on("x", cb);

        bus.off(Names::Any, None, Some(&ctx));
        assert_eq!(bus.callback_count(), 1);
        assert_eq!(bus.keys(None).collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn test_guard_exclusivity() {
        let bus = Bus::builder().config(BusConfig::test()).build();
        let (guarded, _) = counter();
        let (other, calls) = counter();
        bus.on_with("x", guarded, None, Options::new().guard(true));

        bus.on("x", other.clone());
        bus.once("x", other.clone());
        bus.before(2, "x", other.clone()).unwrap();
        bus.on("x y", other.clone());
        bus.on_with("x", other, Context::new(()), Options::new().guard(true));

        assert_eq!(bus.callback_count(), 1);
        assert_eq!(bus.event_count(), 1);
        assert!(bus.is_guarded("x"));
        assert!(!bus.is_guarded("y"));

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&calls), 0);
    }

    #[test]
    fn test_guard_on_event_map_keys() {
        let bus = Bus::new("guard-map");
        let (cb, _) = counter();
        bus.on_with("b", cb.clone(), None, Options::new().guard(true));

        let map = EventMap::new().with("a", cb.clone()).with("b", cb);
        bus.on(map, None);
        assert_eq!(bus.keys(None).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_count_collapse() {
        let bus = Bus::new("collapse");
        assert!(bus.trigger_sync("x", &[]).unwrap().is_none());

        bus.on("x", Callback::new(|_| ()));
        assert!(bus.trigger_sync("x", &[]).unwrap().is_none());

        bus.on("x", Callback::new(|_| json!(1)));
        assert_eq!(
            values(bus.trigger_sync("x", &[]).unwrap()),
            Collected::One(Some(json!(1)))
        );

        bus.on("x", Callback::new(|_| Value::Null));
        assert_eq!(
            values(bus.trigger_sync("x", &[]).unwrap()),
            Collected::Many(vec![Some(json!(1)), Some(Value::Null)])
        );
    }

    #[test]
    fn test_sync_scenario_and_type() {
        let bus = Bus::new("sync");
        bus.on_with(
            "x",
            Callback::new(|_| json!(1)),
            Context::new("ctx"),
            Options::new().call_type("sync"),
        );
        bus.on_with(
            "x",
            Callback::new(|_| json!(2)),
            Context::new("ctx2"),
            Options::new().call_type("sync"),
        );

        assert_eq!(
            values(bus.trigger_sync("x", &[]).unwrap()),
            Collected::Many(vec![Some(json!(1)), Some(json!(2))])
        );
        assert_eq!(bus.get_type("x"), CallType::Sync);
        assert_eq!(bus.get_type("x").as_str(), Some("sync"));
    }

    #[test]
    fn test_sync_merges_across_names() {
        let bus = Bus::new("merge");
        bus.on("a", Callback::new(|_| json!("a")));
        bus.on("b", Callback::new(|_| json!("b1")));
        bus.on("b", Callback::new(|_| json!("b2")));

        assert_eq!(
            values(bus.trigger_sync("a b missing", &[]).unwrap()),
            Collected::Many(vec![Some(json!("a")), Some(json!("b1")), Some(json!("b2"))])
        );
    }

    #[test]
    fn test_sync_passes_pending_through() {
        let bus = Bus::new("opaque");
        bus.on("x", Callback::future(|_| async { Ok(Some(json!(1))) }));
        let result = bus.trigger_sync("x", &[]).unwrap();
        assert!(matches!(result, Collected::One(ref outcome) if outcome.is_pending()));
    }

    #[tokio::test]
    async fn test_async_aggregation() {
        let bus = Bus::new("async");
        bus.on("y", Callback::future(|_| async { Ok(Some(json!("foo"))) }));
        bus.on("y", Callback::future(|_| async { Ok(Some(json!("bar"))) }));

        let result = bus.trigger_async("y", &[]).await.unwrap();
        assert_eq!(result, Collected::Many(vec![json!("foo"), json!("bar")]));
        assert_eq!(bus.get_type("y"), CallType::Async);
    }

    #[tokio::test]
    async fn test_async_single_defined_value() {
        let bus = Bus::new("async-one");
        bus.on("y", Callback::future(|_| async { Ok(Some(json!("foo"))) }));
        bus.on("y", Callback::future(|_| async { Ok(None) }));
        bus.on("y", Callback::new(|_| ()));

        let result = bus.trigger_async("y", &[]).await.unwrap();
        assert_eq!(result, Collected::One(json!("foo")));

        let empty = bus.trigger_async("nothing", &[]).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_async_flattens_list_results() {
        let bus = Bus::new("flatten");
        bus.on("y", Callback::new(|_| json!([1, 2])));
        bus.on("y", Callback::future(|_| async { Ok(Some(json!(3))) }));

        let result = bus.trigger_async("y", &[]).await.unwrap();
        assert_eq!(result, Collected::Many(vec![json!(1), json!(2), json!(3)]));
    }

    #[tokio::test]
    async fn test_async_rejections() {
        let bus = Bus::new("reject");
        bus.on("x", Callback::new(|_| json!(1)));
        bus.on("x", Callback::future(|_| async { Err(Error::handler("nope")) }));
        let err = bus.trigger_async("x", &[]).await.unwrap_err();
        assert_eq!(err, Error::handler("nope"));

        bus.on("z", Callback::fallible(|_| Err::<(), _>(Error::handler("sync"))));
        let err = bus.trigger_async("z", &[]).await.unwrap_err();
        assert_eq!(err, Error::handler("sync"));
    }

    #[test]
    fn test_callback_error_aborts_pass() {
        let bus = Bus::new("abort");
        let (cb, calls) = counter();
        bus.on("x", Callback::fallible(|_| Err::<(), _>(Error::handler("boom"))));
        bus.on("x", cb.clone());
        bus.on("y", cb);

        let err = bus.trigger("x y", &[]).unwrap_err();
        assert_eq!(err, Error::handler("boom"));
        assert!(err.is_handler_error());
        assert_eq!(hits(&calls), 0);
    }

    #[test]
    fn test_once_exhaustion() {
        let bus = Bus::new("once");
        let (cb, calls) = counter();
        bus.once("x", cb);

        bus.trigger("x", &[]).unwrap();
        assert_eq!(bus.callback_count(), 0);
        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&calls), 1);
    }

    #[test]
    fn test_once_without_callback_is_noop() {
        let bus = Bus::new("once-none");
        bus.once("x", None);
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_once_per_name() {
        let bus = Bus::new("once-multi");
        let (cb, calls) = counter();
        bus.once("a b", cb);
        assert_eq!(bus.callback_count(), 2);

        bus.trigger("a", &[]).unwrap();
        bus.trigger("a", &[]).unwrap();
        assert_eq!(hits(&calls), 1);
        assert_eq!(bus.keys(None).collect::<Vec<_>>(), vec!["b"]);

        bus.trigger("b", &[]).unwrap();
        assert_eq!(hits(&calls), 2);
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_once_reentrant_trigger() {
        let bus = Bus::new("reenter");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bus.once(
            "x",
            Callback::fallible(move |call: &Call<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                call.bus().trigger("x", &[])?;
                Ok(())
            }),
        );

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&calls), 1);
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_before_exhaustion() {
        let bus = Bus::new("before");
        let (cb, calls) = counter();
        bus.before(3, "x", cb).unwrap();

        for _ in 0..3 {
            bus.trigger("x", &[]).unwrap();
        }
        assert_eq!(hits(&calls), 3);
        assert_eq!(bus.callback_count(), 0);

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&calls), 3);
    }

    #[test]
    fn test_before_rejects_zero() {
        let bus = Bus::new("zero");
        let err = bus.before(0, "x", Callback::new(|_| ())).unwrap_err();
        assert_eq!(err, Error::InvalidCount { count: 0 });
        assert!(err.is_argument_error());
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_off_by_original_removes_wrapper() {
        let bus = Bus::new("original");
        let (cb, calls) = counter();
        bus.once("x", cb.clone());
        bus.before(2, "y", cb.clone()).unwrap();

        bus.off(Names::Any, Some(&cb), None);
        assert_eq!(bus.callback_count(), 0);
        bus.trigger("x y", &[]).unwrap();
        assert_eq!(hits(&calls), 0);
    }

    #[test]
    fn test_once_keeps_context_and_options() {
        let bus = Bus::new("once-ctx");
        let ctx = Context::new("owner");
        bus.once_with(
            "x",
            Callback::new(|_| ()),
            ctx.clone(),
            Options::new().call_type("sync"),
        );

        let entry = bus.entries(None).next().unwrap();
        assert!(entry.context.is_some_and(|c| c.same(&ctx)));
        assert_eq!(entry.options.call_type, CallType::Sync);

        bus.off(Names::Any, None, Some(&ctx));
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_all_event_receives_name() {
        let bus = Bus::new("all");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(ALL, Callback::new(move |call| sink.lock().push(call.args().to_vec())));

        bus.trigger("a b", &[json!(1)]).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![vec![json!("a"), json!(1)], vec![json!("b"), json!(1)]]
        );
    }

    #[test]
    fn test_all_runs_after_primary() {
        let bus = Bus::new("order");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());
        bus.on(ALL, Callback::new(move |_| first.lock().push("all")));
        bus.on("x", Callback::new(move |_| second.lock().push("x")));

        bus.trigger("x", &[]).unwrap();
        assert_eq!(*order.lock(), vec!["x", "all"]);
    }

    #[test]
    fn test_all_list_is_snapshotted() {
        let bus = Bus::new("all-snap");
        let (late, late_calls) = counter();
        bus.on(
            "x",
            Callback::new(move |call: &Call<'_>| {
                call.bus().on(ALL, late.clone());
            }),
        );

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&late_calls), 0);
        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&late_calls), 1);
    }

    #[test]
    fn test_primary_list_is_snapshotted() {
        let bus = Bus::new("snap");
        let (late, late_calls) = counter();
        let (second, second_calls) = counter();
        let victim = second.clone();
        bus.on(
            "x",
            Callback::new(move |call: &Call<'_>| {
                call.bus().on("x", late.clone());
                call.bus().off("x", Some(&victim), None);
            }),
        );
        bus.on("x", second);

        // Added during the pass: not invoked. Removed during the pass after
        // the snapshot was taken: still invoked.
        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&late_calls), 0);
        assert_eq!(hits(&second_calls), 1);

        bus.trigger("x", &[]).unwrap();
        assert_eq!(hits(&late_calls), 1);
        assert_eq!(hits(&second_calls), 1);
    }

    #[test]
    fn test_receiver_defaults_to_bus() {
        let bus = Bus::new("receiver");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (with_ctx, without_ctx) = (seen.clone(), seen.clone());

        bus.on(
            "x",
            Callback::new(move |call| {
                without_ctx
                    .lock()
                    .push(call.receiver().bus().map(|b| b.name().to_string()));
            }),
        );
        bus.on_with(
            "x",
            Callback::new(move |call| {
                with_ctx
                    .lock()
                    .push(call.receiver().downcast_ref::<String>().cloned());
            }),
            Context::new(String::from("owner")),
            Options::default(),
        );

        bus.trigger("x", &[]).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Some("receiver".to_string()), Some("owner".to_string())]
        );
    }

    #[test]
    fn test_event_map_with_callback_context() {
        let bus = Bus::new("map");
        let (a, a_calls) = counter();
        let (b, b_calls) = counter();
        let owner = Callback::new(|_| ());

        bus.on(EventMap::new().with("a", a).with("b", b), owner.clone());
        assert_eq!(bus.callback_count(), 2);
        for entry in bus.entries(None) {
            assert!(entry.context.is_some_and(|c| c.same(&Context::from(&owner))));
        }

        bus.trigger("a b", &[]).unwrap();
        assert_eq!((hits(&a_calls), hits(&b_calls)), (1, 1));

        bus.off(Names::Any, None, Some(&Context::from(&owner)));
        assert_eq!(bus.callback_count(), 0);
    }

    #[test]
    fn test_entries_and_keys() {
        let bus = Bus::new("intro");
        bus.on("user:login", Callback::new(|_| ()));
        bus.on("system", Callback::new(|_| ()));
        bus.on_with("user:login", Callback::new(|_| ()), None, Options::new().guard(true));

        let keys: Vec<_> = bus.keys(None).collect();
        assert_eq!(keys, vec!["user:login", "user:login", "system"]);

        let re = Regex::new("^user:").unwrap();
        let entries = bus.entries(Some(&re));
        assert_eq!(entries.len(), 2);
        let guards: Vec<_> = entries.map(|e| e.options.guard).collect();
        assert_eq!(guards, vec![false, true]);

        assert_eq!(bus.event_count(), 2);
        assert_eq!(bus.callback_count(), 3);
    }

    #[test]
    fn test_get_options_combines_names() {
        let bus = Bus::new("options");
        bus.on_with("a", Callback::new(|_| ()), None, Options::new().call_type("sync"));
        bus.on("b", Callback::future(|_| async { Ok(None) }));
        bus.on_with("c", Callback::new(|_| ()), None, Options::new().guard(true));

        assert_eq!(bus.get_type("a"), CallType::Sync);
        assert_eq!(bus.get_type("a b"), CallType::Async);
        assert_eq!(bus.get_type("missing"), CallType::Unset);
        assert!(bus.get_options("a c").guard);
        assert!(!bus.get_options("a b").guard);
    }

    #[tokio::test]
    async fn test_trigger_defer_fires_later() {
        let bus = Bus::new("defer");
        let (cb, calls) = counter();
        bus.on("x", cb);

        bus.trigger_defer("x", &[]).unwrap();
        assert_eq!(hits(&calls), 0);

        for _ in 0..50 {
            if bus.stats().deferred.delivered == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hits(&calls), 1);
    }

    #[test]
    fn test_trigger_defer_without_runtime() {
        let bus = Bus::new("defer-none");
        let err = bus.trigger_defer("x", &[]).unwrap_err();
        assert!(matches!(err, Error::NoRuntime { .. }));
    }

    #[test]
    fn test_stats() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        a.on("x y", Callback::new(|_| ()));
        b.listen_to(&a, "x", Callback::new(|_| ())).unwrap();

        let stats = a.stats();
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.callback_count, 3);
        assert_eq!(stats.listened_by, 1);
        assert_eq!(b.stats().listening_to, 1);
        assert_eq!(
            stats.to_string(),
            "Bus 'a': 2 events, 3 callbacks, listening to 0, listened by 1, \
             deferred 0 queued, 0 delivered, 0 failed"
        );
    }

    #[test]
    fn test_weak_bus() {
        let bus = Bus::new("weak");
        let weak = bus.downgrade();
        assert!(weak.ptr_eq(&bus.downgrade()));
        assert_eq!(weak.upgrade().map(|b| b.id()), Some(bus.id()));
        drop(bus);
        assert!(weak.upgrade().is_none());
    }
}
