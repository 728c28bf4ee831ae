//! A bus proxy that remembers what was registered through it.

use crate::bus::Bus;
use crate::dispatcher::Collected;
use crate::event::{resolve, Context, Names, Resolve};
use crate::registry::Options;
use crate::subscription::{Callback, Outcome};
use crate::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use tracing::debug;

struct Tracked {
    name: String,
    callback: Callback,
    context: Option<Context>,
}

impl Tracked {
    fn matches(&self, name: Option<&str>, callback: Option<&Callback>, context: Option<&Context>) -> bool {
        name.map_or(true, |name| self.name == name)
            && callback.map_or(true, |cb| self.callback.matches(cb))
            && context.map_or(true, |ctx| {
                self.context.as_ref().is_some_and(|own| own.same(ctx))
            })
    }
}

/// Forwards to a [`Bus`] and keeps a side ledger of every registration
/// made through it, so they can all be removed with [`BusProxy::dispose`].
///
/// Removal goes by name, callback and context. A registration made on the
/// bus directly with the same callback and context under the same name is
/// removed along with the proxy's own.
pub struct BusProxy {
    bus: Bus,
    tracked: Mutex<Vec<Tracked>>,
}

impl BusProxy {
    /// Create a proxy for `bus`
    pub fn new(bus: &Bus) -> Self {
        Self {
            bus: bus.clone(),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// The proxied bus
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Number of registrations made through the proxy that are still on
    /// the bus
    pub fn tracked_count(&self) -> usize {
        let mut tracked = self.tracked.lock();
        self.prune(&mut tracked);
        tracked.len()
    }

    // Drops entries whose registration left the bus, e.g. exhausted
    // once/before wrappers.
    fn prune(&self, tracked: &mut Vec<Tracked>) {
        let table = self.bus.table().lock();
        tracked.retain(|t| {
            table
                .snapshot(&t.name)
                .iter()
                .any(|reg| reg.matches(Some(&t.callback), t.context.as_ref()))
        });
    }

    fn track(&self, names: &Names, callback: Option<&Callback>, context: Option<Context>) {
        if !self.bus.guarded_names(names).is_empty() {
            return;
        }
        let mut tracked = self.tracked.lock();
        self.prune(&mut tracked);
        resolve(
            |(), name, callback, opts| {
                if let (Some(name), Some(callback)) = (name, callback) {
                    tracked.push(Tracked {
                        name: name.to_string(),
                        callback: callback.clone(),
                        context: opts.context.clone(),
                    });
                }
            },
            (),
            names,
            callback,
            &mut Resolve::with_context(context),
        );
    }

    /// See [`Bus::on`]
    pub fn on(&self, names: impl Into<Names>, callback: impl Into<Option<Callback>>) -> &Self {
        self.on_with(names, callback, None, Options::default())
    }

    /// See [`Bus::on_with`]
    pub fn on_with(
        &self,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> &Self {
        let (names, callback, context) = (names.into(), callback.into(), context.into());
        self.track(&names, callback.as_ref(), context.clone());
        self.bus.on_with(&names, callback, context, options);
        self
    }

    /// See [`Bus::once`]
    pub fn once(&self, names: impl Into<Names>, callback: impl Into<Option<Callback>>) -> &Self {
        self.once_with(names, callback, None, Options::default())
    }

    /// See [`Bus::once_with`]
    pub fn once_with(
        &self,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> &Self {
        let (names, callback, context) = (names.into(), callback.into(), context.into());
        self.track(&names, callback.as_ref(), context.clone());
        self.bus.once_with(&names, callback, context, options);
        self
    }

    /// See [`Bus::before`]
    pub fn before(
        &self,
        count: usize,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
    ) -> Result<&Self> {
        self.before_with(count, names, callback, None, Options::default())
    }

    /// See [`Bus::before_with`]
    pub fn before_with(
        &self,
        count: usize,
        names: impl Into<Names>,
        callback: impl Into<Option<Callback>>,
        context: impl Into<Option<Context>>,
        options: Options,
    ) -> Result<&Self> {
        let (names, callback, context) = (names.into(), callback.into(), context.into());
        crate::subscription::check_count(count)?;
        self.track(&names, callback.as_ref(), context.clone());
        self.bus.before_with(count, &names, callback, context, options)?;
        Ok(self)
    }

    /// See [`Bus::off`]. Matching ledger entries are dropped as well.
    pub fn off(
        &self,
        names: impl Into<Names>,
        callback: Option<&Callback>,
        context: Option<&Context>,
    ) -> &Self {
        let names = names.into();
        {
            let mut tracked = self.tracked.lock();
            resolve(
                |(), name, callback, opts| {
                    tracked.retain(|t| !t.matches(name, callback, opts.context.as_ref()));
                },
                (),
                &names,
                callback,
                &mut Resolve::with_context(context.cloned()),
            );
        }
        self.bus.off(&names, callback, context);
        self
    }

    /// See [`Bus::trigger`]
    pub fn trigger(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.bus.trigger(names, args)?;
        Ok(self)
    }

    /// See [`Bus::trigger_sync`]
    pub fn trigger_sync(&self, names: impl Into<Names>, args: &[Value]) -> Result<Collected<Outcome>> {
        self.bus.trigger_sync(names, args)
    }

    /// See [`Bus::trigger_async`]
    pub fn trigger_async(
        &self,
        names: impl Into<Names>,
        args: &[Value],
    ) -> BoxFuture<'static, Result<Collected<Value>>> {
        self.bus.trigger_async(names, args)
    }

    /// See [`Bus::trigger_defer`]
    pub fn trigger_defer(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.bus.trigger_defer(names, args)?;
        Ok(self)
    }

    /// Remove every registration made through this proxy and empty the
    /// ledger. Returns how many ledger entries were processed.
    pub fn dispose(&self) -> usize {
        let tracked = {
            let mut tracked = self.tracked.lock();
            self.prune(&mut tracked);
            std::mem::take(&mut *tracked)
        };
        let count = tracked.len();
        for entry in tracked {
            self.bus
                .off(entry.name.as_str(), Some(&entry.callback), entry.context.as_ref());
        }
        debug!(bus = self.bus.name(), count, "Proxy disposed");
        count
    }
}

impl fmt::Debug for BusProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusProxy")
            .field("bus", &self.bus)
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
