//! A trigger-and-inspect-only view of a bus.

use crate::bus::Bus;
use crate::dispatcher::Collected;
use crate::event::Names;
use crate::registry::{CallType, Entries, Keys, Options};
use crate::subscription::Outcome;
use crate::{Error, Result};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Exposes only the trigger and introspection operations of a [`Bus`].
///
/// Holders of a `SecureBus` cannot register or remove callbacks. The view
/// can be destroyed, after which every operation fails with
/// [`Error::Destroyed`], and rebound to another bus.
pub struct SecureBus {
    bus: RwLock<Option<Bus>>,
}

impl SecureBus {
    /// Create a view of `bus`
    pub fn new(bus: &Bus) -> Self {
        Self {
            bus: RwLock::new(Some(bus.clone())),
        }
    }

    // The handle is cloned out so no lock is held while callbacks run.
    fn bound(&self) -> Result<Bus> {
        self.bus.read().clone().ok_or(Error::Destroyed)
    }

    /// Unbind from the bus
    pub fn destroy(&self) {
        if let Some(bus) = self.bus.write().take() {
            debug!(bus = bus.name(), "Secure bus destroyed");
        }
    }

    /// Whether [`SecureBus::destroy`] was called and no rebind followed
    pub fn is_destroyed(&self) -> bool {
        self.bus.read().is_none()
    }

    /// Bind to another bus, reviving a destroyed view
    pub fn rebind(&self, bus: &Bus) {
        debug!(bus = bus.name(), "Secure bus rebound");
        *self.bus.write() = Some(bus.clone());
    }

    /// The name of the bound bus
    pub fn name(&self) -> Result<String> {
        Ok(self.bound()?.name().to_string())
    }

    /// See [`Bus::trigger`]
    pub fn trigger(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.bound()?.trigger(names, args)?;
        Ok(self)
    }

    /// See [`Bus::trigger_sync`]
    pub fn trigger_sync(&self, names: impl Into<Names>, args: &[Value]) -> Result<Collected<Outcome>> {
        self.bound()?.trigger_sync(names, args)
    }

    /// See [`Bus::trigger_async`]
    pub fn trigger_async(
        &self,
        names: impl Into<Names>,
        args: &[Value],
    ) -> BoxFuture<'static, Result<Collected<Value>>> {
        match self.bound() {
            Ok(bus) => bus.trigger_async(names, args),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    /// See [`Bus::trigger_defer`]
    pub fn trigger_defer(&self, names: impl Into<Names>, args: &[Value]) -> Result<&Self> {
        self.bound()?.trigger_defer(names, args)?;
        Ok(self)
    }

    /// See [`Bus::entries`]
    pub fn entries(&self, filter: Option<&Regex>) -> Result<Entries> {
        Ok(self.bound()?.entries(filter))
    }

    /// See [`Bus::keys`]
    pub fn keys(&self, filter: Option<&Regex>) -> Result<Keys> {
        Ok(self.bound()?.keys(filter))
    }

    /// See [`Bus::event_count`]
    pub fn event_count(&self) -> Result<usize> {
        Ok(self.bound()?.event_count())
    }

    /// See [`Bus::callback_count`]
    pub fn callback_count(&self) -> Result<usize> {
        Ok(self.bound()?.callback_count())
    }

    /// See [`Bus::get_options`]
    pub fn get_options(&self, names: impl Into<Names>) -> Result<Options> {
        Ok(self.bound()?.get_options(names))
    }

    /// See [`Bus::get_type`]
    pub fn get_type(&self, names: impl Into<Names>) -> Result<CallType> {
        Ok(self.bound()?.get_type(names))
    }

    /// See [`Bus::is_guarded`]
    pub fn is_guarded(&self, names: impl Into<Names>) -> Result<bool> {
        Ok(self.bound()?.is_guarded(names))
    }
}

impl fmt::Debug for SecureBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBus")
            .field("bus", &*self.bus.read())
            .finish()
    }
}
