//! Registration contexts and the per-invocation call view.

use crate::bus::{Bus, WeakBus};
use crate::subscription::Callback;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An identity handle attached to a registration.
///
/// The context is matched by identity when removing registrations and is
/// handed to the callback as its receiver. Clones share identity.
#[derive(Clone)]
pub enum Context {
    /// A bus, held weakly so that listening does not keep buses alive
    Bus(WeakBus),

    /// Any shared value
    Value(Arc<dyn Any + Send + Sync>),

    /// A callback standing in as context (map-form calls)
    Callback(Callback),
}

impl Context {
    /// Wrap a value in a fresh context
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Context::Value(Arc::new(value))
    }

    /// Wrap an already shared value; clones of `value` share identity
    pub fn shared(value: Arc<dyn Any + Send + Sync>) -> Self {
        Context::Value(value)
    }

    /// Identity comparison
    pub fn same(&self, other: &Context) -> bool {
        match (self, other) {
            (Context::Bus(a), Context::Bus(b)) => a.ptr_eq(b),
            (Context::Value(a), Context::Value(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Context::Callback(a), Context::Callback(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    /// Downcast a value context
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Context::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// The bus behind a bus context, if it is still alive
    pub fn bus(&self) -> Option<Bus> {
        match self {
            Context::Bus(weak) => weak.upgrade(),
            _ => None,
        }
    }
}

impl From<&Bus> for Context {
    fn from(bus: &Bus) -> Self {
        Context::Bus(bus.downgrade())
    }
}

impl From<&Callback> for Context {
    fn from(callback: &Callback) -> Self {
        Context::Callback(callback.clone())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Bus(weak) => match weak.upgrade() {
                Some(bus) => write!(f, "Context::Bus({:?})", bus.name()),
                None => f.write_str("Context::Bus(<dropped>)"),
            },
            Context::Value(value) => write!(f, "Context::Value({:p})", Arc::as_ptr(value)),
            Context::Callback(cb) => write!(f, "Context::Callback({})", cb.id()),
        }
    }
}

/// What a callback sees when it is invoked.
#[derive(Clone, Copy)]
pub struct Call<'a> {
    bus: &'a Bus,
    context: Option<&'a Context>,
    name: &'a str,
    args: &'a [Value],
}

impl<'a> Call<'a> {
    pub(crate) fn new(
        bus: &'a Bus,
        context: Option<&'a Context>,
        name: &'a str,
        args: &'a [Value],
    ) -> Self {
        Self {
            bus,
            context,
            name,
            args,
        }
    }

    /// The bus that fired this call
    pub fn bus(&self) -> &'a Bus {
        self.bus
    }

    /// The event name the callback was registered under
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Positional arguments. For `all` callbacks the first argument is the
    /// triggered event name.
    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    /// A single positional argument
    pub fn arg(&self, index: usize) -> Option<&'a Value> {
        self.args.get(index)
    }

    /// The registration context, if one was given
    pub fn context(&self) -> Option<&'a Context> {
        self.context
    }

    /// The receiver: the registration context, or the firing bus
    pub fn receiver(&self) -> Context {
        match self.context {
            Some(context) => context.clone(),
            None => Context::from(self.bus),
        }
    }
}

impl fmt::Debug for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("bus", &self.bus.name())
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}
