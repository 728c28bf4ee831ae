//! Callbacks and the values they return.

use crate::dispatcher::Collected;
use crate::event::Call;
use crate::registry::CallType;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use uuid::Uuid;

/// Type alias for the erased callback body
pub type HandlerFn = dyn Fn(&Call<'_>) -> Result<Outcome> + Send + Sync;

/// A registered event callback.
///
/// Clones share identity: removing by any clone removes the registration.
/// Callbacks built with [`Callback::future`] are recognised as async and
/// always register with [`CallType::Async`].
#[derive(Clone)]
pub struct Callback {
    id: Uuid,
    original: Option<Uuid>,
    call_type: CallType,
    function: Arc<HandlerFn>,
}

impl Callback {
    /// Create a callback from a closure returning anything convertible into
    /// an [`Outcome`] (`()`, a [`Value`], an `Option<Value>` or a [`Pending`]).
    pub fn new<F, R>(function: F) -> Self
    where
        F: Fn(&Call<'_>) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        Self::from_fn(CallType::Unset, move |call| Ok(function(call).into()))
    }

    /// Create a callback whose body may fail. An error aborts the dispatch
    /// pass and is returned to the trigger caller.
    pub fn fallible<F, R>(function: F) -> Self
    where
        F: Fn(&Call<'_>) -> Result<R> + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        Self::from_fn(CallType::Unset, move |call| function(call).map(Into::into))
    }

    /// Create an async callback. Each invocation returns a [`Pending`]
    /// driving the produced future.
    pub fn future<F, Fut>(function: F) -> Self
    where
        F: Fn(&Call<'_>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self::from_fn(CallType::Async, move |call| {
            Ok(Outcome::Pending(Pending::new(function(call))))
        })
    }

    fn from_fn<F>(call_type: CallType, function: F) -> Self
    where
        F: Fn(&Call<'_>) -> Result<Outcome> + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            original: None,
            call_type,
            function: Arc::new(function),
        }
    }

    /// A wrapper around `original` with a preassigned identity.
    pub(crate) fn wrapping(id: Uuid, original: &Callback, function: Arc<HandlerFn>) -> Self {
        Self {
            id,
            original: Some(original.id),
            call_type: original.call_type,
            function,
        }
    }

    /// A body-less callback carrying only an identity, used to remove the
    /// registration with that identity.
    pub(crate) fn key(id: Uuid) -> Self {
        Self {
            id,
            original: None,
            call_type: CallType::Unset,
            function: Arc::new(|_| Ok(Outcome::Nothing)),
        }
    }

    /// The callback identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity of the callback this one wraps (once/before)
    pub fn original(&self) -> Option<Uuid> {
        self.original
    }

    /// The call type this callback forces on registration
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Whether this callback was built from an async function
    pub fn is_async(&self) -> bool {
        self.call_type == CallType::Async
    }

    /// Whether `other` identifies this callback, directly or as the
    /// callback this one wraps.
    pub fn matches(&self, other: &Callback) -> bool {
        self.id == other.id || self.original == Some(other.id)
    }

    /// Invoke the callback body
    pub fn invoke(&self, call: &Call<'_>) -> Result<Outcome> {
        (self.function)(call)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("original", &self.original)
            .field("call_type", &self.call_type)
            .finish()
    }
}

/// What a single callback invocation produced.
#[derive(Clone, Debug, Default)]
pub enum Outcome {
    /// No value. Not collected by sync/async triggers.
    #[default]
    Nothing,

    /// A ready value (`Value::Null` counts as a value)
    Value(Value),

    /// A value that is still being computed
    Pending(Pending),
}

impl Outcome {
    /// Whether this is the "no value" outcome
    pub fn is_nothing(&self) -> bool {
        matches!(self, Outcome::Nothing)
    }

    /// The ready value, if any
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Whether this outcome is still pending
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }

    /// Wait for the outcome to settle.
    pub async fn settle(self) -> Result<Collected<Value>> {
        match self {
            Outcome::Nothing => Ok(Collected::None),
            Outcome::Value(value) => Ok(Collected::One(value)),
            Outcome::Pending(pending) => pending.await,
        }
    }
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::Nothing
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<Option<Value>> for Outcome {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Outcome::Nothing, Outcome::Value)
    }
}

impl From<Pending> for Outcome {
    fn from(pending: Pending) -> Self {
        Outcome::Pending(pending)
    }
}

/// A shared, cloneable pending result.
///
/// Resolves to the collected shape of whatever it wraps: `None` for no
/// value, `One` for a single value, `Many` for an aggregate of several
/// callbacks.
#[derive(Clone)]
pub struct Pending {
    inner: Shared<BoxFuture<'static, Result<Collected<Value>>>>,
}

impl Pending {
    /// Wrap a future producing an optional value
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self::collected(async move { future.await.map(Collected::from) })
    }

    /// An already resolved pending value
    pub fn ready(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::collected(async move { Ok(Collected::One(value)) })
    }

    /// An already rejected pending value
    pub fn rejected(error: Error) -> Self {
        Self::collected(async move { Err(error) })
    }

    pub(crate) fn collected<F>(future: F) -> Self
    where
        F: Future<Output = Result<Collected<Value>>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }
}

impl Future for Pending {
    type Output = Result<Collected<Value>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(settled) => f.debug_tuple("Pending").field(settled).finish(),
            None => f.write_str("Pending(<unsettled>)"),
        }
    }
}
