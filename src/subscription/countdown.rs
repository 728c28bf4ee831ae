//! Count-limited callback wrappers behind `once` and `before`.

use crate::subscription::{Callback, HandlerFn, Outcome};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Runs once when a wrapper is exhausted, typically removing it.
pub(crate) type AfterHook = Box<dyn FnOnce() -> Result<()> + Send>;

struct State {
    remaining: usize,
    callback: Option<Callback>,
    after: Option<AfterHook>,
    last: Outcome,
}

/// Validate a before/once count
pub(crate) fn check_count(count: usize) -> Result<usize> {
    if count == 0 {
        return Err(Error::InvalidCount { count });
    }
    Ok(count)
}

/// Wrap `callback` so that it runs at most `count` times.
///
/// `make_after` receives a removal key for the wrapper (a callback sharing
/// the wrapper's identity) and returns the hook to run on exhaustion. The
/// hook runs exactly once, before the final invocation of `callback`, and
/// both are dropped afterwards. A hook error is returned after that final
/// invocation. Later invocations return the last outcome without calling
/// `callback` again.
pub(crate) fn wrap_before<M>(count: usize, callback: &Callback, make_after: M) -> Callback
where
    M: FnOnce(Callback) -> AfterHook,
{
    let id = Uuid::new_v4();
    let state = Arc::new(Mutex::new(State {
        remaining: count,
        callback: Some(callback.clone()),
        after: Some(make_after(Callback::key(id))),
        last: Outcome::Nothing,
    }));

    let function: Arc<HandlerFn> = Arc::new(move |call| {
        // State changes before any callout so re-entrant triggers see the
        // decremented count.
        let (callback, after) = {
            let mut state = state.lock();
            let Some(callback) = state.callback.clone() else {
                return Ok(state.last.clone());
            };
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                state.callback = None;
                (callback, state.after.take())
            } else {
                (callback, None)
            }
        };

        let hooked = match after {
            Some(after) => {
                trace!(callback_id = %callback.id(), event = call.name(), "Countdown exhausted");
                after()
            }
            None => Ok(()),
        };

        // The final call still runs when the hook fails.
        let outcome = callback.invoke(call)?;
        state.lock().last = outcome.clone();
        hooked?;
        Ok(outcome)
    });

    Callback::wrapping(id, callback, function)
}
