//! Cross-object listening ledger.
//!
//! When bus A listens to target B, A keeps one [`Listening`] record per
//! target. For a compatible target (another [`Bus`]) every registration made
//! on B on A's behalf holds a reference on that record, and B also files the
//! record under A's id, so that removal on either side keeps both ledgers
//! consistent. A foreign target that only implements [`Listenable`] is
//! tracked in interop mode: the record mirrors the registrations in a
//! shadow table of its own.
//!
//! A record detaches itself from both ledgers exactly once, when its
//! reference count drops to zero or its shadow table empties.

use crate::bus::{Bus, WeakBus};
use crate::event::{Context, Names};
use crate::registry::{EventTable, Options};
use crate::subscription::Callback;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The contract a listen target has to offer.
///
/// [`Bus`] implements it and is recognised as compatible through
/// [`Listenable::probe`]. Other implementors are driven through `on`/`off`
/// only and are tracked in interop mode.
pub trait Listenable: Send + Sync {
    /// A stable identity for this target
    fn listen_id(&self) -> Uuid;

    /// Report whether this target is a compatible bus
    fn probe(&self) -> Probe {
        Probe::Incompatible
    }

    /// Whether registrations under `names` are currently blocked
    fn is_guarded(&self, _names: &Names) -> Result<bool> {
        Ok(false)
    }

    /// Register `callback` under `names` with `context` as receiver.
    /// `callback` is absent when `names` is an event map.
    fn on(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()>;

    /// Remove registrations matching `names`, `callback` and `context`
    fn off(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()>;
}

/// Outcome of probing a listen target
#[derive(Debug)]
pub enum Probe {
    /// The target is a bus and takes part in reference counting
    Compatible(Bus),
    /// The target is foreign
    Incompatible,
    /// Probing failed; treated as incompatible
    Failed(Error),
}

/// The listened-to side of a listening record
pub(crate) enum Remote {
    Bus(WeakBus),
    Foreign(Arc<dyn Listenable>),
}

/// "This bus is listening to that target for at least one event."
pub(crate) struct Listening {
    /// Key in the listener's listening-to map
    target_id: Uuid,
    /// Key in the target's listened-by map
    listener_id: Uuid,
    listener: WeakBus,
    remote: Remote,
    count: AtomicUsize,
    shadow: Option<Mutex<EventTable>>,
    detached: AtomicBool,
}

impl Listening {
    pub(crate) fn new(listener: &Bus, target_id: Uuid, remote: Remote) -> Self {
        let shadow = match remote {
            Remote::Bus(_) => None,
            Remote::Foreign(_) => Some(Mutex::new(EventTable::new())),
        };
        Self {
            target_id,
            listener_id: listener.id(),
            listener: listener.downgrade(),
            remote,
            count: AtomicUsize::new(0),
            shadow,
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn target_id(&self) -> Uuid {
        self.target_id
    }

    pub(crate) fn listener_id(&self) -> Uuid {
        self.listener_id
    }

    pub(crate) fn remote(&self) -> &Remote {
        &self.remote
    }

    pub(crate) fn is_interop(&self) -> bool {
        self.shadow.is_some()
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Nothing tracked, neither by count nor by shadow
    pub(crate) fn is_idle(&self) -> bool {
        match &self.shadow {
            Some(shadow) => shadow.lock().is_empty(),
            None => self.count() == 0,
        }
    }

    /// One more registration depends on this record
    pub(crate) fn retain(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Mirror a foreign registration in the shadow table
    pub(crate) fn shadow_on(&self, names: &Names, callback: Option<&Callback>) {
        let Some(shadow) = &self.shadow else {
            return;
        };
        let mut shadow = shadow.lock();
        crate::event::resolve(
            |(), name, callback, _| {
                if let Some(name) = name {
                    shadow.add(name, callback, None, Options::default(), None);
                }
            },
            (),
            names,
            callback,
            &mut crate::event::Resolve::default(),
        );
    }

    /// A registration tracked by this record went away.
    ///
    /// Reference-counted records drop one reference; interop records remove
    /// the matching shadow entries. Either way the record detaches once
    /// nothing is left.
    pub(crate) fn release(&self, names: &Names, callback: Option<&Callback>) {
        let empty = match &self.shadow {
            Some(shadow) => {
                let mut shadow = shadow.lock();
                crate::event::resolve(
                    |(), name, callback, _| {
                        if name.is_none() && callback.is_none() {
                            shadow.clear();
                        } else {
                            shadow.remove(name, callback, None);
                        }
                    },
                    (),
                    names,
                    callback,
                    &mut crate::event::Resolve::default(),
                );
                shadow.is_empty()
            }
            None => {
                let previous = self
                    .count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .unwrap_or(0);
                previous <= 1
            }
        };

        if empty {
            self.cleanup();
        }
    }

    /// Remove this record from both ledgers. Only the first call acts.
    pub(crate) fn cleanup(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.forget_listening(self);
        }
        if let Remote::Bus(target) = &self.remote {
            if let Some(target) = target.upgrade() {
                target.forget_listener(self);
            }
        }

        debug!(
            listener_id = %self.listener_id,
            target_id = %self.target_id,
            interop = self.is_interop(),
            "Listening detached"
        );
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Whether `other` is this very record
    pub(crate) fn is(&self, other: &Arc<Listening>) -> bool {
        std::ptr::eq(self, Arc::as_ptr(other))
    }
}

impl fmt::Debug for Listening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listening")
            .field("listener_id", &self.listener_id)
            .field("target_id", &self.target_id)
            .field("interop", &self.is_interop())
            .field("count", &self.count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Outcome;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// A target that wraps a bus but does not admit to being one.
    #[derive(Clone)]
    struct Foreign {
        id: Uuid,
        inner: Bus,
        fail_on: bool,
        fail_guard: bool,
    }

    impl Foreign {
        fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                inner: Bus::new("foreign"),
                fail_on: false,
                fail_guard: false,
            }
        }
    }

    impl Listenable for Foreign {
        fn listen_id(&self) -> Uuid {
            self.id
        }

        fn is_guarded(&self, names: &Names) -> Result<bool> {
            if self.fail_guard {
                return Err(Error::target("no guard support"));
            }
            Ok(self.inner.is_guarded(names))
        }

        fn on(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()> {
            if self.fail_on {
                return Err(Error::target("refused"));
            }
            self.inner
                .on_with(names, callback.cloned(), context.clone(), Options::default());
            Ok(())
        }

        fn off(&self, names: &Names, callback: Option<&Callback>, context: &Context) -> Result<()> {
            self.inner.off(names, callback, Some(context));
            Ok(())
        }
    }

    fn counter() -> (Callback, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let cb = Callback::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (cb, hits)
    }

    #[test]
    fn test_listen_and_stop_cleans_both_ledgers() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (fn_x, hits) = counter();
        let (direct, direct_hits) = counter();

        b.on("x", direct);
        a.listen_to(&b, "x", fn_x).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(b.listener_count(), 1);

        b.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        a.stop_listening(Some(&b), Names::Any, None).unwrap();
        assert_eq!(a.listening_count(), 0);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(b.callback_count(), 1);

        b.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(direct_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_receives_listener_as_receiver() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let receiver = Arc::new(Mutex::new(None));
        let slot = receiver.clone();
        a.listen_to(
            &b,
            "x",
            Callback::new(move |call| {
                *slot.lock() = call.receiver().bus().map(|bus| bus.name().to_string());
            }),
        )
        .unwrap();
        b.trigger("x", &[]).unwrap();
        assert_eq!(receiver.lock().as_deref(), Some("a"));
    }

    #[test]
    fn test_ref_count_tracks_each_registration() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (cb, _) = counter();
        a.listen_to(&b, "x y z", cb.clone()).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(b.callback_count(), 3);

        b.off("x", None, None);
        assert_eq!(a.listening_count(), 1);
        a.stop_listening(Some(&b), "y", None).unwrap();
        assert_eq!(a.listening_count(), 1);

        // Removing the last one detaches, repeated removal is harmless.
        b.off("z", Some(&cb), None);
        b.off("z", Some(&cb), None);
        assert_eq!(a.listening_count(), 0);
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_target_off_everything_detaches_listeners() {
        let a = Bus::new("a");
        let c = Bus::new("c");
        let b = Bus::new("b");
        let (cb, _) = counter();
        a.listen_to(&b, "x", cb.clone()).unwrap();
        c.listen_to(&b, "y", cb).unwrap();
        assert_eq!(b.listener_count(), 2);

        b.off_all();
        assert_eq!(b.callback_count(), 0);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(a.listening_count(), 0);
        assert_eq!(c.listening_count(), 0);
    }

    #[test]
    fn test_stop_listening_everything() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let c = Bus::new("c");
        let (cb, _) = counter();
        a.listen_to(&b, "x", cb.clone()).unwrap();
        a.listen_to(&c, "x", cb).unwrap();
        assert_eq!(a.listening_count(), 2);

        a.stop_listening(None, Names::Any, None).unwrap();
        assert_eq!(a.listening_count(), 0);
        assert_eq!(b.callback_count() + c.callback_count(), 0);
    }

    #[test]
    fn test_interop_target_uses_shadow_table() {
        let a = Bus::new("a");
        let foreign = Foreign::new();
        let (cb, hits) = counter();

        a.listen_to(&foreign, "x y", cb.clone()).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(foreign.inner.callback_count(), 2);

        foreign.inner.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        a.stop_listening(Some(&foreign), "x", None).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(foreign.inner.callback_count(), 1);

        a.stop_listening(Some(&foreign), "y", Some(&cb)).unwrap();
        assert_eq!(a.listening_count(), 0);
        assert_eq!(foreign.inner.callback_count(), 0);
    }

    #[test]
    fn test_interop_failure_propagates_and_leaves_no_record() {
        let a = Bus::new("a");
        let mut foreign = Foreign::new();
        foreign.fail_on = true;
        let (cb, _) = counter();

        let err = a.listen_to(&foreign, "x", cb.clone()).unwrap_err();
        assert_eq!(err, Error::target("refused"));
        assert_eq!(a.listening_count(), 0);

        // Unrelated listening afterwards works normally.
        let b = Bus::new("b");
        a.listen_to(&b, "x", cb).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(b.listener_count(), 1);
    }

    #[test]
    fn test_interop_guard_failure_fails_open() {
        let a = Bus::new("a");
        let mut foreign = Foreign::new();
        foreign.fail_guard = true;
        let (cb, _) = counter();
        a.listen_to(&foreign, "x", cb).unwrap();
        assert_eq!(foreign.inner.callback_count(), 1);
    }

    #[test]
    fn test_listen_to_guarded_target_is_noop() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        b.on_with("x", Callback::new(|_| ()), None, Options::new().guard(true));
        let (cb, _) = counter();
        a.listen_to(&b, "x", cb).unwrap();
        assert_eq!(b.callback_count(), 1);
        assert_eq!(a.listening_count(), 0);
    }

    #[test]
    fn test_release_and_cleanup_are_idempotent() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (cb, _) = counter();
        a.listen_to(&b, "x", cb).unwrap();
        let listening = a.listening_to(b.id()).unwrap();

        listening.release(&Names::from("x"), None);
        assert!(listening.is_detached());
        listening.release(&Names::from("x"), None);
        listening.cleanup();
        assert_eq!(listening.count(), 0);
        assert_eq!(a.listening_count(), 0);
    }

    #[test]
    fn test_listen_to_once() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (cb, hits) = counter();
        a.listen_to_once(&b, "x", cb).unwrap();

        b.trigger("x", &[]).unwrap();
        b.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.callback_count(), 0);
        assert_eq!(a.listening_count(), 0);
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_interop_listen_to_once_detaches() {
        let a = Bus::new("a");
        let foreign = Foreign::new();
        let (cb, hits) = counter();
        a.listen_to_once(&foreign, "x y", cb).unwrap();
        assert_eq!(a.listening_count(), 1);
        assert_eq!(foreign.inner.callback_count(), 2);

        foreign.inner.trigger("x", &[]).unwrap();
        foreign.inner.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(a.listening_count(), 1);
        assert_eq!(foreign.inner.callback_count(), 1);

        foreign.inner.trigger("y", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(a.listening_count(), 0);
        assert_eq!(foreign.inner.callback_count(), 0);
    }

    #[test]
    fn test_listen_to_before() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let cb = Callback::new(|call| json!(call.args().len()));
        a.listen_to_before(2, &b, "x", cb).unwrap();

        let first = b.trigger_sync("x", &[json!(1)]).unwrap();
        assert!(matches!(first.one(), Some(Outcome::Value(v)) if v == json!(1)));
        b.trigger("x", &[]).unwrap();
        assert_eq!(b.callback_count(), 0);
        assert_eq!(a.listening_count(), 0);

        assert!(a.listen_to_before(0, &b, "x", Callback::new(|_| ())).is_err());
    }

    #[test]
    fn test_stop_listening_by_original_removes_once_wrapper() {
        let a = Bus::new("a");
        let b = Bus::new("b");
        let (cb, hits) = counter();
        a.listen_to_once(&b, "x", cb.clone()).unwrap();
        a.stop_listening(Some(&b), "x", Some(&cb)).unwrap();
        b.trigger("x", &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(a.listening_count(), 0);
    }
}
