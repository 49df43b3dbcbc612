// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cooperative task-priority-level dispatching.
//!
//! Firmware drivers do not run on threads. Code runs at a task priority
//! level (TPL); raising the level masks notifications at or below it, and
//! lowering it again runs every notification that was held back, highest
//! level first. This crate models that scheduler for the vmbus stack:
//!
//! * [`Dispatcher::raise`] returns a [`TplGuard`] that restores the previous
//!   level (and dispatches pending notifications) when dropped.
//! * [`Event`]s are either wait-only or carry a notification function that
//!   runs at the event's level when the event is signaled.
//! * [`Dispatcher::wait_for_event`] blocks by polling the registered
//!   [`InterruptSource`]s, which is how simulated hardware delivers
//!   interrupts.

use parking_lot::Mutex;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// A task priority level.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tpl(pub u8);

impl Tpl {
    /// The level at which ordinary driver code runs.
    pub const APPLICATION: Self = Self(4);
    /// The level used for most asynchronous callbacks.
    pub const CALLBACK: Self = Self(8);
    /// The level used for notifications that must not be interrupted by
    /// ordinary callbacks.
    pub const NOTIFY: Self = Self(16);
    /// The highest level. Nothing is dispatched while running here.
    pub const HIGH_LEVEL: Self = Self(31);

    /// Returns the level `n` steps above this one.
    pub const fn above(self, n: u8) -> Self {
        Self(self.0 + n)
    }

    /// Returns the level `n` steps below this one.
    pub const fn below(self, n: u8) -> Self {
        Self(self.0 - n)
    }
}

impl Debug for Tpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::APPLICATION => f.pad("APPLICATION"),
            Self::CALLBACK => f.pad("CALLBACK"),
            Self::NOTIFY => f.pad("NOTIFY"),
            Self::HIGH_LEVEL => f.pad("HIGH_LEVEL"),
            Self(n) => write!(f, "Tpl({n})"),
        }
    }
}

/// The level at which the vmbus root dispatches SynIC messages and event
/// flags.
pub const TPL_VMBUS: Tpl = Tpl::HIGH_LEVEL.below(1);

/// The level EMCL raises to while touching a channel's completion table and
/// outgoing queue.
pub const TPL_EMCL: Tpl = Tpl::HIGH_LEVEL.below(1);

/// A source of asynchronous interrupts, polled while the dispatcher waits.
pub trait InterruptSource: Send + Sync {
    /// Delivers any pending interrupts. Returns true if anything was
    /// delivered.
    fn poll_interrupts(&self) -> bool;
}

/// An event notification function.
pub type NotifyFn = Box<dyn Fn() + Send + Sync>;

/// The priority-level scheduler shared by every component of one firmware
/// instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<DispatchState>,
    sources: Mutex<Vec<Arc<dyn InterruptSource>>>,
}

struct DispatchState {
    current: Tpl,
    pending: Vec<Arc<EventInner>>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("current", &state.current)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher running at [`Tpl::APPLICATION`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatchState {
                    current: Tpl::APPLICATION,
                    pending: Vec::new(),
                }),
                sources: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the current priority level.
    pub fn current(&self) -> Tpl {
        self.inner.state.lock().current
    }

    /// Raises the priority level to `tpl` until the returned guard is
    /// dropped.
    ///
    /// Panics if `tpl` is below the current level.
    #[must_use]
    pub fn raise(&self, tpl: Tpl) -> TplGuard<'_> {
        let mut state = self.inner.state.lock();
        let prev = state.current;
        assert!(
            tpl >= prev,
            "raising to {tpl:?} while running at {prev:?}"
        );
        state.current = tpl;
        TplGuard {
            dispatcher: self,
            prev,
        }
    }

    /// Lowers the level to `tpl`, first running every pending notification
    /// above it.
    fn restore(&self, tpl: Tpl) {
        loop {
            let mut state = self.inner.state.lock();
            let mut next: Option<usize> = None;
            for (i, event) in state.pending.iter().enumerate() {
                if event.tpl > tpl && next.is_none_or(|n| event.tpl > state.pending[n].tpl) {
                    next = Some(i);
                }
            }
            let Some(i) = next else {
                state.current = tpl;
                return;
            };
            let event = state.pending.remove(i);
            event.queued.store(false, Ordering::SeqCst);
            state.current = event.tpl;
            drop(state);
            event.dispatch();
        }
    }

    /// Creates an event.
    ///
    /// Events with a notification function run it at `tpl` whenever they are
    /// signaled. Events without one can only be waited on.
    pub fn create_event(&self, tpl: Tpl, notify: Option<NotifyFn>) -> Event {
        assert!(
            notify.is_none() || (tpl > Tpl::APPLICATION && tpl < Tpl::HIGH_LEVEL),
            "invalid notification level {tpl:?}"
        );
        Event(Arc::new(EventInner {
            tpl,
            notify,
            signaled: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dispatcher: Arc::downgrade(&self.inner),
        }))
    }

    /// Registers a source of interrupts polled by [`Self::wait_for_event`]
    /// and [`Self::poll`].
    pub fn add_interrupt_source(&self, source: Arc<dyn InterruptSource>) {
        self.inner.sources.lock().push(source);
    }

    /// Polls every interrupt source once. Returns true if any delivered an
    /// interrupt.
    pub fn poll(&self) -> bool {
        let sources = self.inner.sources.lock().clone();
        let mut delivered = false;
        for source in &sources {
            delivered |= source.poll_interrupts();
        }
        delivered
    }

    /// Blocks until `event` is signaled, then clears the signal.
    ///
    /// There is no timeout. Interrupts are delivered by polling, so the wait
    /// only makes progress if the condition is satisfied by something an
    /// interrupt source delivers.
    pub fn wait_for_event(&self, event: &Event) {
        assert!(
            event.0.notify.is_none(),
            "waiting on an event with a notification function"
        );
        loop {
            if event.check() {
                return;
            }
            if !self.poll() {
                std::hint::spin_loop();
            }
        }
    }

    fn queue(&self, event: &Arc<EventInner>) {
        let mut state = self.inner.state.lock();
        event.signaled.store(true, Ordering::SeqCst);
        if event.notify.is_none() || event.queued.load(Ordering::SeqCst) {
            return;
        }
        if event.tpl > state.current {
            let prev = state.current;
            state.current = event.tpl;
            drop(state);
            event.dispatch();
            self.restore(prev);
        } else {
            event.queued.store(true, Ordering::SeqCst);
            state.pending.push(event.clone());
        }
    }
}

/// Restores the previous priority level when dropped.
#[must_use]
pub struct TplGuard<'a> {
    dispatcher: &'a Dispatcher,
    prev: Tpl,
}

impl TplGuard<'_> {
    /// The level that will be restored.
    pub fn previous(&self) -> Tpl {
        self.prev
    }
}

impl Drop for TplGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.restore(self.prev);
    }
}

/// An event, which may be signaled and waited on, and which may carry a
/// notification function.
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

struct EventInner {
    tpl: Tpl,
    notify: Option<NotifyFn>,
    signaled: AtomicBool,
    queued: AtomicBool,
    closed: AtomicBool,
    dispatcher: Weak<DispatcherInner>,
}

impl EventInner {
    fn dispatch(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.signaled.store(false, Ordering::SeqCst);
        if let Some(notify) = &self.notify {
            notify();
        }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("tpl", &self.0.tpl)
            .field("notify", &self.0.notify.is_some())
            .field("signaled", &self.0.signaled.load(Ordering::Relaxed))
            .field("closed", &self.0.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Event {
    /// The level of the event's notification function.
    pub fn tpl(&self) -> Tpl {
        self.0.tpl
    }

    /// Signals the event.
    ///
    /// If the event has a notification function, it runs immediately when
    /// the current level is below the event's, and otherwise once the level
    /// drops. A notification that is already pending is not queued twice.
    pub fn signal(&self) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.0.dispatcher.upgrade() else {
            return;
        };
        Dispatcher { inner }.queue(&self.0);
    }

    /// Returns whether the event was signaled, clearing the signal.
    pub fn check(&self) -> bool {
        self.0.signaled.swap(false, Ordering::SeqCst)
    }

    /// Returns whether the event is signaled without clearing the signal.
    pub fn is_signaled(&self) -> bool {
        self.0.signaled.load(Ordering::SeqCst)
    }

    /// Closes the event. Pending notifications are dropped and later signals
    /// are ignored.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.0.dispatcher.upgrade() {
            let mut state = inner.state.lock();
            if self.0.queued.swap(false, Ordering::SeqCst) {
                state.pending.retain(|e| !Arc::ptr_eq(e, &self.0));
            }
        }
        tracing::trace!(tpl = ?self.0.tpl, "event closed");
    }

    /// Returns whether `self` and `other` refer to the same event.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
