//! Deadline-ordered timer registry.
//!
//! A [`Chronology`] keeps pending deadlines on a skip list keyed by
//! `Instant` and fires the due ones when whoever owns the clock calls
//! [`Chronology::advance`]. Each callback dispatches through its timer's
//! strand, so timer completions obey the same serialization as every
//! other socket event.
//!
//! The front observer exists for the poll loop: whenever the earliest
//! deadline changes, the observer runs so the poller can shorten its
//! timeout.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::skiplist::{SkipList, SkipListHandle, Status};
use crate::strand::{Executor, ExecutorRef, Functor, Strand};

struct ScheduledEntry {
    strand: Option<Strand>,
    callback: Functor,
}

struct ChronologyInner {
    executor: ExecutorRef,
    deadlines: Mutex<SkipList<Instant, ScheduledEntry>>,
    front_observer: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Shared deadline registry.
#[derive(Clone)]
pub struct Chronology {
    inner: Arc<ChronologyInner>,
}

impl Chronology {
    #[must_use]
    pub fn new(executor: ExecutorRef) -> Self {
        Self {
            inner: Arc::new(ChronologyInner {
                executor,
                deadlines: Mutex::new(SkipList::new()),
                front_observer: Mutex::new(None),
            }),
        }
    }

    /// Install the callback to run whenever the earliest deadline moves
    /// closer. Replaces any previous observer.
    pub fn set_front_observer(&self, observer: Box<dyn Fn() + Send + Sync>) {
        *self.inner.front_observer.lock() = Some(observer);
    }

    fn notify_front(&self) {
        if let Some(observer) = self.inner.front_observer.lock().as_ref() {
            observer();
        }
    }

    /// Schedule `callback` to run at `deadline`, dispatched through
    /// `strand` when given.
    pub fn schedule(
        &self,
        deadline: Instant,
        strand: Option<Strand>,
        callback: Functor,
    ) -> Arc<Timer> {
        let (handle, new_front) = self
            .inner
            .deadlines
            .lock()
            .add_right(deadline, ScheduledEntry { strand, callback });

        if new_front {
            self.notify_front();
        }

        Arc::new(Timer {
            chronology: Arc::downgrade(&self.inner),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The earliest pending deadline.
    #[must_use]
    pub fn earliest(&self) -> Option<Instant> {
        let deadlines = self.inner.deadlines.lock();
        deadlines.front().and_then(|h| deadlines.key(h).copied())
    }

    /// Number of pending deadlines.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.deadlines.lock().length()
    }

    /// Fire every deadline at or before `now`. Returns the number fired.
    pub fn advance(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut deadlines = self.inner.deadlines.lock();
            while let Some(front) = deadlines.front() {
                match deadlines.key(front) {
                    Some(deadline) if *deadline <= now => {}
                    _ => break,
                }
                if let Some(entry) = deadlines.take(front) {
                    due.push(entry);
                }
            }
        }

        let fired = due.len();
        for entry in due {
            match entry.strand {
                Some(strand) => strand.execute(entry.callback),
                None => self.inner.executor.execute(entry.callback),
            }
        }
        fired
    }
}

/// Handle to one scheduled deadline.
///
/// Cancellation and firing race benignly: whichever happens second finds
/// the skip-list node gone and does nothing.
pub struct Timer {
    chronology: Weak<ChronologyInner>,
    handle: Mutex<Option<SkipListHandle>>,
}

impl Timer {
    /// Cancel the pending deadline. Returns true when the timer had not
    /// fired yet. Idempotent.
    pub fn cancel(&self) -> bool {
        let Some(handle) = self.handle.lock().take() else {
            return false;
        };
        let Some(inner) = self.chronology.upgrade() else {
            return false;
        };
        let removed = inner.deadlines.lock().take(handle).is_some();
        removed
    }

    /// Alias of [`Timer::cancel`]; queue entries close their timer when
    /// the guarded operation completes first.
    pub fn close(&self) -> bool {
        self.cancel()
    }

    /// Move the pending deadline, preserving scheduling order among equal
    /// deadlines. Returns false when the timer already fired.
    pub fn reschedule(&self, new_deadline: Instant) -> bool {
        let guard = self.handle.lock();
        let Some(handle) = *guard else {
            return false;
        };
        let Some(inner) = self.chronology.upgrade() else {
            return false;
        };
        let (status, new_front) = inner.deadlines.lock().update_right(handle, new_deadline);
        drop(guard);

        if status != Status::Success {
            return false;
        }
        if new_front {
            if let Some(observer) = inner.front_observer.lock().as_ref() {
                observer();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::Executor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executes functors immediately on the calling thread.
    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn execute(&self, functor: Functor) {
            functor();
        }

        fn move_and_execute(
            &self,
            sequence: &mut crate::strand::FunctorSequence,
            trailing: Option<Functor>,
        ) {
            for functor in sequence.drain(..) {
                functor();
            }
            if let Some(functor) = trailing {
                functor();
            }
        }
    }

    fn chronology() -> Chronology {
        Chronology::new(Arc::new(InlineExecutor))
    }

    #[test]
    fn fires_due_deadlines_in_order() {
        let chronology = chronology();
        let start = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, offset_ms) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let order = order.clone();
            chronology.schedule(
                start + Duration::from_millis(offset_ms),
                None,
                Box::new(move || order.lock().push(label)),
            );
        }
        assert_eq!(chronology.earliest(), Some(start + Duration::from_millis(10)));

        assert_eq!(chronology.advance(start + Duration::from_millis(25)), 2);
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(chronology.pending(), 1);

        assert_eq!(chronology.advance(start + Duration::from_millis(35)), 1);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(chronology.earliest(), None);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let chronology = chronology();
        let start = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let timer = chronology.schedule(
            start + Duration::from_millis(5),
            None,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(chronology.advance(start + Duration::from_secs(1)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_is_a_no_op() {
        let chronology = chronology();
        let start = Instant::now();
        let timer = chronology.schedule(start, None, Box::new(|| {}));
        assert_eq!(chronology.advance(start), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn reschedule_moves_the_deadline() {
        let chronology = chronology();
        let start = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let timer = chronology.schedule(
            start + Duration::from_millis(10),
            None,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(timer.reschedule(start + Duration::from_millis(100)));
        assert_eq!(chronology.advance(start + Duration::from_millis(50)), 0);
        assert_eq!(chronology.advance(start + Duration::from_millis(100)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.reschedule(start + Duration::from_millis(200)));
    }

    #[test]
    fn front_observer_runs_when_the_front_changes() {
        let chronology = chronology();
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();
        chronology.set_front_observer(Box::new(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let start = Instant::now();
        chronology.schedule(start + Duration::from_secs(10), None, Box::new(|| {}));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // a later deadline does not move the front
        chronology.schedule(start + Duration::from_secs(20), None, Box::new(|| {}));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // an earlier one does
        chronology.schedule(start + Duration::from_secs(5), None, Box::new(|| {}));
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatches_through_the_strand() {
        let chronology = chronology();
        let strand = Strand::new(Arc::new(InlineExecutor));
        let start = Instant::now();

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = observed.clone();
        let strand_clone = strand.clone();
        chronology.schedule(
            start,
            Some(strand.clone()),
            Box::new(move || {
                assert!(strand_clone.is_running_in_current_thread());
                observed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        chronology.advance(start);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
