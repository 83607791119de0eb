use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

enum Slot<T> {
    Running,
    Done(T),
    Abandoned,
}

struct Flight<T> {
    slot: Mutex<Slot<T>>,
    finished: Condvar,
    followers: AtomicUsize,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Running),
            finished: Condvar::new(),
            followers: AtomicUsize::new(0),
        }
    }

    /// `None` when the leader went away without a result.
    fn wait(&self) -> Option<T> {
        self.followers.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.slot.lock();
        while matches!(*guard, Slot::Running) {
            self.finished.wait(&mut guard);
        }
        match &*guard {
            Slot::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn settle(&self, slot: Slot<T>) {
        let mut guard = self.slot.lock();
        if matches!(*guard, Slot::Running) {
            *guard = slot;
        }
        self.finished.notify_all();
    }
}

/// Collapses overlapping calls into one execution whose result every caller
/// receives.
pub(crate) struct SingleFlight<T> {
    current: Mutex<Option<Arc<Flight<T>>>>,
}

struct LeaderGuard<'a, T: Clone> {
    owner: &'a SingleFlight<T>,
    flight: Arc<Flight<T>>,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        // reached with the slot still running only when the work panicked
        self.flight.settle(Slot::Abandoned);
        let mut current = self.owner.current.lock();
        if current
            .as_ref()
            .map_or(false, |active| Arc::ptr_eq(active, &self.flight))
        {
            *current = None;
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub(crate) fn run<F>(&self, work: F) -> T
    where
        F: FnOnce() -> T,
    {
        loop {
            let (flight, leader) = {
                let mut current = self.current.lock();
                match current.as_ref() {
                    Some(active) => (Arc::clone(active), false),
                    None => {
                        let fresh = Arc::new(Flight::new());
                        *current = Some(Arc::clone(&fresh));
                        (fresh, true)
                    }
                }
            };

            if leader {
                let guard = LeaderGuard {
                    owner: self,
                    flight,
                };
                let value = work();
                guard.flight.settle(Slot::Done(value.clone()));
                drop(guard);
                return value;
            }

            if let Some(value) = flight.wait() {
                return value;
            }
            tracing::debug!("in-flight leader abandoned its work; retrying");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Callers currently parked on the running flight.
    #[cfg(test)]
    pub(crate) fn followers(&self) -> usize {
        self.current
            .lock()
            .as_ref()
            .map_or(0, |flight| flight.followers.load(Ordering::SeqCst))
    }
}
