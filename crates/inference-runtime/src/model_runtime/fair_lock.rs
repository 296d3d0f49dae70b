//! Writer-preferring read-write lock with FIFO admission.
//!
//! Admission is decided by a small queue guarded by a std mutex; the data
//! itself sits in a `tokio::sync::RwLock` which is always uncontended by the
//! time a caller has been admitted. Once anything is queued, every new
//! arrival queues behind it, so a waiting writer is never overtaken by
//! readers that arrived after it. Consecutive queued readers are admitted
//! together.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{oneshot, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct Waiter {
    ticket: u64,
    access: Access,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct Admission {
    active_readers: usize,
    writer_active: bool,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl Admission {
    fn admissible(&self, access: Access) -> bool {
        match access {
            Access::Read => !self.writer_active,
            Access::Write => !self.writer_active && self.active_readers == 0,
        }
    }

    fn take(&mut self, access: Access) {
        match access {
            Access::Read => self.active_readers += 1,
            Access::Write => self.writer_active = true,
        }
    }

    fn give_back(&mut self, access: Access) {
        match access {
            Access::Read => self.active_readers = self.active_readers.saturating_sub(1),
            Access::Write => self.writer_active = false,
        }
    }

    /// Admit waiters from the front of the queue while they fit.
    fn grant_waiting(&mut self) {
        while self
            .queue
            .front()
            .map_or(false, |waiter| self.admissible(waiter.access))
        {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.take(waiter.access);
            // The receiver lives inside a PendingAdmission, whose drop takes
            // this mutex before giving it up, so the send cannot miss.
            let _ = waiter.grant.send(());
        }
    }
}

/// Fair read-write lock. See the module docs for the admission rules.
pub struct FairRwLock<T> {
    admission: Mutex<Admission>,
    data: RwLock<T>,
}

impl<T> FairRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            admission: Mutex::new(Admission::default()),
            data: RwLock::new(value),
        }
    }

    fn state(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn acquire_read(&self) -> FairReadGuard<'_, T> {
        let pass = self.admit(Access::Read).await;
        let guard = self.data.read().await;
        FairReadGuard { guard, _pass: pass }
    }

    pub async fn acquire_write(&self) -> FairWriteGuard<'_, T> {
        let pass = self.admit(Access::Write).await;
        let guard = self.data.write().await;
        FairWriteGuard { guard, _pass: pass }
    }

    /// Number of acquisitions waiting for admission.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    async fn admit(&self, access: Access) -> AdmissionPass<'_> {
        let (ticket, rx) = {
            let mut state = self.state();
            if state.queue.is_empty() && state.admissible(access) {
                state.take(access);
                return AdmissionPass {
                    admission: &self.admission,
                    access,
                };
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let (grant, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                ticket,
                access,
                grant,
            });
            (ticket, rx)
        };

        let mut pending = PendingAdmission {
            admission: &self.admission,
            ticket,
            access,
            rx,
            settled: false,
        };
        let granted = (&mut pending.rx).await.is_ok();
        pending.settled = true;
        debug_assert!(granted, "admission sender dropped without a grant");

        AdmissionPass {
            admission: &self.admission,
            access,
        }
    }
}

impl<T: Default> Default for FairRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A queued acquisition. Dropping it before the grant is observed either
/// withdraws it from the queue or hands back a grant that was already made.
struct PendingAdmission<'a> {
    admission: &'a Mutex<Admission>,
    ticket: u64,
    access: Access,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        match state.queue.iter().position(|w| w.ticket == self.ticket) {
            Some(index) => {
                state.queue.remove(index);
            }
            None => state.give_back(self.access),
        }
        state.grant_waiting();
    }
}

/// Admission held by a guard; returned on drop.
struct AdmissionPass<'a> {
    admission: &'a Mutex<Admission>,
    access: Access,
}

impl Drop for AdmissionPass<'_> {
    fn drop(&mut self) {
        let mut state = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        state.give_back(self.access);
        state.grant_waiting();
    }
}

// Field order matters: the data guard drops before the admission pass, so
// the next admitted caller finds the inner lock free.
pub struct FairReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _pass: AdmissionPass<'a>,
}

impl<T> Deref for FairReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct FairWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _pass: AdmissionPass<'a>,
}

impl<T> Deref for FairWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for FairWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: fmt::Debug> fmt::Debug for FairReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}

impl<T: fmt::Debug> fmt::Debug for FairWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}
