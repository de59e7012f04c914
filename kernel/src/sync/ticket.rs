//! Ticket spinlocks.
//!
//! A ticket lock hands out monotonically increasing tickets with a
//! fetch-add on `next` and serves them in order through `serving`, so
//! acquisition is FIFO-fair across cores. Debug builds additionally
//! record the core that currently holds the lock.
//!
//! These locks protect kernel structures whose critical sections never
//! cross a scheduling point (channel endpoints, pipe rings, the process
//! table free-slot scan, run queues during steal).

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Sentinel for "no owner" in the debug owner slot.
#[cfg(debug_assertions)]
const NO_OWNER: u32 = u32::MAX;

/// Raw ticket spinlock.
pub struct TicketLock {
    /// Next ticket to hand out.
    next: AtomicU32,
    /// Ticket currently being served.
    serving: AtomicU32,
    /// Core id of the current holder (debug builds only).
    #[cfg(debug_assertions)]
    owner: AtomicU32,
}

impl TicketLock {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            #[cfg(debug_assertions)]
            owner: AtomicU32::new(NO_OWNER),
        }
    }

    /// Spin until the lock is held.
    pub fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        #[cfg(debug_assertions)]
        self.owner
            .store(crate::arch::cpu_id() as u32, Ordering::Relaxed);
    }

    /// Attempt a single acquisition without spinning.
    pub fn try_lock(&self) -> bool {
        let serving = self.serving.load(Ordering::Acquire);
        let ok = self
            .next
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        #[cfg(debug_assertions)]
        if ok {
            self.owner
                .store(crate::arch::cpu_id() as u32, Ordering::Relaxed);
        }
        ok
    }

    /// Release the lock.
    pub fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.serving.fetch_add(1, Ordering::Release);
    }

    /// True if some core currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.serving.load(Ordering::Relaxed) != self.next.load(Ordering::Relaxed)
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A value guarded by a [`TicketLock`], in the shape of `spin::Mutex`.
pub struct TicketMutex<T> {
    lock: TicketLock,
    value: UnsafeCell<T>,
}

// SAFETY: the ticket lock serializes all access to `value`; a guard is the
// only way to reach it, so TicketMutex provides the same guarantees as any
// mutex and is Sync whenever the protected value is Send.
unsafe impl<T: Send> Sync for TicketMutex<T> {}
// SAFETY: moving the mutex moves the value with it; no thread affinity.
unsafe impl<T: Send> Send for TicketMutex<T> {}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: TicketLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, returning a guard that releases on drop.
    pub fn lock(&self) -> TicketGuard<'_, T> {
        self.lock.lock();
        TicketGuard { mutex: self }
    }

    /// Acquire without spinning; `None` if contended.
    pub fn try_lock(&self) -> Option<TicketGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(TicketGuard { mutex: self })
        } else {
            None
        }
    }
}

/// RAII guard for [`TicketMutex`].
pub struct TicketGuard<'a, T> {
    mutex: &'a TicketMutex<T>,
}

impl<T> Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the ticket lock is held, so no other core
        // can be reading or writing `value`.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; &mut self additionally guarantees this guard is
        // the only live reference derived from it.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let lock = TicketLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = TicketLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn mutex_guards_value() {
        let m = TicketMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn tickets_served_in_order() {
        // Single-threaded sanity: serving trails next by the number of
        // outstanding holders.
        let lock = TicketLock::new();
        lock.lock();
        assert_eq!(lock.next.load(Ordering::Relaxed), 1);
        assert_eq!(lock.serving.load(Ordering::Relaxed), 0);
        lock.unlock();
        assert_eq!(lock.serving.load(Ordering::Relaxed), 1);
    }
}
