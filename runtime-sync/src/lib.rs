/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Four mutex flavors behind one API, and a FIFO condition variable.
//!
//! Grounded on `libsync/src/sync.c`: `mutex_fast_init`/`mutex_fast_recursive_init`
//! back a userspace spinlock; `mutex_notification_init`/`mutex_recursive_init`
//! delegate to a kernel notification object. `cond_init`/`cond_wait`/`cond_signal`/
//! `cond_broadcast` are rendered as [`CondVar`] below.
//!
//! Every operation that can observe or change the current thread (recursive
//! re-entry, the condvar's per-thread wake slot) takes an explicit `&dyn Kernel`
//! rather than caching one, so a single mutex value has no lifetime tied to a
//! particular kernel handle.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use runtime_kernel::{CapAllocator, Kernel, KernelError, Slot};
use snafu::Snafu;

/// Errors raised by the synchronization primitives.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum SyncError {
    #[snafu(display("mutex was unlocked by a thread that is not its holder"))]
    NotHolder,
    #[snafu(display("no capability slots or untyped memory available to back this mutex"))]
    ResourceExhausted,
    #[snafu(display("underlying kernel object operation failed: {source}"))]
    Kernel { source: KernelError },
}

impl From<KernelError> for SyncError {
    fn from(source: KernelError) -> Self {
        SyncError::Kernel { source }
    }
}

const NO_HOLDER: u64 = 0;

enum Backing {
    UserSpin,
    UserSpinRecursive,
    KernelNotif(Slot),
    KernelNotifRecursive(Slot),
}

/// One of the four mutex kinds named in the spec, behind a uniform `lock`/`unlock` API.
pub struct Mutex {
    backing: Backing,
    locked: AtomicBool,
    holder: AtomicU64,
    held_count: AtomicU64,
    can_destroy: bool,
}

impl Mutex {
    /// A non-recursive userspace spinlock. Never fails: it needs no kernel object.
    pub fn create_user_spin() -> Self {
        Self::new(Backing::UserSpin, true)
    }

    /// A recursive userspace spinlock.
    pub fn create_user_spin_recursive() -> Self {
        Self::new(Backing::UserSpinRecursive, true)
    }

    /// A mutex backed by a freshly allocated kernel notification object.
    pub fn create_kernel_notif(alloc: &dyn CapAllocator) -> Result<Self, SyncError> {
        let notif = alloc.alloc_slot().map_err(|_| SyncError::ResourceExhausted)?;
        Ok(Self::new(Backing::KernelNotif(notif), true))
    }

    /// A mutex wrapping an externally-owned kernel notification object; `destroy`
    /// will not free it.
    pub fn attach_kernel_notif(notif: Slot) -> Self {
        Self::new(Backing::KernelNotif(notif), false)
    }

    /// A recursive mutex backed by a freshly allocated kernel notification object.
    pub fn create_kernel_notif_recursive(alloc: &dyn CapAllocator) -> Result<Self, SyncError> {
        let notif = alloc.alloc_slot().map_err(|_| SyncError::ResourceExhausted)?;
        Ok(Self::new(Backing::KernelNotifRecursive(notif), true))
    }

    /// A recursive mutex wrapping an externally-owned kernel notification object.
    pub fn attach_kernel_notif_recursive(notif: Slot) -> Self {
        Self::new(Backing::KernelNotifRecursive(notif), false)
    }

    fn new(backing: Backing, can_destroy: bool) -> Self {
        Self {
            backing,
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(NO_HOLDER),
            held_count: AtomicU64::new(0),
            can_destroy,
        }
    }

    fn is_recursive(&self) -> bool {
        matches!(self.backing, Backing::UserSpinRecursive | Backing::KernelNotifRecursive(_))
    }

    fn acquire_spin(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn release_spin(&self) -> Result<(), SyncError> {
        self.locked
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| SyncError::NotHolder)
    }

    /// Acquire the mutex, blocking (spinning, or waiting on a kernel notification)
    /// until it is available.
    pub fn lock(&self, kernel: &dyn Kernel) -> Result<(), SyncError> {
        let me = kernel.current_thread_id();
        if self.is_recursive() && self.holder.load(Ordering::Acquire) == me {
            self.held_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        match self.backing {
            Backing::UserSpin | Backing::UserSpinRecursive => self.acquire_spin(),
            Backing::KernelNotif(notif) | Backing::KernelNotifRecursive(notif) => {
                while self
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    kernel.wait(notif)?;
                }
            }
        }
        if self.is_recursive() {
            self.holder.store(me, Ordering::Release);
            self.held_count.store(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Try to acquire the mutex without blocking.
    pub fn try_lock(&self, kernel: &dyn Kernel) -> bool {
        let me = kernel.current_thread_id();
        if self.is_recursive() && self.holder.load(Ordering::Acquire) == me {
            self.held_count.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let got = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if got && self.is_recursive() {
            self.holder.store(me, Ordering::Release);
            self.held_count.store(1, Ordering::Relaxed);
        }
        got
    }

    /// Release the mutex. Recursive mutexes require the caller to be the current holder.
    pub fn unlock(&self, kernel: &dyn Kernel) -> Result<(), SyncError> {
        if self.is_recursive() {
            if self.holder.load(Ordering::Acquire) != kernel.current_thread_id() {
                return Err(SyncError::NotHolder);
            }
            let remaining = self.held_count.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining > 0 {
                return Ok(());
            }
            self.holder.store(NO_HOLDER, Ordering::Release);
        }
        match self.backing {
            Backing::UserSpin | Backing::UserSpinRecursive => self.release_spin(),
            Backing::KernelNotif(notif) | Backing::KernelNotifRecursive(notif) => {
                self.release_spin()?;
                kernel.signal(notif).map_err(Into::into)
            }
        }
    }

    /// Destroy the mutex, freeing its backing notification if this mutex owns it.
    pub fn destroy(self, alloc: &dyn CapAllocator) {
        if let Backing::KernelNotif(notif) | Backing::KernelNotifRecursive(notif) = self.backing {
            if self.can_destroy {
                alloc.free_slot(notif);
            }
        }
    }
}

/// Owned or borrowed main lock for a [`CondVar`].
pub enum MainLock {
    Owned(Mutex),
    Borrowed,
}

/// A FIFO condition variable: waiters wake in arrival order.
///
/// Grounded on `libsync/src/sync.c`'s `cond_wait`/`signal_once`/`cond_broadcast`.
/// The reference implementation's wait-queue node carries an incidental `prev`
/// pointer despite being used strictly as a FIFO queue; dropped here in favor
/// of a plain `VecDeque` (spec 9 open question).
pub struct CondVar {
    main_lock: MainLock,
    queue_lock: Mutex,
    queue: UnsafeCell<VecDeque<Slot>>,
}

// SAFETY: all access to `queue` happens while `queue_lock` is held.
unsafe impl Sync for CondVar {}

impl CondVar {
    /// A condition variable owning a fresh recursive userspace mutex as its main lock.
    pub fn new() -> Self {
        Self {
            main_lock: MainLock::Owned(Mutex::create_user_spin_recursive()),
            queue_lock: Mutex::create_user_spin(),
            queue: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// A condition variable sharing an externally-owned main lock.
    pub fn with_borrowed_lock() -> Self {
        Self {
            main_lock: MainLock::Borrowed,
            queue_lock: Mutex::create_user_spin(),
            queue: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// The owned main lock, if any. Callers with a borrowed lock manage their own.
    pub fn main_lock(&self) -> Option<&Mutex> {
        match &self.main_lock {
            MainLock::Owned(m) => Some(m),
            MainLock::Borrowed => None,
        }
    }

    fn queue_mut(&self) -> &mut VecDeque<Slot> {
        unsafe { &mut *self.queue.get() }
    }

    /// Block on the condition variable. Precondition: the caller holds the main lock.
    pub fn wait(&self, kernel: &dyn Kernel) -> Result<(), SyncError> {
        let my_slot = kernel.current_thread_sync_notification();
        self.queue_lock.lock(kernel)?;
        self.queue_mut().push_back(my_slot);
        self.queue_lock.unlock(kernel)?;

        if let Some(lock) = self.main_lock() {
            lock.unlock(kernel)?;
        }

        kernel.wait(my_slot)?;

        if let Some(lock) = self.main_lock() {
            lock.lock(kernel)?;
        }
        Ok(())
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self, kernel: &dyn Kernel) -> Result<(), SyncError> {
        self.queue_lock.lock(kernel)?;
        let next = self.queue_mut().pop_front();
        self.queue_lock.unlock(kernel)?;
        if let Some(slot) = next {
            kernel.signal(slot)?;
        }
        Ok(())
    }

    /// Wake every waiting thread, in arrival order.
    pub fn broadcast(&self, kernel: &dyn Kernel) -> Result<(), SyncError> {
        loop {
            self.queue_lock.lock(kernel)?;
            let next = self.queue_mut().pop_front();
            self.queue_lock.unlock(kernel)?;
            match next {
                Some(slot) => kernel.signal(slot)?,
                None => return Ok(()),
            }
        }
    }

    /// Destroy the condition variable: the owned main lock (if any) and the queue lock.
    pub fn destroy(self, alloc: &dyn CapAllocator) {
        if let MainLock::Owned(lock) = self.main_lock {
            lock.destroy(alloc);
        }
        self.queue_lock.destroy(alloc);
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimCapAllocator, SimKernel};

    #[test]
    fn user_spin_excludes_concurrent_holders() {
        let kernel = SimKernel::new();
        let m = Mutex::create_user_spin();
        m.lock(&*kernel).unwrap();
        assert!(!m.try_lock(&*kernel));
        m.unlock(&*kernel).unwrap();
        assert!(m.try_lock(&*kernel));
    }

    #[test]
    fn user_spin_unlock_without_lock_fails() {
        let kernel = SimKernel::new();
        let m = Mutex::create_user_spin();
        assert_eq!(m.unlock(&*kernel), Err(SyncError::NotHolder));
    }

    #[test]
    fn recursive_spin_reentry_and_invariant() {
        let kernel = SimKernel::new();
        let m = Mutex::create_user_spin_recursive();
        m.lock(&*kernel).unwrap();
        m.lock(&*kernel).unwrap();
        m.unlock(&*kernel).unwrap();
        m.unlock(&*kernel).unwrap();
        assert_eq!(m.unlock(&*kernel), Err(SyncError::NotHolder));
    }

    #[test]
    fn recursive_lock_rejects_foreign_unlock() {
        let kernel = SimKernel::new();
        let m = Mutex::create_user_spin_recursive();
        m.lock(&*kernel).unwrap();
        kernel.register_thread(); // bumps current_thread_id as seen by a "different" caller
        assert_eq!(m.unlock(&*kernel), Err(SyncError::NotHolder));
    }

    #[test]
    fn kernel_notif_mutex_signals_on_unlock() {
        let kernel = SimKernel::new();
        let alloc = SimCapAllocator::new();
        let m = Mutex::create_kernel_notif(&alloc).unwrap();
        m.lock(&*kernel).unwrap();
        m.unlock(&*kernel).unwrap();
        assert_eq!(kernel.signals().len(), 1);
    }

    #[test]
    fn condvar_signal_is_fifo() {
        let kernel = SimKernel::new();
        let cv = CondVar::with_borrowed_lock();
        {
            let q = cv.queue_mut();
            q.push_back(Slot(10));
            q.push_back(Slot(11));
            q.push_back(Slot(12));
        }
        cv.signal(&*kernel).unwrap();
        cv.signal(&*kernel).unwrap();
        cv.signal(&*kernel).unwrap();
        assert_eq!(kernel.signals(), alloc::vec![Slot(10), Slot(11), Slot(12)]);
    }

    #[test]
    fn condvar_broadcast_drains_queue() {
        let kernel = SimKernel::new();
        let cv = CondVar::with_borrowed_lock();
        {
            let q = cv.queue_mut();
            q.push_back(Slot(1));
            q.push_back(Slot(2));
        }
        cv.broadcast(&*kernel).unwrap();
        assert_eq!(kernel.signals().len(), 2);
        cv.broadcast(&*kernel).unwrap(); // no-op, queue empty
        assert_eq!(kernel.signals().len(), 2);
    }
}
