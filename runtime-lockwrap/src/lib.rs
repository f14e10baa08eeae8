/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Lock-wrapped capability allocator and address space.
//!
//! Grounded on `liblockwrapper/src/lockvka.c`: `lockvka_make_vka` fills a `vka_t`
//! function-pointer table with wrappers that each acquire `lockvka->lock`, call
//! through to `lockvka->parent_vka`, and release. `lockvka_attach` stores the
//! `{parent, lock}` pair. The C library also offers a `replace` constructor that
//! mutates an existing object's dispatch table in place; with Rust trait objects
//! there is nothing to mutate in place, so only `attach`-style composition is
//! offered here (see DESIGN.md).
//!
//! The wrapper's mutex must be one of the two recursive kinds: every wrapped
//! operation holds the lock across its call to `parent`, and `parent`'s own
//! allocation callback may need to re-enter a wrapped operation (for example,
//! an address-space reservation triggering a fresh capability-table slot
//! allocation) on the same thread.

#![cfg_attr(not(test), no_std)]

use runtime_kernel::{AddressSpace, CapAllocator, Kernel, KernelError, PageAttrs, Rights, Slot, VirtRange};
use runtime_sync::Mutex;

/// Serializes every [`CapAllocator`] operation on `parent` behind a recursive mutex.
pub struct LockWrappedCapAllocator<'a> {
    parent: &'a dyn CapAllocator,
    kernel: &'a dyn Kernel,
    lock: Mutex,
}

impl<'a> LockWrappedCapAllocator<'a> {
    /// Wrap `parent`, serializing all access behind a fresh recursive lock.
    pub fn attach(parent: &'a dyn CapAllocator, kernel: &'a dyn Kernel) -> Self {
        Self {
            parent,
            kernel,
            lock: Mutex::create_user_spin_recursive(),
        }
    }

    /// Explicitly hold the lock across more than one operation, e.g. while an
    /// image loader issues many sub-allocations that must appear atomic to
    /// concurrent builders.
    pub fn locked<R>(&self, f: impl FnOnce(&dyn CapAllocator) -> R) -> Result<R, KernelError> {
        self.lock.lock(self.kernel).map_err(|_| KernelError::KernelRefused)?;
        let r = f(self.parent);
        self.lock.unlock(self.kernel).map_err(|_| KernelError::KernelRefused)?;
        Ok(r)
    }
}

impl<'a> CapAllocator for LockWrappedCapAllocator<'a> {
    fn alloc_slot(&self) -> Result<Slot, KernelError> {
        self.locked(|p| p.alloc_slot())?
    }

    fn free_slot(&self, slot: Slot) {
        let _ = self.locked(|p| p.free_slot(slot));
    }

    fn retype_untyped(&self, untyped: Slot, object_size_bits: u8, dest: Slot) -> Result<(), KernelError> {
        self.locked(|p| p.retype_untyped(untyped, object_size_bits, dest))?
    }

    fn add_untyped(&self, untyped: Slot, size_bits: u8, is_device: bool) {
        let _ = self.locked(|p| p.add_untyped(untyped, size_bits, is_device));
    }

    fn copy_cap(&self, src: Slot, dest: Slot, rights: Rights) -> Result<(), KernelError> {
        self.locked(|p| p.copy_cap(src, dest, rights))?
    }

    fn mint_cap(&self, src: Slot, dest: Slot, rights: Rights, badge: u64) -> Result<(), KernelError> {
        self.locked(|p| p.mint_cap(src, dest, rights, badge))?
    }

    fn delete_cap(&self, slot: Slot) -> Result<(), KernelError> {
        self.locked(|p| p.delete_cap(slot))?
    }

    fn revoke_cap(&self, slot: Slot) -> Result<(), KernelError> {
        self.locked(|p| p.revoke_cap(slot))?
    }
}

/// Serializes every [`AddressSpace`] operation on `parent` behind a recursive mutex.
pub struct LockWrappedAddressSpace<'a> {
    parent: &'a dyn AddressSpace,
    kernel: &'a dyn Kernel,
    lock: Mutex,
}

impl<'a> LockWrappedAddressSpace<'a> {
    pub fn attach(parent: &'a dyn AddressSpace, kernel: &'a dyn Kernel) -> Self {
        Self {
            parent,
            kernel,
            lock: Mutex::create_user_spin_recursive(),
        }
    }

    /// Run a sequence of operations against the wrapped address space as one
    /// atomic unit, e.g. loading a program image's many segments.
    pub fn locked<R>(&self, f: impl FnOnce(&dyn AddressSpace) -> R) -> Result<R, KernelError> {
        self.lock.lock(self.kernel).map_err(|_| KernelError::KernelRefused)?;
        let r = f(self.parent);
        self.lock.unlock(self.kernel).map_err(|_| KernelError::KernelRefused)?;
        Ok(r)
    }
}

impl<'a> AddressSpace for LockWrappedAddressSpace<'a> {
    fn reserve(&self, num_pages: usize) -> Result<VirtRange, KernelError> {
        self.locked(|p| p.reserve(num_pages))?
    }

    fn map_fresh(&self, alloc: &dyn CapAllocator, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError> {
        self.locked(|p| p.map_fresh(alloc, range, attrs))?
    }

    fn map_frames(&self, range: VirtRange, frames: &[Slot], attrs: PageAttrs) -> Result<(), KernelError> {
        self.locked(|p| p.map_frames(range, frames, attrs))?
    }

    fn map_device(
        &self,
        alloc: &dyn CapAllocator,
        phys_addr: u64,
        num_pages: usize,
        attrs: PageAttrs,
    ) -> Result<VirtRange, KernelError> {
        self.locked(|p| p.map_device(alloc, phys_addr, num_pages, attrs))?
    }

    fn remap(&self, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError> {
        self.locked(|p| p.remap(range, attrs))?
    }

    fn unmap(&self, range: VirtRange) -> Result<(), KernelError> {
        self.locked(|p| p.unmap(range))?
    }

    fn share_map(&self, frames: &[Slot], attrs: PageAttrs) -> Result<VirtRange, KernelError> {
        self.locked(|p| p.share_map(frames, attrs))?
    }

    fn physical_address(&self, vaddr: u64) -> Result<u64, KernelError> {
        self.locked(|p| p.physical_address(vaddr))?
    }

    fn write_bytes(&self, vaddr: u64, data: &[u8]) -> Result<(), KernelError> {
        self.locked(|p| p.write_bytes(vaddr, data))?
    }

    fn read_bytes(&self, vaddr: u64, out: &mut [u8]) -> Result<(), KernelError> {
        self.locked(|p| p.read_bytes(vaddr, out))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimAddressSpace, SimCapAllocator, SimKernel};

    #[test]
    fn wrapped_allocator_forwards_and_serializes() {
        let inner = SimCapAllocator::new();
        let kernel = SimKernel::new();
        let wrapped = LockWrappedCapAllocator::attach(&inner, &*kernel);
        let a = wrapped.alloc_slot().unwrap();
        let b = wrapped.alloc_slot().unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn wrapped_vspace_reentrant_locked_call() {
        let inner = SimAddressSpace::new();
        let alloc = SimCapAllocator::new();
        let kernel = SimKernel::new();
        let wrapped = LockWrappedAddressSpace::attach(&inner, &*kernel);
        // a "loader" holding the lock across two operations, as create.c does
        // around sel4utils_elf_load.
        wrapped
            .locked(|p| {
                let range = p.reserve(2).unwrap();
                p.map_fresh(&alloc, range, PageAttrs::rx()).unwrap();
                range
            })
            .unwrap();
    }

}
