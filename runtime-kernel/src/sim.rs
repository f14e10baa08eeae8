/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! In-memory fakes of [`CapAllocator`], [`AddressSpace`], and [`Kernel`], used
//! by every `runtime-*` crate's hosted `#[test]` suite instead of a real
//! kernel. Not part of the public contract shipped to a target build.

use crate::{AddressSpace, CapAllocator, Kernel, KernelError, PageAttrs, Rights, Slot, VirtRange};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

const PAGE_BITS: u8 = 12;

#[derive(Default)]
struct State {
    next_slot: u64,
    untypeds: Vec<(Slot, u8, bool)>,
    revoked: Vec<Slot>,
}

/// A fake capability allocator: slots are a simple counter, untypeds are just
/// recorded, `retype_untyped` always succeeds as long as any untyped was added.
pub struct SimCapAllocator {
    state: RefCell<State>,
}

impl SimCapAllocator {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_slot: 1,
                untypeds: Vec::new(),
                revoked: Vec::new(),
            }),
        }
    }

    /// Slots freed or revoked so far, for test assertions.
    pub fn revoked(&self) -> Vec<Slot> {
        self.state.borrow().revoked.clone()
    }
}

impl Default for SimCapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CapAllocator for SimCapAllocator {
    fn alloc_slot(&self) -> Result<Slot, KernelError> {
        let mut st = self.state.borrow_mut();
        let slot = Slot(st.next_slot);
        st.next_slot += 1;
        Ok(slot)
    }

    fn free_slot(&self, slot: Slot) {
        self.state.borrow_mut().revoked.push(slot);
    }

    fn retype_untyped(&self, _untyped: Slot, _size_bits: u8, _dest: Slot) -> Result<(), KernelError> {
        if self.state.borrow().untypeds.is_empty() {
            return Err(KernelError::NoUntyped);
        }
        Ok(())
    }

    fn add_untyped(&self, untyped: Slot, size_bits: u8, is_device: bool) {
        self.state.borrow_mut().untypeds.push((untyped, size_bits, is_device));
    }

    fn copy_cap(&self, _src: Slot, _dest: Slot, _rights: Rights) -> Result<(), KernelError> {
        Ok(())
    }

    fn mint_cap(&self, _src: Slot, _dest: Slot, _rights: Rights, _badge: u64) -> Result<(), KernelError> {
        Ok(())
    }

    fn delete_cap(&self, slot: Slot) -> Result<(), KernelError> {
        self.state.borrow_mut().revoked.push(slot);
        Ok(())
    }

    fn revoke_cap(&self, slot: Slot) -> Result<(), KernelError> {
        self.state.borrow_mut().revoked.push(slot);
        Ok(())
    }
}

/// A fake address space: a bump allocator over a generous virtual range, with a
/// map recording which ranges are mapped (and with what attributes) for assertions.
pub struct SimAddressSpace {
    next_base: RefCell<u64>,
    mapped: RefCell<BTreeMap<u64, (usize, PageAttrs)>>,
    memory: RefCell<BTreeMap<u64, u8>>,
}

impl SimAddressSpace {
    pub fn new() -> Self {
        Self {
            next_base: RefCell::new(0x1000_0000),
            mapped: RefCell::new(BTreeMap::new()),
            memory: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn is_mapped(&self, base: u64) -> bool {
        self.mapped.borrow().contains_key(&base)
    }

    pub fn attrs_at(&self, base: u64) -> Option<PageAttrs> {
        self.mapped.borrow().get(&base).map(|(_, a)| *a)
    }
}

impl Default for SimAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SimAddressSpace {
    fn reserve(&self, num_pages: usize) -> Result<VirtRange, KernelError> {
        let mut base = self.next_base.borrow_mut();
        let range = VirtRange {
            base: *base,
            num_pages,
            page_bits: PAGE_BITS,
        };
        *base += range.len_bytes() + (1 << PAGE_BITS); // leave a page gap, like a guard
        Ok(range)
    }

    fn map_fresh(
        &self,
        _alloc: &dyn CapAllocator,
        range: VirtRange,
        attrs: PageAttrs,
    ) -> Result<(), KernelError> {
        self.mapped.borrow_mut().insert(range.base, (range.num_pages, attrs));
        Ok(())
    }

    fn map_frames(&self, range: VirtRange, frames: &[Slot], attrs: PageAttrs) -> Result<(), KernelError> {
        if frames.len() != range.num_pages {
            return Err(KernelError::MapFailed);
        }
        self.mapped.borrow_mut().insert(range.base, (range.num_pages, attrs));
        Ok(())
    }

    fn map_device(
        &self,
        _alloc: &dyn CapAllocator,
        _phys_addr: u64,
        num_pages: usize,
        attrs: PageAttrs,
    ) -> Result<VirtRange, KernelError> {
        let range = self.reserve(num_pages)?;
        self.mapped.borrow_mut().insert(range.base, (range.num_pages, attrs));
        Ok(range)
    }

    fn remap(&self, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError> {
        let mut mapped = self.mapped.borrow_mut();
        if !mapped.contains_key(&range.base) {
            return Err(KernelError::MapFailed);
        }
        mapped.insert(range.base, (range.num_pages, attrs));
        Ok(())
    }

    fn unmap(&self, range: VirtRange) -> Result<(), KernelError> {
        self.mapped.borrow_mut().remove(&range.base);
        Ok(())
    }

    fn share_map(&self, frames: &[Slot], attrs: PageAttrs) -> Result<VirtRange, KernelError> {
        let range = self.reserve(frames.len())?;
        self.mapped.borrow_mut().insert(range.base, (range.num_pages, attrs));
        Ok(range)
    }

    fn physical_address(&self, vaddr: u64) -> Result<u64, KernelError> {
        if self.mapped.borrow().contains_key(&vaddr) {
            Ok(vaddr.wrapping_add(0x8000_0000))
        } else {
            Err(KernelError::MapFailed)
        }
    }

    fn write_bytes(&self, vaddr: u64, data: &[u8]) -> Result<(), KernelError> {
        let mut mem = self.memory.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            mem.insert(vaddr + i as u64, *b);
        }
        Ok(())
    }

    fn read_bytes(&self, vaddr: u64, out: &mut [u8]) -> Result<(), KernelError> {
        let mem = self.memory.borrow();
        for (i, b) in out.iter_mut().enumerate() {
            *b = *mem.get(&(vaddr + i as u64)).unwrap_or(&0);
        }
        Ok(())
    }
}

/// A fake kernel: records register writes and signals for assertions, and
/// hands out real thread ids from a shared counter so recursive-lock tests can
/// run on more than one "thread" (in practice, the same OS thread calling in
/// with a different simulated id).
pub struct SimKernel {
    thread_id: AtomicU64,
    signals: RefCell<Vec<Slot>>,
    registers: RefCell<BTreeMap<u64, (u64, u64, bool)>>,
}

impl SimKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            thread_id: AtomicU64::new(1),
            signals: RefCell::new(Vec::new()),
            registers: RefCell::new(BTreeMap::new()),
        })
    }

    /// Simulates a new thread registering and receiving an id. Resolves the
    /// spec 9 open question about `thread_get_id()` always returning zero.
    pub fn register_thread(&self) -> u64 {
        self.thread_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Slot> {
        self.signals.borrow().clone()
    }

    pub fn registers_for(&self, tcb: Slot) -> Option<(u64, u64, bool)> {
        self.registers.borrow().get(&tcb.0).copied()
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self {
            thread_id: AtomicU64::new(1),
            signals: RefCell::new(Vec::new()),
            registers: RefCell::new(BTreeMap::new()),
        }
    }
}

impl Kernel for SimKernel {
    fn configure_tcb(
        &self,
        _tcb: Slot,
        _cspace: Slot,
        _vspace: Slot,
        _fault_ep: Option<Slot>,
    ) -> Result<(), KernelError> {
        Ok(())
    }

    fn write_registers(&self, tcb: Slot, ip: u64, sp: u64, resume: bool) -> Result<(), KernelError> {
        self.registers.borrow_mut().insert(tcb.0, (ip, sp, resume));
        Ok(())
    }

    fn set_priority(&self, _tcb: Slot, _priority: u8) -> Result<(), KernelError> {
        Ok(())
    }

    fn set_affinity(&self, _tcb: Slot, _cpu: u32) -> Result<(), KernelError> {
        Ok(())
    }

    fn assign_asid(&self, _pool: Slot, _vspace: Slot) -> Result<(), KernelError> {
        Ok(())
    }

    fn signal(&self, notification: Slot) -> Result<(), KernelError> {
        self.signals.borrow_mut().push(notification);
        Ok(())
    }

    fn wait(&self, _notification: Slot) -> Result<(), KernelError> {
        Ok(())
    }

    fn send(&self, _endpoint: Slot, _badge: u64, _payload: u64) -> Result<(), KernelError> {
        Ok(())
    }

    fn recv(&self, _endpoint: Slot) -> Result<(u64, u64), KernelError> {
        Ok((0, 0))
    }

    fn call(&self, _endpoint: Slot, _badge: u64, payload: u64) -> Result<u64, KernelError> {
        Ok(!payload)
    }

    fn reply(&self, _payload: u64) -> Result<(), KernelError> {
        Ok(())
    }

    fn current_thread_id(&self) -> u64 {
        self.thread_id.load(Ordering::SeqCst)
    }

    fn current_thread_sync_notification(&self) -> Slot {
        Slot(1000 + self.thread_id.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_allocator_allocates_monotonic_slots() {
        let alloc = SimCapAllocator::new();
        let a = alloc.alloc_slot().unwrap();
        let b = alloc.alloc_slot().unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn address_space_reserve_then_map() {
        let vspace = SimAddressSpace::new();
        let range = vspace.reserve(4).unwrap();
        let alloc = SimCapAllocator::new();
        vspace.map_fresh(&alloc, range, PageAttrs::rw()).unwrap();
        assert!(vspace.is_mapped(range.base));
        assert_eq!(vspace.attrs_at(range.base), Some(PageAttrs::rw()));
    }
}
