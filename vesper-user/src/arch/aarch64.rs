/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! aarch64 syscall trap.
//!
//! Every kernel operation — capability management, page mapping, thread
//! control, IPC — is a single `svc #0` instruction carrying a capability
//! slot, an invocation label, and up to four message-register words, and
//! returning an error code plus up to four result words in the same
//! registers. This is vesper's own invocation ABI (labels below), not a claim
//! of compatibility with any external kernel's numbering; it mirrors the
//! "everything is a capability-named, opaque operation" model `nucleus`'s own
//! `Capability` trait presents kernel-side (`nucleus/src/caps/mod.rs`).

use core::arch::asm;
use runtime_kernel::{AddressSpace, CapAllocator, Kernel, KernelError, PageAttrs, Rights, Slot, VirtRange};

#[repr(u64)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Label {
    AllocSlot = 1,
    FreeSlot = 2,
    RetypeUntyped = 3,
    AddUntyped = 4,
    CopyCap = 5,
    MintCap = 6,
    DeleteCap = 7,
    RevokeCap = 8,
    Reserve = 9,
    MapFresh = 10,
    MapFrames = 11,
    MapDevice = 12,
    Remap = 13,
    Unmap = 14,
    ShareMap = 15,
    PhysicalAddress = 16,
    WriteBytes = 17,
    ReadBytes = 18,
    ConfigureTcb = 19,
    WriteRegisters = 20,
    SetPriority = 21,
    SetAffinity = 22,
    AssignAsid = 23,
    Signal = 24,
    Wait = 25,
    Send = 26,
    Recv = 27,
    Call = 28,
    Reply = 29,
    DebugNameThread = 30,
    CurrentThreadId = 31,
    CurrentThreadSyncNotification = 32,
}

/// Error codes the kernel returns in `x0`, matching [`runtime_kernel::KernelError`].
const ERR_NO_FREE_SLOTS: u64 = 1;
const ERR_NO_UNTYPED: u64 = 2;
const ERR_CAP_COPY_FAILED: u64 = 3;
const ERR_MAP_FAILED: u64 = 4;
const ERR_NO_VIRTUAL_RANGE: u64 = 5;

pub(crate) fn decode_error(code: u64) -> KernelError {
    match code {
        ERR_NO_FREE_SLOTS => KernelError::NoFreeSlots,
        ERR_NO_UNTYPED => KernelError::NoUntyped,
        ERR_CAP_COPY_FAILED => KernelError::CapCopyFailed,
        ERR_MAP_FAILED => KernelError::MapFailed,
        ERR_NO_VIRTUAL_RANGE => KernelError::NoVirtualRange,
        _ => KernelError::KernelRefused,
    }
}

/// Trap into the kernel with a target slot, an invocation label, and four
/// message-register words. Returns the error code in `x0` plus the four
/// (possibly kernel-overwritten) message registers.
#[inline(always)]
pub(crate) unsafe fn invoke(cptr: u64, label: Label, a0: u64, a1: u64, a2: u64, a3: u64) -> (u64, u64, u64, u64, u64) {
    let mut r0 = cptr;
    let mut r1 = label as u64;
    let mut r2 = a0;
    let mut r3 = a1;
    let mut r4 = a2;
    let mut r5 = a3;
    asm!(
        "svc #0",
        inout("x0") r0,
        inout("x1") r1,
        inout("x2") r2,
        inout("x3") r3,
        inout("x4") r4,
        inout("x5") r5,
        options(nostack),
    );
    (r0, r2, r3, r4, r5)
}

/// Convenience wrapper for calls that carry no result words, just success/failure.
pub(crate) fn call(cptr: u64, label: Label, a0: u64, a1: u64, a2: u64, a3: u64) -> Result<(), KernelError> {
    let (err, ..) = unsafe { invoke(cptr, label, a0, a1, a2, a3) };
    if err == 0 {
        Ok(())
    } else {
        Err(decode_error(err))
    }
}

/// Convenience wrapper for calls returning one result word in `x2`.
pub(crate) fn call1(cptr: u64, label: Label, a0: u64, a1: u64, a2: u64, a3: u64) -> Result<u64, KernelError> {
    let (err, r2, ..) = unsafe { invoke(cptr, label, a0, a1, a2, a3) };
    if err == 0 {
        Ok(r2)
    } else {
        Err(decode_error(err))
    }
}

/// Convenience wrapper for calls returning two result words in `x2`/`x3`.
pub(crate) fn call2(cptr: u64, label: Label, a0: u64, a1: u64, a2: u64, a3: u64) -> Result<(u64, u64), KernelError> {
    let (err, r2, r3, ..) = unsafe { invoke(cptr, label, a0, a1, a2, a3) };
    if err == 0 {
        Ok((r2, r3))
    } else {
        Err(decode_error(err))
    }
}

fn encode_rights(r: Rights) -> u64 {
    r.read as u64 | (r.write as u64) << 1 | (r.execute as u64) << 2 | (r.grant as u64) << 3
}

fn encode_attrs(a: PageAttrs) -> u64 {
    a.readable as u64 | (a.writable as u64) << 1 | (a.executable as u64) << 2 | (a.cacheable as u64) << 3
}

/// The concrete [`Kernel`]/[`CapAllocator`]/[`AddressSpace`] backend for this
/// architecture: every trait method traps via [`invoke`] against either the
/// object the operation is about (a TCB, an endpoint) or one of the two fixed
/// capabilities this handle was constructed with.
pub struct Syscalls {
    cnode: Slot,
    page_directory: Slot,
}

impl Syscalls {
    /// `cnode` and `page_directory` are this thread's own well-known slots
    /// (`runtime_process::slot::SELF_CNODE`/`PAGE_DIRECTORY`) — every
    /// capability-table and address-space operation is invoked against them.
    pub const fn new(cnode: Slot, page_directory: Slot) -> Self {
        Self { cnode, page_directory }
    }
}

impl CapAllocator for Syscalls {
    fn alloc_slot(&self) -> Result<Slot, KernelError> {
        call1(self.cnode.0, Label::AllocSlot, 0, 0, 0, 0).map(Slot)
    }

    fn free_slot(&self, slot: Slot) {
        let _ = call(self.cnode.0, Label::FreeSlot, slot.0, 0, 0, 0);
    }

    fn retype_untyped(&self, untyped: Slot, object_size_bits: u8, dest: Slot) -> Result<(), KernelError> {
        call(self.cnode.0, Label::RetypeUntyped, untyped.0, object_size_bits as u64, dest.0, 0)
    }

    fn add_untyped(&self, untyped: Slot, size_bits: u8, is_device: bool) {
        let _ = call(self.cnode.0, Label::AddUntyped, untyped.0, size_bits as u64, is_device as u64, 0);
    }

    fn copy_cap(&self, src: Slot, dest: Slot, rights: Rights) -> Result<(), KernelError> {
        call(self.cnode.0, Label::CopyCap, src.0, dest.0, encode_rights(rights), 0)
    }

    fn mint_cap(&self, src: Slot, dest: Slot, rights: Rights, badge: u64) -> Result<(), KernelError> {
        call(self.cnode.0, Label::MintCap, src.0, dest.0, encode_rights(rights), badge)
    }

    fn delete_cap(&self, slot: Slot) -> Result<(), KernelError> {
        call(self.cnode.0, Label::DeleteCap, slot.0, 0, 0, 0)
    }

    fn revoke_cap(&self, slot: Slot) -> Result<(), KernelError> {
        call(self.cnode.0, Label::RevokeCap, slot.0, 0, 0, 0)
    }
}

impl AddressSpace for Syscalls {
    fn reserve(&self, num_pages: usize) -> Result<VirtRange, KernelError> {
        let (base, page_bits) = call2(self.page_directory.0, Label::Reserve, num_pages as u64, 0, 0, 0)?;
        Ok(VirtRange { base, num_pages, page_bits: page_bits as u8 })
    }

    fn map_fresh(&self, _alloc: &dyn CapAllocator, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError> {
        call(
            self.page_directory.0,
            Label::MapFresh,
            range.base,
            range.num_pages as u64,
            range.page_bits as u64,
            encode_attrs(attrs),
        )
    }

    fn map_frames(&self, range: VirtRange, frames: &[Slot], attrs: PageAttrs) -> Result<(), KernelError> {
        let page_size = 1u64 << range.page_bits;
        for (i, f) in frames.iter().enumerate() {
            call(
                self.page_directory.0,
                Label::MapFrames,
                range.base + i as u64 * page_size,
                f.0,
                range.page_bits as u64,
                encode_attrs(attrs),
            )?;
        }
        Ok(())
    }

    fn map_device(&self, _alloc: &dyn CapAllocator, phys_addr: u64, num_pages: usize, attrs: PageAttrs) -> Result<VirtRange, KernelError> {
        let (base, page_bits) = call2(self.page_directory.0, Label::MapDevice, phys_addr, num_pages as u64, encode_attrs(attrs), 0)?;
        Ok(VirtRange { base, num_pages, page_bits: page_bits as u8 })
    }

    fn remap(&self, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError> {
        call(
            self.page_directory.0,
            Label::Remap,
            range.base,
            range.num_pages as u64,
            range.page_bits as u64,
            encode_attrs(attrs),
        )
    }

    fn unmap(&self, range: VirtRange) -> Result<(), KernelError> {
        call(self.page_directory.0, Label::Unmap, range.base, range.num_pages as u64, range.page_bits as u64, 0)
    }

    fn share_map(&self, frames: &[Slot], attrs: PageAttrs) -> Result<VirtRange, KernelError> {
        let (base, page_bits) = call2(self.page_directory.0, Label::ShareMap, frames.len() as u64, encode_attrs(attrs), 0, 0)?;
        let range = VirtRange { base, num_pages: frames.len(), page_bits: page_bits as u8 };
        self.map_frames(range, frames, attrs)?;
        Ok(range)
    }

    fn physical_address(&self, vaddr: u64) -> Result<u64, KernelError> {
        call1(self.page_directory.0, Label::PhysicalAddress, vaddr, 0, 0, 0)
    }

    fn write_bytes(&self, vaddr: u64, data: &[u8]) -> Result<(), KernelError> {
        // The range is already mapped into this address space by the time a
        // caller writes to it; an ordinary store is all that's needed here,
        // unlike every other operation in this file, which must trap.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), vaddr as *mut u8, data.len()) };
        Ok(())
    }

    fn read_bytes(&self, vaddr: u64, out: &mut [u8]) -> Result<(), KernelError> {
        unsafe { core::ptr::copy_nonoverlapping(vaddr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}

impl Kernel for Syscalls {
    fn configure_tcb(&self, tcb: Slot, cspace: Slot, vspace: Slot, fault_ep: Option<Slot>) -> Result<(), KernelError> {
        call(
            tcb.0,
            Label::ConfigureTcb,
            cspace.0,
            vspace.0,
            fault_ep.map(|s| s.0).unwrap_or(0),
            fault_ep.is_some() as u64,
        )
    }

    fn write_registers(&self, tcb: Slot, ip: u64, sp: u64, resume: bool) -> Result<(), KernelError> {
        call(tcb.0, Label::WriteRegisters, ip, sp, resume as u64, 0)
    }

    fn set_priority(&self, tcb: Slot, priority: u8) -> Result<(), KernelError> {
        call(tcb.0, Label::SetPriority, priority as u64, 0, 0, 0)
    }

    fn set_affinity(&self, tcb: Slot, cpu: u32) -> Result<(), KernelError> {
        call(tcb.0, Label::SetAffinity, cpu as u64, 0, 0, 0)
    }

    fn assign_asid(&self, pool: Slot, vspace: Slot) -> Result<(), KernelError> {
        call(pool.0, Label::AssignAsid, vspace.0, 0, 0, 0)
    }

    fn signal(&self, notification: Slot) -> Result<(), KernelError> {
        call(notification.0, Label::Signal, 0, 0, 0, 0)
    }

    fn wait(&self, notification: Slot) -> Result<(), KernelError> {
        call(notification.0, Label::Wait, 0, 0, 0, 0)
    }

    fn send(&self, endpoint: Slot, badge: u64, payload: u64) -> Result<(), KernelError> {
        call(endpoint.0, Label::Send, badge, payload, 0, 0)
    }

    fn recv(&self, endpoint: Slot) -> Result<(u64, u64), KernelError> {
        call2(endpoint.0, Label::Recv, 0, 0, 0, 0)
    }

    fn call(&self, endpoint: Slot, badge: u64, payload: u64) -> Result<u64, KernelError> {
        call1(endpoint.0, Label::Call, badge, payload, 0, 0)
    }

    fn reply(&self, payload: u64) -> Result<(), KernelError> {
        call(0, Label::Reply, payload, 0, 0, 0)
    }

    fn debug_name_thread(&self, tcb: Slot, name: &str) {
        let mut bytes = [0u8; 8];
        let n = name.len().min(8);
        bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
        let _ = call(tcb.0, Label::DebugNameThread, u64::from_le_bytes(bytes), name.len() as u64, 0, 0);
    }

    fn current_thread_id(&self) -> u64 {
        call1(0, Label::CurrentThreadId, 0, 0, 0, 0).unwrap_or(0)
    }

    fn current_thread_sync_notification(&self) -> Slot {
        Slot(call1(0, Label::CurrentThreadSyncNotification, 0, 0, 0, 0).unwrap_or(0))
    }
}
