/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Traits naming the microkernel primitives the higher `runtime-*` crates are
//! built against: capability allocation, address-space mapping, and the raw
//! thread/IPC/notification syscalls. Real backends (arch-specific syscall
//! trampolines) live in `vesper-user`; the [`sim`] module backs hosted tests.

#![cfg_attr(not(any(test, feature = "sim")), no_std)]

extern crate alloc;

use snafu::Snafu;

/// A slot in some capability table. Opaque outside of the crate that owns the table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Slot(pub u64);

/// A virtual address range reserved in some address space.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VirtRange {
    pub base: u64,
    pub num_pages: usize,
    pub page_bits: u8,
}

impl VirtRange {
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_bits
    }

    pub fn len_bytes(&self) -> u64 {
        self.page_size() * self.num_pages as u64
    }

    pub fn top(&self) -> u64 {
        self.base + self.len_bytes()
    }
}

/// Page mapping/permission attributes, the rendering of the kernel's page-attribute bitfield.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageAttrs {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub cacheable: bool,
}

impl PageAttrs {
    pub const fn rw() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: false,
            cacheable: true,
        }
    }

    pub const fn rx() -> Self {
        Self {
            readable: true,
            writable: false,
            executable: true,
            cacheable: true,
        }
    }

    pub const fn device() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: false,
            cacheable: false,
        }
    }

    /// The permission-fix remap pass (spec 4.3): strip execute, keep everything else.
    pub const fn execute_never(self) -> Self {
        Self {
            executable: false,
            ..self
        }
    }
}

/// Rights carried by a capability copy or mint.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub grant: bool,
}

/// Errors surfaced by the external collaborators. Every higher crate's own error
/// type has a `#[snafu(context(false))]`-style `From<KernelError>` conversion.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    #[snafu(display("capability allocator has no free slots"))]
    NoFreeSlots,
    #[snafu(display("no untyped memory large enough for the request"))]
    NoUntyped,
    #[snafu(display("kernel refused to copy or mint the capability"))]
    CapCopyFailed,
    #[snafu(display("kernel refused to map, remap, or unmap the requested pages"))]
    MapFailed,
    #[snafu(display("address space has no virtual range large enough for the request"))]
    NoVirtualRange,
    #[snafu(display("kernel refused the TCB or IPC operation"))]
    KernelRefused,
}

/// Allocates capability-table slots and retypes untyped memory into kernel objects.
///
/// Grounded on `vka_t`'s function-pointer table (`lockvka.c`): `cspace_alloc`,
/// `utspace_alloc`, `utspace_free`, `cspace_free` collapse here into one trait.
pub trait CapAllocator {
    /// Reserve the next free slot in the underlying capability table.
    fn alloc_slot(&self) -> Result<Slot, KernelError>;

    /// Return a previously allocated, now-unused slot to the pool.
    fn free_slot(&self, slot: Slot);

    /// Retype a range of untyped memory into a new kernel object, placed at `dest`.
    fn retype_untyped(
        &self,
        untyped: Slot,
        object_size_bits: u8,
        dest: Slot,
    ) -> Result<(), KernelError>;

    /// Contribute a raw untyped region (as granted in a handoff record) to this allocator.
    fn add_untyped(&self, untyped: Slot, size_bits: u8, is_device: bool);

    /// Copy a capability, with the given rights, into `dest`.
    fn copy_cap(&self, src: Slot, dest: Slot, rights: Rights) -> Result<(), KernelError>;

    /// Derive a badged capability from `src` into `dest`.
    fn mint_cap(&self, src: Slot, dest: Slot, rights: Rights, badge: u64) -> Result<(), KernelError>;

    /// Delete the capability occupying `slot`, without affecting its derivatives.
    fn delete_cap(&self, slot: Slot) -> Result<(), KernelError>;

    /// Delete the capability occupying `slot` and everything derived from it.
    fn revoke_cap(&self, slot: Slot) -> Result<(), KernelError>;
}

/// Reserves and maps virtual address ranges against one page directory.
///
/// Grounded on `vspace_t`-style bookkeepers used throughout `create.c`/`run.c`.
pub trait AddressSpace {
    /// Reserve `num_pages` contiguous pages of virtual address space, unmapped.
    fn reserve(&self, num_pages: usize) -> Result<VirtRange, KernelError>;

    /// Map fresh frames (allocated from `alloc`'s untypeds) over `range`.
    fn map_fresh(
        &self,
        alloc: &dyn CapAllocator,
        range: VirtRange,
        attrs: PageAttrs,
    ) -> Result<(), KernelError>;

    /// Map caller-supplied frame capabilities over `range`.
    fn map_frames(
        &self,
        range: VirtRange,
        frames: &[Slot],
        attrs: PageAttrs,
    ) -> Result<(), KernelError>;

    /// Map `num_pages` device frames at `phys_addr` over a freshly reserved range.
    fn map_device(
        &self,
        alloc: &dyn CapAllocator,
        phys_addr: u64,
        num_pages: usize,
        attrs: PageAttrs,
    ) -> Result<VirtRange, KernelError>;

    /// Re-map an already-mapped range with new attributes (the permission-fix pass).
    fn remap(&self, range: VirtRange, attrs: PageAttrs) -> Result<(), KernelError>;

    /// Unmap and release a previously mapped range.
    fn unmap(&self, range: VirtRange) -> Result<(), KernelError>;

    /// Temporarily map `range` (from some other address space) into this one, for a
    /// one-shot copy such as the handoff blob's root-side write.
    fn share_map(&self, frames: &[Slot], attrs: PageAttrs) -> Result<VirtRange, KernelError>;

    /// The physical address backing a mapped virtual address, if any.
    fn physical_address(&self, vaddr: u64) -> Result<u64, KernelError>;

    /// Write `data` into a previously mapped range starting at `vaddr`.
    ///
    /// A real backend performs this as an ordinary pointer write into mapped
    /// virtual memory; it is surfaced here as an explicit operation (rather
    /// than handing out a raw pointer) so that hosted tests can exercise the
    /// handoff-blob and stack-frame writers against the in-memory simulator
    /// in `sim` without mapping real pages.
    fn write_bytes(&self, vaddr: u64, data: &[u8]) -> Result<(), KernelError>;

    /// Read back previously written bytes from a mapped range.
    fn read_bytes(&self, vaddr: u64, out: &mut [u8]) -> Result<(), KernelError>;
}

/// The raw syscalls not mediated by a `CapAllocator`/`AddressSpace`: thread
/// control, IPC, notifications, ASID assignment, and debug naming.
pub trait Kernel {
    fn configure_tcb(
        &self,
        tcb: Slot,
        cspace: Slot,
        vspace: Slot,
        fault_ep: Option<Slot>,
    ) -> Result<(), KernelError>;

    fn write_registers(&self, tcb: Slot, ip: u64, sp: u64, resume: bool) -> Result<(), KernelError>;

    fn set_priority(&self, tcb: Slot, priority: u8) -> Result<(), KernelError>;

    fn set_affinity(&self, tcb: Slot, cpu: u32) -> Result<(), KernelError>;

    fn assign_asid(&self, pool: Slot, vspace: Slot) -> Result<(), KernelError>;

    fn signal(&self, notification: Slot) -> Result<(), KernelError>;

    fn wait(&self, notification: Slot) -> Result<(), KernelError>;

    fn send(&self, endpoint: Slot, badge: u64, payload: u64) -> Result<(), KernelError>;

    fn recv(&self, endpoint: Slot) -> Result<(u64, u64), KernelError>;

    fn call(&self, endpoint: Slot, badge: u64, payload: u64) -> Result<u64, KernelError>;

    fn reply(&self, payload: u64) -> Result<(), KernelError>;

    /// Best-effort debug aid; absent on release kernels, so this never fails.
    fn debug_name_thread(&self, _tcb: Slot, _name: &str) {}

    /// A monotonically increasing id for the calling thread, assigned once at
    /// thread registration and retrieved thereafter from per-thread storage.
    /// Resolves the open question in spec 9: the reference thread library's
    /// `thread_get_id()` always returned 0.
    fn current_thread_id(&self) -> u64;

    /// The calling thread's private notification slot, used by condition
    /// variables to wake exactly one waiter (fixed slot 7 in a child's
    /// capability table for its main thread; other threads get one assigned
    /// at thread creation).
    fn current_thread_sync_notification(&self) -> Slot;
}

#[cfg(any(test, feature = "sim"))]
pub mod sim;
