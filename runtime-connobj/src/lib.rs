/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Typed connection objects: endpoints, notifications, and shared memory,
//! attachable to any number of process builders with per-attach permissions
//! and a reference count that rejects freeing a still-used object.
//!
//! Grounded on `libprocess/src/connect.c`. Interior state (refcount and the
//! optional self-mapping) is guarded the way `machine::sync::NullLock` guards
//! kernel globals: callers are required to already hold the process-wide lock
//! (`runtime-process`'s `libprocessLock`) before touching a [`ConnObj`], so a
//! plain [`core::cell::UnsafeCell`] plus an explicit `Sync` assertion is
//! enough; no internal lock is duplicated here.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{string::String, vec::Vec};
use core::cell::UnsafeCell;
use runtime_kernel::{AddressSpace, CapAllocator, Kernel, KernelError, PageAttrs, Rights, Slot, VirtRange};
use snafu::Snafu;

/// Errors from connection-object operations.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum ConnError {
    #[snafu(display("connection object still has {count} attachment(s)"))]
    StillReferenced { count: u32 },
    #[snafu(display("shared memory object already has a self-mapping"))]
    AlreadySelfMapped,
    #[snafu(display("underlying kernel operation failed: {source}"))]
    Kernel { source: KernelError },
}

impl From<KernelError> for ConnError {
    fn from(source: KernelError) -> Self {
        ConnError::Kernel { source }
    }
}

/// Permissions requested for one attachment of a connection object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ConnPerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub grant: bool,
    /// Badge applied when minting an endpoint/notification capability into a
    /// remote process. Ignored for shared memory.
    pub badge: Option<u64>,
}

impl From<ConnPerms> for Rights {
    fn from(p: ConnPerms) -> Self {
        Rights {
            read: p.read,
            write: p.write,
            execute: p.execute,
            grant: p.grant,
        }
    }
}

impl ConnPerms {
    fn page_attrs(self) -> PageAttrs {
        PageAttrs {
            readable: self.read,
            writable: self.write,
            executable: self.execute,
            cacheable: true,
        }
    }
}

enum Kind {
    Endpoint(Slot),
    Notification(Slot),
    Shmem {
        frames: Vec<Slot>,
        page_bits: u8,
        self_mapping: UnsafeCell<Option<VirtRange>>,
    },
}

/// A created but not-yet-attached (or already attached) connection object.
pub struct ConnObj {
    name: String,
    kind: Kind,
    refcount: UnsafeCell<u32>,
}

// SAFETY: every accessor below is only sound when the caller serializes access
// externally (runtime-process's libprocessLock), exactly as the reference
// library requires its callers to hold its own global lock.
unsafe impl Sync for ConnObj {}

/// The outcome of connecting a connection object to a destination.
pub enum ConnectOutcome {
    /// An endpoint or notification capability copied (or minted) into the
    /// destination's capability table at the slot the caller provided.
    Slot(Slot),
    /// Shared-memory frame capabilities copied into the destination's
    /// capability table, one per page, in order.
    Frames(Vec<Slot>),
    /// Shared memory mapped directly into the caller's own address space
    /// (the `SELF` destination).
    SelfMapped(VirtRange),
}

impl ConnObj {
    /// Create a fresh endpoint.
    pub fn create_endpoint(alloc: &dyn CapAllocator, name: impl Into<String>) -> Result<Self, ConnError> {
        let slot = alloc.alloc_slot()?;
        Ok(Self {
            name: name.into(),
            kind: Kind::Endpoint(slot),
            refcount: UnsafeCell::new(0),
        })
    }

    /// Create a fresh notification.
    pub fn create_notification(alloc: &dyn CapAllocator, name: impl Into<String>) -> Result<Self, ConnError> {
        let slot = alloc.alloc_slot()?;
        Ok(Self {
            name: name.into(),
            kind: Kind::Notification(slot),
            refcount: UnsafeCell::new(0),
        })
    }

    /// Create a fresh shared-memory region of `num_pages` frames, rolling back
    /// any frame already allocated if a later one fails.
    pub fn create_shmem(
        alloc: &dyn CapAllocator,
        name: impl Into<String>,
        num_pages: usize,
        page_bits: u8,
    ) -> Result<Self, ConnError> {
        let mut frames = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            match alloc.alloc_slot() {
                Ok(slot) => frames.push(slot),
                Err(e) => {
                    for f in frames {
                        alloc.free_slot(f);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(Self {
            name: name.into(),
            kind: Kind::Shmem {
                frames,
                page_bits,
                self_mapping: UnsafeCell::new(None),
            },
            refcount: UnsafeCell::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn refcount(&self) -> u32 {
        unsafe { *self.refcount.get() }
    }

    fn bump_refcount(&self, delta: i32) {
        let r = unsafe { &mut *self.refcount.get() };
        *r = (*r as i32 + delta) as u32;
    }

    /// Attach this object to the caller's own address space (`connect(SELF, ...)`).
    /// Only meaningful for shared memory; endpoints/notifications return their
    /// own capability slot directly since no copy is needed for `SELF`.
    ///
    /// Unlike [`ConnObj::connect_remote`], this does not bump `refcount`: the
    /// reference count tracks attachments to *other* processes (§8 refcount
    /// conservation holds for `connect(h, c)` with `h != SELF`), the original
    /// gates its increment the same way (`if (handle != PROCESS_SELF)` in
    /// `connect.c`). The self-mapping itself is its own piece of state,
    /// recorded in `self_mapping` and torn down by `unmap_self`/`free`.
    pub fn connect_self(
        &self,
        vspace: &dyn AddressSpace,
        perms: ConnPerms,
    ) -> Result<ConnectOutcome, ConnError> {
        let outcome = match &self.kind {
            Kind::Endpoint(slot) | Kind::Notification(slot) => ConnectOutcome::Slot(*slot),
            Kind::Shmem {
                frames,
                page_bits,
                self_mapping,
            } => {
                let existing = unsafe { &*self_mapping.get() };
                if existing.is_some() {
                    return Err(ConnError::AlreadySelfMapped);
                }
                let range = VirtRange {
                    base: vspace.reserve(frames.len())?.base,
                    num_pages: frames.len(),
                    page_bits: *page_bits,
                };
                vspace.map_frames(range, frames, perms.page_attrs())?;
                unsafe {
                    *self_mapping.get() = Some(range);
                }
                ConnectOutcome::SelfMapped(range)
            }
        };
        Ok(outcome)
    }

    /// Attach this object to a remote process: copy (or, if `perms.badge` is
    /// set, mint) its capability into `dest_slot` of `dest_alloc`'s table.
    /// For shared memory, `dest_slot` is the first of `frames.len()`
    /// contiguous slots the caller has reserved.
    pub fn connect_remote(
        &self,
        dest_alloc: &dyn CapAllocator,
        dest_slot: Slot,
        perms: ConnPerms,
    ) -> Result<ConnectOutcome, ConnError> {
        let rights: Rights = perms.into();
        let outcome = match &self.kind {
            Kind::Endpoint(src) | Kind::Notification(src) => {
                if let Some(badge) = perms.badge {
                    dest_alloc.mint_cap(*src, dest_slot, rights, badge)?;
                } else {
                    dest_alloc.copy_cap(*src, dest_slot, rights)?;
                }
                ConnectOutcome::Slot(dest_slot)
            }
            Kind::Shmem { frames, .. } => {
                let mut copied = Vec::with_capacity(frames.len());
                for (i, src) in frames.iter().enumerate() {
                    let dest = Slot(dest_slot.0 + i as u64);
                    if let Err(e) = dest_alloc.copy_cap(*src, dest, rights) {
                        for d in &copied {
                            let _ = dest_alloc.delete_cap(*d);
                        }
                        return Err(e.into());
                    }
                    copied.push(dest);
                }
                ConnectOutcome::Frames(copied)
            }
        };
        self.bump_refcount(1);
        Ok(outcome)
    }

    /// Record that one previously successful `connect` has been released
    /// (the attached process was destroyed).
    pub fn disconnect(&self) {
        self.bump_refcount(-1);
    }

    /// Undo a self-mapping created by [`ConnObj::connect_self`]. Does not
    /// touch `refcount`, which `connect_self` never bumped either.
    pub fn unmap_self(&self, vspace: &dyn AddressSpace) -> Result<(), ConnError> {
        if let Kind::Shmem { self_mapping, .. } = &self.kind {
            let range = unsafe { (*self_mapping.get()).take() };
            if let Some(range) = range {
                vspace.unmap(range)?;
            }
        }
        Ok(())
    }

    /// Free the object's kernel resources. Fails while any remote attachment
    /// remains; a lingering self-mapping is unmapped here first rather than
    /// counted as a reference (`cleanup_shmem_obj` in `connect.c` does the
    /// same: unmap the local mapping, then delete the frame caps).
    pub fn free(self, alloc: &dyn CapAllocator, _kernel: &dyn Kernel, vspace: &dyn AddressSpace) -> Result<(), ConnError> {
        let count = self.refcount();
        if count > 0 {
            return Err(ConnError::StillReferenced { count });
        }
        self.unmap_self(vspace)?;
        match self.kind {
            Kind::Endpoint(slot) | Kind::Notification(slot) => alloc.delete_cap(slot)?,
            Kind::Shmem { frames, .. } => {
                for f in frames {
                    alloc.delete_cap(f)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimAddressSpace, SimCapAllocator, SimKernel};

    #[test]
    fn refcount_tracks_connects_and_disconnects() {
        let alloc = SimCapAllocator::new();
        let kernel = SimKernel::new();
        let vspace = SimAddressSpace::new();
        let ep = ConnObj::create_endpoint(&alloc, "ep").unwrap();
        assert_eq!(ep.refcount(), 0);
        ep.connect_remote(&alloc, Slot(100), ConnPerms::default()).unwrap();
        ep.connect_remote(&alloc, Slot(101), ConnPerms::default()).unwrap();
        assert_eq!(ep.refcount(), 2);
        ep.disconnect();
        assert_eq!(ep.refcount(), 1);
        assert_eq!(
            ep.free(&alloc, &*kernel, &vspace),
            Err(ConnError::StillReferenced { count: 1 })
        );
        ep.disconnect();
        assert_eq!(ep.refcount(), 0);
        ep.free(&alloc, &*kernel, &vspace).unwrap();
    }

    #[test]
    fn self_mapping_is_idempotent_and_exclusive() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let shmem = ConnObj::create_shmem(&alloc, "shm", 2, 12).unwrap();
        let outcome = shmem.connect_self(&vspace, ConnPerms { read: true, write: true, ..Default::default() }).unwrap();
        let first_addr = match outcome {
            ConnectOutcome::SelfMapped(r) => r.base,
            _ => panic!("expected self mapping"),
        };
        assert_eq!(
            shmem.connect_self(&vspace, ConnPerms::default()),
            Err(ConnError::AlreadySelfMapped)
        );
        shmem.unmap_self(&vspace).unwrap();
        let outcome = shmem.connect_self(&vspace, ConnPerms::default()).unwrap();
        match outcome {
            ConnectOutcome::SelfMapped(r) => assert_ne!(r.base, 0),
            _ => panic!("expected self mapping"),
        }
        let _ = first_addr;
    }

    #[test]
    fn self_connect_does_not_bump_refcount_and_free_unmaps_it() {
        let alloc = SimCapAllocator::new();
        let kernel = SimKernel::new();
        let vspace = SimAddressSpace::new();
        let shmem = ConnObj::create_shmem(&alloc, "shm", 2, 12).unwrap();
        let outcome = shmem.connect_self(&vspace, ConnPerms { read: true, write: true, ..Default::default() }).unwrap();
        let base = match outcome {
            ConnectOutcome::SelfMapped(r) => r.base,
            _ => panic!("expected self mapping"),
        };
        assert_eq!(shmem.refcount(), 0);
        assert!(vspace.is_mapped(base));
        // A self-mapping alone must not block free, and free must tear it down.
        shmem.free(&alloc, &*kernel, &vspace).unwrap();
        assert!(!vspace.is_mapped(base));
    }

    #[test]
    fn shmem_connect_remote_copies_one_cap_per_frame() {
        let alloc = SimCapAllocator::new();
        let shmem = ConnObj::create_shmem(&alloc, "shm", 3, 12).unwrap();
        let outcome = shmem
            .connect_remote(&alloc, Slot(50), ConnPerms { read: true, write: true, ..Default::default() })
            .unwrap();
        match outcome {
            ConnectOutcome::Frames(slots) => assert_eq!(slots.len(), 3),
            _ => panic!("expected frame list"),
        }
    }
}
