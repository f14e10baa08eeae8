/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Root-task init: the privileged analog of [`crate::child::ChildInit`],
//! bootstrapping from kernel-provided boot info instead of a handoff record,
//! and performing the image re-mapping pass some architectures need.

use runtime_kernel::{AddressSpace, CapAllocator, KernelError, PageAttrs, Slot, VirtRange};

/// One untyped region as reported by the kernel's boot info, before it has
/// been added to any allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootInfoUntyped {
    pub slot: Slot,
    pub size_bits: u8,
    pub phys_addr: u64,
    pub is_device: bool,
}

/// One loaded segment of the root task's own image, as the bootloader or
/// linker script reports it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ImageSegment {
    pub range: VirtRange,
    pub executable: bool,
}

/// Bootstraps the privileged root context: seeds the capability allocator
/// from boot info, then (on architectures where the initial mapping cannot
/// already express it) re-maps the root image's own segments to their final
/// permissions.
pub struct RootInit<'a> {
    alloc: &'a dyn CapAllocator,
    vspace: &'a dyn AddressSpace,
}

impl<'a> RootInit<'a> {
    pub fn new(alloc: &'a dyn CapAllocator, vspace: &'a dyn AddressSpace) -> Self {
        Self { alloc, vspace }
    }

    /// Register every boot-info untyped with the allocator.
    pub fn bootstrap_allocator(&self, untypeds: &[BootInfoUntyped]) {
        for u in untypeds {
            self.alloc.add_untyped(u.slot, u.size_bits, u.is_device);
        }
    }

    /// Re-map the root image to its final permissions: executable segments
    /// read-only+execute, everything else read-write+execute-never. Logs and
    /// continues, rather than failing, on an architecture that rejects the
    /// remap — mirrors `init.c`'s ARM-only pass, generalized to run
    /// unconditionally and degrade gracefully elsewhere.
    pub fn remap_image(&self, segments: &[ImageSegment]) -> Result<(), KernelError> {
        for seg in segments {
            let attrs = if seg.executable { PageAttrs::rx() } else { PageAttrs::rw().execute_never() };
            match self.vspace.remap(seg.range, attrs) {
                Ok(()) => {}
                Err(KernelError::MapFailed) => {
                    runtime_log::warn!("architecture rejected root image remap; leaving original mapping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimAddressSpace, SimCapAllocator};

    #[test]
    fn bootstrap_allocator_forwards_every_untyped() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let root = RootInit::new(&alloc, &vspace);
        root.bootstrap_allocator(&[
            BootInfoUntyped { slot: Slot(10), size_bits: 20, phys_addr: 0x8000_0000, is_device: false },
            BootInfoUntyped { slot: Slot(11), size_bits: 12, phys_addr: 0x3f20_0000, is_device: true },
        ]);
        // retype_untyped only succeeds once at least one untyped is known.
        assert!(alloc.retype_untyped(Slot(10), 12, Slot(50)).is_ok());
    }

    #[test]
    fn remap_gives_code_execute_and_data_execute_never() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let code = vspace.reserve(1).unwrap();
        vspace.map_fresh(&alloc, code, PageAttrs::rw()).unwrap();
        let data = vspace.reserve(1).unwrap();
        vspace.map_fresh(&alloc, data, PageAttrs::rw()).unwrap();

        let root = RootInit::new(&alloc, &vspace);
        root.remap_image(&[
            ImageSegment { range: code, executable: true },
            ImageSegment { range: data, executable: false },
        ])
        .unwrap();

        assert!(vspace.attrs_at(code.base).unwrap().executable);
        assert!(!vspace.attrs_at(data.base).unwrap().executable);
    }
}
