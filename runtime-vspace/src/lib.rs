/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Policy wrapper over [`AddressSpace`]: a stack with a faulting guard page, a
//! plain page mapper, a device-memory mapper, and a permission-fix remap pass
//! for architectures that cannot express "no-execute" in the initial mapping call.
//!
//! Grounded on `libmmap/src/mmap.c` (the authoritative `mmap_new_pages` shape,
//! the out-parameter-returning variant per spec 9 open question) and, for the
//! guard-page placement either side of a stack,
//! `other_examples/.../quahad-ferros__src-userland-process-standard.rs.rs`
//! (`vspace.skip_pages(1)` before and after the mapped stack).

#![cfg_attr(not(test), no_std)]

use runtime_kernel::{AddressSpace, CapAllocator, KernelError, PageAttrs, VirtRange};
use snafu::Snafu;

/// Errors from the mapping policy layer.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum VspaceError {
    #[snafu(display("underlying address space operation failed: {source}"))]
    Kernel { source: KernelError },
}

impl From<KernelError> for VspaceError {
    fn from(source: KernelError) -> Self {
        VspaceError::Kernel { source }
    }
}

/// A mapped stack: `top` is the address one past the highest usable byte, and
/// `guard_addr` is the unmapped page immediately below the mapped region.
///
/// Spec 9 resolves the stack-guard arithmetic ambiguity unambiguously here:
/// `guard_addr = top - (stack_pages + 1) * page_size`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedStack {
    pub top: u64,
    pub guard_addr: u64,
    pub mapped: VirtRange,
}

/// Map a `num_pages`-page stack with a single unmapped guard page below it.
/// Touching `guard_addr` (or anything below it) faults, by construction: the
/// guard page is reserved but never mapped.
pub fn map_stack(
    vspace: &dyn AddressSpace,
    alloc: &dyn CapAllocator,
    num_pages: usize,
) -> Result<MappedStack, VspaceError> {
    let full = vspace.reserve(num_pages + 1)?;
    let page_size = full.page_size();
    let guard_addr = full.base;
    let stack_range = VirtRange {
        base: full.base + page_size,
        num_pages,
        page_bits: full.page_bits,
    };
    vspace.map_fresh(alloc, stack_range, PageAttrs::rw())?;
    Ok(MappedStack {
        top: stack_range.top(),
        guard_addr,
        mapped: stack_range,
    })
}

/// Map `num_pages` fresh frames with the given attributes, running the
/// permission-fix pass when the caller asked for a non-executable mapping.
pub fn map_pages(
    vspace: &dyn AddressSpace,
    alloc: &dyn CapAllocator,
    num_pages: usize,
    attrs: PageAttrs,
) -> Result<VirtRange, VspaceError> {
    let range = vspace.reserve(num_pages)?;
    vspace.map_fresh(alloc, range, attrs)?;
    fixup_permissions(vspace, range, attrs)?;
    Ok(range)
}

/// Map `num_pages` device frames at `phys_addr`. Cache attribute is forced off
/// regardless of what the caller requested, matching device-memory semantics.
pub fn map_device_pages(
    vspace: &dyn AddressSpace,
    alloc: &dyn CapAllocator,
    phys_addr: u64,
    num_pages: usize,
    mut attrs: PageAttrs,
) -> Result<VirtRange, VspaceError> {
    attrs.cacheable = false;
    let range = vspace.map_device(alloc, phys_addr, num_pages, attrs)?;
    fixup_permissions(vspace, range, attrs)?;
    Ok(range)
}

/// After the initial mapping, if the caller asked for a non-executable range,
/// re-map it with the architecture's explicit execute-never attribute. This is
/// a no-op when `attrs.executable` is already false... actually it *is* false
/// in that case, so the remap always runs with `execute_never()`; the teacher's
/// closest analog ARM remap pass (`init_root_task`'s image-remap, `init.c`)
/// always performs an unconditional second pass too, logging rather than
/// failing on architectures where the kernel ignores the distinction.
fn fixup_permissions(vspace: &dyn AddressSpace, range: VirtRange, attrs: PageAttrs) -> Result<(), VspaceError> {
    if attrs.executable {
        return Ok(());
    }
    match vspace.remap(range, attrs.execute_never()) {
        Ok(()) => Ok(()),
        Err(KernelError::MapFailed) => {
            runtime_log::warn!("architecture has no execute-never remap; leaving mapping as-is");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimAddressSpace, SimCapAllocator};

    #[test]
    fn stack_guard_is_below_mapped_region_and_unmapped() {
        let vspace = SimAddressSpace::new();
        let alloc = SimCapAllocator::new();
        let stack = map_stack(&vspace, &alloc, 4).unwrap();
        assert_eq!(stack.guard_addr, stack.mapped.base - stack.mapped.page_size());
        assert!(!vspace.is_mapped(stack.guard_addr));
        assert!(vspace.is_mapped(stack.mapped.base));
        assert_eq!(stack.top, stack.mapped.base + 4 * stack.mapped.page_size());
    }

    #[test]
    fn map_pages_runs_permission_fix_for_data() {
        let vspace = SimAddressSpace::new();
        let alloc = SimCapAllocator::new();
        let range = map_pages(&vspace, &alloc, 2, PageAttrs::rw()).unwrap();
        let attrs = vspace.attrs_at(range.base).unwrap();
        assert!(!attrs.executable);
    }

    #[test]
    fn map_pages_skips_permission_fix_for_code() {
        let vspace = SimAddressSpace::new();
        let alloc = SimCapAllocator::new();
        let range = map_pages(&vspace, &alloc, 2, PageAttrs::rx()).unwrap();
        let attrs = vspace.attrs_at(range.base).unwrap();
        assert!(attrs.executable);
    }

    #[test]
    fn device_pages_are_never_cacheable() {
        let vspace = SimAddressSpace::new();
        let alloc = SimCapAllocator::new();
        let range = map_device_pages(&vspace, &alloc, 0x3f20_0000, 1, PageAttrs::device()).unwrap();
        assert!(!vspace.attrs_at(range.base).unwrap().cacheable);
    }
}
