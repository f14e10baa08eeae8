/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Child-side `initProcess`: parse the parent-supplied environment, decode
//! the handoff blob, seed the capability allocator, report which virtual
//! ranges are already live, and publish a sequentially-consistent
//! `initialized` flag gating every name-lookup call.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use runtime_handoff::{HandoffError, HandoffRecord};
use runtime_kernel::{CapAllocator, Slot, VirtRange};
use runtime_process::slot;
use snafu::Snafu;

/// Errors from child-side initialization or from a lookup made before/without it.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum InitError {
    #[snafu(display("init_process has not completed yet"))]
    NotInitialized,
    #[snafu(display("handoff record bytes were not a valid encoding"))]
    InvalidHandoff,
    #[snafu(display("no resource with that name was granted"))]
    NotFound,
}

impl From<HandoffError> for InitError {
    fn from(_: HandoffError) -> Self {
        InitError::InvalidHandoff
    }
}

/// The four environment strings the parent's `run()` step sets before
/// starting the child (spec 4.5 step 4 / 4.6 step 1).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChildEnv {
    pub heap_addr: u64,
    pub heap_size: u64,
    pub init_data_addr: u64,
    pub init_data_size: u64,
}

impl ChildEnv {
    /// Parse `HEAP_ADDR=<hex>`, `HEAP_SIZE=<dec>`, `INIT_DATA_ADDR=<hex>`,
    /// `INIT_DATA_SIZE=<dec>` out of a caller-supplied `key, value` list (the
    /// runtime's own `environ` walk is out of scope for this crate).
    pub fn parse(vars: &[(&str, &str)]) -> Result<Self, InitError> {
        let find = |key: &str| vars.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        let hex = |s: &str| u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| InitError::InvalidHandoff);
        let dec = |s: &str| s.parse::<u64>().map_err(|_| InitError::InvalidHandoff);

        Ok(Self {
            heap_addr: hex(find("HEAP_ADDR").ok_or(InitError::InvalidHandoff)?)?,
            heap_size: dec(find("HEAP_SIZE").ok_or(InitError::InvalidHandoff)?)?,
            init_data_addr: hex(find("INIT_DATA_ADDR").ok_or(InitError::InvalidHandoff)?)?,
            init_data_size: dec(find("INIT_DATA_SIZE").ok_or(InitError::InvalidHandoff)?)?,
        })
    }
}

/// The well-known fixed capability slots every child finds populated at
/// start-of-day (re-exported from `runtime-process` so this crate is the
/// only one a child program needs to depend on for lookups).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WellKnownSlots {
    pub self_cnode: Slot,
    pub page_directory: Slot,
    pub fault_sink: Slot,
    pub tcb: Slot,
}

pub const WELL_KNOWN_SLOTS: WellKnownSlots = WellKnownSlots {
    self_cnode: slot::SELF_CNODE,
    page_directory: slot::PAGE_DIRECTORY,
    fault_sink: slot::FAULT_SINK,
    tcb: slot::TCB,
};

/// Number of bookkeeping pages reserved for the capability allocator's
/// dynamic pool once any untyped memory was granted (step 6).
const DYNAMIC_POOL_PAGES: usize = 16;

/// Runtime-side state built up by [`ChildInit::init_process`] and queried by
/// every `lookup_*` call thereafter.
pub struct ChildInit<'a> {
    alloc: &'a dyn CapAllocator,
    handoff: HandoffRecord,
    initialized: AtomicBool,
}

impl<'a> ChildInit<'a> {
    pub fn new(alloc: &'a dyn CapAllocator) -> Self {
        Self {
            alloc,
            handoff: HandoffRecord::default(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Run `initProcess()` steps 1-7. Returns the virtual ranges already live
    /// at entry (step 5) so the caller can seed its own address-space
    /// bookkeeper before making its first `reserve` call; reserves the
    /// dynamic capability-allocator pool itself (step 6) when any untyped
    /// memory was granted.
    pub fn init_process(
        &mut self,
        env: ChildEnv,
        init_data_bytes: &[u8],
        ipc_buffer: VirtRange,
        page_size: u64,
        vspace: &dyn runtime_kernel::AddressSpace,
    ) -> Result<Vec<VirtRange>, InitError> {
        let size = env.init_data_size as usize;
        let record = HandoffRecord::decode(&init_data_bytes[..size])?;

        for u in &record.untypeds {
            self.alloc.add_untyped(Slot(u.slot as u64), u.size_bits as u8, u.is_device);
        }

        let frames = existing_frames(&record, &env, ipc_buffer, page_size);

        if !record.untypeds.is_empty() {
            let _ = vspace.reserve(DYNAMIC_POOL_PAGES);
        }

        self.handoff = record;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(frames)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn require_initialized(&self) -> Result<(), InitError> {
        if !self.is_initialized() {
            return Err(InitError::NotInitialized);
        }
        Ok(())
    }

    pub fn lookup_endpoint(&self, name: &str) -> Result<u32, InitError> {
        self.require_initialized()?;
        self.handoff.lookup_endpoint(name).ok_or(InitError::NotFound)
    }

    pub fn lookup_notification(&self, name: &str) -> Result<u32, InitError> {
        self.require_initialized()?;
        self.handoff.lookup_notification(name).ok_or(InitError::NotFound)
    }

    pub fn lookup_shmem(&self, name: &str) -> Result<&runtime_handoff::ShmemRecord, InitError> {
        self.require_initialized()?;
        self.handoff.lookup_shmem(name).ok_or(InitError::NotFound)
    }

    pub fn lookup_device(&self, name: &str) -> Result<&runtime_handoff::DeviceRecord, InitError> {
        self.require_initialized()?;
        self.handoff.lookup_device(name).ok_or(InitError::NotFound)
    }

    pub fn lookup_irq(&self, name: &str) -> Result<&runtime_handoff::IrqRecord, InitError> {
        self.require_initialized()?;
        self.handoff.lookup_irq(name).ok_or(InitError::NotFound)
    }
}

/// Step 5: every virtual range already mapped before the child's first own
/// `reserve` call — handoff page(s), heap, stack, every shmem/device region,
/// and the IPC buffer.
fn existing_frames(record: &HandoffRecord, env: &ChildEnv, ipc_buffer: VirtRange, page_size: u64) -> Vec<VirtRange> {
    let page_bits = page_size.trailing_zeros() as u8;
    let pages_for = |bytes: u64| ((bytes + page_size - 1) / page_size) as usize;

    let mut ranges = Vec::new();
    ranges.push(VirtRange {
        base: env.init_data_addr,
        num_pages: pages_for(env.init_data_size),
        page_bits,
    });
    ranges.push(VirtRange {
        base: env.heap_addr,
        num_pages: pages_for(env.heap_size),
        page_bits,
    });
    let stack_bytes = record.stack_pages as u64 * page_size;
    ranges.push(VirtRange {
        base: record.stack_top_addr - stack_bytes,
        num_pages: record.stack_pages as usize,
        page_bits,
    });
    for s in &record.shmem_regions {
        ranges.push(VirtRange {
            base: s.addr,
            num_pages: pages_for(s.length_bytes),
            page_bits,
        });
    }
    for d in &record.device_regions {
        ranges.push(VirtRange {
            base: d.virt_addr,
            num_pages: d.num_pages as usize,
            page_bits,
        });
    }
    ranges.push(ipc_buffer);
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use runtime_handoff::{NamedSlot, ShmemRecord};
    use runtime_kernel::sim::SimCapAllocator;

    #[test]
    fn env_parse_reads_all_four_hex_and_decimal_fields() {
        let vars = [
            ("HEAP_ADDR", "0x20000000"),
            ("HEAP_SIZE", "65536"),
            ("INIT_DATA_ADDR", "0x10000000"),
            ("INIT_DATA_SIZE", "128"),
        ];
        let env = ChildEnv::parse(&vars).unwrap();
        assert_eq!(env.heap_addr, 0x2000_0000);
        assert_eq!(env.heap_size, 65536);
        assert_eq!(env.init_data_addr, 0x1000_0000);
        assert_eq!(env.init_data_size, 128);
    }

    #[test]
    fn env_parse_fails_on_missing_var() {
        let vars = [("HEAP_ADDR", "0x1000")];
        assert_eq!(ChildEnv::parse(&vars), Err(InitError::InvalidHandoff));
    }

    #[test]
    fn lookups_fail_before_init() {
        let alloc = SimCapAllocator::new();
        let child = ChildInit::new(&alloc);
        assert_eq!(child.lookup_endpoint("ep"), Err(InitError::NotInitialized));
    }

    #[test]
    fn init_process_seeds_allocator_and_enables_lookup() {
        use runtime_kernel::sim::SimAddressSpace;

        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let mut record = HandoffRecord {
            proc_name: "child".to_string(),
            stack_pages: 4,
            stack_top_addr: 0x3000_0000,
            ..Default::default()
        };
        record.add_endpoint(NamedSlot { name: "ep".to_string(), slot: 9 });
        record.add_shmem(ShmemRecord { name: "shm".to_string(), addr: 0x4000_0000, length_bytes: 8192 });

        let mut buf = [0u8; 1024];
        let len = record.encode(&mut buf).unwrap();

        let env = ChildEnv {
            heap_addr: 0x5000_0000,
            heap_size: 4096,
            init_data_addr: 0x1000_0000,
            init_data_size: len as u64,
        };
        let ipc_buffer = VirtRange { base: 0x6000_0000, num_pages: 1, page_bits: 12 };

        let mut child = ChildInit::new(&alloc);
        let frames = child.init_process(env, &buf, ipc_buffer, 4096, &vspace).unwrap();

        assert!(child.is_initialized());
        assert_eq!(child.lookup_endpoint("ep"), Ok(9));
        assert_eq!(child.lookup_endpoint("missing"), Err(InitError::NotFound));
        // init-data, heap, stack, shmem, ipc buffer.
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().any(|r| r.base == 0x3000_0000 - 4 * 4096));
    }
}
