/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! The process handle itself: `create` populates the fixed capability slots
//! and maps a stack, `configure_*` grants resources one at a time while
//! recording them into the handoff record, `run` writes the initial stack
//! frame and the handoff blob and starts the thread, `destroy` unwinds
//! everything `create`/`configure_*` built up.
//!
//! Grounded on `libprocess/src/{create,config,run,destroy}.c`: the builder
//! holds the child's own capability allocator and address space (objects the
//! root task has authority over until `run()` hands control to the child),
//! guarded by `libprocessLock` so a re-entrant allocation during `configure_*`
//! (routed through `runtime-lockwrap`) cannot corrupt the handoff record.

extern crate alloc;

use crate::{slot, ProcessAttributes, ProcessError, ProcessState};
use alloc::{string::String, vec::Vec};
use runtime_connobj::{ConnObj, ConnPerms, ConnectOutcome};
use runtime_handoff::{DeviceRecord, HandoffRecord, IrqRecord, NamedSlot, ShmemRecord, UntypedRecord};
use runtime_kernel::{AddressSpace, CapAllocator, Kernel, KernelError, PageAttrs, Rights, Slot};
use runtime_sync::Mutex;
use runtime_vspace::MappedStack;

const PAGE_SIZE: u64 = 4096;

/// One ELF64-style program header, as the image loader reports it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeader {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub flags: u32,
}

pub mod phdr_flags {
    pub const EXEC: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const READ: u32 = 4;
}

/// What an [`ImageLoader`] hands back after mapping a program image into the
/// child's address space.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadedImage {
    pub entry_point: u64,
    pub sysinfo_addr: u64,
    pub phdr_vaddr: u64,
    pub phent_size: u64,
    pub program_headers: Vec<ProgramHeader>,
}

/// External collaborator that knows how to map a program image's segments
/// into a child's address space. Not implemented by this crate: a concrete
/// loader reads an ELF file and calls `vspace`/`alloc` per segment.
pub trait ImageLoader {
    fn load(&self, vspace: &dyn AddressSpace, alloc: &dyn CapAllocator) -> Result<LoadedImage, KernelError>;
}

/// A process under construction (or, after [`ProcessHandle::run`], already running).
pub struct ProcessHandle<'a> {
    name: String,
    attrs: ProcessAttributes,
    state: ProcessState,
    alloc: &'a dyn CapAllocator,
    vspace: &'a dyn AddressSpace,
    kernel: &'a dyn Kernel,
    stack: MappedStack,
    fault_sink: Option<ConnObj>,
    connections: Vec<ConnObj>,
    handoff: HandoffRecord,
    next_dest_slot: u64,
    /// Serializes `configure_*` calls against re-entrant allocation, the way
    /// `libprocessLock` serializes every `process_*` call in the C original.
    process_lock: Mutex,
}

impl<'a> ProcessHandle<'a> {
    /// Populate the fixed slots (tcb/cnode/page directory/fault sink) and map
    /// the initial stack. `alloc`/`vspace`/`kernel` operate on the child's own
    /// objects, already granted to the caller by whatever created the child's
    /// CNode and VSpace.
    pub fn create(
        alloc: &'a dyn CapAllocator,
        vspace: &'a dyn AddressSpace,
        kernel: &'a dyn Kernel,
        name: impl Into<String>,
        attrs: ProcessAttributes,
    ) -> Result<Self, ProcessError> {
        let name = name.into();

        let fault_sink = if attrs.create_fault_sink {
            Some(ConnObj::create_endpoint(alloc, "fault_sink")?)
        } else {
            None
        };
        let fault_ep_slot = match &fault_sink {
            Some(conn) => match conn.connect_remote(alloc, slot::FAULT_SINK, ConnPerms {
                read: true,
                write: true,
                grant: true,
                ..Default::default()
            })? {
                ConnectOutcome::Slot(s) => Some(s),
                _ => unreachable!("endpoint connect always yields a Slot"),
            },
            None => None,
        };

        kernel.configure_tcb(slot::TCB, slot::SELF_CNODE, slot::PAGE_DIRECTORY, fault_ep_slot)?;
        kernel.set_priority(slot::TCB, attrs.priority)?;
        kernel.set_affinity(slot::TCB, attrs.cpu_affinity)?;
        kernel.debug_name_thread(slot::TCB, &name);

        let stack = runtime_vspace::map_stack(vspace, alloc, attrs.stack_pages)?;

        let handoff = HandoffRecord {
            proc_name: name.clone(),
            cnode_size_bits: attrs.cnode_size_bits as u32,
            cnode_next_free: slot::FIRST_FREE_SLOT as u32,
            stack_pages: attrs.stack_pages as u32,
            stack_top_addr: stack.top,
            ..Default::default()
        };

        Ok(Self {
            name,
            attrs,
            state: ProcessState::Init,
            alloc,
            vspace,
            kernel,
            stack,
            fault_sink,
            connections: Vec::new(),
            handoff,
            next_dest_slot: slot::FIRST_FREE_SLOT,
            process_lock: Mutex::create_user_spin_recursive(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn require_init(&self) -> Result<(), ProcessError> {
        if self.state != ProcessState::Init {
            return Err(ProcessError::InvalidState);
        }
        Ok(())
    }

    /// Total number of slots the child's own CNode can hold.
    fn cnode_capacity(&self) -> u64 {
        1u64 << self.attrs.cnode_size_bits
    }

    /// The slot the *next* `count` allocations would start at, without
    /// consuming it yet — the allocator only actually advances once the
    /// caller's copy/mint into that slot has succeeded (`commit_dest_slots`).
    fn peek_dest_slots(&self, count: u64) -> Result<Slot, ProcessError> {
        if self.next_dest_slot + count > self.cnode_capacity() {
            return Err(ProcessError::ResourceExhausted);
        }
        Ok(Slot(self.next_dest_slot))
    }

    fn commit_dest_slots(&mut self, count: u64) {
        self.next_dest_slot += count;
    }

    /// Copy an untyped capability into the child's table (`process_map_untyped`).
    pub fn configure_untyped(&mut self, untyped: Slot, size_bits: u8, is_device: bool) -> Result<(), ProcessError> {
        self.require_init()?;
        self.process_lock.lock(self.kernel)?;
        let result: Result<Slot, ProcessError> = self.peek_dest_slots(1).and_then(|dest| {
            self.alloc
                .copy_cap(untyped, dest, Rights { read: true, write: true, grant: true, ..Rights::default() })
                .map(|_| dest)
                .map_err(ProcessError::from)
        });
        if result.is_ok() {
            self.commit_dest_slots(1);
        }
        self.process_lock.unlock(self.kernel)?;
        let dest = result?;
        self.handoff.add_untyped(UntypedRecord {
            slot: dest.0 as u32,
            size_bits: size_bits as u32,
            phys_addr: 0,
            is_device,
        });
        Ok(())
    }

    /// Create an endpoint and attach it into the child (`process_connect` with
    /// a fresh endpoint connection object).
    pub fn configure_endpoint(&mut self, name: impl Into<String>, perms: ConnPerms) -> Result<(), ProcessError> {
        self.require_init()?;
        let name = name.into();
        let conn = ConnObj::create_endpoint(self.alloc, name.clone())?;
        self.process_lock.lock(self.kernel)?;
        let result: Result<Slot, ProcessError> = self.peek_dest_slots(1).and_then(|dest| match conn.connect_remote(self.alloc, dest, perms)? {
            ConnectOutcome::Slot(s) => Ok(s),
            _ => unreachable!(),
        });
        if result.is_ok() {
            self.commit_dest_slots(1);
        }
        self.process_lock.unlock(self.kernel)?;
        let slot = result?;
        self.handoff.add_endpoint(NamedSlot { name, slot: slot.0 as u32 });
        self.connections.push(conn);
        Ok(())
    }

    /// Create a notification and attach it into the child.
    pub fn configure_notification(&mut self, name: impl Into<String>, perms: ConnPerms) -> Result<(), ProcessError> {
        self.require_init()?;
        let name = name.into();
        let conn = ConnObj::create_notification(self.alloc, name.clone())?;
        self.process_lock.lock(self.kernel)?;
        let result: Result<Slot, ProcessError> = self.peek_dest_slots(1).and_then(|dest| match conn.connect_remote(self.alloc, dest, perms)? {
            ConnectOutcome::Slot(s) => Ok(s),
            _ => unreachable!(),
        });
        if result.is_ok() {
            self.commit_dest_slots(1);
        }
        self.process_lock.unlock(self.kernel)?;
        let slot = result?;
        self.handoff.add_notification(NamedSlot { name, slot: slot.0 as u32 });
        self.connections.push(conn);
        Ok(())
    }

    /// Create a shared memory region, reserve its child-visible address, and
    /// attach its frame capabilities. The child maps the frames itself at
    /// `init_process` time, at the address recorded here.
    pub fn configure_shmem(&mut self, name: impl Into<String>, num_pages: usize, perms: ConnPerms) -> Result<(), ProcessError> {
        self.require_init()?;
        let name = name.into();
        let conn = ConnObj::create_shmem(self.alloc, name.clone(), num_pages, 12)?;
        self.process_lock.lock(self.kernel)?;
        let dest = self.peek_dest_slots(num_pages as u64);
        let outcome = match dest {
            Ok(d) => conn.connect_remote(self.alloc, d, perms).map_err(ProcessError::from),
            Err(e) => Err(e),
        };
        if outcome.is_ok() {
            self.commit_dest_slots(num_pages as u64);
        }
        let addr = self.vspace.reserve(num_pages);
        self.process_lock.unlock(self.kernel)?;
        outcome?;
        let addr = addr?;
        self.handoff.add_shmem(ShmemRecord {
            name,
            addr: addr.base,
            length_bytes: addr.len_bytes(),
        });
        self.connections.push(conn);
        Ok(())
    }

    /// Grant already-acquired device frame capabilities into the child and
    /// record where the child should map them.
    pub fn configure_device(
        &mut self,
        name: impl Into<String>,
        frame_caps: &[Slot],
        phys_addr: u64,
        size_bits: u8,
    ) -> Result<(), ProcessError> {
        self.require_init()?;
        let name = name.into();
        self.process_lock.lock(self.kernel)?;
        let mut caps = Vec::with_capacity(frame_caps.len());
        let result: Result<(), ProcessError> = match self.peek_dest_slots(frame_caps.len() as u64) {
            Err(e) => Err(e),
            Ok(dest) => {
                let mut loop_result = Ok(());
                for (i, src) in frame_caps.iter().enumerate() {
                    let d = Slot(dest.0 + i as u64);
                    if let Err(e) = self.alloc.copy_cap(
                        *src,
                        d,
                        Rights { read: true, write: true, ..Rights::default() },
                    ) {
                        for c in &caps {
                            let _: Result<(), KernelError> = self.alloc.delete_cap(Slot(*c as u64));
                        }
                        loop_result = Err(ProcessError::from(e));
                        break;
                    }
                    caps.push(d.0 as u32);
                }
                loop_result
            }
        };
        if result.is_ok() {
            self.commit_dest_slots(frame_caps.len() as u64);
        }
        let addr = self.vspace.reserve(frame_caps.len());
        self.process_lock.unlock(self.kernel)?;
        result?;
        let addr = addr?;
        self.handoff.add_device(DeviceRecord {
            name,
            virt_addr: addr.base,
            phys_addr,
            size_bits: size_bits as u32,
            num_pages: frame_caps.len() as u32,
            caps,
        });
        Ok(())
    }

    /// Grant an IRQ handler capability plus a notification the child waits on.
    pub fn configure_irq(&mut self, name: impl Into<String>, irq_cap: Slot, number: u32) -> Result<(), ProcessError> {
        self.require_init()?;
        let name = name.into();
        let conn = ConnObj::create_notification(self.alloc, name.clone())?;
        self.process_lock.lock(self.kernel)?;
        let result: Result<(Slot, Slot), ProcessError> = match self.peek_dest_slots(2) {
            Err(e) => Err(e),
            Ok(d) => {
                let ep_slot = d;
                let irq_slot = Slot(d.0 + 1);
                let connected = conn
                    .connect_remote(self.alloc, ep_slot, ConnPerms { read: true, write: true, ..Default::default() })
                    .map_err(ProcessError::from);
                let copied = self
                    .alloc
                    .copy_cap(irq_cap, irq_slot, Rights { read: true, grant: true, ..Rights::default() })
                    .map_err(ProcessError::from);
                connected.and(copied).map(|_| (ep_slot, irq_slot))
            }
        };
        if result.is_ok() {
            self.commit_dest_slots(2);
        }
        self.process_lock.unlock(self.kernel)?;
        let (ep_slot, irq_slot) = result?;
        self.handoff.add_irq(IrqRecord {
            name,
            irq_slot: irq_slot.0 as u32,
            ep_slot: ep_slot.0 as u32,
            number,
        });
        self.connections.push(conn);
        Ok(())
    }

    /// Write the initial stack frame and the handoff blob, then start the
    /// thread at `image.entry_point` (`process_run`, spec 4.5).
    pub fn run(&mut self, image: &LoadedImage, argv: &[&str], envp: &[&str]) -> Result<(), ProcessError> {
        self.require_init()?;

        let handoff_pages = self.handoff.pages_required(PAGE_SIZE as usize)?;
        let handoff_range = runtime_vspace::map_pages(self.vspace, self.alloc, handoff_pages, PageAttrs::rw())?;
        let mut scratch = alloc::vec![0u8; handoff_pages * PAGE_SIZE as usize];
        let len = self.handoff.encode(&mut scratch)?;
        self.vspace.write_bytes(handoff_range.base, &scratch[..len])?;

        let auxv = crate::stack::build_auxv(
            PAGE_SIZE,
            image.phdr_vaddr,
            image.program_headers.len(),
            image.phent_size,
            image.sysinfo_addr,
        );
        let frame = crate::stack::layout_initial_stack(self.stack.top, argv, envp, &auxv);
        self.vspace.write_bytes(frame.strings_base, &frame.string_bytes)?;
        self.vspace.write_bytes(frame.tables_base, &frame.table_bytes)?;

        self.kernel.write_registers(slot::TCB, image.entry_point, frame.stack_pointer, true)?;
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Tear down everything `create`/`configure_*` built: destroy the main
    /// thread, release every connection this handle owns, revoke and delete
    /// every slot in the child's own capability table, free the fixed
    /// notifications/page directory/cnode, and revoke+free every untyped
    /// granted along the way (`process_destroy`, spec 4.5, `destroy.c:43-112`).
    pub fn destroy(mut self) -> Result<(), ProcessError> {
        if self.state == ProcessState::Destroyed {
            return Err(ProcessError::InvalidState);
        }

        for conn in self.connections.drain(..) {
            conn.disconnect();
            if conn.refcount() == 0 {
                conn.free(self.alloc, self.kernel, self.vspace)?;
            }
        }
        if let Some(sink) = self.fault_sink.take() {
            sink.disconnect();
            if sink.refcount() == 0 {
                sink.free(self.alloc, self.kernel, self.vspace)?;
            }
        }

        self.vspace.unmap(self.stack.mapped)?;
        self.alloc.revoke_cap(slot::TCB)?;
        self.alloc.delete_cap(slot::TCB)?;

        // Slots granted untypeds occupy are revoked+freed separately, below,
        // after the rest of the table — skip them here so neither pass
        // double-frees the other's work.
        let untyped_slots: Vec<Slot> = self.handoff.untypeds.iter().map(|u| Slot(u.slot as u64)).collect();

        // Every other slot the child's table could hold, including the fixed
        // page directory/cnode/lock-notification slots and anything the
        // running child itself minted or copied above `next_dest_slot` — a
        // builder-side free only accounts for what it granted by name.
        for raw in 0..self.cnode_capacity() {
            let s = Slot(raw);
            if s == slot::TCB || untyped_slots.contains(&s) {
                continue;
            }
            let _: Result<(), KernelError> = self.alloc.revoke_cap(s);
            let _: Result<(), KernelError> = self.alloc.delete_cap(s);
        }

        for s in untyped_slots {
            self.alloc.revoke_cap(s)?;
            self.alloc.delete_cap(s)?;
        }

        self.state = ProcessState::Destroyed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_kernel::sim::{SimAddressSpace, SimCapAllocator, SimKernel};

    fn fixture_image() -> LoadedImage {
        LoadedImage {
            entry_point: 0x4000_0000,
            sysinfo_addr: 0,
            phdr_vaddr: 0x4000_1000,
            phent_size: 56,
            program_headers: alloc::vec![ProgramHeader {
                vaddr: 0x4000_0000,
                memsz: 0x1000,
                filesz: 0x1000,
                offset: 0,
                flags: phdr_flags::READ | phdr_flags::EXEC,
            }],
        }
    }

    #[test]
    fn create_maps_stack_and_populates_handoff() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let kernel = SimKernel::new();
        let proc = ProcessHandle::create(&alloc, &vspace, &*kernel, "child", ProcessAttributes::default()).unwrap();
        assert_eq!(proc.state(), ProcessState::Init);
        assert!(vspace.is_mapped(proc.stack.mapped.base));
        assert_eq!(proc.handoff.stack_top_addr, proc.stack.top);
    }

    #[test]
    fn configure_then_run_writes_registers() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let kernel = SimKernel::new();
        let mut proc = ProcessHandle::create(&alloc, &vspace, &*kernel, "child", ProcessAttributes::default().create_fault_sink(false)).unwrap();
        proc.configure_endpoint("ep", ConnPerms { read: true, write: true, ..Default::default() }).unwrap();
        assert_eq!(proc.handoff.lookup_endpoint("ep"), Some(slot::FIRST_FREE_SLOT as u32));

        let image = fixture_image();
        proc.run(&image, &["child"], &["HOME=/"]).unwrap();
        assert_eq!(proc.state(), ProcessState::Running);
        let (ip, sp, resume) = kernel.registers_for(slot::TCB).unwrap();
        assert_eq!(ip, image.entry_point);
        assert!(resume);
        assert!(sp < proc.stack.top);
    }

    #[test]
    fn run_rejects_non_init_state() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let kernel = SimKernel::new();
        let mut proc = ProcessHandle::create(&alloc, &vspace, &*kernel, "child", ProcessAttributes::default().create_fault_sink(false)).unwrap();
        let image = fixture_image();
        proc.run(&image, &[], &[]).unwrap();
        assert_eq!(proc.run(&image, &[], &[]), Err(ProcessError::InvalidState));
    }

    #[test]
    fn destroy_frees_connections_once_unreferenced() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let kernel = SimKernel::new();
        let mut proc = ProcessHandle::create(&alloc, &vspace, &*kernel, "child", ProcessAttributes::default().create_fault_sink(false)).unwrap();
        proc.configure_notification("notif", ConnPerms { read: true, write: true, ..Default::default() }).unwrap();
        let stack_base = proc.stack.mapped.base;
        let tcb_slot = slot::TCB;
        proc.destroy().unwrap();
        assert!(!vspace.is_mapped(stack_base));
        assert!(alloc.revoked().contains(&tcb_slot));
    }

    #[test]
    fn destroy_frees_page_directory_notifications_and_untypeds() {
        let alloc = SimCapAllocator::new();
        let vspace = SimAddressSpace::new();
        let kernel = SimKernel::new();
        let mut proc = ProcessHandle::create(&alloc, &vspace, &*kernel, "child", ProcessAttributes::default().create_fault_sink(false)).unwrap();
        let untyped_source = Slot(900);
        alloc.add_untyped(untyped_source, 16, false);
        proc.configure_untyped(untyped_source, 16, false).unwrap();
        let untyped_dest = Slot(slot::FIRST_FREE_SLOT);
        proc.destroy().unwrap();

        let revoked = alloc.revoked();
        assert!(revoked.contains(&slot::PAGE_DIRECTORY));
        assert!(revoked.contains(&slot::SELF_CNODE));
        assert!(revoked.contains(&slot::VSPACE_LOCK_NOTIF));
        assert!(revoked.contains(&slot::CAP_ALLOC_LOCK_NOTIF));
        assert!(revoked.contains(&slot::INIT_DATA_LOCK_NOTIF));
        assert!(revoked.contains(&slot::THREAD_SYNC_NOTIF));
        assert!(revoked.contains(&untyped_dest));
    }
}
