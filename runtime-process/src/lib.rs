/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Process builder: create/configure/run/destroy lifecycle, capability table
//! population, stack-frame layout, and handoff blob assembly.
//!
//! Grounded on `libprocess/src/{create,run,destroy,config}.c`: a process
//! handle owns a fixed, well-known slice of its own capability table (cnode,
//! vspace, fault endpoint, TCB, the three lock notifications, and a
//! per-thread sync notification), with every capability the process acquires
//! afterward landing at `FIRST_FREE_SLOT` and up.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod builder;
pub mod stack;

use runtime_connobj::ConnError;
use runtime_handoff::HandoffError;
use runtime_kernel::{KernelError, Slot};
use runtime_sync::SyncError;
use runtime_vspace::VspaceError;
use snafu::Snafu;

pub use builder::{ImageLoader, LoadedImage, ProcessHandle, ProgramHeader};

/// Fixed capability-table slots every process is built with, populated during
/// `create()` before any caller-supplied configuration runs.
pub mod slot {
    use runtime_kernel::Slot;

    pub const SELF_CNODE: Slot = Slot(0);
    pub const PAGE_DIRECTORY: Slot = Slot(1);
    pub const FAULT_SINK: Slot = Slot(2);
    pub const TCB: Slot = Slot(3);
    pub const VSPACE_LOCK_NOTIF: Slot = Slot(4);
    pub const CAP_ALLOC_LOCK_NOTIF: Slot = Slot(5);
    pub const INIT_DATA_LOCK_NOTIF: Slot = Slot(6);
    pub const THREAD_SYNC_NOTIF: Slot = Slot(7);
    /// First slot available for capabilities the caller configures in (shmem
    /// frames, remote endpoints, device frames, irq handlers).
    pub const FIRST_FREE_SLOT: u64 = 8;
}

/// Tunables for a process about to be created, mirroring `process_default_attrs`
/// plus the per-call overrides `libprocess` accepts.
#[derive(Clone, Debug)]
pub struct ProcessAttributes {
    pub cnode_size_bits: u8,
    pub stack_pages: usize,
    pub heap_pages: usize,
    pub priority: u8,
    pub cpu_affinity: u32,
    pub create_fault_sink: bool,
}

impl Default for ProcessAttributes {
    fn default() -> Self {
        Self {
            cnode_size_bits: 12,
            stack_pages: 16,
            heap_pages: 256,
            priority: 100,
            cpu_affinity: 0,
            create_fault_sink: true,
        }
    }
}

impl ProcessAttributes {
    pub fn cnode_size_bits(mut self, bits: u8) -> Self {
        self.cnode_size_bits = bits;
        self
    }

    pub fn stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages;
        self
    }

    pub fn heap_pages(mut self, pages: usize) -> Self {
        self.heap_pages = pages;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn cpu_affinity(mut self, cpu: u32) -> Self {
        self.cpu_affinity = cpu;
        self
    }

    pub fn create_fault_sink(mut self, create: bool) -> Self {
        self.create_fault_sink = create;
        self
    }
}

/// A process handle's lifecycle, enforced by `ProcessHandle`'s methods:
/// `configure*` only runs during `Init`, `run()` moves `Init -> Running`,
/// `destroy()` consumes the handle and leaves nothing to reuse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessState {
    Init,
    Running,
    Destroyed,
}

/// Errors a process-builder operation can fail with.
#[derive(Debug, Snafu, Eq, PartialEq)]
pub enum ProcessError {
    #[snafu(display("process not initialized"))]
    NotInitialized,
    #[snafu(display("invalid argument"))]
    InvalidArg,
    #[snafu(display("operation invalid in the current process state"))]
    InvalidState,
    #[snafu(display("resource exhausted"))]
    ResourceExhausted,
    #[snafu(display("capability copy failed"))]
    CapCopyFailed,
    #[snafu(display("virtual memory mapping failed"))]
    MapFailed,
    #[snafu(display("conflicting configuration"))]
    Conflict,
    #[snafu(display("calling thread does not hold the required lock"))]
    NotHolder,
    #[snafu(display("unrecoverable kernel failure"))]
    Fatal,
}

impl From<KernelError> for ProcessError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::NoFreeSlots => ProcessError::ResourceExhausted,
            KernelError::NoUntyped => ProcessError::ResourceExhausted,
            KernelError::CapCopyFailed => ProcessError::CapCopyFailed,
            KernelError::MapFailed => ProcessError::MapFailed,
            KernelError::NoVirtualRange => ProcessError::ResourceExhausted,
            KernelError::KernelRefused => ProcessError::Fatal,
        }
    }
}

impl From<SyncError> for ProcessError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotHolder => ProcessError::NotHolder,
            SyncError::ResourceExhausted => ProcessError::ResourceExhausted,
            SyncError::Kernel { source } => source.into(),
        }
    }
}

impl From<VspaceError> for ProcessError {
    fn from(e: VspaceError) -> Self {
        match e {
            VspaceError::Kernel { source } => source.into(),
        }
    }
}

impl From<ConnError> for ProcessError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::StillReferenced { .. } => ProcessError::Conflict,
            ConnError::AlreadySelfMapped => ProcessError::Conflict,
            ConnError::Kernel { source } => source.into(),
        }
    }
}

impl From<HandoffError> for ProcessError {
    fn from(_: HandoffError) -> Self {
        ProcessError::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_attributes_match_reference_values() {
        let attrs = ProcessAttributes::default();
        assert_eq!(attrs.cnode_size_bits, 12);
        assert_eq!(attrs.stack_pages, 16);
        assert!(attrs.create_fault_sink);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let attrs = ProcessAttributes::default().stack_pages(4).priority(50).create_fault_sink(false);
        assert_eq!(attrs.stack_pages, 4);
        assert_eq!(attrs.priority, 50);
        assert!(!attrs.create_fault_sink);
    }

    #[test]
    fn fixed_slots_are_below_first_free_slot() {
        let fixed = [
            slot::SELF_CNODE,
            slot::PAGE_DIRECTORY,
            slot::FAULT_SINK,
            slot::TCB,
            slot::VSPACE_LOCK_NOTIF,
            slot::CAP_ALLOC_LOCK_NOTIF,
            slot::INIT_DATA_LOCK_NOTIF,
            slot::THREAD_SYNC_NOTIF,
        ];
        for s in fixed {
            assert!(s.0 < slot::FIRST_FREE_SLOT);
        }
    }

    #[test]
    fn kernel_error_maps_to_expected_process_error() {
        let e: ProcessError = KernelError::MapFailed.into();
        assert_eq!(e, ProcessError::MapFailed);
        let e: ProcessError = SyncError::NotHolder.into();
        assert_eq!(e, ProcessError::NotHolder);
    }
}
