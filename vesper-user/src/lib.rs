/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! User-facing facade: re-exports every `runtime-*` crate plus the concrete,
//! architecture-specific `Kernel` backend (`Syscalls`), so a program only
//! depends on `vesper-user` rather than the whole crate family directly.
//!
//! The concrete `CapAllocator`/`AddressSpace` backends are not provided here:
//! exactly as the original reference libraries took `vka_t`/`vspace_t` as
//! externally supplied collaborators rather than implementing them
//! themselves, a real boot sequence constructs its allocator and
//! address-space bookkeeper (for example, from `runtime_init::RootInit` plus
//! kernel boot info) and passes them by reference into
//! `runtime_process`/`runtime_init`.

#![no_std]

pub mod arch;

pub use runtime_connobj as connobj;
pub use runtime_handoff as handoff;
pub use runtime_init as init;
pub use runtime_kernel as kernel;
pub use runtime_lockwrap as lockwrap;
pub use runtime_log as log;
pub use runtime_process as process;
pub use runtime_sync as sync;
pub use runtime_vspace as vspace;

#[cfg(target_arch = "aarch64")]
pub use arch::aarch64::Syscalls;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_reexports_are_reachable() {
        let _ = kernel::PageAttrs::rw();
        let _attrs = process::ProcessAttributes::default();
    }
}
