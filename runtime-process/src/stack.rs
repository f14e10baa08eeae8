/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Initial process stack layout: argv/envp string storage, pointer tables,
//! and the auxiliary vector, assembled top-down exactly as `run.c` does.
//!
//! Pure byte-layout math, independent of any kernel trait, so the ordering and
//! alignment invariants (spec 4.5 step 5, spec 6) are unit-testable directly.

extern crate alloc;

use alloc::vec::Vec;

/// One auxiliary-vector entry, `{type, value}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuxEntry {
    pub a_type: u64,
    pub a_val: u64,
}

/// The standard auxv types this runtime populates (spec 6).
pub mod auxv_type {
    pub const AT_PAGESZ: u64 = 6;
    pub const AT_PHDR: u64 = 3;
    pub const AT_PHNUM: u64 = 5;
    pub const AT_PHENT: u64 = 4;
    pub const AT_SYSINFO: u64 = 32;
}

/// Build the fixed five-entry auxiliary vector (spec 6: page size, program
/// header address/count/entry-size, syscall info address).
pub fn build_auxv(page_size: u64, phdr_addr: u64, phnum: usize, phent_size: u64, sysinfo_addr: u64) -> [AuxEntry; 5] {
    [
        AuxEntry { a_type: auxv_type::AT_PAGESZ, a_val: page_size },
        AuxEntry { a_type: auxv_type::AT_PHDR, a_val: phdr_addr },
        AuxEntry { a_type: auxv_type::AT_PHNUM, a_val: phnum as u64 },
        AuxEntry { a_type: auxv_type::AT_PHENT, a_val: phent_size },
        AuxEntry { a_type: auxv_type::AT_SYSINFO, a_val: sysinfo_addr },
    ]
}

/// Where every piece of the initial stack frame ended up.
#[derive(Debug, Eq, PartialEq)]
pub struct StackImage {
    /// Bytes to write starting at `strings_base`: every argv/envp string,
    /// NUL-terminated, packed back-to-back from high to low addresses.
    pub string_bytes: Vec<u8>,
    pub strings_base: u64,
    /// Bytes to write starting at `tables_base`: argc, argv ptrs + NULL,
    /// envp ptrs + NULL, auxv pairs + null pair, in that order.
    pub table_bytes: Vec<u8>,
    pub tables_base: u64,
    /// Final stack pointer handed to the kernel at resume. Double-word aligned.
    pub stack_pointer: u64,
}

const WORD: u64 = 8;
const DOUBLE_WORD_ALIGN: u64 = 16;

/// Lay out argv, envp, and the auxiliary vector below `stack_top`, following
/// the order `run.c` pushes them in: strings highest, then (from high to low)
/// the auxv terminator, auxv entries, envp terminator, envp pointers, argv
/// terminator, argv pointers, argc — with the final stack pointer rounded
/// down to a double-word boundary.
pub fn layout_initial_stack(stack_top: u64, argv: &[&str], envp: &[&str], auxv: &[AuxEntry]) -> StackImage {
    let mut cursor = stack_top;
    let mut argv_addrs = Vec::with_capacity(argv.len());
    let mut envp_addrs = Vec::with_capacity(envp.len());
    let mut string_bytes = Vec::new();

    for s in argv {
        cursor -= s.len() as u64 + 1;
        argv_addrs.push(cursor);
    }
    for s in envp {
        cursor -= s.len() as u64 + 1;
        envp_addrs.push(cursor);
    }
    // string_bytes is written starting at `cursor` (the lowest string address)
    // up to stack_top; build it in that same low-to-high order.
    for (s, addr) in argv.iter().zip(argv_addrs.iter()).chain(envp.iter().zip(envp_addrs.iter())) {
        let _ = addr;
        string_bytes.extend_from_slice(s.as_bytes());
        string_bytes.push(0);
    }
    let strings_base = cursor;

    let num_words: u64 = 1 // argc
        + argv.len() as u64 + 1 // argv ptrs + terminator
        + envp.len() as u64 + 1 // envp ptrs + terminator
        + auxv.len() as u64 * 2 + 2; // auxv pairs + terminator pair
    let to_push = num_words * WORD;

    let mut sp = strings_base - to_push;
    sp &= !(DOUBLE_WORD_ALIGN - 1);
    let tables_base = sp;

    let mut table_bytes = Vec::with_capacity((strings_base - sp) as usize);
    table_bytes.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    for a in &argv_addrs {
        table_bytes.extend_from_slice(&a.to_le_bytes());
    }
    table_bytes.extend_from_slice(&0u64.to_le_bytes());
    for a in &envp_addrs {
        table_bytes.extend_from_slice(&a.to_le_bytes());
    }
    table_bytes.extend_from_slice(&0u64.to_le_bytes());
    for e in auxv {
        table_bytes.extend_from_slice(&e.a_type.to_le_bytes());
        table_bytes.extend_from_slice(&e.a_val.to_le_bytes());
    }
    table_bytes.extend_from_slice(&0u64.to_le_bytes());
    table_bytes.extend_from_slice(&0u64.to_le_bytes());
    // Rounding `sp` down below `strings_base - to_push` opens a gap between the
    // pushed block and the strings above it, not below `sp`. `argc` must land
    // at `sp` itself (`run.c` lowers the pointer first, then pushes downward),
    // so the padding goes on the high side, between the auxv terminator and
    // `strings_base`.
    let padding = (strings_base - to_push) - sp;
    table_bytes.extend(core::iter::repeat(0u8).take(padding as usize));

    StackImage {
        string_bytes,
        strings_base,
        table_bytes,
        tables_base,
        stack_pointer: sp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_stack_pointer_is_double_word_aligned() {
        let auxv = build_auxv(4096, 0x1000, 2, 56, 0x2000);
        let img = layout_initial_stack(0x7fff_f000, &["prog"], &["HOME=/", "PATH=/bin"], &auxv);
        assert_eq!(img.stack_pointer % DOUBLE_WORD_ALIGN, 0);
    }

    #[test]
    fn argc_is_first_word_at_stack_pointer() {
        let auxv = build_auxv(4096, 0x1000, 2, 56, 0x2000);
        let argv = ["a", "bb", "ccc"];
        let img = layout_initial_stack(0x8000_0000, &argv, &[], &auxv);
        // argc must sit at byte 0 of the buffer, which is written at
        // `tables_base == stack_pointer` — that's what SP points the child at.
        assert_eq!(img.tables_base, img.stack_pointer);
        let argc = u64::from_le_bytes(img.table_bytes[0..8].try_into().unwrap());
        assert_eq!(argc, argv.len() as u64);
    }

    #[test]
    fn argv_pointers_resolve_into_string_area() {
        let auxv = build_auxv(4096, 0, 0, 0, 0);
        let argv = ["hello", "world"];
        let img = layout_initial_stack(0x9000_0000, &argv, &[], &auxv);
        assert!(img.strings_base < 0x9000_0000);
        assert_eq!(img.string_bytes.len(), "hello\0world\0".len());
    }

    #[test]
    fn terminators_are_present_between_sections() {
        let auxv = build_auxv(1, 2, 3, 4, 5);
        let argv = ["x"];
        let envp = ["Y=1"];
        let img = layout_initial_stack(0x1000_0000, &argv, &envp, &auxv);
        let words: Vec<u64> = img
            .table_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // argc, 1 argv ptr, 0 (argv term), 1 envp ptr, 0 (envp term), 5 auxv pairs, 0, 0,
        // then any alignment padding — argc is always word 0, at `stack_pointer`.
        assert_eq!(words[0], 1); // argc
        assert_eq!(words[2], 0); // argv terminator
        assert_eq!(words[4], 0); // envp terminator
        let auxv_term_idx = 5 + auxv.len() * 2;
        assert_eq!(words[auxv_term_idx], 0);
        assert_eq!(words[auxv_term_idx + 1], 0);
    }
}
