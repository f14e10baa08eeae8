/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Process initialization: the child-side `init_process` that unpacks a
//! handoff record into live capabilities and lookup tables, and the root-side
//! `init_root_task` that bootstraps the privileged root context from
//! kernel-provided boot info.
//!
//! Grounded on `libinit/src/init.c`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod child;
pub mod root;

pub use child::{ChildEnv, ChildInit, InitError};
pub use root::{BootInfoUntyped, ImageSegment, RootInit};
