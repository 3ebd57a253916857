//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Tooling for embedding the unikernel vDSO into the kernel image.
//!
//! `bin2c` turns a compiled vDSO into C source that the kernel links in, with
//! a relocation slot wherever the vDSO carries a marker. `rewrite` runs after
//! the kernel is linked: it reads the kernel's `objdump -x` output, rebuilds
//! the vDSO with the kernel addresses it needs, and writes it over the image
//! in the kernel file.

pub mod builder;
pub mod config;
pub mod descriptor;
pub mod emit;
pub mod error;
pub mod layout;
pub mod memmap;
pub mod patch;
pub mod report;
pub mod rewrite;
pub mod scanner;
pub mod symbols;
pub mod toolchain;
pub mod util;

pub use error::{Category, Error, Result};

/// Size of a relocation slot in the generated struct. The marker scheme
/// assumes 64-bit little-endian targets.
pub const SLOT_SIZE: usize = 8;
