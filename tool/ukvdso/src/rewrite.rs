//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs;
use std::io::BufRead;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::PatchEnv;
use crate::error::{Error, Result};
use crate::memmap::{parse_memory_map, KernelFacts, MapQuery};
use crate::patch::{check_patch_bounds, patch_file, patch_offset};
use crate::toolchain::{CompileDefines, VdsoCompiler};

#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    pub query: MapQuery,
    /// Stop after every check has passed, without writing.
    pub dry_run: bool,
    /// Copy the kernel image here before patching it.
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
    pub kernel_image: PathBuf,
    pub facts: KernelFacts,
    pub hz: u64,
    pub offset: u64,
    pub len: u64,
    pub written: bool,
}

/// Rebuild the vDSO for the linked kernel described by `map` and write it over
/// the image embedded in the kernel file.
///
/// Every input is validated, the vDSO is compiled and the target region is
/// bounds-checked before the kernel image is opened for writing, so any
/// failure leaves the image untouched.
pub fn rewrite_kernel<F, R, C>(
    lookup: F,
    map: R,
    compiler: &C,
    options: &RewriteOptions,
) -> Result<PatchSummary>
where
    F: Fn(&str) -> Option<String>,
    R: BufRead,
    C: VdsoCompiler,
{
    let env = PatchEnv::from_lookup(lookup)?;
    log::debug!("{env:?}");

    let facts = parse_memory_map(map, &options.query)?;
    log::info!(
        "read-only segment at offset {:#x} vaddr {:#x}, {} at {:#x}",
        facts.ro_segment.offset,
        facts.ro_segment.vaddr,
        options.query.struct_symbol,
        facts.struct_vaddr
    );

    let offset = patch_offset(&facts)?;

    let defines = CompileDefines::new(env.hz, &facts);
    let vdso = compiler.compile(&defines)?;
    let len = vdso.len() as u64;

    check_patch_bounds(&env.kernel_image, offset, len)?;

    let mut summary = PatchSummary {
        kernel_image: env.kernel_image.clone(),
        facts,
        hz: env.hz,
        offset,
        len,
        written: false,
    };

    if options.dry_run {
        return Ok(summary);
    }

    if let Some(backup) = &options.backup {
        fs::copy(&env.kernel_image, backup).map_err(|err| {
            Error::io(
                format!(
                    "could not back up '{}' to '{}'",
                    env.kernel_image.display(),
                    backup.display()
                ),
                err,
            )
        })?;
    }

    patch_file(&env.kernel_image, offset, &vdso)?;
    summary.written = true;

    Ok(summary)
}
