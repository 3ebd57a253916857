//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::memmap::KernelFacts;

pub const DEFAULT_CC: &str = "gcc";
pub const DEFAULT_SONAME: &str = "unikraft-vdso.so.1";
pub const DEFAULT_LINKER_SCRIPT: &str = "vdso.lds";
pub const DEFAULT_OUTPUT: &str = "vdso.so";

/// Values baked into the rebuilt vDSO as preprocessor definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileDefines {
    pub hz: u64,
    pub monotonic_clock: u64,
    pub wall_clock: u64,
    pub vdso_image: u64,
}

impl CompileDefines {
    pub fn new(hz: u64, facts: &KernelFacts) -> CompileDefines {
        CompileDefines {
            hz,
            monotonic_clock: facts.monotonic_clock,
            wall_clock: facts.wall_clock,
            vdso_image: facts.struct_vaddr,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("-DCONFIG_HZ={}", self.hz),
            format!("-DKADDR_ukplat_monotonic_clock=0x{:016x}", self.monotonic_clock),
            format!("-DKADDR_ukplat_wall_clock=0x{:016x}", self.wall_clock),
            format!("-DKADDR_vdso_image=0x{:016x}", self.vdso_image),
        ]
    }
}

/// Something that can turn the vDSO sources into a shared object.
pub trait VdsoCompiler {
    /// Build the vDSO and return the bytes of the resulting object.
    fn compile(&self, defines: &CompileDefines) -> Result<Vec<u8>>;
}

/// Drives an external C compiler, the way the unikernel build does.
#[derive(Debug, Clone)]
pub struct GccToolchain {
    pub cc: String,
    /// Directory holding the vDSO `.c` files and the linker script. The
    /// compiler runs from here.
    pub source_dir: PathBuf,
    pub soname: String,
    pub linker_script: String,
    pub output: String,
}

impl GccToolchain {
    pub fn new(source_dir: &Path) -> GccToolchain {
        GccToolchain {
            cc: DEFAULT_CC.to_string(),
            source_dir: source_dir.to_path_buf(),
            soname: DEFAULT_SONAME.to_string(),
            linker_script: DEFAULT_LINKER_SCRIPT.to_string(),
            output: DEFAULT_OUTPUT.to_string(),
        }
    }

    /// C sources in `source_dir`, sorted so the command line is stable.
    pub fn sources(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.source_dir).map_err(|err| {
            Error::io(
                format!("could not list '{}'", self.source_dir.display()),
                err,
            )
        })?;

        let mut sources = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::io(
                    format!("could not list '{}'", self.source_dir.display()),
                    err,
                )
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "c") {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    sources.push(name.to_string());
                }
            }
        }
        sources.sort();

        if sources.is_empty() {
            return Err(Error::NoSources(self.source_dir.clone()));
        }
        Ok(sources)
    }

    /// Arguments after the compiler name.
    pub fn args(&self, sources: &[String], defines: &CompileDefines) -> Vec<String> {
        let mut args: Vec<String> = sources.to_vec();
        args.extend([
            "-o".to_string(),
            self.output.clone(),
            format!("-Wl,-soname,{}", self.soname),
            "-shared".to_string(),
            "-fPIC".to_string(),
            "-O2".to_string(),
            "-nostdlib".to_string(),
            format!("-Wl,-T,{}", self.linker_script),
        ]);
        args.extend(defines.to_args());
        args
    }
}

impl VdsoCompiler for GccToolchain {
    fn compile(&self, defines: &CompileDefines) -> Result<Vec<u8>> {
        let sources = self.sources()?;
        let args = self.args(&sources, defines);
        let command_line = format!("{} {}", self.cc, args.join(" "));
        log::info!("running '{}' in '{}'", command_line, self.source_dir.display());

        let output = Command::new(&self.cc)
            .args(&args)
            .current_dir(&self.source_dir)
            .output()
            .map_err(|source| Error::ToolchainSpawn {
                program: self.cc.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::ToolchainFailed {
                command: command_line,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }
        if !output.stderr.is_empty() {
            log::warn!("{}", String::from_utf8_lossy(&output.stderr).trim_end());
        }

        let object = self.source_dir.join(&self.output);
        fs::read(&object)
            .map_err(|err| Error::io(format!("could not read '{}'", object.display()), err))
    }
}
