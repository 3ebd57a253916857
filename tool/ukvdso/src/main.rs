//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use ukvdso_tool::builder::{build_image_file, load_symbols};
use ukvdso_tool::memmap::MapQuery;
use ukvdso_tool::report::{write_json, write_layout_json, write_report};
use ukvdso_tool::rewrite::{rewrite_kernel, PatchSummary, RewriteOptions};
use ukvdso_tool::toolchain::{
    GccToolchain, DEFAULT_CC, DEFAULT_LINKER_SCRIPT, DEFAULT_OUTPUT, DEFAULT_SONAME,
};
use ukvdso_tool::util::comma_sep_u64;
use ukvdso_tool::{Error, Result};

#[derive(Debug, Parser)]
#[command(
    name = "ukvdso",
    version,
    about = r#"
Embed the vDSO into a unikernel image.

EXAMPLES:
    # Generate the image source linked into the kernel:
    ukvdso bin2c libvdso.so vdso-image.c --symbols vdso.syms

    # After linking, rebuild the vDSO with kernel addresses and patch it in:
    objdump -x build/app_qemu-x86_64.dbg | \
        CONFIG_HZ=100 KERNEL_IMAGE_PATH=build/app_qemu-x86_64 ukvdso rewrite --vdso-dir vdso
"#
)]
struct Opt {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Generate C source for the vDSO image with relocation slots.
    Bin2c(Bin2cArgs),

    /// Rebuild the vDSO for a linked kernel and patch it into the kernel image.
    Rewrite(RewriteArgs),
}

#[derive(Debug, Args)]
struct Bin2cArgs {
    /// The compiled vDSO shared object.
    vdso: PathBuf,

    /// Where to write the generated C source.
    output: PathBuf,

    /// Symbol map ('<source-symbol> <exported-name>' per line) or an XML
    /// image descriptor ending in '.xml'.
    #[arg(short, long)]
    symbols: PathBuf,

    /// Write a human readable layout report.
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Write the layout as JSON.
    #[arg(long)]
    layout_json: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    /// Read the memory map from this file instead of standard input.
    #[arg(long)]
    map: Option<PathBuf>,

    /// Directory holding the vDSO sources and linker script.
    #[arg(long, default_value = ".")]
    vdso_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_CC)]
    cc: String,

    #[arg(long, default_value = DEFAULT_SONAME)]
    soname: String,

    #[arg(long, default_value = DEFAULT_LINKER_SCRIPT)]
    linker_script: String,

    /// Name of the shared object produced inside the vDSO directory.
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    vdso_output: String,

    /// Symbol of the embedded image in the kernel.
    #[arg(long, default_value = ukvdso_tool::emit::DEFAULT_STRUCT_NAME)]
    struct_symbol: String,

    /// Copy the kernel image here before patching it.
    #[arg(long)]
    backup: Option<PathBuf>,

    /// Do everything except writing the kernel image.
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON summary of the patch.
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn run_bin2c(args: Bin2cArgs) -> Result<()> {
    let (options, symbols) = load_symbols(&args.symbols)?;
    let image = build_image_file(&args.vdso, &args.output, &symbols, &options)?;

    if let Some(report) = &args.report {
        write_report(&image, &options, report)?;
    }
    if let Some(layout_json) = &args.layout_json {
        write_layout_json(layout_json, &image.layout, &options)?;
    }

    println!(
        "UKVDSO|BIN2C: {} relocation slots, image size = {} bytes, wrote '{}'",
        image.layout.slot_count(),
        comma_sep_u64(image.layout.image_size as u64),
        args.output.display()
    );
    Ok(())
}

fn run_rewrite(args: RewriteArgs) -> Result<()> {
    let toolchain = GccToolchain {
        cc: args.cc,
        source_dir: args.vdso_dir,
        soname: args.soname,
        linker_script: args.linker_script,
        output: args.vdso_output,
    };
    let options = RewriteOptions {
        query: MapQuery {
            struct_symbol: args.struct_symbol,
            ..MapQuery::default()
        },
        dry_run: args.dry_run,
        backup: args.backup,
    };
    let lookup = |name: &str| std::env::var(name).ok();

    let summary: PatchSummary = match &args.map {
        Some(path) => {
            let file = File::open(path).map_err(|source| Error::Io {
                context: format!("could not open memory map '{}'", path.display()),
                source,
            })?;
            rewrite_kernel(lookup, BufReader::new(file), &toolchain, &options)?
        }
        None => rewrite_kernel(lookup, io::stdin().lock(), &toolchain, &options)?,
    };

    if let Some(path) = &args.summary_json {
        write_json(path, &summary)?;
    }

    if summary.written {
        println!(
            "UKVDSO|REWRITE: Rewrite success, {} bytes at offset {:#x} of '{}'",
            comma_sep_u64(summary.len),
            summary.offset,
            summary.kernel_image.display()
        );
    } else {
        println!(
            "UKVDSO|REWRITE: dry run, would write {} bytes at offset {:#x} of '{}'",
            comma_sep_u64(summary.len),
            summary.offset,
            summary.kernel_image.display()
        );
    }
    Ok(())
}

fn main() {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    let result = match opt.action {
        Action::Bin2c(args) => run_bin2c(args),
        Action::Rewrite(args) => run_rewrite(args),
    };

    if let Err(err) = result {
        println!("ukvdso: error[{}]: {}", err.category().tag(), err);
        std::process::exit(err.exit_code());
    }
}
