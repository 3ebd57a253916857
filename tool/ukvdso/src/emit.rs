//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! C source generation for the embedded vDSO image.
//!
//! The generated translation unit defines one object, by default
//! `vdso_image`, whose storage is the vDSO byte for byte except that each
//! relocation marker is replaced by a pointer-sized slot. A constructor fills
//! the slots with `symbol - &vdso_image` and publishes the image base address.
//!
//! The constructor is an interface requirement on the kernel: it has to run
//! exactly once, before anything reads the image. We only declare it with
//! `__attribute__((constructor))`; how the kernel's init code triggers that
//! is outside of this tool.

use std::fmt::Write as _;

use serde::Serialize;

use crate::layout::ImageLayout;
use crate::util::hex_byte_rows;

pub const GENERATED_HEADER: &str = "/* AUTOMATICALLY GENERATED -- DO NOT EDIT */";

pub const DEFAULT_MAGIC: u32 = 0x369C2171;
pub const DEFAULT_STRUCT_NAME: &str = "vdso_image";
pub const DEFAULT_SECTION: &str = ".data..ro_after_init";
pub const DEFAULT_ALIGN: u64 = 4096;
pub const DEFAULT_CONSTRUCTOR: &str = "uk_init_vdso";
pub const DEFAULT_BASE_POINTER: &str = "vdso_image_addr";
pub const DEFAULT_ROW_WIDTH: usize = 10;

const DATA_FIELD_PREFIX: &str = "vdso_data_";

/// Everything about the generated source that is not derived from the vDSO
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageOptions {
    pub magic: u32,
    pub struct_name: String,
    pub section: String,
    pub align: u64,
    pub constructor: String,
    pub base_pointer: String,
    pub row_width: usize,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            magic: DEFAULT_MAGIC,
            struct_name: DEFAULT_STRUCT_NAME.to_string(),
            section: DEFAULT_SECTION.to_string(),
            align: DEFAULT_ALIGN,
            constructor: DEFAULT_CONSTRUCTOR.to_string(),
            base_pointer: DEFAULT_BASE_POINTER.to_string(),
            row_width: DEFAULT_ROW_WIDTH,
        }
    }
}

/// Field names of the byte arrays, numbered from 1 in file order.
pub fn data_field_name(index: usize) -> String {
    format!("{DATA_FIELD_PREFIX}{}", index + 1)
}

/// Whether `name` has the shape of a byte array field name, whatever the
/// number of partitions turns out to be.
pub fn is_data_field_name(name: &str) -> bool {
    name.strip_prefix(DATA_FIELD_PREFIX)
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

pub fn generate_image_source(layout: &ImageLayout, blob: &[u8], options: &ImageOptions) -> String {
    let mut out = String::new();
    write_image_source(&mut out, layout, blob, options)
        .expect("formatting into a String cannot fail");
    out
}

fn write_image_source(
    out: &mut String,
    layout: &ImageLayout,
    blob: &[u8],
    options: &ImageOptions,
) -> std::fmt::Result {
    write_struct(out, layout, options)?;
    write_initialiser(out, layout, blob, options)?;
    write_constructor(out, layout, options)
}

fn write_struct(out: &mut String, layout: &ImageLayout, options: &ImageOptions) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(out, "{GENERATED_HEADER}")?;
    writeln!(out)?;
    writeln!(out, "struct {{")?;
    for (i, partition) in layout.partitions.iter().enumerate() {
        writeln!(
            out,
            "    const unsigned char {}[{}];",
            data_field_name(i),
            partition.len()
        )?;
        if let Some(slot) = &partition.slot {
            writeln!(out, "    void * {};", slot.exported_name)?;
        }
    }
    writeln!(
        out,
        "}} {} __attribute__((aligned({}))) __attribute__((section(\"{}\"))) = {{",
        options.struct_name, options.align, options.section
    )
}

fn write_initialiser(
    out: &mut String,
    layout: &ImageLayout,
    blob: &[u8],
    options: &ImageOptions,
) -> std::fmt::Result {
    let last = layout.partitions.len() - 1;
    for (i, partition) in layout.partitions.iter().enumerate() {
        writeln!(out, "    {{")?;
        for row in hex_byte_rows(layout.partition_bytes(blob, i), options.row_width) {
            writeln!(out, "\t\t{row}")?;
        }
        if partition.slot.is_some() {
            writeln!(out, "    }},")?;
            writeln!(out, "        0,")?;
        } else {
            debug_assert_eq!(i, last);
            writeln!(out, "    }}")?;
        }
    }
    writeln!(out, "}};")
}

fn write_constructor(out: &mut String, layout: &ImageLayout, options: &ImageOptions) -> std::fmt::Result {
    let slots = layout.slots_by_ordinal();
    let name = &options.struct_name;

    writeln!(out)?;
    for slot in &slots {
        writeln!(out, "extern void {}(void);", slot.source_symbol)?;
    }
    writeln!(out, "char* {};", options.base_pointer)?;
    writeln!(out)?;
    writeln!(
        out,
        "void {}(void) __attribute__((constructor));",
        options.constructor
    )?;
    writeln!(out)?;
    writeln!(out, "void {}(void) {{", options.constructor)?;
    for slot in &slots {
        writeln!(
            out,
            "    {name}.{} = (void *)((char *)&{} - (char *)&{name});",
            slot.exported_name, slot.source_symbol
        )?;
    }
    writeln!(out, "    {} = (char*)&{name};", options.base_pointer)?;
    writeln!(out, "}}")
}
