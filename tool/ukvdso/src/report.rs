//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::builder::GeneratedImage;
use crate::emit::{data_field_name, ImageOptions};
use crate::error::{Error, Result};
use crate::layout::ImageLayout;
use crate::util::{comma_sep_u64, comma_sep_usize};

/// Human readable description of a generated image, written next to the C
/// source so that a broken relocation can be traced back to its marker.
pub fn write_report(image: &GeneratedImage, options: &ImageOptions, output_path: &Path) -> Result<()> {
    let file = File::create(output_path).map_err(|err| {
        Error::io(
            format!("cannot create report file '{}'", output_path.display()),
            err,
        )
    })?;
    let mut report = BufWriter::new(file);
    write_report_to(&mut report, image, options)
        .and_then(|_| report.flush())
        .map_err(|err| {
            Error::io(
                format!("cannot write report file '{}'", output_path.display()),
                err,
            )
        })
}

pub fn write_report_to<W: Write>(
    report: &mut W,
    image: &GeneratedImage,
    options: &ImageOptions,
) -> std::io::Result<()> {
    let layout = &image.layout;

    writeln!(report, "# vDSO Image Details")?;
    writeln!(report, "\t- Symbol: '{}'", options.struct_name)?;
    writeln!(report, "\t- Section: '{}'", options.section)?;
    writeln!(report, "\t- Alignment: {}", comma_sep_u64(options.align))?;
    writeln!(
        report,
        "\t- Image size: {} bytes",
        comma_sep_usize(layout.image_size)
    )?;
    writeln!(
        report,
        "\t- Markers: {} (magic {:#010x})",
        image.marker_count, options.magic
    )?;

    writeln!(report, "\n# Partitions")?;
    for (i, partition) in layout.partitions.iter().enumerate() {
        writeln!(
            report,
            "\t- {}: [0x{:x}..0x{:x}), {} bytes",
            data_field_name(i),
            partition.range.start,
            partition.range.end,
            comma_sep_usize(partition.len())
        )?;
        if let Some(slot) = &partition.slot {
            writeln!(
                report,
                "\t- {}: replaces marker at 0x{:x}",
                slot.exported_name, slot.offset
            )?;
        }
    }

    writeln!(report, "\n# Relocations")?;
    for slot in layout.slots_by_ordinal() {
        writeln!(report, "\t- Slot {}: '{}'", slot.ordinal, slot.exported_name)?;
        writeln!(report, "\t\t* Sort key: {:#x}", slot.key)?;
        writeln!(report, "\t\t* Target: '{}'", slot.source_symbol)?;
    }

    Ok(())
}

#[derive(Serialize)]
struct LayoutDump<'a> {
    options: &'a ImageOptions,
    layout: &'a ImageLayout,
}

/// Dump the layout as JSON for other build tooling.
pub fn write_layout_json(
    output_path: &Path,
    layout: &ImageLayout,
    options: &ImageOptions,
) -> Result<()> {
    write_json(output_path, &LayoutDump { options, layout })
}

pub fn write_json<T: Serialize>(output_path: &Path, value: &T) -> Result<()> {
    let serialised = serde_json::to_string_pretty(value)?;
    std::fs::write(output_path, serialised)
        .map_err(|err| Error::io(format!("could not write '{}'", output_path.display()), err))
}
