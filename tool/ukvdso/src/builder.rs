//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs;
use std::path::Path;

use crate::descriptor;
use crate::emit::{generate_image_source, ImageOptions};
use crate::error::{Error, Result};
use crate::layout::ImageLayout;
use crate::scanner::{pair_markers, scan_markers};
use crate::symbols::SymbolMap;
use crate::SLOT_SIZE;

/// Result of one generation pass. Holds everything the caller may want to
/// report on; the source text is only written out by the caller once the
/// whole pass succeeded.
pub struct GeneratedImage {
    pub layout: ImageLayout,
    pub source: String,
    pub marker_count: usize,
}

/// Load the relocation requests, either from a plain symbol map or from an
/// XML image descriptor (`.xml` extension) that also carries image options.
pub fn load_symbols(path: &Path) -> Result<(ImageOptions, SymbolMap)> {
    let is_xml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));

    if is_xml {
        let xml = fs::read_to_string(path).map_err(|err| {
            Error::io(format!("could not read descriptor '{}'", path.display()), err)
        })?;
        let desc = descriptor::parse(&path.display().to_string(), &xml)?;
        Ok((desc.options, desc.symbols))
    } else {
        let options = ImageOptions::default();
        let symbols = SymbolMap::from_path(path)?;
        symbols.check_reserved_names(&path.display().to_string(), &options)?;
        Ok((options, symbols))
    }
}

pub fn build_image(blob: &[u8], symbols: &SymbolMap, options: &ImageOptions) -> Result<GeneratedImage> {
    let markers = scan_markers(blob, options.magic);
    log::debug!(
        "found {} markers with magic {:#010x}",
        markers.len(),
        options.magic
    );
    for marker in &markers {
        log::trace!("marker key {:#x} at {:#x}", marker.key, marker.offset);
    }

    let pairs = pair_markers(&markers, symbols.len())?;
    let layout = ImageLayout::new(blob.len(), &pairs, symbols);
    for slot in layout.slots() {
        if slot.offset % SLOT_SIZE != 0 {
            // The C compiler pads the struct to align the pointer, which would
            // shift every following byte.
            return Err(Error::MisalignedSlot {
                name: slot.exported_name.clone(),
                offset: slot.offset,
                align: SLOT_SIZE,
            });
        }
        log::debug!(
            "slot {} ({}) at {:#x} <- {}",
            slot.ordinal,
            slot.exported_name,
            slot.offset,
            slot.source_symbol
        );
    }

    let source = generate_image_source(&layout, blob, options);

    Ok(GeneratedImage {
        layout,
        source,
        marker_count: markers.len(),
    })
}

/// The whole `bin2c` step: read the vDSO, generate, and only then create
/// `output`.
pub fn build_image_file(
    vdso_path: &Path,
    output: &Path,
    symbols: &SymbolMap,
    options: &ImageOptions,
) -> Result<GeneratedImage> {
    let blob = fs::read(vdso_path)
        .map_err(|err| Error::io(format!("could not read vDSO '{}'", vdso_path.display()), err))?;
    let image = build_image(&blob, symbols, options)?;
    fs::write(output, &image.source)
        .map_err(|err| Error::io(format!("could not write '{}'", output.display()), err))?;
    Ok(image)
}
