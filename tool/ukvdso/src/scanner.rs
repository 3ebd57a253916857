//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Locating sentinel markers in a compiled vDSO.
//!
//! A marker is an 8-byte, 4-aligned span: a little-endian `u32` sort key
//! immediately followed by the little-endian `u32` magic. The vDSO sources
//! plant one pointer-sized constant per relocation point and the compiled
//! object ends up carrying that constant twice, so every key is expected to
//! show up exactly two times.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::util::read_u32_le;

pub const MARKER_SIZE: usize = 8;
const STRIDE: usize = 4;

/// One marker occurrence. `offset` is where the span starts, i.e. the
/// position of the sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub offset: usize,
    pub key: u32,
}

/// The opening and closing occurrence of one logical relocation point. Only
/// the opening one is cut out of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarkerPair {
    pub key: u32,
    pub offset: usize,
    pub closing_offset: usize,
}

/// Scan `blob` at 4-byte strides for `magic`. The result is ordered by file
/// offset. The final tail that cannot hold a whole marker is not examined, and
/// after a match the scan continues past the matched span so that no two
/// markers overlap.
pub fn scan_markers(blob: &[u8], magic: u32) -> Vec<Marker> {
    let mut markers = Vec::new();
    let end = blob.len().saturating_sub(MARKER_SIZE);

    let mut offset = 0;
    while offset < end {
        if read_u32_le(blob, offset + 4) == magic {
            markers.push(Marker {
                offset,
                key: read_u32_le(blob, offset),
            });
            offset += MARKER_SIZE;
        } else {
            offset += STRIDE;
        }
    }

    markers
}

/// Group marker occurrences into pairs by sort key.
///
/// `expected_pairs` is the length of the symbol map; anything other than
/// exactly twice that many occurrences is a build that cannot be fixed up.
/// The pairs come back ordered by the offset of their opening marker.
pub fn pair_markers(markers: &[Marker], expected_pairs: usize) -> Result<Vec<MarkerPair>> {
    if markers.len() != expected_pairs * 2 {
        return Err(Error::CountMismatch {
            found: markers.len(),
            symbols: expected_pairs,
        });
    }

    let mut by_key: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for marker in markers {
        by_key.entry(marker.key).or_default().push(marker.offset);
    }

    let mut pairs = Vec::with_capacity(expected_pairs);
    for (key, offsets) in by_key {
        if offsets.len() != 2 {
            return Err(Error::UnpairedMarker {
                key,
                count: offsets.len(),
            });
        }
        // Markers are scanned in offset order so the first one is the lower.
        pairs.push(MarkerPair {
            key,
            offset: offsets[0],
            closing_offset: offsets[1],
        });
    }

    pairs.sort_by_key(|pair| pair.offset);
    Ok(pairs)
}
