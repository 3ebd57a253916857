//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::ops::Range;

use serde::Serialize;

use crate::scanner::{MarkerPair, MARKER_SIZE};
use crate::symbols::SymbolMap;

/// A relocation slot following a partition. `ordinal` is the position of the
/// slot's marker pair in sort-key order and is what binds the slot to its
/// symbol map entry; it is unrelated to where the slot sits in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub ordinal: usize,
    pub key: u32,
    /// File offset of the marker span this slot replaces.
    pub offset: usize,
    pub source_symbol: String,
    pub exported_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub range: Range<usize>,
    /// Every partition but the last is followed by a slot.
    pub slot: Option<Slot>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// The vDSO image cut into byte ranges at each relocation point, in file
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageLayout {
    pub image_size: usize,
    pub partitions: Vec<Partition>,
}

impl ImageLayout {
    /// `pairs` must already have passed `pair_markers` against `symbols`, so
    /// there is exactly one pair per symbol map entry.
    pub fn new(image_size: usize, pairs: &[MarkerPair], symbols: &SymbolMap) -> ImageLayout {
        assert_eq!(pairs.len(), symbols.len());

        // First pass: ordinals follow sort-key order.
        let mut by_key: Vec<&MarkerPair> = pairs.iter().collect();
        by_key.sort_by_key(|pair| pair.key);

        let mut slots: Vec<Slot> = by_key
            .iter()
            .zip(symbols.iter())
            .enumerate()
            .map(|(ordinal, (pair, mapping))| {
                Slot {
                    ordinal,
                    key: pair.key,
                    offset: pair.offset,
                    source_symbol: mapping.source_symbol.clone(),
                    exported_name: mapping.exported_name.clone(),
                }
            })
            .collect();

        // Second pass: physical order for emission. The ordinal travels with
        // each slot.
        slots.sort_by_key(|slot| slot.offset);

        let mut partitions = Vec::with_capacity(slots.len() + 1);
        let mut cut = 0;
        for slot in slots {
            let next_cut = slot.offset + MARKER_SIZE;
            partitions.push(Partition {
                range: cut..slot.offset,
                slot: Some(slot),
            });
            cut = next_cut;
        }
        partitions.push(Partition {
            range: cut..image_size,
            slot: None,
        });

        ImageLayout {
            image_size,
            partitions,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.partitions.len() - 1
    }

    /// Slots in physical order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.partitions.iter().filter_map(|p| p.slot.as_ref())
    }

    /// Slots in ordinal order, i.e. symbol map order.
    pub fn slots_by_ordinal(&self) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.slots().collect();
        slots.sort_by_key(|slot| slot.ordinal);
        slots
    }

    pub fn partition_bytes<'a>(&self, blob: &'a [u8], index: usize) -> &'a [u8] {
        &blob[self.partitions[index].range.clone()]
    }

    /// The image with every slot's marker span taken out, which is exactly
    /// what the byte arrays of the generated struct hold.
    pub fn stripped_bytes(&self, blob: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.image_size);
        for partition in &self.partitions {
            bytes.extend_from_slice(&blob[partition.range.clone()]);
        }
        bytes
    }
}
