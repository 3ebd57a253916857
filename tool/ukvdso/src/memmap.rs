//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Extracting addresses from the textual dump of the linked kernel.
//!
//! The input is what `objdump -x` prints for the kernel ELF. Program headers
//! are printed as two lines, the second of which carries the permissions:
//!
//! ```text
//!     LOAD off    0x0000000000051000 vaddr 0x0000000000150000 paddr 0x0000000000150000 align 2**12
//!          filesz 0x0000000000010000 memsz 0x0000000000010000 flags r--
//! ```
//!
//! so the offset and vaddr of the read-only segment are the 3rd and 5th tokens
//! of the line *before* the `flags r--` line. Symbol table lines start with the
//! address and end with the symbol name. This positional coupling belongs to
//! objdump's output format and has to be re-checked for any other producer.

use std::io::BufRead;

use serde::Serialize;

use crate::emit::DEFAULT_STRUCT_NAME;
use crate::error::{Error, Result};
use crate::util::parse_hex_u64;

pub const MONOTONIC_CLOCK_SYMBOL: &str = "ukplat_monotonic_clock";
pub const WALL_CLOCK_SYMBOL: &str = "ukplat_wall_clock";

const OFFSET_TOKEN: usize = 2;
const VADDR_TOKEN: usize = 4;

/// Which symbol names to look for.
#[derive(Debug, Clone)]
pub struct MapQuery {
    pub struct_symbol: String,
    pub monotonic_clock_symbol: String,
    pub wall_clock_symbol: String,
}

impl Default for MapQuery {
    fn default() -> Self {
        MapQuery {
            struct_symbol: DEFAULT_STRUCT_NAME.to_string(),
            monotonic_clock_symbol: MONOTONIC_CLOCK_SYMBOL.to_string(),
            wall_clock_symbol: WALL_CLOCK_SYMBOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub offset: u64,
    pub vaddr: u64,
}

/// Everything the patcher needs from the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelFacts {
    pub ro_segment: Segment,
    pub struct_vaddr: u64,
    pub monotonic_clock: u64,
    pub wall_clock: u64,
}

/// Accumulates facts while the map is scanned. Every field starts unset and
/// is only checked for completeness in `finish`, once all lines were seen.
#[derive(Debug, Default)]
pub struct MapFacts {
    ro_segment: Option<Segment>,
    ro_flag_lines: Vec<usize>,
    struct_vaddr: Option<u64>,
    monotonic_clock: Option<u64>,
    wall_clock: Option<u64>,
}

fn is_ro_flags_line(tokens: &[&str]) -> bool {
    tokens.windows(2).any(|w| w[0] == "flags" && w[1] == "r--")
}

/// Address of `name` if `tokens` is a symbol table line defining it.
fn symbol_address(tokens: &[&str], name: &str) -> Option<u64> {
    if tokens.len() < 2 || *tokens.last()? != name {
        return None;
    }
    parse_hex_u64(tokens[0])
}

fn record_symbol(slot: &mut Option<u64>, name: &str, vaddr: u64) -> Result<()> {
    match *slot {
        Some(first) if first != vaddr => Err(Error::ConflictingSymbol {
            name: name.to_string(),
            first,
            second: vaddr,
        }),
        _ => {
            *slot = Some(vaddr);
            Ok(())
        }
    }
}

impl MapFacts {
    /// Feed one line. `prev` is the line before it, if any; `line_no` is
    /// 1-based and only used for diagnostics.
    pub fn observe(
        &mut self,
        query: &MapQuery,
        line_no: usize,
        line: &str,
        prev: Option<&str>,
    ) -> Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if is_ro_flags_line(&tokens) {
            self.ro_flag_lines.push(line_no);
            if self.ro_segment.is_none() {
                let prev = prev.ok_or(Error::OrphanReadOnlyFlags { line: line_no })?;
                self.ro_segment = Some(parse_segment_line(line_no - 1, prev)?);
            }
        }

        if let Some(vaddr) = symbol_address(&tokens, &query.struct_symbol) {
            record_symbol(&mut self.struct_vaddr, &query.struct_symbol, vaddr)?;
        }
        if let Some(vaddr) = symbol_address(&tokens, &query.monotonic_clock_symbol) {
            record_symbol(&mut self.monotonic_clock, &query.monotonic_clock_symbol, vaddr)?;
        }
        if let Some(vaddr) = symbol_address(&tokens, &query.wall_clock_symbol) {
            record_symbol(&mut self.wall_clock, &query.wall_clock_symbol, vaddr)?;
        }

        Ok(())
    }

    pub fn finish(self, query: &MapQuery) -> Result<KernelFacts> {
        if self.ro_flag_lines.len() > 1 {
            return Err(Error::AmbiguousReadOnlySegment {
                lines: self.ro_flag_lines,
            });
        }

        let ro_segment = self.ro_segment.ok_or(Error::NoReadOnlySegment)?;

        let mut missing = Vec::new();
        if self.struct_vaddr.is_none() {
            missing.push(format!("symbol '{}'", query.struct_symbol));
        }
        if self.monotonic_clock.is_none() {
            missing.push(format!("symbol '{}'", query.monotonic_clock_symbol));
        }
        if self.wall_clock.is_none() {
            missing.push(format!("symbol '{}'", query.wall_clock_symbol));
        }

        match (self.struct_vaddr, self.monotonic_clock, self.wall_clock) {
            (Some(struct_vaddr), Some(monotonic_clock), Some(wall_clock)) => {
                Ok(KernelFacts {
                    ro_segment,
                    struct_vaddr,
                    monotonic_clock,
                    wall_clock,
                })
            }
            _ => Err(Error::MissingFacts(missing)),
        }
    }
}

fn parse_segment_line(line_no: usize, line: &str) -> Result<Segment> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let malformed = || Error::MalformedSegmentLine {
        line: line_no,
        text: line.trim().to_string(),
    };

    let offset = tokens
        .get(OFFSET_TOKEN)
        .and_then(|t| parse_hex_u64(t))
        .ok_or_else(malformed)?;
    let vaddr = tokens
        .get(VADDR_TOKEN)
        .and_then(|t| parse_hex_u64(t))
        .ok_or_else(malformed)?;

    Ok(Segment { offset, vaddr })
}

/// Scan the whole map once and extract the kernel facts.
pub fn parse_memory_map<R: BufRead>(reader: R, query: &MapQuery) -> Result<KernelFacts> {
    let mut facts = MapFacts::default();
    let mut prev: Option<String> = None;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| Error::io("could not read memory map", err))?;
        facts.observe(query, idx + 1, &line, prev.as_deref())?;
        prev = Some(line);
    }

    facts.finish(query)
}
