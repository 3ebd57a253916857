//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::emit::{is_data_field_name, ImageOptions};
use crate::error::{Error, Result};
use crate::util::is_c_identifier;

/// One relocation request: the kernel-side symbol whose address is wanted and
/// the name of the slot in the generated struct that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolMapping {
    pub source_symbol: String,
    pub exported_name: String,
}

/// Ordered list of relocation requests. Entry `i` is bound to the marker pair
/// with the `i`-th smallest sort key, so order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolMap {
    entries: Vec<SymbolMapping>,
}

impl SymbolMap {
    pub fn new(entries: Vec<SymbolMapping>) -> SymbolMap {
        SymbolMap { entries }
    }

    pub fn from_path(path: &Path) -> Result<SymbolMap> {
        let text = fs::read_to_string(path).map_err(|err| {
            Error::io(format!("could not read symbol map '{}'", path.display()), err)
        })?;
        SymbolMap::parse(&path.display().to_string(), &text)
    }

    /// Parse the `<source-symbol> <exported-name>` line format. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn parse(filename: &str, text: &str) -> Result<SymbolMap> {
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            if tokens.len() != 2 {
                return Err(Error::MalformedSymbolMap {
                    path: filename.to_string(),
                    line: idx + 1,
                    text: line.to_string(),
                });
            }

            for name in &tokens {
                if !is_c_identifier(name) {
                    return Err(Error::InvalidIdentifier {
                        path: filename.to_string(),
                        line: idx + 1,
                        name: name.to_string(),
                    });
                }
            }

            entries.push(SymbolMapping {
                source_symbol: tokens[0].to_string(),
                exported_name: tokens[1].to_string(),
            });
        }

        let map = SymbolMap { entries };
        map.validate(filename)?;
        Ok(map)
    }

    /// Checks shared by every way of loading a map: it must not be empty and
    /// neither column may repeat a name, otherwise the generated C would not
    /// compile.
    pub fn validate(&self, filename: &str) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::EmptySymbolMap {
                path: filename.to_string(),
            });
        }

        for (i, entry) in self.entries.iter().enumerate() {
            let rest = &self.entries[i + 1..];
            if rest.iter().any(|e| e.source_symbol == entry.source_symbol) {
                return Err(Error::DuplicateSymbol {
                    path: filename.to_string(),
                    kind: "source symbol",
                    name: entry.source_symbol.clone(),
                });
            }
            if rest.iter().any(|e| e.exported_name == entry.exported_name) {
                return Err(Error::DuplicateSymbol {
                    path: filename.to_string(),
                    kind: "exported name",
                    name: entry.exported_name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Reject names that would clash with identifiers of the generated
    /// source: exported names against the byte array fields, source symbols
    /// against the file scope names taken from `options`.
    pub fn check_reserved_names(&self, filename: &str, options: &ImageOptions) -> Result<()> {
        let file_scope = [
            ("the image symbol", &options.struct_name),
            ("the constructor", &options.constructor),
            ("the base pointer", &options.base_pointer),
        ];

        for entry in &self.entries {
            if is_data_field_name(&entry.exported_name) {
                return Err(Error::ReservedName {
                    path: filename.to_string(),
                    kind: "exported name",
                    name: entry.exported_name.clone(),
                    clash: "a generated byte array field".to_string(),
                });
            }
            if let Some((what, _)) = file_scope
                .iter()
                .find(|(_, name)| **name == entry.source_symbol)
            {
                return Err(Error::ReservedName {
                    path: filename.to_string(),
                    kind: "source symbol",
                    name: entry.source_symbol.clone(),
                    clash: what.to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Option<&SymbolMapping> {
        self.entries.get(ordinal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolMapping> {
        self.entries.iter()
    }
}
