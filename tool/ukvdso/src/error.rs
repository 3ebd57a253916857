//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Broad classes of failure. Each class maps to its own process exit code so
/// that build scripts can tell a bad configuration apart from, say, a broken
/// toolchain without parsing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Configuration,
    Structure,
    MissingFact,
    Toolchain,
    Io,
}

impl Category {
    pub fn exit_code(self) -> i32 {
        match self {
            Category::Configuration => 2,
            Category::Structure => 3,
            Category::MissingFact => 4,
            Category::Toolchain => 5,
            Category::Io => 6,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Category::Configuration => "config",
            Category::Structure => "structure",
            Category::MissingFact => "missing-fact",
            Category::Toolchain => "toolchain",
            Category::Io => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("environment variable '{0}' is not set")]
    MissingEnv(&'static str),

    #[error("environment variable '{name}' has invalid value '{value}': {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{path}:{line}: malformed symbol map line '{text}', expected '<source-symbol> <exported-name>'")]
    MalformedSymbolMap {
        path: String,
        line: usize,
        text: String,
    },

    #[error("{path}:{line}: '{name}' is not a valid C identifier")]
    InvalidIdentifier {
        path: String,
        line: usize,
        name: String,
    },

    #[error("{path}: {kind} '{name}' appears more than once")]
    DuplicateSymbol {
        path: String,
        kind: &'static str,
        name: String,
    },

    #[error("{path}: {kind} '{name}' clashes with {clash}")]
    ReservedName {
        path: String,
        kind: &'static str,
        name: String,
        clash: String,
    },

    #[error("{path}: the symbol map is empty")]
    EmptySymbolMap { path: String },

    /// Errors found while loading an XML image descriptor. The message already
    /// carries the file position.
    #[error("{0}")]
    Descriptor(String),

    #[error("found {found} marker occurrences but the symbol map has {symbols} entries (expected {} occurrences)", .symbols * 2)]
    CountMismatch { found: usize, symbols: usize },

    #[error("marker with sort key {key:#x} occurs {count} times, expected exactly 2")]
    UnpairedMarker { key: u32, count: usize },

    #[error("multiple read-only segments are flagged in the memory map (lines {})", .lines.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", "))]
    AmbiguousReadOnlySegment { lines: Vec<usize> },

    #[error("no segment descriptor precedes the read-only flags on line {line}")]
    OrphanReadOnlyFlags { line: usize },

    #[error("line {line}: cannot read segment offset and vaddr from '{text}'")]
    MalformedSegmentLine { line: usize, text: String },

    #[error("symbol '{name}' is listed at both {first:#x} and {second:#x}")]
    ConflictingSymbol { name: String, first: u64, second: u64 },

    #[error("no read-only segment is flagged in the memory map")]
    NoReadOnlySegment,

    #[error("memory map is missing: {}", .0.join(", "))]
    MissingFacts(Vec<String>),

    #[error("struct vaddr {struct_vaddr:#x} lies below the read-only segment vaddr {segment_vaddr:#x}")]
    AddressUnderflow { struct_vaddr: u64, segment_vaddr: u64 },

    #[error("image offset {delta:#x} past the read-only segment at file offset {segment_offset:#x} overflows")]
    OffsetOverflow { delta: u64, segment_offset: u64 },

    #[error("slot '{name}' at offset {offset:#x} is not {align}-byte aligned, the generated struct would not match the vDSO layout")]
    MisalignedSlot {
        name: String,
        offset: usize,
        align: usize,
    },

    #[error("no C sources found in '{}'", .0.display())]
    NoSources(PathBuf),

    #[error("could not run '{program}': {source}")]
    ToolchainSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed ({status}):\n{stderr}")]
    ToolchainFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("patch of {len} bytes at offset {offset:#x} runs past the end of '{}' ({file_len} bytes)", .path.display())]
    PatchOutOfBounds {
        path: PathBuf,
        offset: u64,
        len: u64,
        file_len: u64,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("could not serialise layout: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Error::MissingEnv(_)
            | Error::InvalidEnv { .. }
            | Error::MalformedSymbolMap { .. }
            | Error::InvalidIdentifier { .. }
            | Error::DuplicateSymbol { .. }
            | Error::ReservedName { .. }
            | Error::EmptySymbolMap { .. }
            | Error::Descriptor(_) => Category::Configuration,
            Error::CountMismatch { .. }
            | Error::UnpairedMarker { .. }
            | Error::AmbiguousReadOnlySegment { .. }
            | Error::OrphanReadOnlyFlags { .. }
            | Error::MalformedSegmentLine { .. }
            | Error::ConflictingSymbol { .. }
            | Error::NoReadOnlySegment
            | Error::AddressUnderflow { .. }
            | Error::OffsetOverflow { .. }
            | Error::MisalignedSlot { .. } => Category::Structure,
            Error::MissingFacts(_) => Category::MissingFact,
            Error::NoSources(_) | Error::ToolchainSpawn { .. } | Error::ToolchainFailed { .. } => {
                Category::Toolchain
            }
            Error::PatchOutOfBounds { .. } | Error::Io { .. } | Error::Json(_) => Category::Io,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Error {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
