//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::memmap::KernelFacts;

/// File offset of the embedded image inside the kernel:
/// `struct_vaddr - segment_vaddr + segment_offset`.
pub fn patch_offset(facts: &KernelFacts) -> Result<u64> {
    let delta = facts
        .struct_vaddr
        .checked_sub(facts.ro_segment.vaddr)
        .ok_or(Error::AddressUnderflow {
            struct_vaddr: facts.struct_vaddr,
            segment_vaddr: facts.ro_segment.vaddr,
        })?;
    delta
        .checked_add(facts.ro_segment.offset)
        .ok_or(Error::OffsetOverflow {
            delta,
            segment_offset: facts.ro_segment.offset,
        })
}

/// Make sure `len` bytes at `offset` lie inside the file, without touching it.
pub fn check_patch_bounds(path: &Path, offset: u64, len: u64) -> Result<()> {
    let file_len = fs::metadata(path)
        .map_err(|err| Error::io(format!("could not stat '{}'", path.display()), err))?
        .len();

    match offset.checked_add(len) {
        Some(end) if end <= file_len => Ok(()),
        _ => Err(Error::PatchOutOfBounds {
            path: path.to_path_buf(),
            offset,
            len,
            file_len,
        }),
    }
}

/// Overwrite `data.len()` bytes of `path` starting at `offset`, in place.
/// The region is bounds-checked first so a bad offset never extends the file.
/// There is no recovery from an interrupted write.
pub fn patch_file(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    check_patch_bounds(path, offset, data.len() as u64)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::io(format!("could not open '{}'", path.display()), err))?;

    file.seek(SeekFrom::Start(offset))
        .map_err(|err| Error::io(format!("could not seek '{}'", path.display()), err))?;
    file.write_all(data)
        .map_err(|err| Error::io(format!("could not write '{}'", path.display()), err))?;
    file.sync_all()
        .map_err(|err| Error::io(format!("could not sync '{}'", path.display()), err))?;

    Ok(())
}
