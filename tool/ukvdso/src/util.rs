//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

/// Decode the little-endian `u32` stored at `bytes[offset..offset + 4]`.
///
/// The value is assembled with shifts on unsigned bytes so the top bit of the
/// window is never treated as a sign.
pub fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let b = &bytes[offset..offset + 4];
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16) | ((b[3] as u32) << 24)
}

/// Parse a hexadecimal address as it appears in objdump output. The `0x`
/// prefix is optional since symbol table lines omit it while program header
/// lines carry it.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse an integer that is either decimal or `0x` prefixed hex. Underscores
/// are ignored so that `0x369C_2171` is accepted.
pub fn parse_number(s: &str) -> Result<u64, String> {
    let mut to_parse = s.to_string();
    to_parse.retain(|c| c != '_');

    let (final_str, base) = match to_parse.strip_prefix("0x") {
        Some(stripped) => (stripped, 16),
        None => (to_parse.as_str(), 10),
    };

    u64::from_str_radix(final_str, base)
        .map_err(|err| format!("failed to parse integer '{s}': {err}"))
}

pub fn is_power_of_two(n: u64) -> bool {
    n > 0 && n & (n - 1) == 0
}

/// Whether `name` can be used verbatim as a C identifier in generated source.
pub fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Render `bytes` as rows of at most `width` entries, each entry formatted as
/// `0xNN,`. The output is a pure function of the input.
pub fn hex_byte_rows(bytes: &[u8], width: usize) -> Vec<String> {
    assert!(width > 0);
    bytes
        .chunks(width)
        .map(|row| {
            row.iter()
                .map(|b| format!("0x{b:02X},"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Take an integer, such as 1000000 and add commas such as:
/// 1,000,000.
pub fn comma_sep_u64(n: u64) -> String {
    let mut s = String::new();
    for (i, val) in n.to_string().chars().rev().enumerate() {
        if i != 0 && i % 3 == 0 {
            s.insert(0, ',');
        }
        s.insert(0, val);
    }

    s
}

pub fn comma_sep_usize(n: usize) -> String {
    comma_sep_u64(n as u64)
}
