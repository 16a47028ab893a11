//! Small helpers shared across layers.

use byteorder::{ByteOrder, LittleEndian};

/// Formats a byte count for humans.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Makes a single path component safe to create on common filesystems.
///
/// Separators, reserved punctuation and control characters become `_`;
/// names that would vanish or walk upwards (`""`, `.`, `..`) become `_`.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim_end_matches([' ', '.']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Decodes a UTF-16LE run, stopping at a NUL or 0xFFFF padding unit.
pub fn decode_utf16_le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0x0000 && u != 0xFFFF)
        .collect();
    String::from_utf16_lossy(&units)
}
