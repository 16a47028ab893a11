//! Lightweight per-format structural checks
//!
//! Each check looks at the bytes of a sized candidate and answers whether
//! the internal fields agree with each other. None of them decode content.

use crate::domain::entities::StructureCheck;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const ZIP_END_RECORD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const ZIP_CENTRAL_ENTRY: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const ZIP_END_RECORD_LEN: usize = 22;
const DIB_HEADER_SIZES: [u32; 7] = [12, 40, 52, 56, 64, 108, 124];

/// Runs `check` against the candidate's bytes
pub fn verify(check: StructureCheck, data: &[u8]) -> bool {
    match check {
        StructureCheck::Jpeg => jpeg_markers(data),
        StructureCheck::Png => png_header(data),
        StructureCheck::Gif => gif_screen(data),
        StructureCheck::Bmp => bmp_header(data),
        StructureCheck::Zip => zip_directory(data),
        StructureCheck::Riff => riff_form(data),
        StructureCheck::Pdf => pdf_version(data),
    }
}

/// Walks marker segments from SOI up to the start of scan or EOI
fn jpeg_markers(data: &[u8]) -> bool {
    if data.len() < 4 || data[..2] != [0xFF, 0xD8] || data[data.len() - 2..] != [0xFF, 0xD9] {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            return false;
        }
        let marker = data[pos + 1];
        match marker {
            // fill byte
            0xFF => pos += 1,
            0xD9 | 0xDA => return true,
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let Some(raw) = data.get(pos + 2..pos + 4) else {
                    return false;
                };
                let length = BigEndian::read_u16(raw) as usize;
                if length < 2 {
                    return false;
                }
                pos += 2 + length;
            }
        }
    }
    false
}

/// IHDR must come first, be 13 bytes long and carry a valid CRC
fn png_header(data: &[u8]) -> bool {
    if data.len() < 33 || data[..8] != PNG_SIGNATURE {
        return false;
    }
    let length = BigEndian::read_u32(&data[8..12]);
    if length != 13 || &data[12..16] != b"IHDR" {
        return false;
    }
    let width = BigEndian::read_u32(&data[16..20]);
    let height = BigEndian::read_u32(&data[20..24]);
    let stored = BigEndian::read_u32(&data[29..33]);
    width > 0 && height > 0 && crc32fast::hash(&data[12..29]) == stored
}

/// Logical screen dimensions must be non-zero
fn gif_screen(data: &[u8]) -> bool {
    if data.len() < 14 || !(data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) {
        return false;
    }
    let width = LittleEndian::read_u16(&data[6..8]);
    let height = LittleEndian::read_u16(&data[8..10]);
    width > 0 && height > 0 && data[data.len() - 1] == 0x3B
}

/// File header and DIB header agree with the candidate length
fn bmp_header(data: &[u8]) -> bool {
    if data.len() < 26 || &data[..2] != b"BM" {
        return false;
    }
    let mut cursor = Cursor::new(&data[2..18]);
    let (Ok(file_size), Ok(reserved), Ok(pixel_offset), Ok(dib_size)) = (
        cursor.read_u32::<LittleEndian>(),
        cursor.read_u32::<LittleEndian>(),
        cursor.read_u32::<LittleEndian>(),
        cursor.read_u32::<LittleEndian>(),
    ) else {
        return false;
    };

    file_size as usize == data.len()
        && reserved == 0
        && DIB_HEADER_SIZES.contains(&dib_size)
        && pixel_offset >= 14 + dib_size
        && (pixel_offset as usize) < data.len()
}

/// The end record points at a central directory that ends where it begins
fn zip_directory(data: &[u8]) -> bool {
    if data.len() < ZIP_END_RECORD_LEN + 4 {
        return false;
    }
    let end = data.len() - ZIP_END_RECORD_LEN;
    let record = &data[end..];
    if record[..4] != ZIP_END_RECORD {
        return false;
    }
    let entries = LittleEndian::read_u16(&record[10..12]);
    let cd_size = LittleEndian::read_u32(&record[12..16]) as usize;
    let cd_offset = LittleEndian::read_u32(&record[16..20]) as usize;

    if cd_offset.checked_add(cd_size) != Some(end) {
        return false;
    }
    if entries == 0 {
        return cd_size == 0;
    }
    data.get(cd_offset..cd_offset + 4) == Some(&ZIP_CENTRAL_ENTRY[..])
}

/// RIFF size field matches the candidate and the form type is known
fn riff_form(data: &[u8]) -> bool {
    if data.len() < 12 || &data[..4] != b"RIFF" {
        return false;
    }
    let size = LittleEndian::read_u32(&data[4..8]) as usize;
    let form = &data[8..12];
    size + 8 == data.len() && matches!(form, b"WEBP" | b"WAVE" | b"AVI ")
}

/// `%PDF-M.m` with a plausible version, ending at `%%EOF`
fn pdf_version(data: &[u8]) -> bool {
    if data.len() < 13 || !data.starts_with(b"%PDF-") {
        return false;
    }
    let (major, dot, minor) = (data[5], data[6], data[7]);
    matches!(major, b'1' | b'2') && dot == b'.' && minor.is_ascii_digit() && data.ends_with(b"%%EOF")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// SOI, a JFIF APP0 segment, SOS, `len` bytes total, EOI
    pub(crate) fn jpeg_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        data.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
        data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        while data.len() < len - 2 {
            data.push(0x5A);
        }
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn png_bytes() -> Vec<u8> {
        let mut data = PNG_SIGNATURE.to_vec();
        let mut ihdr = b"IHDR".to_vec();
        ihdr.extend_from_slice(&16u32.to_be_bytes());
        ihdr.extend_from_slice(&9u32.to_be_bytes());
        ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(&ihdr);
        data.extend_from_slice(&crc32fast::hash(&ihdr).to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(b"IEND\xAE\x42\x60\x82");
        data
    }

    #[test]
    fn jpeg_marker_walk() {
        assert!(verify(StructureCheck::Jpeg, &jpeg_bytes(500)));

        let mut broken = jpeg_bytes(500);
        // APP0 length now lands inside the scan data
        broken[4] = 0x00;
        broken[5] = 0x40;
        assert!(!verify(StructureCheck::Jpeg, &broken));
    }

    #[test]
    fn png_crc_is_checked() {
        let good = png_bytes();
        assert!(verify(StructureCheck::Png, &good));

        let mut bad = good.clone();
        bad[17] ^= 0x01;
        assert!(!verify(StructureCheck::Png, &bad));
    }

    #[test]
    fn bmp_size_must_match() {
        let mut data = vec![0u8; 120];
        data[..2].copy_from_slice(b"BM");
        data[2..6].copy_from_slice(&120u32.to_le_bytes());
        data[10..14].copy_from_slice(&54u32.to_le_bytes());
        data[14..18].copy_from_slice(&40u32.to_le_bytes());
        assert!(verify(StructureCheck::Bmp, &data));
        assert!(!verify(StructureCheck::Bmp, &data[..100]));
    }

    #[test]
    fn zip_end_record_consistency() {
        let mut data = vec![0x50, 0x4B, 0x03, 0x04];
        data.extend_from_slice(&[0u8; 26]);
        let cd_offset = data.len() as u32;
        data.extend_from_slice(&ZIP_CENTRAL_ENTRY);
        data.extend_from_slice(&[0u8; 42]);
        let cd_size = data.len() as u32 - cd_offset;
        data.extend_from_slice(&ZIP_END_RECORD);
        data.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
        data.extend_from_slice(&cd_size.to_le_bytes());
        data.extend_from_slice(&cd_offset.to_le_bytes());
        data.extend_from_slice(&[0, 0]);
        assert!(verify(StructureCheck::Zip, &data));

        let mut shifted = data.clone();
        let end = shifted.len() - 22;
        shifted[end + 16] ^= 0x04;
        assert!(!verify(StructureCheck::Zip, &shifted));
    }

    #[test]
    fn riff_and_pdf() {
        let mut wav = b"RIFF".to_vec();
        wav.extend_from_slice(&28u32.to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&[0u8; 20]);
        assert!(verify(StructureCheck::Riff, &wav));
        assert!(!verify(StructureCheck::Riff, &wav[..30]));

        assert!(verify(StructureCheck::Pdf, b"%PDF-1.7\n1 0 obj\n%%EOF"));
        assert!(!verify(StructureCheck::Pdf, b"%PDF-9.x\n1 0 obj\n%%EOF"));
    }

    #[test]
    fn gif_needs_a_screen() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[4, 0, 4, 0, 0, 0, 0]);
        gif.extend_from_slice(&[0x2C, 0x00, 0x3B]);
        assert!(verify(StructureCheck::Gif, &gif));
        gif[6] = 0;
        assert!(!verify(StructureCheck::Gif, &gif));
    }
}
