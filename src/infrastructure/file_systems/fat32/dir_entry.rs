//! FAT directory entries and long file name runs

use crate::domain::entities::NodeAttributes;
use crate::utils::decode_utf16_le;
use byteorder::{ByteOrder, LittleEndian};

pub const ENTRY_SIZE: usize = 32;

pub const END_MARKER: u8 = 0x00;
pub const DELETED_MARKER: u8 = 0xE5;
/// Stored in place of a leading 0xE5 that belongs to the name
const KANJI_ESCAPE: u8 = 0x05;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_LONG_NAME: u8 = 0x0F;
const LFN_LAST: u8 = 0x40;
const LFN_SEQ_MASK: u8 = 0x3F;
/// Leading slots checked when guessing whether an unlisted cluster holds entries
const SAMPLE_SLOTS: usize = 16;

/// Raw slot classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntry {
    End,
    LongName(LfnPart),
    Short(ShortEntry),
    /// Volume label or "." / ".."
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfnPart {
    pub sequence: u8,
    pub last: bool,
    pub deleted: bool,
    pub checksum: u8,
    pub chars: Vec<u8>,
}

/// 8.3 entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEntry {
    /// Name bytes with the deletion marker still in place
    pub raw_name: [u8; 11],
    pub deleted: bool,
    pub attributes: NodeAttributes,
    /// Case flags (0x08 lower-case base, 0x10 lower-case extension)
    pub case_flags: u8,
    pub first_cluster: u32,
    pub size: u32,
}

impl ShortEntry {
    /// Display name; the lost first byte of a deleted name is `first`
    pub fn display_name(&self, first: u8) -> String {
        let mut name = self.raw_name;
        name[0] = if self.deleted { first } else { name[0] };
        if name[0] == KANJI_ESCAPE {
            name[0] = DELETED_MARKER;
        }

        let mut base = String::from_utf8_lossy(&name[..8]).trim_end().to_string();
        let mut ext = String::from_utf8_lossy(&name[8..]).trim_end().to_string();
        if self.case_flags & 0x08 != 0 {
            base = base.to_lowercase();
        }
        if self.case_flags & 0x10 != 0 {
            ext = ext.to_lowercase();
        }

        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }
}

/// Checksum of an 8.3 name as stored in its LFN entries
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

pub fn classify(entry: &[u8]) -> RawEntry {
    let marker = entry[0];
    if marker == END_MARKER {
        return RawEntry::End;
    }
    let deleted = marker == DELETED_MARKER;
    let attr = entry[11];

    if attr & 0x3F == ATTR_LONG_NAME {
        let mut chars = Vec::with_capacity(26);
        chars.extend_from_slice(&entry[1..11]);
        chars.extend_from_slice(&entry[14..26]);
        chars.extend_from_slice(&entry[28..32]);
        return RawEntry::LongName(LfnPart {
            sequence: marker & LFN_SEQ_MASK,
            last: !deleted && marker & LFN_LAST != 0,
            deleted,
            checksum: entry[13],
            chars,
        });
    }

    if attr & ATTR_VOLUME_ID != 0 || (!deleted && marker == b'.') {
        return RawEntry::Skip;
    }

    let mut raw_name = [0u8; 11];
    raw_name.copy_from_slice(&entry[..11]);
    let first_cluster =
        ((LittleEndian::read_u16(&entry[20..]) as u32) << 16) | LittleEndian::read_u16(&entry[26..]) as u32;

    RawEntry::Short(ShortEntry {
        raw_name,
        deleted,
        attributes: NodeAttributes::from_dos(attr as u32),
        case_flags: entry[12],
        first_cluster,
        size: LittleEndian::read_u32(&entry[28..]),
    })
}

/// Collects LFN slots preceding a short entry
#[derive(Debug, Default)]
pub struct LfnAccumulator {
    parts: Vec<LfnPart>,
}

impl LfnAccumulator {
    pub fn push(&mut self, part: LfnPart) {
        if part.last {
            self.parts.clear();
        }
        self.parts.push(part);
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// Resolves the pending run against `short`, returning the long name
    /// and the restored first byte of a deleted short name.
    ///
    /// The run is consumed either way.
    pub fn finish(&mut self, short: &ShortEntry) -> (Option<String>, u8) {
        let parts = std::mem::take(&mut self.parts);
        let fallback = if short.deleted { b'_' } else { short.raw_name[0] };

        let Some(checksum) = parts.first().map(|p| p.checksum) else {
            return (None, fallback);
        };
        if parts.iter().any(|p| p.checksum != checksum) {
            return (None, fallback);
        }

        let first = if short.deleted {
            match restore_first_byte(&short.raw_name, checksum) {
                Some(b) => b,
                None => return (None, fallback),
            }
        } else {
            if short_name_checksum(&short.raw_name) != checksum {
                return (None, fallback);
            }
            short.raw_name[0]
        };

        // live runs must count down to 1 without gaps
        if !short.deleted {
            let contiguous = parts
                .iter()
                .rev()
                .enumerate()
                .all(|(i, p)| p.sequence as usize == i + 1);
            if !contiguous {
                return (None, first);
            }
        }

        let mut raw = Vec::with_capacity(parts.len() * 26);
        for part in parts.iter().rev() {
            raw.extend_from_slice(&part.chars);
        }
        let name = decode_utf16_le(&raw);
        ((!name.is_empty()).then_some(name), first)
    }
}

/// Whether a cluster no directory points at reads like one: at least two
/// entry-shaped slots before the end marker and none that could not be an
/// entry
pub fn looks_like_directory_cluster(data: &[u8]) -> bool {
    let mut entries = 0;
    for slot in data.chunks_exact(ENTRY_SIZE).take(SAMPLE_SLOTS) {
        if slot[0] == END_MARKER {
            break;
        }
        let attr = slot[11];
        let fits = if attr & 0x3F == ATTR_LONG_NAME {
            slot[12] == 0 && slot[26] == 0 && slot[27] == 0
        } else {
            attr & 0xC0 == 0 && plausible_short_name(&slot[..11])
        };
        if !fits {
            return false;
        }
        entries += 1;
    }
    entries >= 2
}

fn plausible_short_name(name: &[u8]) -> bool {
    if name[0] == b'.' {
        return name == b".          " || name == b"..         ";
    }
    let first = matches!(name[0], DELETED_MARKER | KANJI_ESCAPE) || short_name_byte(name[0]);
    first && name[0] != b' ' && name[1..].iter().all(|&b| short_name_byte(b))
}

fn short_name_byte(b: u8) -> bool {
    b >= 0x20 && b != 0x7F && !b.is_ascii_lowercase() && !b"\"*+,./:;<=>?[\\]|".contains(&b)
}

/// Finds a printable first byte that makes the 8.3 checksum match
fn restore_first_byte(raw_name: &[u8; 11], checksum: u8) -> Option<u8> {
    let mut name = *raw_name;
    (0x21u8..0x7F)
        .filter(|b| !b"\"*+,./:;<=>?[\\]|".contains(b) && !b.is_ascii_lowercase())
        .find(|&b| {
            name[0] = b;
            short_name_checksum(&name) == checksum
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[..11].copy_from_slice(name);
        e[11] = attr;
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    fn lfn(seq: u8, checksum: u8, text: &str) -> [u8; 32] {
        let mut units: Vec<u16> = text.encode_utf16().collect();
        if units.len() < 13 {
            units.push(0);
        }
        units.resize(13, 0xFFFF);
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();

        let mut e = [0u8; 32];
        e[0] = seq;
        e[1..11].copy_from_slice(&bytes[..10]);
        e[11] = ATTR_LONG_NAME;
        e[13] = checksum;
        e[14..26].copy_from_slice(&bytes[10..22]);
        e[28..32].copy_from_slice(&bytes[22..26]);
        e
    }

    #[test]
    fn short_entry_fields() {
        let e = short(b"REPORT  TXT", 0x20, 0x0001_0005, 1234);
        let RawEntry::Short(s) = classify(&e) else {
            panic!("expected short entry");
        };
        assert_eq!(s.first_cluster, 0x0001_0005);
        assert_eq!(s.size, 1234);
        assert_eq!(s.display_name(b'R'), "REPORT.TXT");
        assert!(!s.attributes.directory);
    }

    #[test]
    fn dot_entries_and_labels_are_skipped() {
        assert_eq!(classify(&short(b".          ", 0x10, 2, 0)), RawEntry::Skip);
        assert_eq!(classify(&short(b"VOLUME     ", 0x08, 0, 0)), RawEntry::Skip);
        assert_eq!(classify(&[0u8; 32]), RawEntry::End);
    }

    #[test]
    fn long_name_resolves_against_checksum() {
        let name = *b"HOLIDA~1JPG";
        let sum = short_name_checksum(&name);
        let mut acc = LfnAccumulator::default();
        for slot in [lfn(0x42, sum, ".jpg"), lfn(0x01, sum, "holiday photo")] {
            let RawEntry::LongName(part) = classify(&slot) else {
                panic!("expected lfn");
            };
            acc.push(part);
        }
        let RawEntry::Short(s) = classify(&short(&name, 0x20, 3, 10)) else {
            panic!("expected short entry");
        };
        assert_eq!(acc.finish(&s).0.as_deref(), Some("holiday photo.jpg"));
    }

    #[test]
    fn deleted_short_name_regains_first_byte() {
        let name = *b"LETTER  DOC";
        let sum = short_name_checksum(&name);
        let mut deleted_lfn = lfn(0x41, sum, "letter.doc");
        deleted_lfn[0] = DELETED_MARKER;
        let mut deleted_short = short(&name, 0x20, 9, 100);
        deleted_short[0] = DELETED_MARKER;

        let mut acc = LfnAccumulator::default();
        let RawEntry::LongName(part) = classify(&deleted_lfn) else {
            panic!("expected lfn");
        };
        acc.push(part);
        let RawEntry::Short(s) = classify(&deleted_short) else {
            panic!("expected short entry");
        };
        assert!(s.deleted);

        let (long, first) = acc.finish(&s);
        assert_eq!(long.as_deref(), Some("letter.doc"));
        assert_eq!(first, b'L');
        assert_eq!(s.display_name(first), "LETTER.DOC");
    }

    #[test]
    fn directory_clusters_are_told_from_data() {
        let mut cluster = vec![0u8; 512];
        cluster[..32].copy_from_slice(&short(b".          ", 0x10, 7, 0));
        cluster[32..64].copy_from_slice(&short(b"..         ", 0x10, 0, 0));
        let mut gone = short(b"DRAFT   TXT", 0x20, 8, 10);
        gone[0] = DELETED_MARKER;
        cluster[64..96].copy_from_slice(&gone);
        assert!(looks_like_directory_cluster(&cluster));

        let text = b"the quick brown fox jumps over the lazy dog ".repeat(12);
        assert!(!looks_like_directory_cluster(&text));
        assert!(!looks_like_directory_cluster(&[0u8; 512]));

        // one entry is not enough
        let mut lone = vec![0u8; 512];
        lone[..32].copy_from_slice(&short(b"ONLY    BIN", 0x20, 9, 1));
        assert!(!looks_like_directory_cluster(&lone));
    }

    #[test]
    fn deleted_without_lfn_gets_placeholder() {
        let mut e = short(b"NOTES   TXT", 0x20, 4, 5);
        e[0] = DELETED_MARKER;
        let RawEntry::Short(s) = classify(&e) else {
            panic!("expected short entry");
        };
        let (long, first) = LfnAccumulator::default().finish(&s);
        assert!(long.is_none());
        assert_eq!(s.display_name(first), "_OTES.TXT");
    }
}
