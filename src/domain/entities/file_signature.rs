//! File signature entity
//!
//! Describes how one file format is recognised and sized by the carver:
//! the magic bytes at the start, an optional footer, an optional length
//! field inside the header, and a named structural check. Signatures are
//! plain data so a catalog can be loaded from JSON.

use serde::{Deserialize, Serialize};

/// Byte order of an embedded length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    Little,
    Big,
}

/// One integer field inside a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeField {
    /// Offset from the start of the file
    pub offset: usize,
    /// Width in bytes: 2, 4 or 8
    pub width: u8,
    pub endian: Endian,
}

impl SizeField {
    pub fn le(offset: usize, width: u8) -> Self {
        Self {
            offset,
            width,
            endian: Endian::Little,
        }
    }

    /// Reads the field, or `None` if the data is too short
    pub fn read(&self, data: &[u8]) -> Option<u64> {
        let width = self.width as usize;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return None;
        }
        let raw = data.get(self.offset..self.offset + width)?;
        let mut value = 0u64;
        match self.endian {
            Endian::Little => {
                for &b in raw.iter().rev() {
                    value = (value << 8) | b as u64;
                }
            }
            Endian::Big => {
                for &b in raw {
                    value = (value << 8) | b as u64;
                }
            }
        }
        Some(value)
    }
}

/// Total size computed from header fields: `sum(fields) + adjust`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRule {
    pub fields: Vec<SizeField>,
    #[serde(default)]
    pub adjust: i64,
}

impl SizeRule {
    pub fn single(field: SizeField, adjust: i64) -> Self {
        Self {
            fields: vec![field],
            adjust,
        }
    }

    /// Evaluates the rule against the first bytes of a candidate
    pub fn evaluate(&self, header: &[u8]) -> Option<u64> {
        let mut total: i128 = self.adjust as i128;
        for field in &self.fields {
            total += field.read(header)? as i128;
        }
        (total > 0 && total <= u64::MAX as i128).then_some(total as u64)
    }

    /// Bytes of header needed to evaluate the rule
    pub fn span(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.width as usize)
            .max()
            .unwrap_or(0)
    }
}

/// Which footer occurrence ends the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FooterSearch {
    /// First occurrence after the header
    #[default]
    First,
    /// Last occurrence within the size bound (incrementally updated formats)
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterRule {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    /// Bytes that follow the footer and still belong to the file
    #[serde(default)]
    pub trailer: u64,
    #[serde(default)]
    pub search: FooterSearch,
}

impl FooterRule {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            trailer: 0,
            search: FooterSearch::First,
        }
    }

    pub fn with_trailer(mut self, trailer: u64) -> Self {
        self.trailer = trailer;
        self
    }

    pub fn last(mut self) -> Self {
        self.search = FooterSearch::Last;
        self
    }
}

/// Lightweight per-format validation run on a sized candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureCheck {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Zip,
    Riff,
    Pdf,
}

/// A file signature: magic bytes plus sizing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    /// Short kind name, e.g. `jpeg`
    pub kind: String,
    /// Extension used when exporting
    pub extension: String,
    /// The header bytes
    #[serde(with = "hex_bytes")]
    pub header: Vec<u8>,
    /// Where the header sits relative to the file start (usually 0)
    #[serde(default)]
    pub header_offset: usize,
    #[serde(default)]
    pub footer: Option<FooterRule>,
    #[serde(default)]
    pub size_rule: Option<SizeRule>,
    /// Length assumed when neither a size field nor a footer applies
    pub default_size: u64,
    /// Upper bound on a carved file of this kind
    pub max_size: u64,
    #[serde(default)]
    pub structure: Option<StructureCheck>,
}

impl FileSignature {
    /// Creates a signature with only a header and size bounds
    pub fn new(kind: &str, extension: &str, header: &[u8], default_size: u64, max_size: u64) -> Self {
        Self {
            kind: kind.to_string(),
            extension: extension.to_string(),
            header: header.to_vec(),
            header_offset: 0,
            footer: None,
            size_rule: None,
            default_size: default_size.min(max_size),
            max_size,
            structure: None,
        }
    }

    /// Sets the header offset
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.header_offset = offset;
        self
    }

    /// Sets the footer rule
    pub fn with_footer(mut self, footer: FooterRule) -> Self {
        self.footer = Some(footer);
        self
    }

    /// Sets the embedded size rule
    pub fn with_size_rule(mut self, rule: SizeRule) -> Self {
        self.size_rule = Some(rule);
        self
    }

    /// Sets the structural check
    pub fn with_structure(mut self, check: StructureCheck) -> Self {
        self.structure = Some(check);
        self
    }

    /// Checks if the given data starts with this signature's header
    pub fn matches_header(&self, data: &[u8]) -> bool {
        let start = self.header_offset;
        let end = start + self.header.len();
        data.get(start..end) == Some(self.header.as_slice())
    }

    /// Header specificity in [0, 1]; twelve or more bytes is fully specific
    pub fn specificity(&self) -> f32 {
        (self.header.len().min(12) as f32) / 12.0
    }
}

/// Serde adapter storing byte strings as lowercase hex
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_field_reads_both_orders() {
        let data = [0x00, 0x01, 0x02, 0x03];
        assert_eq!(SizeField::le(0, 4).read(&data), Some(0x0302_0100));
        let be = SizeField {
            offset: 2,
            width: 2,
            endian: Endian::Big,
        };
        assert_eq!(be.read(&data), Some(0x0203));
        assert_eq!(SizeField::le(2, 4).read(&data), None);
    }

    #[test]
    fn size_rule_sums_and_adjusts() {
        let rule = SizeRule {
            fields: vec![SizeField::le(0, 2), SizeField::le(2, 2)],
            adjust: 8,
        };
        assert_eq!(rule.evaluate(&[10, 0, 20, 0]), Some(38));
        assert_eq!(rule.span(), 4);

        let negative = SizeRule::single(SizeField::le(0, 1), -10);
        assert_eq!(negative.evaluate(&[5]), None);
    }

    #[test]
    fn header_offset_is_honoured() {
        let sig = FileSignature::new("mp4", "mp4", b"ftyp", 1024, 4096).with_offset(4);
        assert!(sig.matches_header(b"\0\0\0\x18ftypisom"));
        assert!(!sig.matches_header(b"ftyp"));
    }

    #[test]
    fn json_uses_hex() {
        let sig = FileSignature::new("gif", "gif", b"GIF8", 1024, 4096)
            .with_footer(FooterRule::new(&[0x00, 0x3B]));
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains("\"47494638\""));
        let back: FileSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }
}
