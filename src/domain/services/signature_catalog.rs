//! Signature catalog service
//!
//! Manages the collection of file signatures used for carving.
//! Uses Aho-Corasick for O(n+m+z) multi-pattern matching over a window.

use crate::domain::entities::{FileSignature, FooterRule, SizeField, SizeRule, StructureCheck};
use aho_corasick::AhoCorasick;
use std::collections::BTreeSet;
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signature `{0}` has an empty header")]
    EmptyHeader(String),

    #[error("signature `{kind}`: default size {default_size} exceeds max size {max_size}")]
    InvalidBounds {
        kind: String,
        default_size: u64,
        max_size: u64,
    },

    #[error("pattern matcher: {0}")]
    Matcher(#[from] aho_corasick::BuildError),
}

/// Catalog of file signatures for carving
///
/// Signatures keep their registration order, which makes match order and
/// therefore carving output deterministic.
///
/// # Example
///
/// ```
/// use reclaim::domain::services::SignatureCatalog;
///
/// let catalog = SignatureCatalog::standard();
/// let data = b"....\xFF\xD8\xFF\xE0....";
/// let matches = catalog.find_all_matches_with_offsets(data);
/// assert_eq!(matches.len(), 1);
/// assert_eq!(matches[0].1.kind, "jpeg");
/// ```
#[derive(Debug)]
pub struct SignatureCatalog {
    signatures: Vec<FileSignature>,
    enabled: Vec<bool>,
    /// Aho-Corasick automaton over enabled headers
    pattern_matcher: Option<AhoCorasick>,
    /// Maps pattern index to signature index
    pattern_map: Vec<usize>,
}

impl SignatureCatalog {
    /// Creates an empty catalog
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
            enabled: Vec::new(),
            pattern_matcher: None,
            pattern_map: Vec::new(),
        }
    }

    /// Creates a catalog from signatures, validating each one
    pub fn from_signatures(signatures: Vec<FileSignature>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for signature in signatures {
            catalog.register(signature)?;
        }
        catalog.build_pattern_matcher()?;
        Ok(catalog)
    }

    /// Parses a JSON array of signatures
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let signatures: Vec<FileSignature> = serde_json::from_str(text)?;
        Self::from_signatures(signatures)
    }

    /// Serialises the registered signatures as a JSON array
    pub fn to_json(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(&self.signatures)?)
    }

    /// Creates the built-in catalog
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for signature in standard_signatures() {
            // built-in entries are well formed
            let _ = catalog.register(signature);
        }
        let _ = catalog.build_pattern_matcher();
        catalog
    }

    /// Registers a new file signature
    pub fn register(&mut self, signature: FileSignature) -> Result<(), CatalogError> {
        if signature.header.is_empty() {
            return Err(CatalogError::EmptyHeader(signature.kind));
        }
        if signature.default_size > signature.max_size {
            return Err(CatalogError::InvalidBounds {
                kind: signature.kind,
                default_size: signature.default_size,
                max_size: signature.max_size,
            });
        }

        self.signatures.push(signature);
        self.enabled.push(true);

        // Invalidate the pattern matcher - needs rebuild
        self.pattern_matcher = None;
        Ok(())
    }

    /// Builds the Aho-Corasick automaton from enabled signatures
    pub fn build_pattern_matcher(&mut self) -> Result<(), CatalogError> {
        let mut patterns: Vec<&[u8]> = Vec::new();
        let mut pattern_map = Vec::new();

        for (idx, sig) in self.signatures.iter().enumerate() {
            if self.enabled[idx] {
                patterns.push(&sig.header);
                pattern_map.push(idx);
            }
        }

        self.pattern_matcher = if patterns.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&patterns)?)
        };
        self.pattern_map = pattern_map;
        Ok(())
    }

    /// Enables only the given kinds; an empty list keeps everything
    pub fn restrict_to(&mut self, kinds: &[String]) -> Result<(), CatalogError> {
        if kinds.is_empty() {
            return Ok(());
        }
        for (idx, sig) in self.signatures.iter().enumerate() {
            self.enabled[idx] = kinds.iter().any(|k| k.eq_ignore_ascii_case(&sig.kind));
        }
        self.build_pattern_matcher()
    }

    /// Returns all registered signatures
    pub fn signatures(&self) -> &[FileSignature] {
        &self.signatures
    }

    /// Distinct enabled kinds
    pub fn enabled_kinds(&self) -> BTreeSet<&str> {
        self.signatures
            .iter()
            .zip(&self.enabled)
            .filter(|(_, on)| **on)
            .map(|(sig, _)| sig.kind.as_str())
            .collect()
    }

    /// Longest `header_offset + header` among enabled signatures.
    ///
    /// Windows are extended by this much minus one so a header straddling
    /// a window boundary is still seen.
    pub fn max_header_reach(&self) -> usize {
        self.pattern_map
            .iter()
            .map(|&idx| {
                let sig = &self.signatures[idx];
                sig.header_offset + sig.header.len()
            })
            .max()
            .unwrap_or(0)
    }

    /// Finds all header matches and returns (file start, signature) pairs.
    ///
    /// The file start accounts for `header_offset`; matches that would
    /// start before the buffer are dropped. Results are ordered by start,
    /// then registration order.
    pub fn find_all_matches_with_offsets(&self, data: &[u8]) -> Vec<(usize, &FileSignature)> {
        let Some(matcher) = &self.pattern_matcher else {
            return Vec::new();
        };

        let mut results: Vec<(usize, usize)> = matcher
            .find_overlapping_iter(data)
            .filter_map(|mat| {
                let sig_idx = self.pattern_map[mat.pattern().as_usize()];
                let offset = self.signatures[sig_idx].header_offset;
                mat.start().checked_sub(offset).map(|start| (start, sig_idx))
            })
            .collect();

        results.sort_unstable();
        results.dedup();
        results
            .into_iter()
            .map(|(start, idx)| (start, &self.signatures[idx]))
            .collect()
    }

    /// Returns the number of registered signatures
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

impl Default for SignatureCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// The built-in signature table
fn standard_signatures() -> Vec<FileSignature> {
    let riff_size = SizeRule::single(SizeField::le(4, 4), 8);

    vec![
        // JPEG: SOI + marker prefix, ends at EOI
        FileSignature::new("jpeg", "jpg", &[0xFF, 0xD8, 0xFF], 2 * MIB, 20 * MIB)
            .with_footer(FooterRule::new(&[0xFF, 0xD9]))
            .with_structure(StructureCheck::Jpeg),
        FileSignature::new(
            "png",
            "png",
            &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            5 * MIB,
            50 * MIB,
        )
        .with_footer(FooterRule::new(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]))
        .with_structure(StructureCheck::Png),
        FileSignature::new("gif", "gif", b"GIF89a", MIB, 20 * MIB)
            .with_footer(FooterRule::new(&[0x00, 0x3B]))
            .with_structure(StructureCheck::Gif),
        FileSignature::new("gif", "gif", b"GIF87a", MIB, 20 * MIB)
            .with_footer(FooterRule::new(&[0x00, 0x3B]))
            .with_structure(StructureCheck::Gif),
        FileSignature::new("bmp", "bmp", b"BM", MIB, 50 * MIB)
            .with_size_rule(SizeRule::single(SizeField::le(2, 4), 0))
            .with_structure(StructureCheck::Bmp),
        FileSignature::new("pdf", "pdf", b"%PDF-", 5 * MIB, 50 * MIB)
            .with_footer(FooterRule::new(b"%%EOF").last())
            .with_structure(StructureCheck::Pdf),
        // ZIP (also docx/xlsx/jar): ends with the 22-byte end record
        FileSignature::new("zip", "zip", &[0x50, 0x4B, 0x03, 0x04], 10 * MIB, 100 * MIB)
            .with_footer(FooterRule::new(&[0x50, 0x4B, 0x05, 0x06]).with_trailer(18))
            .with_structure(StructureCheck::Zip),
        FileSignature::new(
            "rar",
            "rar",
            &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00],
            10 * MIB,
            100 * MIB,
        ),
        FileSignature::new(
            "rar",
            "rar",
            &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00],
            10 * MIB,
            100 * MIB,
        ),
        // 7z: next-header offset + size + 32-byte start header
        FileSignature::new("7z", "7z", &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], 10 * MIB, 200 * MIB)
            .with_size_rule(SizeRule {
                fields: vec![SizeField::le(12, 8), SizeField::le(20, 8)],
                adjust: 32,
            }),
        FileSignature::new(
            "ole",
            "doc",
            &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            MIB,
            50 * MIB,
        ),
        FileSignature::new("mp3", "mp3", b"ID3", 5 * MIB, 50 * MIB),
        FileSignature::new("mp4", "mp4", b"ftyp", 10 * MIB, 500 * MIB).with_offset(4),
        FileSignature::new("webp", "webp", b"WEBPVP8", MIB, 50 * MIB)
            .with_offset(8)
            .with_size_rule(riff_size.clone())
            .with_structure(StructureCheck::Riff),
        FileSignature::new("wav", "wav", b"WAVEfmt ", 10 * MIB, 500 * MIB)
            .with_offset(8)
            .with_size_rule(riff_size.clone())
            .with_structure(StructureCheck::Riff),
        FileSignature::new("avi", "avi", b"AVI LIST", 10 * MIB, 500 * MIB)
            .with_offset(8)
            .with_size_rule(riff_size)
            .with_structure(StructureCheck::Riff),
        FileSignature::new("elf", "elf", &[0x7F, 0x45, 0x4C, 0x46], MIB, 100 * MIB),
    ]
}
