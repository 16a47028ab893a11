//! MFT record decoding
//!
//! A record is a "FILE" header followed by a list of attributes. Only the
//! attributes needed to rebuild the tree are decoded: standard
//! information, file name and the unnamed data stream.

use super::data_runs::{decode_data_runs, DataRun, RunListError};
use crate::utils::decode_utf16_le;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use thiserror::Error;

const FILE_SIGNATURE: &[u8; 4] = b"FILE";
const BAAD_SIGNATURE: &[u8; 4] = b"BAAD";

const FLAG_IN_USE: u16 = 0x0001;
const FLAG_DIRECTORY: u16 = 0x0002;

const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
const ATTR_FLAG_SPARSE: u16 = 0x8000;

/// DOS-only 8.3 names; any other namespace is preferred
const NAMESPACE_DOS: u8 = 2;

const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Why a record slot was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordFault {
    #[error("record marked BAAD by chkdsk")]
    Bad,

    #[error("update sequence mismatch in sector {0}, record torn or overwritten")]
    TornFixup(usize),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error(transparent)]
    RunList(#[from] RunListError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub parent_record: u64,
    pub parent_sequence: u16,
    pub name: String,
    pub namespace: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataStream {
    Resident(Bytes),
    NonResident {
        runs: Vec<DataRun>,
        real_size: u64,
        compressed: bool,
        encrypted: bool,
        sparse: bool,
    },
}

impl DataStream {
    pub fn size(&self) -> u64 {
        match self {
            Self::Resident(bytes) => bytes.len() as u64,
            Self::NonResident { real_size, .. } => *real_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftRecord {
    pub number: u64,
    pub sequence: u16,
    pub in_use: bool,
    pub directory: bool,
    /// Non-zero for extension records
    pub base_record: u64,
    pub dos_attributes: Option<u32>,
    pub file_name: Option<FileName>,
    pub data: Option<DataStream>,
}

/// Applies the update sequence array in place.
///
/// The last two bytes of every stride hold the update sequence number and
/// are restored from the array.
pub fn apply_fixups(buf: &mut [u8]) -> Result<(), RecordFault> {
    if buf.len() < 8 {
        return Err(RecordFault::Malformed("record shorter than its fixup header".into()));
    }
    let usa_offset = LittleEndian::read_u16(&buf[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&buf[6..8]) as usize;
    if usa_count < 2 || usa_offset + usa_count * 2 > buf.len() {
        return Err(RecordFault::Malformed(format!(
            "update sequence array {usa_count}@{usa_offset} out of bounds"
        )));
    }

    let strides = usa_count - 1;
    if buf.len() % strides != 0 {
        return Err(RecordFault::Malformed("record size not a multiple of the fixup stride".into()));
    }
    let stride = buf.len() / strides;
    let usn = [buf[usa_offset], buf[usa_offset + 1]];

    for i in 0..strides {
        let tail = (i + 1) * stride - 2;
        if buf[tail..tail + 2] != usn {
            return Err(RecordFault::TornFixup(i));
        }
        let entry = usa_offset + 2 * (i + 1);
        buf[tail] = buf[entry];
        buf[tail + 1] = buf[entry + 1];
    }
    Ok(())
}

impl MftRecord {
    /// Decodes one record slot.
    ///
    /// `Ok(None)` means the slot was never used (no signature).
    pub fn parse(number: u64, buf: &mut [u8]) -> Result<Option<Self>, RecordFault> {
        if buf.len() < 48 {
            return Err(RecordFault::Malformed("record shorter than its header".into()));
        }
        match &buf[..4] {
            sig if sig == BAAD_SIGNATURE => return Err(RecordFault::Bad),
            sig if sig != FILE_SIGNATURE => return Ok(None),
            _ => {}
        }

        apply_fixups(buf)?;

        let sequence = LittleEndian::read_u16(&buf[0x10..]);
        let first_attr = LittleEndian::read_u16(&buf[0x14..]) as usize;
        let flags = LittleEndian::read_u16(&buf[0x16..]);
        let used = (LittleEndian::read_u32(&buf[0x18..]) as usize).min(buf.len());
        let base_record = LittleEndian::read_u64(&buf[0x20..]) & REFERENCE_MASK;

        let mut record = Self {
            number,
            sequence,
            in_use: flags & FLAG_IN_USE != 0,
            directory: flags & FLAG_DIRECTORY != 0,
            base_record,
            dos_attributes: None,
            file_name: None,
            data: None,
        };

        let mut offset = first_attr;
        while offset + 16 <= used {
            let attr_type = LittleEndian::read_u32(&buf[offset..]);
            if attr_type == ATTR_END {
                break;
            }
            let length = LittleEndian::read_u32(&buf[offset + 4..]) as usize;
            if length < 16 || offset + length > used {
                return Err(RecordFault::Malformed(format!(
                    "attribute {attr_type:#x} at {offset} overruns the record"
                )));
            }
            let attr = &buf[offset..offset + length];
            record.read_attribute(attr_type, attr)?;
            offset += length;
        }

        Ok(Some(record))
    }

    fn read_attribute(&mut self, attr_type: u32, attr: &[u8]) -> Result<(), RecordFault> {
        let non_resident = attr[8] != 0;
        let name_length = attr[9];
        let flags = LittleEndian::read_u16(&attr[12..]);

        match attr_type {
            ATTR_STANDARD_INFORMATION if !non_resident => {
                let content = resident_value(attr)?;
                if content.len() >= 36 {
                    self.dos_attributes = Some(LittleEndian::read_u32(&content[32..]));
                }
            }
            ATTR_FILE_NAME if !non_resident => {
                let content = resident_value(attr)?;
                let Some(candidate) = parse_file_name(content) else {
                    return Ok(());
                };
                let replace = match &self.file_name {
                    None => true,
                    Some(current) => {
                        current.namespace == NAMESPACE_DOS && candidate.namespace != NAMESPACE_DOS
                    }
                };
                if replace {
                    self.file_name = Some(candidate);
                }
            }
            ATTR_DATA if name_length == 0 => {
                self.data = Some(if non_resident {
                    if attr.len() < 64 {
                        return Err(RecordFault::Malformed("short non-resident header".into()));
                    }
                    let runs_offset = LittleEndian::read_u16(&attr[32..]) as usize;
                    let runs_bytes = attr.get(runs_offset..).ok_or_else(|| {
                        RecordFault::Malformed("run-list offset past attribute".into())
                    })?;
                    DataStream::NonResident {
                        runs: decode_data_runs(runs_bytes)?,
                        real_size: LittleEndian::read_u64(&attr[48..]),
                        compressed: flags & ATTR_FLAG_COMPRESSED != 0,
                        encrypted: flags & ATTR_FLAG_ENCRYPTED != 0,
                        sparse: flags & ATTR_FLAG_SPARSE != 0,
                    }
                } else {
                    DataStream::Resident(Bytes::copy_from_slice(resident_value(attr)?))
                });
            }
            _ => {}
        }
        Ok(())
    }
}

fn resident_value(attr: &[u8]) -> Result<&[u8], RecordFault> {
    if attr.len() < 24 {
        return Err(RecordFault::Malformed("short resident header".into()));
    }
    let length = LittleEndian::read_u32(&attr[16..]) as usize;
    let offset = LittleEndian::read_u16(&attr[20..]) as usize;
    offset
        .checked_add(length)
        .and_then(|end| attr.get(offset..end))
        .ok_or_else(|| RecordFault::Malformed("resident value past attribute".into()))
}

fn parse_file_name(content: &[u8]) -> Option<FileName> {
    if content.len() < 66 {
        return None;
    }
    let reference = LittleEndian::read_u64(content);
    let chars = content[64] as usize;
    let namespace = content[65];
    let raw = content.get(66..66 + chars * 2)?;
    Some(FileName {
        parent_record: reference & REFERENCE_MASK,
        parent_sequence: (reference >> 48) as u16,
        name: decode_utf16_le(raw),
        namespace,
    })
}
