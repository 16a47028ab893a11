//! Run-list decoding for non-resident attributes

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// One run of a non-resident attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    /// Logical cluster number; `None` for a sparse run
    pub lcn: Option<u64>,
    /// Length in clusters
    pub length: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunListError {
    #[error("run at byte {0} extends beyond the attribute")]
    Truncated(usize),

    #[error("run at byte {pos} resolves to negative cluster {lcn}")]
    NegativeLcn { pos: usize, lcn: i64 },

    #[error("run at byte {0} has an oversized field")]
    OversizedField(usize),
}

/// Decodes a run-list up to its terminating zero byte.
///
/// Each run starts with a header byte: low nibble is the size of the
/// length field, high nibble the size of the signed offset field, which is
/// relative to the previous run's cluster. An offset size of zero marks a
/// sparse run.
pub fn decode_data_runs(data: &[u8]) -> Result<Vec<DataRun>, RunListError> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut prev_lcn = 0i64;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let start = pos;
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        pos += 1;

        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(RunListError::OversizedField(start));
        }
        if pos + length_size + offset_size > data.len() {
            return Err(RunListError::Truncated(start));
        }

        let length = LittleEndian::read_uint(&data[pos..], length_size);
        pos += length_size;

        if offset_size == 0 {
            runs.push(DataRun { lcn: None, length });
            continue;
        }

        let delta = LittleEndian::read_int(&data[pos..], offset_size);
        pos += offset_size;

        let lcn = prev_lcn.wrapping_add(delta);
        if lcn < 0 {
            return Err(RunListError::NegativeLcn { pos: start, lcn });
        }
        prev_lcn = lcn;
        runs.push(DataRun {
            lcn: Some(lcn as u64),
            length,
        });
    }

    Ok(runs)
}

/// Encodes runs back into a run-list, terminator included
#[cfg(test)]
pub(crate) fn encode_data_runs(runs: &[DataRun]) -> Vec<u8> {
    fn minimal_signed(v: i64) -> Vec<u8> {
        let bytes = v.to_le_bytes();
        for n in 1..=8 {
            let value = LittleEndian::read_int(&bytes, n);
            if value == v {
                return bytes[..n].to_vec();
            }
        }
        bytes.to_vec()
    }

    let mut out = Vec::new();
    let mut prev = 0i64;
    for run in runs {
        let length = run.length.to_le_bytes();
        let length_size = (8 - run.length.leading_zeros() as usize / 8).max(1);
        let offset = match run.lcn {
            Some(lcn) => {
                let delta = minimal_signed(lcn as i64 - prev);
                prev = lcn as i64;
                delta
            }
            None => Vec::new(),
        };
        out.push(((offset.len() as u8) << 4) | length_size as u8);
        out.extend_from_slice(&length[..length_size]);
        out.extend_from_slice(&offset);
    }
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_run() {
        // 16 clusters at LCN 100
        let runs = decode_data_runs(&[0x21, 0x10, 0x64, 0x00, 0x00]).unwrap();
        assert_eq!(
            runs,
            vec![DataRun {
                lcn: Some(100),
                length: 16
            }]
        );
    }

    #[test]
    fn negative_delta_and_sparse_run() {
        // 10 at 100, 5 sparse, 20 at 100 - 50
        let data = [0x21, 0x0A, 0x64, 0x00, 0x01, 0x05, 0x11, 0x14, 0xCE, 0x00];
        let runs = decode_data_runs(&data).unwrap();
        assert_eq!(runs[0].lcn, Some(100));
        assert_eq!(runs[1], DataRun { lcn: None, length: 5 });
        assert_eq!(runs[2].lcn, Some(50));
    }

    #[test]
    fn wide_fields_sign_extend() {
        // 16 at 256, 8 at 256 - 256, 2^56 at 0 + 5
        let data = [
            0x21, 0x10, 0x00, 0x01, 0x31, 0x08, 0x00, 0xFF, 0xFF, 0x18, 0, 0, 0, 0, 0, 0, 0, 1,
            0x05, 0x00,
        ];
        let runs = decode_data_runs(&data).unwrap();
        assert_eq!(runs[0], DataRun { lcn: Some(256), length: 16 });
        assert_eq!(runs[1], DataRun { lcn: Some(0), length: 8 });
        assert_eq!(runs[2], DataRun { lcn: Some(5), length: 1 << 56 });
    }

    #[test]
    fn truncated_run_is_an_error() {
        assert_eq!(
            decode_data_runs(&[0x21, 0x10, 0x64]),
            Err(RunListError::Truncated(0))
        );
    }

    #[test]
    fn negative_cluster_is_an_error() {
        assert!(matches!(
            decode_data_runs(&[0x11, 0x01, 0xF0, 0x00]),
            Err(RunListError::NegativeLcn { .. })
        ));
    }

    proptest! {
        #[test]
        fn encoded_runs_decode_back(
            raw in proptest::collection::vec((1u64..1 << 20, proptest::option::of(0u64..1 << 30)), 1..12)
        ) {
            let runs: Vec<DataRun> = raw.iter().map(|&(length, lcn)| DataRun { lcn, length }).collect();
            prop_assert_eq!(decode_data_runs(&encode_data_runs(&runs)).unwrap(), runs);
        }

        #[test]
        fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_data_runs(&data);
        }
    }
}
