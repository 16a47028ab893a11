//! Synthetic media for integration tests
//!
//! Small FAT32 and NTFS volumes built byte by byte, plus file payloads
//! that carve the way real ones do.

#![allow(dead_code)]

use reclaim::application::dto::RecoveryConfig;
use reclaim::infrastructure::medium::RetryPolicy;

pub const SECTOR: usize = 512;

/// Smallest valid JPEG: SOI, JFIF APP0, SOS, filler, EOI
pub fn jpeg_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    data.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
    data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    while data.len() < len - 2 {
        data.push(0x5A);
    }
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Lower-case text that matches no signature in the standard catalog
pub fn text_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| b'a' + ((i * 7 + seed as usize) % 26) as u8)
        .collect()
}

/// Settings sized for images of a few hundred KiB
pub fn test_config() -> RecoveryConfig {
    RecoveryConfig::default()
        .with_cache_block_size(4096)
        .with_carve_chunk_size(8192)
        .with_retry(RetryPolicy::immediate(0))
        .with_worker_threads(2)
        .with_signature_kinds(["jpeg"])
}

/// Image with JPEGs of `len` bytes at each offset and zeros elsewhere
pub fn image_with_jpegs(size: usize, offsets: &[usize], len: usize) -> Vec<u8> {
    let mut image = vec![0u8; size];
    for &offset in offsets {
        image[offset..offset + len].copy_from_slice(&jpeg_bytes(len));
    }
    image
}

// FAT32: 512-byte sectors and clusters, 32 reserved sectors, two FATs of
// 32 sectors, 4096 sectors in all. Cluster 2 is the root directory.
const FAT_RESERVED: usize = 32;
const FAT_SECTORS: usize = 32;
const FAT_TOTAL_SECTORS: usize = 4096;
const FAT_EOC: u32 = 0x0FFF_FFFF;
pub const FAT_ROOT: u32 = 2;

pub struct Fat32Image {
    data: Vec<u8>,
}

impl Fat32Image {
    pub fn new() -> Self {
        let mut data = vec![0u8; FAT_TOTAL_SECTORS * SECTOR];
        let boot = &mut data[..SECTOR];
        boot[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        boot[3..11].copy_from_slice(b"MSWIN4.1");
        boot[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        boot[13] = 1;
        boot[14..16].copy_from_slice(&(FAT_RESERVED as u16).to_le_bytes());
        boot[16] = 2;
        boot[32..36].copy_from_slice(&(FAT_TOTAL_SECTORS as u32).to_le_bytes());
        boot[36..40].copy_from_slice(&(FAT_SECTORS as u32).to_le_bytes());
        boot[44..48].copy_from_slice(&FAT_ROOT.to_le_bytes());
        boot[0x47..0x52].copy_from_slice(b"TESTVOL    ");
        boot[0x52..0x5A].copy_from_slice(b"FAT32   ");
        boot[510] = 0x55;
        boot[511] = 0xAA;

        let mut image = Self { data };
        image.set_fat(0, 0x0FFF_FFF8);
        image.set_fat(1, FAT_EOC);
        image.set_fat(FAT_ROOT, FAT_EOC);
        image
    }

    pub fn cluster_offset(cluster: u32) -> usize {
        (FAT_RESERVED + 2 * FAT_SECTORS) * SECTOR + (cluster as usize - 2) * SECTOR
    }

    /// Writes `value` into both FAT copies
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..2 {
            let at = (FAT_RESERVED + copy * FAT_SECTORS) * SECTOR + cluster as usize * 4;
            self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn link(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, FAT_EOC);
        }
    }

    pub fn write_clusters(&mut self, clusters: &[u32], content: &[u8]) {
        for (cluster, chunk) in clusters.iter().zip(content.chunks(SECTOR)) {
            let at = Self::cluster_offset(*cluster);
            self.data[at..at + chunk.len()].copy_from_slice(chunk);
        }
    }

    pub fn put_entry(&mut self, dir_cluster: u32, slot: usize, entry: [u8; 32]) {
        let at = Self::cluster_offset(dir_cluster) + slot * 32;
        self.data[at..at + 32].copy_from_slice(&entry);
    }

    /// Allocated file with its chain and content
    pub fn add_file(&mut self, dir_cluster: u32, slot: usize, name: &[u8; 11], clusters: &[u32], content: &[u8]) {
        self.link(clusters);
        self.write_clusters(clusters, content);
        self.put_entry(
            dir_cluster,
            slot,
            short_entry(name, 0x20, clusters[0], content.len() as u32),
        );
    }

    /// Allocated single-cluster directory with "." and ".." entries
    pub fn add_dir(&mut self, parent: u32, slot: usize, name: &[u8; 11], cluster: u32) {
        self.link(&[cluster]);
        self.put_entry(parent, slot, short_entry(name, 0x10, cluster, 0));
        self.put_entry(cluster, 0, short_entry(b".          ", 0x10, cluster, 0));
        self.put_entry(cluster, 1, short_entry(b"..         ", 0x10, 0, 0));
    }

    /// Marks an entry deleted and frees its clusters in the FAT
    pub fn delete(&mut self, dir_cluster: u32, slot: usize, clusters: &[u32]) {
        let at = Self::cluster_offset(dir_cluster) + slot * 32;
        self.data[at] = 0xE5;
        for &cluster in clusters {
            self.set_fat(cluster, 0);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

pub fn short_entry(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(name);
    e[11] = attr;
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

// NTFS: 512-byte sectors, 4 KiB clusters, 1 KiB records, 256 clusters.
// The MFT occupies clusters 4..12 (32 records).
pub const NTFS_CLUSTER: usize = 4096;
const NTFS_TOTAL_SECTORS: u64 = 2048;
const NTFS_MFT_LCN: usize = 4;
const NTFS_MFT_CLUSTERS: usize = 8;
const RECORD_SIZE: usize = 1024;
pub const NTFS_ROOT: u64 = 5;

pub struct NtfsImage {
    data: Vec<u8>,
}

impl NtfsImage {
    pub fn new() -> Self {
        let mut data = vec![0u8; NTFS_TOTAL_SECTORS as usize * SECTOR];
        let boot = &mut data[..SECTOR];
        boot[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        boot[3..11].copy_from_slice(b"NTFS    ");
        boot[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        boot[13] = (NTFS_CLUSTER / SECTOR) as u8;
        boot[40..48].copy_from_slice(&NTFS_TOTAL_SECTORS.to_le_bytes());
        boot[48..56].copy_from_slice(&(NTFS_MFT_LCN as u64).to_le_bytes());
        boot[56..64].copy_from_slice(&2u64.to_le_bytes());
        boot[64] = 0xF6;
        boot[72..80].copy_from_slice(&0x1234_5678_9ABC_DEF0u64.to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;

        let mut image = Self { data };
        let mft_runs = [0x11, NTFS_MFT_CLUSTERS as u8, NTFS_MFT_LCN as u8, 0x00];
        image.put_record(
            0,
            RecordBuilder::new(true, false)
                .file_name(NTFS_ROOT, "$MFT", 3)
                .runs(&mft_runs, (NTFS_MFT_CLUSTERS * NTFS_CLUSTER) as u64)
                .build(),
        );
        image
    }

    pub fn put_record(&mut self, number: usize, record: Vec<u8>) {
        let at = NTFS_MFT_LCN * NTFS_CLUSTER + number * RECORD_SIZE;
        self.data[at..at + RECORD_SIZE].copy_from_slice(&record);
    }

    pub fn write_cluster(&mut self, lcn: usize, content: &[u8]) {
        let at = lcn * NTFS_CLUSTER;
        self.data[at..at + content.len()].copy_from_slice(content);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// One-byte-length, one-byte-offset run list for a single run
pub fn single_run(lcn: u8, clusters: u8) -> Vec<u8> {
    assert!(lcn < 0x80, "offset byte would read as negative");
    vec![0x11, clusters, lcn, 0x00]
}

/// 1 KiB MFT record with update sequence fixups for 512-byte sectors
pub struct RecordBuilder {
    attrs: Vec<Vec<u8>>,
    flags: u16,
}

impl RecordBuilder {
    pub fn new(in_use: bool, directory: bool) -> Self {
        let mut flags = 0;
        if in_use {
            flags |= 0x0001;
        }
        if directory {
            flags |= 0x0002;
        }
        Self {
            attrs: Vec::new(),
            flags,
        }
    }

    fn resident(attr_type: u32, value: &[u8]) -> Vec<u8> {
        let length = (24 + value.len()).div_ceil(8) * 8;
        let mut a = vec![0u8; length];
        a[0..4].copy_from_slice(&attr_type.to_le_bytes());
        a[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        a[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
        a[20..22].copy_from_slice(&24u16.to_le_bytes());
        a[24..24 + value.len()].copy_from_slice(value);
        a
    }

    pub fn file_name(mut self, parent: u64, name: &str, namespace: u8) -> Self {
        let units: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut v = vec![0u8; 66];
        v[0..8].copy_from_slice(&(parent | 1 << 48).to_le_bytes());
        v[64] = (units.len() / 2) as u8;
        v[65] = namespace;
        v.extend_from_slice(&units);
        self.attrs.push(Self::resident(0x30, &v));
        self
    }

    pub fn resident_data(mut self, data: &[u8]) -> Self {
        self.attrs.push(Self::resident(0x80, data));
        self
    }

    pub fn runs(mut self, runs: &[u8], real_size: u64) -> Self {
        let length = (64 + runs.len()).div_ceil(8) * 8;
        let mut a = vec![0u8; length];
        a[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        a[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        a[8] = 1;
        a[32..34].copy_from_slice(&64u16.to_le_bytes());
        a[48..56].copy_from_slice(&real_size.to_le_bytes());
        a[64..64 + runs.len()].copy_from_slice(runs);
        self.attrs.push(a);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut r = vec![0u8; RECORD_SIZE];
        r[0..4].copy_from_slice(b"FILE");
        r[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        r[6..8].copy_from_slice(&3u16.to_le_bytes());
        r[0x10..0x12].copy_from_slice(&1u16.to_le_bytes());
        r[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
        r[0x16..0x18].copy_from_slice(&self.flags.to_le_bytes());

        let mut offset = 0x38;
        for attr in &self.attrs {
            r[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        r[offset..offset + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        r[0x18..0x1C].copy_from_slice(&((offset + 8) as u32).to_le_bytes());

        r[0x30..0x32].copy_from_slice(&7u16.to_le_bytes());
        for i in 0..2 {
            let tail = (i + 1) * SECTOR - 2;
            let saved = [r[tail], r[tail + 1]];
            r[0x32 + 2 * i..0x34 + 2 * i].copy_from_slice(&saved);
            r[tail..tail + 2].copy_from_slice(&7u16.to_le_bytes());
        }
        r
    }
}
