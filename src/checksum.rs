use std::io::Read;

use crc32fast::Hasher as Crc32;
use md5::{Digest as Md5Digest, Md5};
use sha1_smol::Sha1;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// CRC32, MD5 and SHA-1 of one blob, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomDigests {
    pub size: u64,
    pub crc32: String,
    pub md5: String,
    pub sha1: String,
}

/// Stream a reader through all three hashers at once.
pub fn hash_reader<R: Read>(mut reader: R) -> anyhow::Result<RomDigests> {
    let mut crc32h = Crc32::new();
    let mut md5h = Md5::new();
    let mut sha1h = Sha1::new();

    let mut size = 0u64;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let slice = &buf[..n];
        crc32h.update(slice);
        md5h.update(slice);
        sha1h.update(slice);
        size = size.saturating_add(n as u64);
    }

    Ok(RomDigests {
        size,
        crc32: format!("{:08x}", crc32h.finalize()),
        md5: format!("{:032x}", md5h.finalize()),
        sha1: sha1h.digest().to_string(),
    })
}

pub fn hash_bytes(data: &[u8]) -> anyhow::Result<RomDigests> {
    hash_reader(std::io::Cursor::new(data))
}
