use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dat::{Dat, Rom};
use crate::kv::{Batch, KvStore, SqliteStore};

// Key prefixes, one logical table per digest family. The crc family keys on
// crc plus size because a CRC32 alone is too weak to identify a blob.
const SHA1_PREFIX: &[u8] = b"sha1:";
const MD5_PREFIX: &[u8] = b"md5:";
const CRC_PREFIX: &[u8] = b"crc:";

const SHA1_LEN: usize = 20;
const MD5_LEN: usize = 16;
const CRC_LEN: usize = 4;

/// Canonical description of one blob: its size and every digest known for
/// it. Stored under each digest key as one JSON line; a key may accumulate
/// several records (digest collisions), newline-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomRecord {
    pub size: u64,
    pub crc32: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

impl RomRecord {
    pub fn from_rom(rom: &Rom) -> Self {
        RomRecord {
            size: rom.size,
            crc32: rom.crc32.clone(),
            md5: rom.md5.clone(),
            sha1: rom.sha1.clone(),
        }
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("encoding rom record")
    }

    fn decode_all(bytes: &[u8]) -> anyhow::Result<Vec<RomRecord>> {
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).context("decoding rom record"))
            .collect()
    }

    // A record is usable for a rom when no field both sides know disagrees.
    fn matches(&self, rom: &Rom) -> bool {
        fn compatible(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.size == rom.size
            && compatible(&self.crc32, &rom.crc32)
            && compatible(&self.md5, &rom.md5)
            && compatible(&self.sha1, &rom.sha1)
    }

    fn fill(&self, rom: &mut Rom) {
        if rom.crc32.is_none() {
            rom.crc32 = self.crc32.clone();
        }
        if rom.md5.is_none() {
            rom.md5 = self.md5.clone();
        }
        if rom.sha1.is_none() {
            rom.sha1 = self.sha1.clone();
        }
    }
}

/// Append-merge for the digest tables: concatenate the new record line unless
/// an identical line is already present. Pure and store-independent; both KV
/// backends are constructed with it.
pub fn merge_records(
    _key: &[u8],
    value: &[u8],
    old: Option<&[u8]>,
) -> anyhow::Result<Option<Vec<u8>>> {
    match old {
        None => Ok(Some(value.to_vec())),
        Some(old) if old.split(|b| *b == b'\n').any(|line| line == value) => Ok(None),
        Some(old) => {
            let mut merged = old.to_vec();
            merged.push(b'\n');
            merged.extend_from_slice(value);
            Ok(Some(merged))
        }
    }
}

fn digest_key(prefix: &[u8], hex: &str, expected_len: usize) -> anyhow::Result<Vec<u8>> {
    let raw = hex::decode(hex).with_context(|| format!("invalid digest hex {hex:?}"))?;
    if raw.len() != expected_len {
        anyhow::bail!("digest {hex:?} has {} bytes, expected {expected_len}", raw.len());
    }
    let mut key = prefix.to_vec();
    key.extend_from_slice(&raw);
    Ok(key)
}

fn sha1_key(sha1: &str) -> anyhow::Result<Vec<u8>> {
    digest_key(SHA1_PREFIX, sha1, SHA1_LEN)
}

fn md5_key(md5: &str) -> anyhow::Result<Vec<u8>> {
    digest_key(MD5_PREFIX, md5, MD5_LEN)
}

fn crc_key(crc32: &str, size: u64) -> anyhow::Result<Vec<u8>> {
    let mut key = digest_key(CRC_PREFIX, crc32, CRC_LEN)?;
    key.extend_from_slice(&size.to_be_bytes());
    Ok(key)
}

/// Semantic layer over the KV store: completes partial ROM records by
/// looking them up under the strongest digest they carry.
pub struct RomDb {
    store: Box<dyn KvStore>,
}

impl RomDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let store = SqliteStore::open(path, merge_records)?;
        Ok(RomDb {
            store: Box::new(store),
        })
    }

    pub fn with_store(store: Box<dyn KvStore>) -> Self {
        RomDb { store }
    }

    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    fn lookup(&self, key: &[u8]) -> anyhow::Result<Vec<RomRecord>> {
        match self.store.get(key)? {
            Some(bytes) => RomRecord::decode_all(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Fill the missing fields of `rom` from the canonical record found under
    /// its strongest digest (SHA-1 > MD5 > CRC+size). Finding nothing is not
    /// an error; the rom is left partial and callers recognize "not in depot"
    /// as `sha1 == None && size > 0`.
    pub fn complete_rom(&self, rom: &mut Rom) -> anyhow::Result<()> {
        // The empty blob needs no lookup.
        if rom.size == 0 {
            return Ok(());
        }
        if rom.sha1.is_some() && rom.md5.is_some() && rom.crc32.is_some() {
            return Ok(());
        }

        let records = if let Some(sha1) = &rom.sha1 {
            self.lookup(&sha1_key(sha1)?)?
        } else if let Some(md5) = &rom.md5 {
            self.lookup(&md5_key(md5)?)?
        } else if let Some(crc32) = &rom.crc32 {
            self.lookup(&crc_key(crc32, rom.size)?)?
        } else {
            Vec::new()
        };

        for record in records {
            if record.matches(rom) {
                record.fill(rom);
                break;
            }
        }
        Ok(())
    }

    /// Queue index writes for one rom under every digest it carries.
    pub fn index_rom(&self, batch: &mut Batch, rom: &Rom) -> anyhow::Result<()> {
        if rom.size == 0 {
            return Ok(());
        }
        let line = RomRecord::from_rom(rom).encode()?;
        if let Some(sha1) = &rom.sha1 {
            batch.append(self.store.as_ref(), &sha1_key(sha1)?, &line)?;
        }
        if let Some(md5) = &rom.md5 {
            batch.append(self.store.as_ref(), &md5_key(md5)?, &line)?;
        }
        if let Some(crc32) = &rom.crc32 {
            batch.append(self.store.as_ref(), &crc_key(crc32, rom.size)?, &line)?;
        }
        Ok(())
    }

    /// Index every rom of a DAT in one batch commit. Returns the number of
    /// roms indexed.
    pub fn index_dat(&self, dat: &Dat) -> anyhow::Result<usize> {
        let mut batch = self.store.start_batch();
        let mut indexed = 0;
        for game in &dat.games {
            for rom in &game.roms {
                if rom.size > 0 {
                    self.index_rom(&mut batch, rom)?;
                    indexed += 1;
                }
            }
        }
        self.store.write_batch(batch)?;
        Ok(indexed)
    }

    /// Bulk rebuild entry point: suspends backend maintenance around the
    /// per-DAT batches.
    pub fn index_dats(&self, dats: &[Dat]) -> anyhow::Result<usize> {
        self.store.begin_refresh()?;
        let mut total = 0;
        for dat in dats {
            total += self.index_dat(dat)?;
        }
        self.store.end_refresh()?;
        Ok(total)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn test_db() -> RomDb {
        RomDb::with_store(Box::new(MemoryStore::new(merge_records)))
    }

    fn full_rom(name: &str) -> Rom {
        Rom {
            name: name.to_string(),
            size: 4,
            crc32: Some("d87f7e0c".to_string()),
            md5: Some("098f6bcd4621d373cade4e832627b4f6".to_string()),
            sha1: Some("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3".to_string()),
        }
    }

    fn index_one(db: &RomDb, rom: &Rom) {
        let mut batch = db.store().start_batch();
        db.index_rom(&mut batch, rom).unwrap();
        db.store().write_batch(batch).unwrap();
    }

    #[test]
    fn completes_by_sha1() {
        let db = test_db();
        index_one(&db, &full_rom("test.bin"));

        let mut partial = Rom {
            name: "other-name.bin".to_string(),
            size: 4,
            sha1: Some("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut partial).unwrap();

        assert_eq!(partial.crc32.as_deref(), Some("d87f7e0c"));
        assert_eq!(
            partial.md5.as_deref(),
            Some("098f6bcd4621d373cade4e832627b4f6")
        );
    }

    #[test]
    fn completes_by_md5() {
        let db = test_db();
        index_one(&db, &full_rom("test.bin"));

        let mut partial = Rom {
            name: "test.bin".to_string(),
            size: 4,
            md5: Some("098f6bcd4621d373cade4e832627b4f6".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut partial).unwrap();
        assert_eq!(
            partial.sha1.as_deref(),
            Some("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3")
        );
    }

    #[test]
    fn completes_by_crc_and_size() {
        let db = test_db();
        index_one(&db, &full_rom("test.bin"));

        let mut partial = Rom {
            name: "test.bin".to_string(),
            size: 4,
            crc32: Some("d87f7e0c".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut partial).unwrap();
        assert_eq!(
            partial.sha1.as_deref(),
            Some("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3")
        );

        // Same crc, wrong size: keyed apart, stays partial.
        let mut wrong_size = Rom {
            name: "test.bin".to_string(),
            size: 5,
            crc32: Some("d87f7e0c".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut wrong_size).unwrap();
        assert!(wrong_size.sha1.is_none());
    }

    #[test]
    fn unknown_rom_stays_partial() {
        let db = test_db();
        let mut rom = Rom {
            name: "nowhere.bin".to_string(),
            size: 9,
            crc32: Some("00000001".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut rom).unwrap();
        assert!(rom.sha1.is_none());
        assert!(rom.md5.is_none());
    }

    #[test]
    fn empty_rom_needs_no_lookup() {
        let db = test_db();
        let mut rom = Rom {
            name: "empty.bin".to_string(),
            ..Rom::default()
        };
        db.complete_rom(&mut rom).unwrap();
        assert_eq!(rom.size, 0);
        assert!(rom.sha1.is_none());
    }

    #[test]
    fn conflicting_record_is_skipped() {
        let db = test_db();
        index_one(&db, &full_rom("test.bin"));

        // Knows a different md5 under the same sha1 key: record conflicts,
        // nothing is filled in.
        let mut conflicting = Rom {
            name: "test.bin".to_string(),
            size: 4,
            md5: Some("ffffffffffffffffffffffffffffffff".to_string()),
            sha1: Some("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3".to_string()),
            ..Rom::default()
        };
        db.complete_rom(&mut conflicting).unwrap();
        assert!(conflicting.crc32.is_none());
    }

    #[test]
    fn reindexing_suppresses_duplicates() {
        let db = test_db();
        let rom = full_rom("test.bin");
        index_one(&db, &rom);
        index_one(&db, &rom);

        let key = sha1_key(rom.sha1.as_deref().unwrap()).unwrap();
        let stored = db.store().get(&key).unwrap().unwrap();
        assert_eq!(RomRecord::decode_all(&stored).unwrap().len(), 1);
    }

    #[test]
    fn index_dat_counts_nonempty_roms() {
        let db = test_db();
        let dat = Dat {
            name: "set".to_string(),
            games: vec![crate::dat::Game {
                name: "g".to_string(),
                description: None,
                roms: vec![full_rom("a.bin"), Rom::default()],
            }],
            ..Dat::default()
        };
        assert_eq!(db.index_dats(std::slice::from_ref(&dat)).unwrap(), 1);
    }

    #[test]
    fn bad_digest_hex_is_an_error() {
        let db = test_db();
        let mut rom = Rom {
            name: "bad.bin".to_string(),
            size: 4,
            sha1: Some("not-hex".to_string()),
            ..Rom::default()
        };
        assert!(db.complete_rom(&mut rom).is_err());
    }
}
