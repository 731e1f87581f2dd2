use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::dat::Rom;
use crate::romdb::RomDb;

/// Content-addressed store of gzipped ROM blobs plus the ROM database that
/// indexes them. The depot owns its blob files; readers get a scoped handle.
pub struct Depot {
    roots: Vec<PathBuf>,
    db: RomDb,
}

impl Depot {
    pub fn new(roots: Vec<PathBuf>, db: RomDb) -> Self {
        Depot { roots, db }
    }

    pub fn db(&self) -> &RomDb {
        &self.db
    }

    /// Deterministic blob location under one root: two levels of fan-out
    /// from the leading hex, then `<sha1>.gz`.
    pub fn blob_path(root: &Path, sha1: &str) -> PathBuf {
        root.join(&sha1[..2])
            .join(&sha1[2..4])
            .join(format!("{sha1}.gz"))
    }

    /// Open the raw gzip blob for a rom, trying each root in order. The
    /// caller wraps the handle in a gzip decoder. `None` means no root has
    /// the blob.
    pub fn open_rom_gz(&self, rom: &Rom) -> anyhow::Result<Option<File>> {
        let Some(sha1) = rom.sha1.as_deref() else {
            return Ok(None);
        };
        if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
            anyhow::bail!("malformed sha1 digest {sha1:?} for rom {}", rom.name);
        }

        for root in &self.roots {
            let path = Self::blob_path(root, sha1);
            match File::open(&path) {
                Ok(file) => return Ok(Some(file)),
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("opening depot blob {}", path.to_string_lossy())
                    });
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::romdb::merge_records;
    use std::io::Write;
    use tempfile::tempdir;

    const SHA1: &str = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";

    fn test_depot(roots: Vec<PathBuf>) -> Depot {
        Depot::new(
            roots,
            RomDb::with_store(Box::new(MemoryStore::new(merge_records))),
        )
    }

    fn place_blob(root: &Path, sha1: &str, bytes: &[u8]) {
        let path = Depot::blob_path(root, sha1);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn rom_with_sha1(sha1: &str) -> Rom {
        Rom {
            name: "test.bin".to_string(),
            size: 4,
            sha1: Some(sha1.to_string()),
            ..Rom::default()
        }
    }

    #[test]
    fn blob_path_fans_out() {
        let path = Depot::blob_path(Path::new("/depot"), SHA1);
        assert_eq!(
            path,
            Path::new("/depot/a9/4a").join(format!("{SHA1}.gz"))
        );
    }

    #[test]
    fn opens_blob_from_later_root() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        place_blob(second.path(), SHA1, b"raw gz bytes");

        let depot = test_depot(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        assert!(depot.open_rom_gz(&rom_with_sha1(SHA1)).unwrap().is_some());
    }

    #[test]
    fn missing_blob_is_none() {
        let root = tempdir().unwrap();
        let depot = test_depot(vec![root.path().to_path_buf()]);
        assert!(depot.open_rom_gz(&rom_with_sha1(SHA1)).unwrap().is_none());
    }

    #[test]
    fn rom_without_sha1_is_none() {
        let root = tempdir().unwrap();
        let depot = test_depot(vec![root.path().to_path_buf()]);
        let rom = Rom {
            name: "unknown.bin".to_string(),
            size: 4,
            ..Rom::default()
        };
        assert!(depot.open_rom_gz(&rom).unwrap().is_none());
    }

    #[test]
    fn malformed_sha1_is_an_error() {
        let root = tempdir().unwrap();
        let depot = test_depot(vec![root.path().to_path_buf()]);
        assert!(depot.open_rom_gz(&rom_with_sha1("abcd")).is_err());
    }
}
