use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use crc32fast::Hasher as Crc32;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use tempfile::NamedTempFile;

// CP437 table: index -> Unicode char. Filenames are encoded to CP437 by
// reverse-mapping characters to their byte value, as the torrentzip format
// expects; names outside the table fall back to their UTF-8 bytes.
const CP437_TABLE: [char; 256] = [
    '\u{0000}', '\u{0001}', '\u{0002}', '\u{0003}', '\u{0004}', '\u{0005}', '\u{0006}', '\u{0007}',
    '\u{0008}', '\u{0009}', '\u{000A}', '\u{000B}', '\u{000C}', '\u{000D}', '\u{000E}', '\u{000F}',
    '\u{0010}', '\u{0011}', '\u{0012}', '\u{0013}', '\u{0014}', '\u{0015}', '\u{0016}', '\u{0017}',
    '\u{0018}', '\u{0019}', '\u{001A}', '\u{001B}', '\u{001C}', '\u{001D}', '\u{001E}', '\u{001F}',
    ' ', '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', '0', '1', '2',
    '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', '@', 'A', 'B', 'C', 'D', 'E',
    'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X',
    'Y', 'Z', '[', '\\', ']', '^', '_', '`', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k',
    'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '{', '|', '}', '~',
    '\u{007F}', '\u{00C7}', '\u{00FC}', '\u{00E9}', '\u{00E2}', '\u{00E4}', '\u{00E0}', '\u{00E5}',
    '\u{00E7}', '\u{00EA}', '\u{00EB}', '\u{00E8}', '\u{00EF}', '\u{00EE}', '\u{00EC}', '\u{00C4}',
    '\u{00C5}', '\u{00C9}', '\u{00E6}', '\u{00C6}', '\u{00F4}', '\u{00F6}', '\u{00F2}', '\u{00FB}',
    '\u{00F9}', '\u{00FF}', '\u{00D6}', '\u{00DC}', '\u{00A2}', '\u{00A3}', '\u{00A5}', '\u{20A7}',
    '\u{0192}', '\u{00E1}', '\u{00ED}', '\u{00F3}', '\u{00FA}', '\u{00F1}', '\u{00D1}', '\u{00AA}',
    '\u{00BA}', '\u{00BF}', '\u{2310}', '\u{00AC}', '\u{00BD}', '\u{00BC}', '\u{00A1}', '\u{00AB}',
    '\u{00BB}', '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}',
    '\u{2556}', '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255D}', '\u{255C}', '\u{255B}',
    '\u{2510}', '\u{2514}', '\u{2534}', '\u{252C}', '\u{251C}', '\u{2500}', '\u{253C}', '\u{255E}',
    '\u{255F}', '\u{255A}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256C}',
    '\u{2567}', '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}',
    '\u{256B}', '\u{256A}', '\u{2518}', '\u{250C}', '\u{2588}', '\u{2584}', '\u{258C}', '\u{2590}',
    '\u{2580}', '\u{03B1}', '\u{00DF}', '\u{0393}', '\u{03C0}', '\u{03A3}', '\u{03C3}', '\u{00B5}',
    '\u{03C4}', '\u{03A6}', '\u{0398}', '\u{03A9}', '\u{03B4}', '\u{221E}', '\u{03C6}', '\u{03B5}',
    '\u{2229}', '\u{2261}', '\u{00B1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00F7}',
    '\u{2248}', '\u{00B0}', '\u{2219}', '\u{00B7}', '\u{221A}', '\u{207F}', '\u{00B2}', '\u{25A0}',
    '\u{00A0}',
];

fn encode_cp437(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    for ch in s.chars() {
        if ch as u32 <= 0x7F {
            out.push(ch as u8);
            continue;
        }
        match CP437_TABLE.iter().position(|&c| c == ch) {
            Some(i) => out.push(i as u8),
            None => return None,
        }
    }
    Some(out)
}

// Canonical torrentzip metadata: every entry is deflate at maximum level
// with a fixed DOS timestamp, so identical input bytes produce identical
// archive bytes.
const VERSION_NEEDED: u16 = 20;
const GP_FLAG_MAX_DEFLATE: u16 = 2;
const METHOD_DEFLATE: u16 = 8;
const DOS_TIME: u16 = 0xBC00;
const DOS_DATE: u16 = 0x2198;

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const CENTRAL_HEADER_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;
const LOCAL_HEADER_LEN: u64 = 30;

const COPY_BUF_SIZE: usize = 64 * 1024;

struct Entry {
    name: Vec<u8>,
    sort_key: String,
    crc32: u32,
    compressed: NamedTempFile,
    compressed_size: u64,
    uncompressed_size: u64,
}

/// Deterministic ("torrentzip") archive writer. Entries are staged as raw
/// deflate streams in temp files under `tmp_dir`, then assembled in
/// lowercased-name order with canonical headers and the
/// `TORRENTZIPPED-<central directory CRC>` end-of-archive comment.
pub struct Writer {
    out: File,
    tmp_dir: PathBuf,
    entries: Vec<Entry>,
}

impl Writer {
    pub fn new(out: File, tmp_dir: &Path) -> Writer {
        Writer {
            out,
            tmp_dir: tmp_dir.to_path_buf(),
            entries: Vec::new(),
        }
    }

    /// Stream one entry into the archive. Returns the uncompressed size.
    /// Entries may be written in any order; `finish` sorts them.
    pub fn write_entry<R: Read>(&mut self, name: &str, reader: &mut R) -> anyhow::Result<u64> {
        let staged = NamedTempFile::new_in(&self.tmp_dir).with_context(|| {
            format!(
                "creating archive temp file in {}",
                self.tmp_dir.to_string_lossy()
            )
        })?;

        let mut encoder = DeflateEncoder::new(staged, Compression::best());
        let mut hasher = Crc32::new();
        let mut uncompressed_size = 0u64;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            encoder
                .write_all(&buf[..n])
                .with_context(|| format!("compressing archive entry {name}"))?;
            uncompressed_size += n as u64;
        }
        let compressed = encoder
            .finish()
            .with_context(|| format!("finishing archive entry {name}"))?;
        let compressed_size = compressed.as_file().metadata()?.len();

        if uncompressed_size > u32::MAX as u64 || compressed_size > u32::MAX as u64 {
            anyhow::bail!("archive entry {name} exceeds zip32 limits");
        }

        self.entries.push(Entry {
            name: encode_cp437(name).unwrap_or_else(|| name.as_bytes().to_vec()),
            sort_key: name.to_lowercase(),
            crc32: hasher.finalize(),
            compressed,
            compressed_size,
            uncompressed_size,
        });
        Ok(uncompressed_size)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assemble the archive. Must be called; dropping the writer without
    /// finishing discards the staged entries and leaves the output file
    /// empty.
    pub fn finish(mut self) -> anyhow::Result<()> {
        if self.entries.len() > u16::MAX as usize {
            anyhow::bail!("too many archive entries: {}", self.entries.len());
        }
        self.entries
            .sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.name.cmp(&b.name)));

        let mut out = BufWriter::new(&mut self.out);
        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut cursor = 0u64;

        for entry in &mut self.entries {
            offsets.push(cursor);

            out.write_all(&LOCAL_HEADER_SIG.to_le_bytes())?;
            out.write_all(&VERSION_NEEDED.to_le_bytes())?;
            out.write_all(&GP_FLAG_MAX_DEFLATE.to_le_bytes())?;
            out.write_all(&METHOD_DEFLATE.to_le_bytes())?;
            out.write_all(&DOS_TIME.to_le_bytes())?;
            out.write_all(&DOS_DATE.to_le_bytes())?;
            out.write_all(&entry.crc32.to_le_bytes())?;
            out.write_all(&(entry.compressed_size as u32).to_le_bytes())?;
            out.write_all(&(entry.uncompressed_size as u32).to_le_bytes())?;
            out.write_all(&(entry.name.len() as u16).to_le_bytes())?;
            out.write_all(&0u16.to_le_bytes())?;
            out.write_all(&entry.name)?;

            let staged = entry.compressed.as_file_mut();
            staged.seek(SeekFrom::Start(0))?;
            std::io::copy(staged, &mut out)?;

            cursor += LOCAL_HEADER_LEN + entry.name.len() as u64 + entry.compressed_size;
        }

        if cursor > u32::MAX as u64 {
            anyhow::bail!("archive exceeds zip32 limits");
        }

        let mut central = Vec::new();
        for (entry, offset) in self.entries.iter().zip(&offsets) {
            central.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes()); // version made by
            central.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            central.extend_from_slice(&GP_FLAG_MAX_DEFLATE.to_le_bytes());
            central.extend_from_slice(&METHOD_DEFLATE.to_le_bytes());
            central.extend_from_slice(&DOS_TIME.to_le_bytes());
            central.extend_from_slice(&DOS_DATE.to_le_bytes());
            central.extend_from_slice(&entry.crc32.to_le_bytes());
            central.extend_from_slice(&(entry.compressed_size as u32).to_le_bytes());
            central.extend_from_slice(&(entry.uncompressed_size as u32).to_le_bytes());
            central.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes()); // extra length
            central.extend_from_slice(&0u16.to_le_bytes()); // comment length
            central.extend_from_slice(&0u16.to_le_bytes()); // disk number start
            central.extend_from_slice(&0u16.to_le_bytes()); // internal attributes
            central.extend_from_slice(&0u32.to_le_bytes()); // external attributes
            central.extend_from_slice(&(*offset as u32).to_le_bytes());
            central.extend_from_slice(&entry.name);
        }

        let mut hasher = Crc32::new();
        hasher.update(&central);
        let comment = format!("TORRENTZIPPED-{:08X}", hasher.finalize());

        out.write_all(&central)?;

        out.write_all(&EOCD_SIG.to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?;
        out.write_all(&(self.entries.len() as u16).to_le_bytes())?;
        out.write_all(&(self.entries.len() as u16).to_le_bytes())?;
        out.write_all(&(central.len() as u32).to_le_bytes())?;
        out.write_all(&(cursor as u32).to_le_bytes())?;
        out.write_all(&(comment.len() as u16).to_le_bytes())?;
        out.write_all(comment.as_bytes())?;
        out.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn build_archive(path: &Path, tmp: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = Writer::new(file, tmp);
        for (name, bytes) in entries {
            writer.write_entry(name, &mut Cursor::new(bytes)).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn archive_is_readable_and_sorted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.zip");
        build_archive(
            &path,
            dir.path(),
            &[("Zeta.bin", b"zeta"), ("alpha.bin", b"alpha"), ("MID.bin", b"mid")],
        );

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha.bin", "MID.bin", "Zeta.bin"]);

        let mut content = String::new();
        archive
            .by_name("alpha.bin")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "alpha");
    }

    #[test]
    fn identical_inputs_are_byte_identical() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.zip");
        let second = dir.path().join("b.zip");
        let entries: &[(&str, &[u8])] = &[("b.bin", b"bbbb"), ("a.bin", b"aaaa")];

        build_archive(&first, dir.path(), entries);
        build_archive(&second, dir.path(), entries);

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.zip");
        let second = dir.path().join("b.zip");

        build_archive(&first, dir.path(), &[("a.bin", b"aa"), ("b.bin", b"bb")]);
        build_archive(&second, dir.path(), &[("b.bin", b"bb"), ("a.bin", b"aa")]);

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn comment_carries_central_directory_crc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.zip");
        build_archive(&path, dir.path(), &[("r.bin", b"data")]);

        let bytes = std::fs::read(&path).unwrap();
        let comment = &bytes[bytes.len() - 22..];
        assert!(comment.starts_with(b"TORRENTZIPPED-"));
        assert_eq!(comment.len(), 22);
        assert!(
            comment[14..]
                .iter()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase())
        );
    }

    #[test]
    fn empty_entry_is_zero_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.zip");
        build_archive(&path, dir.path(), &[("empty.bin", b"")]);

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let entry = archive.by_name("empty.bin").unwrap();
        assert_eq!(entry.size(), 0);
    }

    #[test]
    fn subdirectory_entry_names_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("game.zip");
        build_archive(&path, dir.path(), &[("sub/dir/rom.bin", b"x")]);

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert!(archive.by_name("sub/dir/rom.bin").is_ok());
    }
}
