use std::collections::HashSet;
use std::sync::Mutex;

use crate::dat::Rom;

/// Identity of a rom for missing reports: the SHA-1 when present, else a
/// stable composition of size and CRC. Never the name, which may refer to
/// different bytes across games. Roms carrying no digest at all have no
/// identity.
pub fn rom_key(rom: &Rom) -> Option<Vec<u8>> {
    if let Some(sha1) = &rom.sha1 {
        let mut key = vec![b's'];
        key.extend_from_slice(sha1.as_bytes());
        return Some(key);
    }
    if let Some(crc32) = &rom.crc32 {
        let mut key = vec![b'c'];
        key.extend_from_slice(&rom.size.to_be_bytes());
        key.extend_from_slice(crc32.as_bytes());
        return Some(key);
    }
    None
}

fn game_scoped_key(game: &str, rom: &Rom) -> Option<Vec<u8>> {
    rom_key(rom).map(|rom_part| {
        let mut key = game.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&rom_part);
        key
    })
}

/// Build-scoped set of roms already declared missing, keyed per game so a
/// gap reported through several paths appears once in that game's fix entry
/// while distinct games each still report it. Concurrent-safe; the first
/// worker to declare a key wins and later `seen` calls return true.
pub trait Deduper: Send + Sync {
    fn seen(&self, game: &str, rom: &Rom) -> anyhow::Result<bool>;
    fn declare(&self, game: &str, rom: &Rom) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryDeduper {
    seen: Mutex<HashSet<Vec<u8>>>,
}

impl MemoryDeduper {
    pub fn new() -> Self {
        MemoryDeduper::default()
    }
}

impl Deduper for MemoryDeduper {
    fn seen(&self, game: &str, rom: &Rom) -> anyhow::Result<bool> {
        Ok(match game_scoped_key(game, rom) {
            Some(key) => self.seen.lock().unwrap().contains(&key),
            None => false,
        })
    }

    fn declare(&self, game: &str, rom: &Rom) -> anyhow::Result<()> {
        if let Some(key) = game_scoped_key(game, rom) {
            self.seen.lock().unwrap().insert(key);
        }
        Ok(())
    }
}
