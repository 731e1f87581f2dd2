use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use quick_xml::Reader;
use quick_xml::Writer as XmlWriter;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;

/// A single file belonging to a game, identified by name within the game and
/// by digest globally. Digests are lowercase hex; any one of them suffices to
/// identify the blob.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Rom {
    pub name: String,
    pub size: u64,
    pub crc32: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Game {
    pub name: String,
    pub description: Option<String>,
    pub roms: Vec<Rom>,
}

/// A parsed catalog of games. `fix_dat` marks a synthesized fix-DAT rather
/// than an input catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dat {
    pub name: String,
    pub description: Option<String>,
    pub path: Option<PathBuf>,
    pub unzip_games: bool,
    pub fix_dat: bool,
    pub games: Vec<Game>,
}

impl Dat {
    pub fn rom_count(&self) -> u64 {
        self.games.iter().map(|g| g.roms.len() as u64).sum()
    }

    pub fn byte_count(&self) -> u64 {
        self.games
            .iter()
            .flat_map(|g| g.roms.iter())
            .map(|r| r.size)
            .sum()
    }
}

fn rom_from_attributes(e: &BytesStart) -> Rom {
    let mut rom = Rom::default();
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"name" | b"NAME" => rom.name = value,
            b"size" | b"SIZE" => rom.size = value.parse().unwrap_or(0),
            b"crc" | b"CRC" => rom.crc32 = Some(value.to_ascii_lowercase()),
            b"md5" | b"MD5" => rom.md5 = Some(value.to_ascii_lowercase()),
            b"sha1" | b"SHA1" => rom.sha1 = Some(value.to_ascii_lowercase()),
            _ => {}
        }
    }
    rom
}

fn name_attribute(e: &BytesStart) -> Option<String> {
    e.attributes()
        .filter_map(Result::ok)
        .find(|a| a.key.as_ref() == b"name")
        .and_then(|a| String::from_utf8(a.value.into_owned()).ok())
}

/// Parse a Logiqx XML DAT. Accepts both `<game>` and `<machine>` elements and
/// both empty and start/end `<rom>` forms.
pub fn parse_dat(path: &Path) -> anyhow::Result<Dat> {
    let mut reader = Reader::from_file(path)
        .with_context(|| format!("unable to open DAT file: {}", path.to_string_lossy()))?;
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut dat = Dat {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: Some(path.to_path_buf()),
        ..Dat::default()
    };

    let mut in_header = false;
    let mut current_game: Option<Game> = None;
    // Element whose text content we are about to read, if any.
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"header" => in_header = true,
                b"game" | b"machine" => {
                    current_game = Some(Game {
                        name: name_attribute(e).unwrap_or_default(),
                        ..Game::default()
                    });
                }
                b"name" if in_header => text_target = Some("header_name"),
                b"description" => {
                    text_target = Some(if in_header {
                        "header_description"
                    } else {
                        "game_description"
                    });
                }
                b"rom" => {
                    if let Some(game) = current_game.as_mut() {
                        game.roms.push(rom_from_attributes(e));
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"rom" => {
                if let Some(game) = current_game.as_mut() {
                    game.roms.push(rom_from_attributes(e));
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(target) = text_target.take() {
                    let value = e.unescape().unwrap_or_default().to_string();
                    match target {
                        "header_name" => dat.name = value,
                        "header_description" => dat.description = Some(value),
                        "game_description" => {
                            if let Some(game) = current_game.as_mut() {
                                game.description = Some(value);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"header" => in_header = false,
                b"game" | b"machine" => {
                    if let Some(game) = current_game.take() {
                        dat.games.push(game);
                    }
                }
                _ => text_target = None,
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("malformed DAT file: {}", path.to_string_lossy()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(dat)
}

/// Serialize a DAT back to Logiqx XML, the same shape `parse_dat` consumes.
pub fn compose_dat<W: Write>(dat: &Dat, out: W) -> anyhow::Result<()> {
    let mut writer = XmlWriter::new_with_indent(out, b'\t', 1);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
    writer.write_event(Event::Start(BytesStart::new("datafile")))?;

    writer.write_event(Event::Start(BytesStart::new("header")))?;
    writer.write_event(Event::Start(BytesStart::new("name")))?;
    writer.write_event(Event::Text(BytesText::new(&dat.name)))?;
    writer.write_event(Event::End(BytesEnd::new("name")))?;
    if let Some(description) = &dat.description {
        writer.write_event(Event::Start(BytesStart::new("description")))?;
        writer.write_event(Event::Text(BytesText::new(description)))?;
        writer.write_event(Event::End(BytesEnd::new("description")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("header")))?;

    for game in &dat.games {
        let mut start = BytesStart::new("game");
        start.push_attribute(("name", game.name.as_str()));
        writer.write_event(Event::Start(start))?;
        if let Some(description) = &game.description {
            writer.write_event(Event::Start(BytesStart::new("description")))?;
            writer.write_event(Event::Text(BytesText::new(description)))?;
            writer.write_event(Event::End(BytesEnd::new("description")))?;
        }
        for rom in &game.roms {
            let mut entry = BytesStart::new("rom");
            entry.push_attribute(("name", rom.name.as_str()));
            entry.push_attribute(("size", rom.size.to_string().as_str()));
            if let Some(crc32) = &rom.crc32 {
                entry.push_attribute(("crc", crc32.as_str()));
            }
            if let Some(md5) = &rom.md5 {
                entry.push_attribute(("md5", md5.as_str()));
            }
            if let Some(sha1) = &rom.sha1 {
                entry.push_attribute(("sha1", sha1.as_str()));
            }
            writer.write_event(Event::Empty(entry))?;
        }
        writer.write_event(Event::End(BytesEnd::new("game")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("datafile")))?;
    Ok(())
}

/// Compose a DAT to a file, buffered.
pub fn compose_dat_file(dat: &Dat, path: &Path) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("creating fix dat {}", path.to_string_lossy()))?;
    let mut out = BufWriter::new(file);
    compose_dat(dat, &mut out)?;
    out.flush()?;
    Ok(())
}
