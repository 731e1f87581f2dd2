use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use flate2::read::GzDecoder;

use crate::config::Config;
use crate::dat::{self, Dat, Game, Rom};
use crate::dedup::Deduper;
use crate::depot::Depot;
use crate::progress::ProgressTracker;
use crate::torrentzip;

const ZIP_SUFFIX: &str = ".zip";
const FIX_PREFIX: &str = "fix_";
const DAT_SUFFIX: &str = ".dat";

/// State shared by the coordinator and its workers for one `build_dat` run.
struct BuildShared<'a> {
    depot: &'a Depot,
    dat_path: PathBuf,
    unzip_games: bool,
    fix_games: Mutex<Vec<Game>>,
    deduper: &'a dyn Deduper,
    progress: &'a ProgressTracker,
    stop: AtomicBool,
    first_err: Mutex<Option<anyhow::Error>>,
    config: &'a Config,
}

impl BuildShared<'_> {
    // First error wins; later ones are only worth a verbose line. Setting
    // the stop flag ends the feed loop.
    fn fail(&self, err: anyhow::Error) {
        self.stop.store(true, Ordering::SeqCst);
        let mut slot = self.first_err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            vprintln!(self.config.verbose, 1, "additional build error: {err:#}");
        }
    }
}

fn archive_path(game_path: &Path) -> PathBuf {
    let mut path = game_path.as_os_str().to_os_string();
    path.push(ZIP_SUFFIX);
    PathBuf::from(path)
}

fn push_fix(fix_game: &mut Option<Game>, game: &Game, rom: Rom) {
    fix_game
        .get_or_insert_with(|| Game {
            name: game.name.clone(),
            description: game.description.clone(),
            roms: Vec::new(),
        })
        .roms
        .push(rom);
}

// Removes whatever `build_game` created when the depot supplied nothing for
// the game. Already-gone output is fine.
fn remove_game_output(game_path: &Path, unzip_games: bool) -> anyhow::Result<()> {
    let removed = if unzip_games {
        fs::remove_dir_all(game_path)
    } else {
        fs::remove_file(archive_path(game_path))
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .with_context(|| format!("removing empty output {}", game_path.to_string_lossy())),
    }
}

fn create_rom_file(game_path: &Path, rom_name: &str) -> anyhow::Result<File> {
    let rom_path = game_path.join(rom_name);
    if rom_name.contains('/') {
        if let Some(parent) = rom_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating rom directory {}", parent.to_string_lossy()))?;
        }
    }
    File::create(&rom_path)
        .with_context(|| format!("creating rom file {}", rom_path.to_string_lossy()))
}

/// Materialize one game from the depot. Returns the fix-game collecting
/// every rom the depot could not supply (None when the game was complete)
/// and whether any rom was actually materialized from the depot.
fn build_game(
    shared: &BuildShared,
    game: &Game,
    game_path: &Path,
) -> anyhow::Result<(Option<Game>, bool)> {
    vprintln!(
        shared.config.verbose,
        4,
        "building game {} at {}",
        game.name,
        game_path.to_string_lossy()
    );

    // A separator in the game name nests its output under the build
    // directory.
    if game.name.contains('/') {
        if let Some(parent) = game_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating game directory {}", parent.to_string_lossy()))?;
        }
    }

    let mut archive: Option<torrentzip::Writer> = None;
    if shared.unzip_games {
        fs::create_dir(game_path)
            .with_context(|| format!("creating game directory {}", game_path.to_string_lossy()))?;
    } else {
        let path = archive_path(game_path);
        let file = File::create(&path)
            .with_context(|| format!("creating archive {}", path.to_string_lossy()))?;
        archive = Some(torrentzip::Writer::new(file, &shared.config.tmp_dir));
    }

    let mut fix_game: Option<Game> = None;
    let mut found_rom = false;

    for rom in &game.roms {
        let mut rom = rom.clone();

        // The empty blob: written directly, no depot or deduper involved.
        if rom.size == 0 {
            match archive.as_mut() {
                Some(writer) => {
                    writer.write_entry(&rom.name, &mut io::empty())?;
                }
                None => {
                    create_rom_file(game_path, &rom.name)?;
                }
            }
            found_rom = true;
            shared.progress.add_files(1);
            continue;
        }

        shared.depot.db().complete_rom(&mut rom)?;

        if rom.sha1.is_none() {
            vprintln!(
                shared.config.verbose,
                2,
                "game {} has rom {} with no known sha1",
                game.name,
                rom.name
            );
            push_fix(&mut fix_game, game, rom);
            continue;
        }

        let Some(blob) = shared.depot.open_rom_gz(&rom)? else {
            vprintln!(
                shared.config.verbose,
                2,
                "game {} has missing rom {} (sha1 {})",
                game.name,
                rom.name,
                rom.sha1.as_deref().unwrap_or_default()
            );
            if !shared.deduper.seen(&game.name, &rom)? {
                shared.deduper.declare(&game.name, &rom)?;
                push_fix(&mut fix_game, game, rom);
            }
            continue;
        };

        found_rom = true;
        let mut decoder = GzDecoder::new(blob);
        let written = match archive.as_mut() {
            Some(writer) => writer.write_entry(&rom.name, &mut decoder)?,
            None => {
                let mut dst = create_rom_file(game_path, &rom.name)?;
                io::copy(&mut decoder, &mut dst)
                    .with_context(|| format!("copying rom {}", rom.name))?
            }
        };
        shared.progress.add_files(1);
        shared.progress.add_bytes(written);
    }

    if let Some(writer) = archive {
        writer
            .finish()
            .with_context(|| format!("finishing archive for game {}", game.name))?;
    }

    Ok((fix_game, found_rom))
}

fn work(shared: &BuildShared, rx: &Mutex<Receiver<&Game>>, index: usize) {
    vprintln!(shared.config.verbose, 3, "starting subworker {index}");
    loop {
        // Hold the receiver lock only for the receive itself.
        let received = rx.lock().unwrap().recv();
        let Ok(game) = received else {
            break; // channel closed, no more work
        };

        let game_path = shared.dat_path.join(&game.name);
        match build_game(shared, game, &game_path) {
            Ok((fix_game, found_rom)) => {
                if let Some(fix_game) = fix_game {
                    shared.fix_games.lock().unwrap().push(fix_game);
                }
                if !found_rom {
                    if let Err(err) = remove_game_output(&game_path, shared.unzip_games) {
                        shared.fail(err);
                        break;
                    }
                }
            }
            Err(err) => {
                vprintln!(
                    shared.config.verbose,
                    1,
                    "error processing {}: {err:#}",
                    game_path.to_string_lossy()
                );
                shared.fail(err);
                break;
            }
        }
    }
    vprintln!(shared.config.verbose, 3, "exiting subworker {index}");
}

impl Depot {
    /// Rebuild one DAT under `out_path/<dat.name>` with `num_workers`
    /// parallel game builders. Returns true when a fix-DAT was written to
    /// `out_path/fix_<dat.name>.dat`, i.e. the depot could not supply
    /// everything.
    pub fn build_dat(
        &self,
        dat: &Dat,
        out_path: &Path,
        num_workers: usize,
        deduper: &dyn Deduper,
        progress: &ProgressTracker,
        config: &Config,
    ) -> anyhow::Result<bool> {
        anyhow::ensure!(num_workers >= 1, "need at least one subworker");

        let dat_path = out_path.join(&dat.name);
        fs::create_dir(&dat_path)
            .with_context(|| format!("creating build directory {}", dat_path.to_string_lossy()))?;

        let shared = BuildShared {
            depot: self,
            dat_path,
            unzip_games: dat.unzip_games,
            fix_games: Mutex::new(Vec::new()),
            deduper,
            progress,
            stop: AtomicBool::new(false),
            first_err: Mutex::new(None),
            config,
        };

        let (tx, rx) = sync_channel::<&Game>(0);
        let rx = Arc::new(Mutex::new(rx));

        thread::scope(|scope| {
            for index in 0..num_workers {
                let rx = Arc::clone(&rx);
                let shared = &shared;
                scope.spawn(move || work(shared, &rx, index));
            }
            // Workers hold the only receiver handles from here on, so the
            // feed loop unblocks with a send error if every worker exits.
            drop(rx);

            for game in &dat.games {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(game).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(err) = shared.first_err.into_inner().unwrap() {
            return Err(err);
        }

        let fix_games = shared.fix_games.into_inner().unwrap();
        if fix_games.is_empty() {
            return Ok(false);
        }

        let fix_dat = Dat {
            name: format!("{FIX_PREFIX}{}", dat.name),
            description: dat.description.clone(),
            path: dat.path.clone(),
            unzip_games: dat.unzip_games,
            fix_dat: true,
            games: fix_games,
        };
        let fix_path = out_path.join(format!("{FIX_PREFIX}{}{DAT_SUFFIX}", dat.name));
        dat::compose_dat_file(&fix_dat, &fix_path)?;
        Ok(true)
    }
}
