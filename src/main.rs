// Keep main thin: parse the CLI, wire up the depot, drive builds.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use serde::Serialize;

use romdepot::cli::Cli;
use romdepot::config::Config;
use romdepot::dat;
use romdepot::dedup::MemoryDeduper;
use romdepot::depot::Depot;
use romdepot::progress::ProgressTracker;
use romdepot::romdb::RomDb;

const BUILD_BAR_TEMPLATE: &str = "{prefix} [{bar:40}] {pos:>5}/{len:<5} | {msg}";

#[derive(Debug, Serialize)]
struct BuildReport {
    dat: String,
    games: usize,
    roms: u64,
    produced_fix_dat: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::try_from(cli)?;

    let db = RomDb::open(&config.db_path)?;
    let depot = Depot::new(config.depot_roots.clone(), db);

    let mut dats = Vec::new();
    for path in &config.dats {
        let mut parsed = dat::parse_dat(path)?;
        parsed.unzip_games = config.unzip_games;
        dats.push(parsed);
    }

    if config.index_dats {
        let indexed = depot.db().index_dats(&dats)?;
        if config.verbose >= 1 {
            eprintln!("indexed {indexed} roms from {} dat(s)", dats.len());
        }
    }

    std::fs::create_dir_all(&config.out)?;

    let progress = ProgressTracker::new();
    let mut reports = Vec::new();

    for built in &dats {
        progress.reset(built.rom_count(), built.byte_count());

        let bar = ProgressBar::new(built.rom_count());
        bar.set_style(ProgressStyle::with_template(BUILD_BAR_TEMPLATE)?);
        bar.set_prefix(built.name.clone());

        let deduper = MemoryDeduper::new();
        let ticking = AtomicBool::new(true);

        let produced_fix_dat = thread::scope(|scope| {
            let ticker = scope.spawn(|| {
                while ticking.load(Ordering::Relaxed) {
                    let snapshot = progress.snapshot();
                    bar.set_position(snapshot.files_so_far);
                    bar.set_message(format!(
                        "{} / {}",
                        HumanBytes(snapshot.bytes_so_far),
                        HumanBytes(snapshot.total_bytes)
                    ));
                    thread::sleep(Duration::from_millis(250));
                }
            });

            let result = depot.build_dat(
                built,
                &config.out,
                config.workers,
                &deduper,
                &progress,
                &config,
            );
            ticking.store(false, Ordering::Relaxed);
            let _ = ticker.join();
            result
        })?;
        bar.finish_and_clear();

        reports.push(BuildReport {
            dat: built.name.clone(),
            games: built.games.len(),
            roms: built.rom_count(),
            produced_fix_dat,
        });
    }

    depot.db().close()?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
