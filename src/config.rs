use std::env;
use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    pub dats: Vec<PathBuf>,
    pub out: PathBuf,
    pub depot_roots: Vec<PathBuf>,
    pub db_path: PathBuf,
    pub workers: usize,
    pub unzip_games: bool,
    pub index_dats: bool,
    pub tmp_dir: PathBuf,
    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dats: Vec::new(),
            out: PathBuf::new(),
            depot_roots: Vec::new(),
            db_path: PathBuf::new(),
            workers: 1,
            unzip_games: false,
            index_dats: false,
            tmp_dir: env::temp_dir(),
            verbose: 0,
        }
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let workers = match cli.workers {
            Some(0) => anyhow::bail!("--workers must be at least 1"),
            Some(n) => n,
            None => num_cpus::get().max(1),
        };

        for root in &cli.depot {
            if !root.is_dir() {
                anyhow::bail!("depot root {} is not a directory", root.to_string_lossy());
            }
        }

        let tmp_dir = cli.tmp_dir.unwrap_or_else(env::temp_dir);
        if !tmp_dir.is_dir() {
            anyhow::bail!("tmp dir {} is not a directory", tmp_dir.to_string_lossy());
        }

        Ok(Config {
            dats: cli.dat,
            out: cli.out,
            depot_roots: cli.depot,
            db_path: cli.db,
            workers,
            unzip_games: cli.unzip_games,
            index_dats: cli.index_dats,
            tmp_dir,
            verbose: cli.verbose,
        })
    }
}
