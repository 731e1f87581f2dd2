use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, serde::Serialize)]
#[command(
    name = "romdepot",
    version,
    about = "Content-addressed ROM depot that rebuilds DAT collections on demand"
)]
pub struct Cli {
    /// DAT file(s) describing the collections to build
    #[arg(short = 'd', long = "dat", value_name = "PATH", required = true, action = ArgAction::Append)]
    pub dat: Vec<PathBuf>,

    /// Directory the built collections are written to
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    pub out: PathBuf,

    /// Depot root(s) holding the gzipped blobs, tried in order
    #[arg(long = "depot", value_name = "PATH", required = true, action = ArgAction::Append)]
    pub depot: Vec<PathBuf>,

    /// Path to the rom database (created when missing)
    #[arg(long = "db", value_name = "PATH", default_value = "romdb.sqlite")]
    pub db: PathBuf,

    /// Number of parallel game builders [default: logical CPUs]
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Materialize one directory per game instead of one archive per game
    #[arg(long = "unzip")]
    pub unzip_games: bool,

    /// Index the input DATs into the rom database before building
    #[arg(long = "index-dats")]
    pub index_dats: bool,

    /// Temp directory for archive staging [default: system temp]
    #[arg(long = "tmp-dir", value_name = "PATH")]
    pub tmp_dir: Option<PathBuf>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}
