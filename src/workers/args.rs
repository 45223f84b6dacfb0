//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Pastedrop - P2P file drop with copy/paste connection codes.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[serde(default)]
pub struct Args {
    /// Join a peer using their offer code. Pass `-` to paste the code
    /// on stdin instead. Without this flag, this side creates the offer.
    #[clap(short, long)]
    pub join: Option<String>,

    /// File to send once the channel opens (repeatable).
    #[clap(short, long)]
    pub send: Vec<PathBuf>,

    /// Directory where received files are written. Defaults to the
    /// current directory.
    #[clap(short, long)]
    pub out: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Do not copy generated connection codes to the clipboard.
    #[clap(long)]
    pub no_clipboard: bool,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let cli_args = Args::parse();

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.join.is_some() {
            file.join = cli.join;
        }
        if !cli.send.is_empty() {
            file.send = cli.send;
        }
        if cli.out.is_some() {
            file.out = cli.out;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.no_clipboard {
            file.no_clipboard = true;
        }
        file
    }
}
