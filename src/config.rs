//! CLI and file-based configuration. CLI flags win
//! over an optional `--config` TOML overlay, which wins over defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::engine::{ChecksumMode, OpenVerifyMode};

#[derive(Parser, Debug)]
#[command(name = "wormfs", about = "A checksummed, WORM-aware FUSE overlay filesystem")]
struct Cli {
    /// Directory whose contents are mirrored through the overlay.
    backing_dir: Option<PathBuf>,

    /// Where to mount the overlay.
    mount_point: Option<PathBuf>,

    /// Optional TOML file overlaying these defaults; CLI flags still win.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated virtual-path prefixes enforced as append-only.
    #[arg(long)]
    append_only_dirs: Option<String>,

    /// Checksum granularity.
    #[arg(long, value_enum)]
    checksum_mode: Option<CliChecksumMode>,

    /// Verification strategy for a non-truncating writer open.
    #[arg(long, value_enum)]
    open_verify: Option<CliOpenVerify>,

    /// Extra mount options (e.g. `ro`, `allow_other`, `fsname=wormfs`).
    #[arg(short = 'o', long = "option")]
    mount_options: Vec<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliChecksumMode {
    Whole,
    Block,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliOpenVerify {
    Strict,
    Relaxed,
}

#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    backing_dir: Option<PathBuf>,
    mount_point: Option<PathBuf>,
    append_only_dirs: Option<Vec<String>>,
    checksum_mode: Option<String>,
    open_verify: Option<String>,
    mount_options: Option<Vec<String>>,
}

/// Fully resolved mount configuration.
#[derive(Debug)]
pub struct Config {
    pub backing_dir: PathBuf,
    pub mount_point: PathBuf,
    pub append_only_dirs: Vec<String>,
    pub checksum_mode: ChecksumMode,
    pub open_verify: OpenVerifyMode,
    pub mount_options: Vec<String>,
}

impl Config {
    /// Parse CLI arguments and, if `--config` is given, overlay a TOML
    /// file read beforehand; CLI values always take precedence over the
    /// file's.
    pub fn load() -> Result<Self, String> {
        let cli = Cli::parse();
        let file = match &cli.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let backing_dir = cli
            .backing_dir
            .or(file.backing_dir)
            .ok_or_else(|| "missing required argument: backing_dir".to_string())?;
        let mount_point = cli
            .mount_point
            .or(file.mount_point)
            .ok_or_else(|| "missing required argument: mount_point".to_string())?;

        let append_only_dirs = cli
            .append_only_dirs
            .map(|csv| csv.split(',').map(str::to_string).collect::<Vec<_>>())
            .or(file.append_only_dirs)
            .unwrap_or_default();

        let checksum_mode = match cli.checksum_mode {
            Some(CliChecksumMode::Whole) => ChecksumMode::WholeFile,
            Some(CliChecksumMode::Block) => ChecksumMode::Block,
            None => match file.checksum_mode.as_deref() {
                Some("block") => ChecksumMode::Block,
                Some("whole") | None => ChecksumMode::WholeFile,
                Some(other) => return Err(format!("unknown checksum_mode: {other}")),
            },
        };

        let open_verify = match cli.open_verify {
            Some(CliOpenVerify::Strict) => OpenVerifyMode::Strict,
            Some(CliOpenVerify::Relaxed) => OpenVerifyMode::Relaxed,
            None => match file.open_verify.as_deref() {
                Some("relaxed") => OpenVerifyMode::Relaxed,
                Some("strict") | None => OpenVerifyMode::Strict,
                Some(other) => return Err(format!("unknown open_verify: {other}")),
            },
        };

        let mount_options = if cli.mount_options.is_empty() {
            file.mount_options.unwrap_or_default()
        } else {
            cli.mount_options
        };

        Ok(Config { backing_dir, mount_point, append_only_dirs, checksum_mode, open_verify, mount_options })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("reading {path:?}: {e}"))?;
    toml::from_str(&text).map_err(|e| format!("parsing {path:?}: {e}"))
}
