use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Directory whose regular files are packed into the image root
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output directory for fs.img
    #[arg(long, short = 'O')]
    pub out_dir: PathBuf,

    /// Image size in sectors
    #[arg(long, default_value_t = 16 * 2048)]
    pub sectors: u64,
}
