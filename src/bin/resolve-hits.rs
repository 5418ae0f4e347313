use ampsweep::{
    matcher::{read_hits, resolve_all, write_resolutions},
    open_for_write,
};
use anyhow::Result;
use clap::Parser;
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Pick the best reference for each query of a hit table
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Hit table (forward, reverse, perc_identity, qseqid, sseqid,
    /// pident, bitscore, qcovs)
    #[arg(value_name = "HITS")]
    pub hits: PathBuf,

    /// Output filename
    #[arg(short, long, value_name = "OUTPUT", default_value = "-")]
    pub output: String,
}

// --------------------------------------------------
fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let hits = read_hits(&args.hits)?;
    let resolutions = resolve_all(&hits)?;
    let output: Box<dyn Write> = match args.output.as_str() {
        "-" => Box::new(io::stdout()),
        out_name => open_for_write(Path::new(out_name))?,
    };
    write_resolutions(&resolutions, output)
}
