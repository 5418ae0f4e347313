pub mod config;
pub mod denoise;
pub mod evaluate;
pub mod grid;
pub mod inputs;
pub mod matcher;
pub mod observe;
pub mod search;
pub mod sweep;
pub mod table;
pub mod taxonomy;

use crate::{
    config::Config,
    denoise::CommandDenoiser,
    evaluate::CommandEvaluator,
    observe::LogObserver,
    search::BlastnSearch,
    sweep::{Collaborators, Plan, Sweep, SweepSummary},
};
use anyhow::{anyhow, Result};
use clap::{builder::PossibleValue, Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use log::info;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Trimming-parameter sweep for amplicon denoising
#[derive(Debug, Parser)]
#[command(arg_required_else_help = true)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level
    #[arg(short, long)]
    pub log: Option<LogLevel>,

    /// Log file, default stderr
    #[arg(long, value_name = "LOGFILE")]
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Denoise, match and evaluate every trimming combination
    Sweep(SweepArgs),

    /// Show the trimming combinations and their batches
    Plan(PlanArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SweepArgs {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output directory, overrides the config
    #[arg(short, long, value_name = "OUTDIR")]
    pub outdir: Option<PathBuf>,

    /// Number of workers, overrides the config
    #[arg(short, long, value_name = "WORKERS")]
    pub workers: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct PlanArgs {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    pub config: PathBuf,

    /// Number of workers, overrides the config
    #[arg(short, long, value_name = "WORKERS")]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

// --------------------------------------------------
pub fn sweep(args: &SweepArgs) -> Result<SweepSummary> {
    let mut config = Config::load(&args.config)?;
    if let Some(outdir) = &args.outdir {
        config.outdir = outdir.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    info!("config = {config:#?}");

    // Find every executable before any work starts
    let denoiser = CommandDenoiser::new(&config.denoiser)?;
    let search = BlastnSearch::new(&config.search)?;
    let evaluator = CommandEvaluator::new(&config.evaluator)?;
    let observer = LogObserver;

    let sweep = Sweep::new(
        config,
        Collaborators {
            denoiser: &denoiser,
            search: &search,
            evaluator: &evaluator,
            observer: &observer,
        },
    )?;
    sweep.run()
}

// --------------------------------------------------
pub fn plan(args: &PlanArgs) -> Result<Plan> {
    let mut config = Config::load(&args.config)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    sweep::plan(&config)
}

// --------------------------------------------------
/// Lines printed by the `plan` command
pub fn format_plan(plan: &Plan) -> Vec<String> {
    let mut lines = vec![format!(
        "{} combos in {} batches",
        plan.combos.len(),
        plan.batches.len()
    )];
    for (i, batch) in plan.batches.iter().enumerate() {
        lines.push(format!(
            "{}: {}",
            i + 1,
            batch.iter().map(|c| c.label()).join(", ")
        ));
    }
    lines
}

// --------------------------------------------------
pub fn open(filename: &Path) -> Result<Box<dyn BufRead>> {
    Ok(Box::new(BufReader::new(File::open(filename).map_err(
        |e| anyhow!("Cannot read {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
pub fn open_for_write(filename: &Path) -> Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(filename).map_err(
        |e| anyhow!("Cannot write {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{format_plan, open, open_for_write};
    use crate::{grid::TrimCombo, sweep::Plan};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{
        io::{BufRead, Write},
        path::Path,
    };
    use tempfile::tempdir;

    #[test]
    fn test_format_plan() {
        let plan = Plan {
            combos: vec![
                TrimCombo::single(200),
                TrimCombo::single(225),
                TrimCombo::single(250),
            ],
            batches: vec![
                vec![TrimCombo::single(200), TrimCombo::single(225)],
                vec![TrimCombo::single(250)],
            ],
        };
        assert_eq!(
            format_plan(&plan),
            vec!["3 combos in 2 batches", "1: 200, 225", "2: 250"]
        );
    }

    #[test]
    fn test_open() -> Result<()> {
        let res = open(Path::new("tests/inputs/missing.tsv"));
        assert!(res.is_err());
        assert!(res
            .err()
            .map(|e| e.to_string().starts_with("Cannot read"))
            .unwrap_or(false));

        let dir = tempdir()?;
        let path = dir.path().join("out.txt");
        {
            let mut out = open_for_write(&path)?;
            writeln!(out, "line1\nline2")?;
        }
        let lines: Vec<String> = open(&path)?.lines().collect::<Result<_, _>>()?;
        assert_eq!(lines, vec!["line1", "line2"]);
        Ok(())
    }
}
