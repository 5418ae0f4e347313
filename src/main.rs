use ampsweep::{self, Cli, Command, LogLevel};
use anyhow::Result;
use clap::Parser;
use std::{fs::File, io::BufWriter};

// --------------------------------------------------
fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

// --------------------------------------------------
fn run(cli: Cli) -> Result<()> {
    // A log file gets everything unless told otherwise
    let level = match (&cli.log, &cli.logfile) {
        (Some(LogLevel::Debug), _) | (None, Some(_)) => log::LevelFilter::Debug,
        (Some(LogLevel::Info), _) => log::LevelFilter::Info,
        _ => log::LevelFilter::Off,
    };
    let mut logger = env_logger::Builder::new();
    logger.filter_level(level);
    if let Some(logfile) = &cli.logfile {
        logger.target(env_logger::Target::Pipe(Box::new(BufWriter::new(
            File::create(logfile)?,
        ))));
    }
    logger.init();

    match &cli.command {
        Command::Sweep(args) => {
            let summary = ampsweep::sweep(args)?;
            println!("{}", ampsweep::sweep::report(&summary));
            Ok(())
        }
        Command::Plan(args) => {
            let plan = ampsweep::plan(args)?;
            for line in ampsweep::format_plan(&plan) {
                println!("{line}");
            }
            Ok(())
        }
    }
}
