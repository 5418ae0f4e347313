use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::tempdir;

const PRG: &str = "ampsweep";
const RESOLVE: &str = "resolve-hits";
const CONFIG: &str = "tests/inputs/ampsweep.toml";
const HITS: &str = "tests/inputs/hits.tsv";

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn no_args_prints_usage() -> Result<()> {
    Command::cargo_bin(PRG)?
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn plan() -> Result<()> {
    let output = Command::cargo_bin(PRG)?
        .args(["plan", "--config", CONFIG, "--workers", "4"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    assert_eq!(
        stdout,
        "2 combos in 2 batches\n1: 240-200\n2: 250-200\n"
    );
    Ok(())
}

// --------------------------------------------------
#[test]
fn plan_bad_config() -> Result<()> {
    Command::cargo_bin(PRG)?
        .args(["plan", "--config", "tests/inputs/missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot read"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn sweep_missing_executable() -> Result<()> {
    let outdir = tempdir()?;
    let config = outdir.path().join("ampsweep.toml");
    fs::write(
        &config,
        fs::read_to_string(CONFIG)?
            .replace("dada2-denoise", "no-such-denoiser-on-the-path"),
    )?;

    Command::cargo_bin(PRG)?
        .args(["sweep", "--config"])
        .arg(&config)
        .arg("--outdir")
        .arg(outdir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-denoiser-on-the-path"));

    // Nothing was started
    assert!(!outdir.path().join("denoised").exists());
    Ok(())
}

// --------------------------------------------------
#[test]
fn resolve_hits_stdout() -> Result<()> {
    let output = Command::cargo_bin(RESOLVE)?.arg(HITS).output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "forward\treverse\tperc_identity\tquery\treference\tcause",
            "240\t\t99\tq1\tMULTIPLE_PERFECT_HITS\tMultiplePerfectHits",
            "250\t200\t97\tq1\tA\tOnePerfectHit",
            "250\t200\t97\tq2\tOTHER\tLessThan80",
            "250\t200\t97\tq3\tA\tMin80IsBest",
        ]
    );
    Ok(())
}

// --------------------------------------------------
#[test]
fn resolve_hits_outfile() -> Result<()> {
    let outdir = tempdir()?;
    let outfile = outdir.path().join("resolutions.tsv");
    Command::cargo_bin(RESOLVE)?
        .arg(HITS)
        .arg("--output")
        .arg(&outfile)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let contents = fs::read_to_string(&outfile)?;
    assert_eq!(contents.lines().count(), 5);
    Ok(())
}

// --------------------------------------------------
#[test]
fn resolve_hits_bad_input() -> Result<()> {
    Command::cargo_bin(RESOLVE)?
        .arg("tests/inputs/feature-table.tsv")
        .assert()
        .failure();
    Ok(())
}
