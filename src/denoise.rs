use crate::{
    config::DenoiserConfig,
    grid::{partition, TrimCombo},
    observe::SweepObserver,
    open,
    table::{AbundanceTable, TextTable},
};
use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use kseq::parse_reader;
use log::debug;
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use walkdir::WalkDir;

pub const FEATURE_TABLE: &str = "feature-table.tsv";
pub const REPRESENTATIVE_SEQUENCES: &str = "representative-sequences.fasta";
pub const STATS: &str = "stats.tsv";

/// Prefix of the hidden scratch directories of a combo. Labels never
/// contain "~", so ".250~" cannot match ".250-200~".
fn scratch_prefix(combo: TrimCombo) -> String {
    format!(".{}~", combo.label())
}

/// The three outputs of denoising one combo, all in one directory
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseArtifacts {
    pub combo: TrimCombo,
    pub feature_table: PathBuf,
    pub representative_sequences: PathBuf,
    pub stats: PathBuf,
}

impl DenoiseArtifacts {
    pub fn in_dir(combo: TrimCombo, dir: &Path) -> Self {
        DenoiseArtifacts {
            combo,
            feature_table: dir.join(FEATURE_TABLE),
            representative_sequences: dir.join(REPRESENTATIVE_SEQUENCES),
            stats: dir.join(STATS),
        }
    }

    fn paths(&self) -> [&PathBuf; 3] {
        [&self.feature_table, &self.representative_sequences, &self.stats]
    }

    pub fn all_exist(&self) -> bool {
        self.paths().iter().all(|p| p.is_file())
    }

    fn missing(&self) -> Vec<String> {
        self.paths()
            .iter()
            .filter(|p| !p.is_file())
            .flat_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect()
    }

    pub fn load_table(&self) -> Result<AbundanceTable> {
        AbundanceTable::read(&self.feature_table)
    }

    /// Feature id to nucleotide sequence
    pub fn load_sequences(&self) -> Result<HashMap<String, String>> {
        let mut reader = parse_reader(open(&self.representative_sequences)?)?;
        let mut seqs = HashMap::new();
        while let Some(rec) = reader.iter_record()? {
            seqs.insert(rec.head().to_string(), rec.seq().to_string());
        }
        Ok(seqs)
    }
}

/// Runs the denoising algorithm for one combo. A successful return
/// means `outdir` holds the three artifact files.
pub trait Denoiser: Sync {
    fn denoise(&self, combo: TrimCombo, manifest: &Path, outdir: &Path) -> Result<()>;
}

/// Denoises by running an external program
#[derive(Debug, Clone)]
pub struct CommandDenoiser {
    program: PathBuf,
    args: Vec<String>,
    config: DenoiserConfig,
}

impl CommandDenoiser {
    pub fn new(config: &DenoiserConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("The denoiser command is empty"))?;
        let program = which::which(program)
            .map_err(|e| anyhow!(r#"Cannot find denoiser "{program}": {e}"#))?;

        Ok(CommandDenoiser {
            program,
            args: args.to_vec(),
            config: config.clone(),
        })
    }

    fn command_args(&self, combo: TrimCombo, manifest: &Path, outdir: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend_from_slice(&[
            "--manifest".to_string(),
            manifest.to_string_lossy().to_string(),
            "--trunc-len-f".to_string(),
            combo.forward.to_string(),
        ]);
        if let Some(rev) = combo.reverse {
            args.extend_from_slice(&["--trunc-len-r".to_string(), rev.to_string()]);
        }
        args.extend_from_slice(&[
            "--trunc-q".to_string(),
            self.config.trunc_q.to_string(),
            "--max-ee-f".to_string(),
            self.config.max_ee_f.to_string(),
        ]);
        if combo.reverse.is_some() {
            args.extend_from_slice(&[
                "--max-ee-r".to_string(),
                self.config.max_ee_r.to_string(),
            ]);
        }
        args.extend_from_slice(&[
            "--n-reads-learn".to_string(),
            self.config.n_reads_learn.to_string(),
            "--chimera-method".to_string(),
            self.config.chimera_method.clone(),
            "--outdir".to_string(),
            outdir.to_string_lossy().to_string(),
        ]);
        args
    }
}

impl Denoiser for CommandDenoiser {
    fn denoise(&self, combo: TrimCombo, manifest: &Path, outdir: &Path) -> Result<()> {
        let args = self.command_args(combo, manifest, outdir);
        debug!(r#"Running "{} {}""#, self.program.display(), args.join(" "));

        let res = Command::new(&self.program).args(&args).output()?;
        if !res.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                res.status,
                String::from_utf8_lossy(&res.stderr).trim()
            );
        }
        Ok(())
    }
}

/// What happened to one combo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Cached,
    Denoised,
}

#[derive(Debug, Clone, Default)]
pub struct DenoiseSummary {
    pub artifacts: Vec<DenoiseArtifacts>,
    pub cache_hits: usize,
    pub denoised: usize,
}

/// Denoises each combo at most once: a combo whose directory already
/// holds all three artifacts is never handed to the denoiser again.
pub struct DenoiseJobCache<'a> {
    root: PathBuf,
    manifest: PathBuf,
    denoiser: &'a dyn Denoiser,
    observer: &'a dyn SweepObserver,
}

impl<'a> DenoiseJobCache<'a> {
    pub fn new(
        root: &Path,
        manifest: &Path,
        denoiser: &'a dyn Denoiser,
        observer: &'a dyn SweepObserver,
    ) -> Self {
        DenoiseJobCache {
            root: root.to_path_buf(),
            manifest: manifest.to_path_buf(),
            denoiser,
            observer,
        }
    }

    pub fn artifacts(&self, combo: TrimCombo) -> DenoiseArtifacts {
        DenoiseArtifacts::in_dir(combo, &self.root.join(combo.label()))
    }

    // --------------------------------------------------
    /// Make sure the artifacts of `combo` exist, denoising if needed.
    ///
    /// The denoiser writes into a scratch directory beside the final one,
    /// which is renamed into place once all three files are there. An
    /// interrupted or failed run therefore never leaves a complete-looking
    /// combo directory behind.
    pub fn ensure(&self, combo: TrimCombo) -> Result<JobOutcome> {
        let artifacts = self.artifacts(combo);
        if artifacts.all_exist() {
            self.observer.cache_hit(combo);
            return Ok(JobOutcome::Cached);
        }

        self.observer.combo_started(combo);
        fs::create_dir_all(&self.root)?;
        self.remove_stale_scratch(combo)?;
        let scratch = tempfile::Builder::new()
            .prefix(&scratch_prefix(combo))
            .tempdir_in(&self.root)?;

        self.denoiser
            .denoise(combo, &self.manifest, scratch.path())
            .with_context(|| format!("Denoising failed for {combo}"))?;

        let staged = DenoiseArtifacts::in_dir(combo, scratch.path());
        if !staged.all_exist() {
            bail!(
                "Denoising {combo} did not produce {}",
                staged.missing().join(", ")
            );
        }

        let final_dir = self.root.join(combo.label());
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        let scratch = scratch.keep();
        fs::rename(&scratch, &final_dir).map_err(|e| {
            anyhow!(
                "Cannot move {} to {}: {e}",
                scratch.display(),
                final_dir.display()
            )
        })?;

        self.observer.combo_denoised(combo);
        Ok(JobOutcome::Denoised)
    }

    /// Scratch directories of `combo` left behind by a killed run
    fn remove_stale_scratch(&self, combo: TrimCombo) -> Result<()> {
        let prefix = scratch_prefix(combo);
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry?;
            if entry.file_type().is_dir()
                && entry.file_name().to_string_lossy().starts_with(&prefix)
            {
                debug!("Removing stale {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------
    /// Denoise all the combos with a pool of `min(workers, max_batches)`
    /// threads, each working through its own batch in order. Returns only
    /// after every batch is done. Failed combos do not stop the other
    /// workers; they are reported together at the end.
    pub fn run_all(
        &self,
        combos: &[TrimCombo],
        workers: usize,
        max_batches: usize,
    ) -> Result<DenoiseSummary> {
        let batches = partition(combos, workers, max_batches);
        debug!(
            "Denoise batches: {}",
            batches
                .iter()
                .map(|b| b.iter().map(|c| c.label()).join(","))
                .join(" | ")
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(batches.len().max(1))
            .build()?;

        let outcomes: Vec<(TrimCombo, Result<JobOutcome>)> = pool.install(|| {
            batches
                .par_iter()
                .map(|batch| {
                    batch
                        .iter()
                        .map(|&combo| {
                            let res = self.ensure(combo);
                            if let Err(e) = &res {
                                self.observer.combo_failed(combo, e);
                            }
                            (combo, res)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
                .into_iter()
                .flatten()
                .collect()
        });

        let mut summary = DenoiseSummary::default();
        let mut failures = vec![];
        for (combo, res) in outcomes {
            match res {
                Ok(JobOutcome::Cached) => summary.cache_hits += 1,
                Ok(JobOutcome::Denoised) => summary.denoised += 1,
                Err(e) => {
                    failures.push(format!("{}: {e:#}", combo.label()));
                    continue;
                }
            }
            summary.artifacts.push(self.artifacts(combo));
        }

        if !failures.is_empty() {
            bail!(
                "Denoising failed for {} of {} combos:\n{}",
                failures.len(),
                combos.len(),
                failures.join("\n")
            );
        }

        summary.artifacts.sort_by_key(|a| a.combo);
        Ok(summary)
    }
}

// --------------------------------------------------
/// Stack the per-combo stats tables, tagging rows with their combo
pub fn collect_stats(artifacts: &[DenoiseArtifacts], outpath: &Path) -> Result<()> {
    let tables = artifacts
        .iter()
        .map(|a| {
            let table = TextTable::read(&a.stats)?;
            Ok(table.tagged(&[
                ("forward", a.combo.forward.to_string()),
                (
                    "reverse",
                    a.combo.reverse.map(|r| r.to_string()).unwrap_or_default(),
                ),
            ]))
        })
        .collect::<Result<Vec<_>>>()?;

    TextTable::concat(&tables).write(outpath)
}
