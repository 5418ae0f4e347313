use crate::{
    config::Config,
    denoise::{collect_stats, DenoiseJobCache, Denoiser},
    evaluate::{write_accuracy, AccuracyAggregator, CompositionEvaluator},
    grid::{partition, plan_combos, TrimCombo},
    inputs::{discover_references, read_metadata, write_manifest},
    matcher::{resolve_all, write_resolutions, ResolutionRecord},
    observe::SweepObserver,
    open_for_write,
    search::{AlignmentSearch, SearchRunner},
    taxonomy::LineageLookup,
};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local};
use log::{debug, info};
use serde::Serialize;
use std::{fs, path::PathBuf};

/// The external tools a sweep talks to, and who hears about it
pub struct Collaborators<'a> {
    pub denoiser: &'a dyn Denoiser,
    pub search: &'a dyn AlignmentSearch,
    pub evaluator: &'a dyn CompositionEvaluator,
    pub observer: &'a dyn SweepObserver,
}

/// Written to `summary.json` at the end of a sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub outdir: PathBuf,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub combos: usize,
    pub cache_hits: usize,
    pub denoised: usize,
    pub thresholds: Vec<String>,
    pub mock_samples: Vec<String>,
    pub records: usize,
}

/// Trimming combinations and the batches the workers would take
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub combos: Vec<TrimCombo>,
    pub batches: Vec<Vec<TrimCombo>>,
}

// --------------------------------------------------
pub fn plan(config: &Config) -> Result<Plan> {
    let combos = plan_combos(&config.trim.spec(), config.trim.single_end)?;
    let batches = partition(&combos, config.workers, config.max_batches);
    Ok(Plan { combos, batches })
}

pub struct Sweep<'a> {
    config: Config,
    with: Collaborators<'a>,
}

impl<'a> Sweep<'a> {
    pub fn new(config: Config, with: Collaborators<'a>) -> Result<Self> {
        config.check()?;
        Ok(Sweep { config, with })
    }

    fn denoised_dir(&self) -> PathBuf {
        self.config.outdir.join("denoised")
    }

    fn evaluated_dir(&self) -> PathBuf {
        self.config.outdir.join("evaluated")
    }

    // --------------------------------------------------
    /// Denoise every combo, match the mock features to the references and
    /// evaluate each (combo, threshold, mock sample, level).
    ///
    /// Inputs are all checked before the first combo is denoised. Any
    /// step can be rerun: denoised combos and search results on disk are
    /// reused.
    pub fn run(&self) -> Result<SweepSummary> {
        let started = Local::now();
        let config = &self.config;
        fs::create_dir_all(self.denoised_dir())?;

        let Plan { combos, batches } = plan(config)?;
        info!("{} combos in {} batches", combos.len(), batches.len());
        let single_end = combos.iter().all(|c| c.reverse.is_none());

        let mock_samples = self.mock_samples()?;
        info!("Mock samples: {}", mock_samples.join(", "));
        let manifest = self.manifest(single_end)?;

        let references = discover_references(&config.reference_dir)?;
        let thresholds: Vec<String> =
            references.iter().map(|r| r.perc_identity.clone()).collect();
        info!("Reference thresholds: {}", thresholds.join(", "));
        let lookup = LineageLookup::from_file(
            &config.taxonomy_path(),
            config.ranks.clone(),
            &config.default_lineage,
        )?
        .with_expected_default(&config.expected_default_lineage);
        debug!("Loaded {} reference lineages", lookup.len());

        let cache = DenoiseJobCache::new(
            &self.denoised_dir(),
            &manifest,
            self.with.denoiser,
            self.with.observer,
        );
        let denoised = cache.run_all(&combos, config.workers, config.max_batches)?;
        collect_stats(&denoised.artifacts, &config.outdir.join("denoise-stats.tsv"))?;

        let evaldir = self.evaluated_dir();
        let runner = SearchRunner {
            evaldir: evaldir.clone(),
            search: self.with.search,
            observer: self.with.observer,
        };
        let searched = runner.run(&denoised.artifacts, &references, &mock_samples)?;

        let resolutions = resolve_all(&searched.hits)?;
        write_resolutions(
            &resolutions,
            open_for_write(&evaldir.join("resolutions.tsv"))?,
        )?;

        let mut aggregator = AccuracyAggregator::new(
            &evaldir,
            &references,
            &lookup,
            self.with.evaluator,
            self.with.observer,
        )?;
        for artifacts in &denoised.artifacts {
            let combo_resolutions: Vec<ResolutionRecord> = resolutions
                .iter()
                .filter(|r| r.combo() == artifacts.combo)
                .cloned()
                .collect();
            aggregator.evaluate_combo(artifacts, &combo_resolutions, &mock_samples)?;
        }

        let records = aggregator.into_records();
        write_accuracy(&records, &config.outdir)?;

        let summary = SweepSummary {
            outdir: config.outdir.clone(),
            started,
            finished: Local::now(),
            combos: combos.len(),
            cache_hits: denoised.cache_hits,
            denoised: denoised.denoised,
            thresholds,
            mock_samples,
            records: records.len(),
        };
        serde_json::to_writer_pretty(
            open_for_write(&config.outdir.join("summary.json"))?,
            &summary,
        )?;

        Ok(summary)
    }

    // --------------------------------------------------
    /// Configured mock samples, else the positive controls in the metadata
    fn mock_samples(&self) -> Result<Vec<String>> {
        let mut mocks = if self.config.mock_samples.is_empty() {
            match &self.config.metadata {
                Some(path) => read_metadata(path)?.mock_samples,
                None => vec![],
            }
        } else {
            self.config.mock_samples.clone()
        };

        if mocks.is_empty() {
            bail!("No mock samples given or found in the metadata");
        }
        mocks.sort();
        mocks.dedup();
        Ok(mocks)
    }

    // --------------------------------------------------
    /// The given manifest, or one built from the FASTQ directory for
    /// every sample in the metadata
    fn manifest(&self, single_end: bool) -> Result<PathBuf> {
        if let Some(manifest) = &self.config.manifest {
            if !manifest.is_file() {
                bail!(r#"Missing manifest "{}""#, manifest.display());
            }
            return Ok(manifest.clone());
        }

        let fastq_dir = self
            .config
            .fastq_dir
            .as_deref()
            .ok_or_else(|| anyhow!("Either manifest or fastq_dir is required"))?;
        let metadata = self
            .config
            .metadata
            .as_deref()
            .ok_or_else(|| anyhow!("metadata is required to build a manifest"))?;

        let outpath = self.denoised_dir().join("manifest.tsv");
        let samples = read_metadata(metadata)?.samples;
        write_manifest(&samples, fastq_dir, single_end, &outpath)?;
        Ok(outpath)
    }
}

// --------------------------------------------------
/// Summary of a finished sweep for the terminal
pub fn report(summary: &SweepSummary) -> String {
    format!(
        "Evaluated {} combos ({} denoised, {} reused) against {} thresholds: \
         {} records in \"{}\"",
        summary.combos,
        summary.denoised,
        summary.cache_hits,
        summary.thresholds.len(),
        summary.records,
        summary.outdir.display()
    )
}
