use crate::{grid::TrimSpec, taxonomy::EXPECTED_DEFAULT_LINEAGE};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

/// Sweep settings, read from a TOML file. Every key has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where all outputs go
    pub outdir: PathBuf,

    /// Manifest of the input read files; built from `fastq_dir` when absent
    pub manifest: Option<PathBuf>,

    /// Directory of trimmed, gzipped FASTQ files
    pub fastq_dir: Option<PathBuf>,

    /// Sample metadata with `sample_name` and `control_type` columns
    pub metadata: Option<PathBuf>,

    /// Mock samples; taken from the metadata when empty
    pub mock_samples: Vec<String>,

    /// Mock community references, one `clustering/<perc_identity>` per threshold
    pub reference_dir: PathBuf,

    /// Reference taxonomy table; defaults to `<reference_dir>/taxonomy.tsv`
    pub taxonomy: Option<PathBuf>,

    pub ranks: Vec<String>,

    /// Lineage given to observed references missing from the taxonomy
    pub default_lineage: String,

    /// Lineage given to expected references missing from the taxonomy
    pub expected_default_lineage: String,

    pub workers: usize,

    /// Upper bound on the number of parallel denoising batches
    pub max_batches: usize,

    pub trim: TrimConfig,
    pub denoiser: DenoiserConfig,
    pub search: SearchConfig,
    pub evaluator: EvaluatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            outdir: PathBuf::from("ampsweep-out"),
            manifest: None,
            fastq_dir: None,
            metadata: None,
            mock_samples: vec![],
            reference_dir: PathBuf::from("mock_refs"),
            taxonomy: None,
            ranks: ["d", "p", "c", "o", "f", "g", "s"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            default_lineage: "d__".to_string(),
            expected_default_lineage: EXPECTED_DEFAULT_LINEAGE.to_string(),
            workers: num_cpus::get(),
            max_batches: 4,
            trim: TrimConfig::default(),
            denoiser: DenoiserConfig::default(),
            search: SearchConfig::default(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| anyhow!("Bad config {}: {e}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.ranks.is_empty() {
            bail!("ranks cannot be empty");
        }
        if self.max_batches == 0 {
            bail!("max_batches must be greater than zero");
        }
        if self.manifest.is_none() && self.fastq_dir.is_none() {
            bail!("Either manifest or fastq_dir is required");
        }
        if self.mock_samples.is_empty() && self.metadata.is_none() {
            bail!("Either mock_samples or metadata is required");
        }
        Ok(())
    }

    pub fn taxonomy_path(&self) -> PathBuf {
        self.taxonomy
            .clone()
            .unwrap_or_else(|| self.reference_dir.join("taxonomy.tsv"))
    }
}

/// Trimming lengths. The first of `pairs`, `lengths`,
/// `forward`/`reverse` or `range` that is given wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrimConfig {
    pub pairs: Vec<(u32, u32)>,
    pub lengths: Vec<u32>,
    pub forward: Vec<u32>,
    pub reverse: Vec<u32>,
    pub range: Option<(u32, u32, u32)>,
    pub single_end: bool,
}

impl TrimConfig {
    pub fn spec(&self) -> TrimSpec {
        if !self.pairs.is_empty() {
            TrimSpec::Pairs(self.pairs.clone())
        } else if !self.lengths.is_empty() {
            TrimSpec::Lengths(self.lengths.clone())
        } else if !self.forward.is_empty() {
            TrimSpec::Separate {
                forward: self.forward.clone(),
                reverse: self.reverse.clone(),
            }
        } else if let Some((min, max, step)) = self.range {
            TrimSpec::Range { min, max, step }
        } else {
            TrimSpec::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DenoiserConfig {
    /// Program and leading arguments
    pub command: Vec<String>,
    pub trunc_q: u32,
    pub max_ee_f: f64,
    pub max_ee_r: f64,
    pub n_reads_learn: u64,
    pub chimera_method: String,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        DenoiserConfig {
            command: vec!["dada2-denoise".to_string()],
            trunc_q: 20,
            max_ee_f: 2.,
            max_ee_r: 2.,
            n_reads_learn: 1_000_000,
            chimera_method: "consensus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub blastn: String,
    pub makeblastdb: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            blastn: "blastn".to_string(),
            makeblastdb: "makeblastdb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    /// Program and leading arguments
    pub command: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        EvaluatorConfig {
            command: vec!["evaluate-composition".to_string()],
        }
    }
}
