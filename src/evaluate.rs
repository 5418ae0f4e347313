use crate::{
    config::EvaluatorConfig,
    denoise::DenoiseArtifacts,
    grid::TrimCombo,
    inputs::ReferenceSet,
    matcher::ResolutionRecord,
    observe::SweepObserver,
    open_for_write,
    table::{relative, AbundanceTable, TextTable},
    taxonomy::LineageLookup,
};
use anyhow::{anyhow, bail, Context, Result};
use csv::WriterBuilder;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
    process::Command,
};

pub const FALSE_NEGATIVES: &str = "false_negative_features.tsv";
pub const MISCLASSIFICATIONS: &str = "misclassifications.tsv";
pub const UNDERCLASSIFICATIONS: &str = "underclassifications.tsv";
pub const RESULTS: &str = "results.tsv";

/// Merged detail tables, in `EvaluationTables::iter` order
const OUTPUT_NAMES: [&str; 4] = [
    "false_negatives.tsv",
    "misclassifications.tsv",
    "underclassifications.tsv",
    "results.tsv",
];

/// Column holding the observed abundances handed to the evaluator
const OBSERVED_SAMPLE: &str = "mock";

/// Where a comparison is made: per resolved reference, or per lineage
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Asv,
    Taxonomy,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Asv => write!(f, "asv"),
            Level::Taxonomy => write!(f, "taxonomy"),
        }
    }
}

/// Identifies one evaluation: the primary key of the accuracy table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub combo: TrimCombo,
    pub perc_identity: String,
    pub mock_sample: String,
    pub level: Level,
}

impl CellKey {
    pub fn tags(&self) -> [(&'static str, String); 5] {
        [
            ("forward", self.combo.forward.to_string()),
            (
                "reverse",
                self.combo.reverse.map(|r| r.to_string()).unwrap_or_default(),
            ),
            ("perc_identity", self.perc_identity.clone()),
            ("mock_sample", self.mock_sample.clone()),
            ("level", self.level.to_string()),
        ]
    }

    fn dir_name(&self) -> String {
        format!(
            "clust-{}_{}_{}",
            self.perc_identity,
            self.mock_sample,
            self.combo.label()
        )
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, perc_identity={}, mock_sample={}, level={}",
            self.combo, self.perc_identity, self.mock_sample, self.level
        )
    }
}

/// The four tables the composition evaluator returns
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationTables {
    pub false_negatives: TextTable,
    pub misclassifications: TextTable,
    pub underclassifications: TextTable,
    pub results: TextTable,
}

impl EvaluationTables {
    /// Read the evaluator's output files from `dir`
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            if !path.is_file() {
                bail!("Evaluator did not produce {}", path.display());
            }
            TextTable::read(&path)
        };

        Ok(EvaluationTables {
            false_negatives: read(FALSE_NEGATIVES)?,
            misclassifications: read(MISCLASSIFICATIONS)?,
            underclassifications: read(UNDERCLASSIFICATIONS)?,
            results: read(RESULTS)?,
        })
    }

    /// The tables in `OUTPUT_NAMES` order
    pub fn iter(&self) -> impl Iterator<Item = &TextTable> {
        [
            &self.false_negatives,
            &self.misclassifications,
            &self.underclassifications,
            &self.results,
        ]
        .into_iter()
    }

    /// Replace every empty table with a single sentinel row
    pub fn padded(self) -> Self {
        EvaluationTables {
            false_negatives: sentinel_if_empty(self.false_negatives),
            misclassifications: sentinel_if_empty(self.misclassifications),
            underclassifications: sentinel_if_empty(self.underclassifications),
            results: sentinel_if_empty(self.results),
        }
    }
}

// --------------------------------------------------
/// An empty table becomes one row with `Taxon` = "None" and every other
/// column NaN, so the cell still shows up when the tables are grouped.
pub fn sentinel_if_empty(table: TextTable) -> TextTable {
    if !table.is_empty() {
        return table;
    }

    let mut headers = table.headers;
    if !headers.iter().any(|h| h.eq_ignore_ascii_case("taxon")) {
        headers.insert(0, "Taxon".to_string());
    }
    if headers.len() == 1 {
        headers.push(OBSERVED_SAMPLE.to_string());
    }

    let row = headers
        .iter()
        .map(|h| {
            if h.eq_ignore_ascii_case("taxon") {
                "None".to_string()
            } else {
                "NaN".to_string()
            }
        })
        .collect();

    TextTable {
        headers,
        rows: vec![row],
    }
}

/// Compares an observed composition to the expected one, down to
/// `depth` taxonomic ranks
pub trait CompositionEvaluator {
    fn evaluate(
        &self,
        expected: &Path,
        observed: &Path,
        depth: usize,
        outdir: &Path,
    ) -> Result<EvaluationTables>;
}

/// Evaluates by running an external program that writes the four
/// tables into `--outdir`
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("The evaluator command is empty"))?;
        let program = which::which(program)
            .map_err(|e| anyhow!(r#"Cannot find evaluator "{program}": {e}"#))?;
        Ok(CommandEvaluator {
            program,
            args: args.to_vec(),
        })
    }
}

impl CompositionEvaluator for CommandEvaluator {
    fn evaluate(
        &self,
        expected: &Path,
        observed: &Path,
        depth: usize,
        outdir: &Path,
    ) -> Result<EvaluationTables> {
        let res = Command::new(&self.program)
            .args(&self.args)
            .arg("--expected")
            .arg(expected)
            .arg("--observed")
            .arg(observed)
            .args(["--depth", &depth.to_string()])
            .arg("--outdir")
            .arg(outdir)
            .output()?;
        if !res.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                res.status,
                String::from_utf8_lossy(&res.stderr).trim()
            );
        }

        EvaluationTables::read_dir(outdir)
    }
}

/// The summary metrics of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub observed_count: f64,
    pub observed_expected_ratio: f64,
    pub tar: f64,
    pub tdr: f64,
    pub bray_curtis: f64,
    pub jaccard: f64,
    pub r_squared: f64,
    pub slope: f64,
    pub p_value: f64,
}

impl Metrics {
    pub fn nan() -> Self {
        Metrics {
            observed_count: f64::NAN,
            observed_expected_ratio: f64::NAN,
            tar: f64::NAN,
            tdr: f64::NAN,
            bray_curtis: f64::NAN,
            jaccard: f64::NAN,
            r_squared: f64::NAN,
            slope: f64::NAN,
            p_value: f64::NAN,
        }
    }

    /// Pull the metrics out of the results row for `depth`. A table
    /// with a `level` column has one row per level; without it the first
    /// row is used. Column names are matched ignoring case and
    /// punctuation; anything absent or unparsable is NaN.
    pub fn from_results(results: &TextTable, depth: usize) -> Self {
        let normalized: Vec<String> = results
            .headers
            .iter()
            .map(|h| {
                h.chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase()
            })
            .collect();

        let row = match normalized.iter().position(|h| h == "level") {
            Some(i) => results.rows.iter().find(|row| {
                row.get(i)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .is_some_and(|level| level == depth as f64)
            }),
            None => results.rows.first(),
        };

        let value = |aliases: &[&str]| -> f64 {
            normalized
                .iter()
                .position(|h| aliases.contains(&h.as_str()))
                .and_then(|i| row.and_then(|row| row.get(i)))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(f64::NAN)
        };

        Metrics {
            observed_count: value(&["observedtaxa", "observedfeatures", "observedcount"]),
            observed_expected_ratio: value(&[
                "observedexpectedtaxa",
                "observedexpectedfeatures",
                "observedexpectedratio",
            ]),
            tar: value(&["tar"]),
            tdr: value(&["tdr"]),
            bray_curtis: value(&["braycurtis"]),
            jaccard: value(&["jaccard"]),
            r_squared: value(&["rsquared"]),
            slope: value(&["slope"]),
            p_value: value(&["pvalue"]),
        }
    }
}

/// One evaluated cell of the sweep
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyRecord {
    pub key: CellKey,
    pub metrics: Metrics,
    pub tables: EvaluationTables,
}

impl AccuracyRecord {
    fn new(key: CellKey, tables: EvaluationTables, depth: usize) -> Self {
        let tables = tables.padded();
        AccuracyRecord {
            metrics: Metrics::from_results(&tables.results, depth),
            key,
            tables,
        }
    }
}

/// Row of `accuracy.tsv`
#[derive(Debug, Serialize)]
struct AccuracyRow<'a> {
    forward: u32,
    reverse: Option<u32>,
    perc_identity: &'a str,
    mock_sample: &'a str,
    level: Level,
    observed_count: f64,
    observed_expected_ratio: f64,
    tar: f64,
    tdr: f64,
    bray_curtis: f64,
    jaccard: f64,
    r_squared: f64,
    slope: f64,
    p_value: f64,
}

impl<'a> From<&'a AccuracyRecord> for AccuracyRow<'a> {
    fn from(rec: &'a AccuracyRecord) -> Self {
        let m = rec.metrics;
        AccuracyRow {
            forward: rec.key.combo.forward,
            reverse: rec.key.combo.reverse,
            perc_identity: &rec.key.perc_identity,
            mock_sample: &rec.key.mock_sample,
            level: rec.key.level,
            observed_count: m.observed_count,
            observed_expected_ratio: m.observed_expected_ratio,
            tar: m.tar,
            tdr: m.tdr,
            bray_curtis: m.bray_curtis,
            jaccard: m.jaccard,
            r_squared: m.r_squared,
            slope: m.slope,
            p_value: m.p_value,
        }
    }
}

/// Expected compositions of one reference set, at both levels
#[derive(Debug, Clone)]
pub struct ExpectedTables {
    pub asv: PathBuf,
    pub taxonomy: PathBuf,
}

/// Runs the evaluator over every (combo, threshold, mock sample, level)
/// cell and keeps the results
pub struct AccuracyAggregator<'a> {
    evaldir: PathBuf,
    evaluator: &'a dyn CompositionEvaluator,
    observer: &'a dyn SweepObserver,
    lookup: &'a LineageLookup,
    expected: BTreeMap<String, ExpectedTables>,
    records: Vec<AccuracyRecord>,
}

impl<'a> AccuracyAggregator<'a> {
    // --------------------------------------------------
    /// Prepare the expected tables of each reference set. The taxonomy
    /// level is the reference abundances rolled up by lineage.
    pub fn new(
        evaldir: &Path,
        references: &[ReferenceSet],
        lookup: &'a LineageLookup,
        evaluator: &'a dyn CompositionEvaluator,
        observer: &'a dyn SweepObserver,
    ) -> Result<Self> {
        let expected_dir = evaldir.join("expected");
        fs::create_dir_all(&expected_dir)?;

        let mut expected = BTreeMap::new();
        for reference in references {
            let asv = AbundanceTable::read(&reference.abundances)?;
            let taxonomy = expected_dir.join(format!("{}-taxonomy.tsv", reference.perc_identity));
            lookup
                .project_expected(&asv, lookup.full_depth())
                .write(&taxonomy)?;
            expected.insert(
                reference.perc_identity.clone(),
                ExpectedTables {
                    asv: reference.abundances.clone(),
                    taxonomy,
                },
            );
        }

        Ok(AccuracyAggregator {
            evaldir: evaldir.to_path_buf(),
            evaluator,
            observer,
            lookup,
            expected,
            records: vec![],
        })
    }

    // --------------------------------------------------
    /// Evaluate every mock sample of one combo at every threshold.
    ///
    /// `resolutions` are that combo's resolved queries. Features without
    /// a resolution (no alignment at all) keep their own id. Returns
    /// false, after telling the observer, when the combo's table lacks
    /// any of the mock samples.
    pub fn evaluate_combo(
        &mut self,
        artifacts: &DenoiseArtifacts,
        resolutions: &[ResolutionRecord],
        mock_samples: &[String],
    ) -> Result<bool> {
        let combo = artifacts.combo;
        let table = artifacts.load_table()?;

        let missing: Vec<_> = mock_samples
            .iter()
            .filter(|m| table.sample_index(m).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            self.observer.combo_skipped(
                combo,
                &format!("mock samples not in feature table: {}", missing.join(", ")),
            );
            return Ok(false);
        }

        let thresholds: Vec<String> = self.expected.keys().cloned().collect();
        for perc_identity in thresholds {
            let refs: HashMap<&str, &str> = resolutions
                .iter()
                .filter(|r| r.perc_identity == perc_identity)
                .map(|r| (r.query.as_str(), r.reference.as_str()))
                .collect();
            debug!("{combo}, perc_identity={perc_identity}: {} resolved queries", refs.len());

            let resolved = table.collapse(|feature| {
                refs.get(feature).copied().unwrap_or(feature).to_string()
            });

            for mock in mock_samples {
                let column: Vec<(String, f64)> = resolved
                    .column(mock)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, v)| *v > 0.)
                    .map(|(f, v)| (f.to_string(), v))
                    .collect();
                self.evaluate_sample(combo, &perc_identity, mock, &column)?;
            }
        }

        Ok(true)
    }

    // --------------------------------------------------
    fn evaluate_sample(
        &mut self,
        combo: TrimCombo,
        perc_identity: &str,
        mock: &str,
        column: &[(String, f64)],
    ) -> Result<()> {
        let key = |level| CellKey {
            combo,
            perc_identity: perc_identity.to_string(),
            mock_sample: mock.to_string(),
            level,
        };
        let (asv_key, tax_key) = (key(Level::Asv), key(Level::Taxonomy));

        let Some(rel) = relative(column) else {
            warn!("{combo}: mock sample {mock} has no reads, nothing to compare");
            for key in [asv_key, tax_key] {
                self.push(AccuracyRecord::new(key, EvaluationTables::default(), 1));
            }
            return Ok(());
        };

        let expected = self
            .expected
            .get(perc_identity)
            .cloned()
            .ok_or_else(|| anyhow!("No reference set for perc_identity={perc_identity}"))?;

        let observed = AbundanceTable::from_column("featureid", OBSERVED_SAMPLE, rel);
        let tables = self.run_cell(&asv_key, &expected.asv, &observed, 1)?;
        self.push(AccuracyRecord::new(asv_key, tables, 1));

        let depth = self.lookup.full_depth();
        let observed = self.lookup.project(&observed, depth);
        let tables = self.run_cell(&tax_key, &expected.taxonomy, &observed, depth)?;
        self.push(AccuracyRecord::new(tax_key, tables, depth));

        Ok(())
    }

    // --------------------------------------------------
    fn run_cell(
        &self,
        key: &CellKey,
        expected: &Path,
        observed: &AbundanceTable,
        depth: usize,
    ) -> Result<EvaluationTables> {
        let outdir = self
            .evaldir
            .join(key.level.to_string())
            .join(key.dir_name());
        fs::create_dir_all(&outdir)?;

        let observed_path = outdir.join("observed.tsv");
        observed.write(&observed_path)?;
        self.evaluator
            .evaluate(expected, &observed_path, depth, &outdir)
            .with_context(|| format!("Evaluation failed for {key}"))
    }

    fn push(&mut self, record: AccuracyRecord) {
        self.observer.cell_complete(&record.key);
        self.records.push(record);
    }

    pub fn records(&self) -> &[AccuracyRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AccuracyRecord> {
        self.records
    }
}

// --------------------------------------------------
/// Write `accuracy.tsv` plus the four long-form detail tables, every row
/// tagged with its cell key
pub fn write_accuracy(records: &[AccuracyRecord], outdir: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_writer(open_for_write(&outdir.join("accuracy.tsv"))?);
    for rec in records {
        wtr.serialize(AccuracyRow::from(rec))?;
    }
    wtr.flush()?;

    let mut merged: BTreeMap<&str, Vec<TextTable>> = OUTPUT_NAMES
        .iter()
        .map(|&name| (name, vec![]))
        .collect();
    for rec in records {
        let tags = rec.key.tags();
        for (name, table) in OUTPUT_NAMES.iter().zip(rec.tables.iter()) {
            if let Some(tables) = merged.get_mut(name) {
                tables.push(table.clone().tagged(&tags));
            }
        }
    }
    for (name, tables) in merged {
        TextTable::concat(&tables).write(&outdir.join(name))?;
    }

    Ok(())
}
