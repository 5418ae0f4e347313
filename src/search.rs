use crate::{
    config::SearchConfig,
    denoise::DenoiseArtifacts,
    grid::TrimCombo,
    inputs::ReferenceSet,
    matcher::{read_hits, write_hits, AlignmentHit, HitRecord},
    observe::SweepObserver,
    open_for_write,
};
use anyhow::{anyhow, bail, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

const OUTFMT: &str = "6 qseqid sseqid pident bitscore qcovs";

/// Aligns query sequences against a reference database
pub trait AlignmentSearch {
    /// Build whatever index the search needs for `db`
    fn prepare(&self, _db: &Path) -> Result<()> {
        Ok(())
    }

    fn search(&self, queries: &Path, db: &Path) -> Result<Vec<AlignmentHit>>;
}

/// NCBI BLAST+ nucleotide search
#[derive(Debug, Clone)]
pub struct BlastnSearch {
    blastn: PathBuf,
    makeblastdb: PathBuf,
}

impl BlastnSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Ok(BlastnSearch {
            blastn: find_program(&config.blastn)?,
            makeblastdb: find_program(&config.makeblastdb)?,
        })
    }
}

// --------------------------------------------------
fn find_program(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|e| anyhow!(r#"Cannot find "{name}": {e}"#))
}

impl AlignmentSearch for BlastnSearch {
    fn prepare(&self, db: &Path) -> Result<()> {
        let mut index = db.as_os_str().to_owned();
        index.push(".nin");
        if Path::new(&index).exists() {
            debug!("BLAST index exists for {}", db.display());
            return Ok(());
        }

        info!(r#"Running "{} -dbtype nucl -in {}""#, self.makeblastdb.display(), db.display());
        let res = Command::new(&self.makeblastdb)
            .args(["-dbtype", "nucl", "-in"])
            .arg(db)
            .output()?;
        if !res.status.success() {
            bail!(
                "makeblastdb failed for {}: {}",
                db.display(),
                String::from_utf8_lossy(&res.stderr).trim()
            );
        }
        Ok(())
    }

    fn search(&self, queries: &Path, db: &Path) -> Result<Vec<AlignmentHit>> {
        debug!(
            r#"Running "{} -query {} -db {} -outfmt '{OUTFMT}'""#,
            self.blastn.display(),
            queries.display(),
            db.display()
        );
        let res = Command::new(&self.blastn)
            .arg("-query")
            .arg(queries)
            .arg("-db")
            .arg(db)
            .args(["-outfmt", OUTFMT])
            .output()?;
        if !res.status.success() {
            bail!(
                "blastn failed: {}",
                String::from_utf8_lossy(&res.stderr).trim()
            );
        }

        parse_outfmt6(&res.stdout)
    }
}

// --------------------------------------------------
/// Parse headerless tab-separated hits in the `OUTFMT` column order
pub fn parse_outfmt6(output: &[u8]) -> Result<Vec<AlignmentHit>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(output);
    let hits: Result<Vec<AlignmentHit>, _> = reader.deserialize().collect();
    Ok(hits?)
}

/// How many sequences of a combo were searched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCount {
    pub forward: u32,
    pub reverse: Option<u32>,
    pub nqueries: usize,
}

impl QueryCount {
    pub fn combo(&self) -> TrimCombo {
        TrimCombo {
            forward: self.forward,
            reverse: self.reverse,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub hits: Vec<HitRecord>,
    pub queries: Vec<QueryCount>,
}

impl SearchResults {
    /// References `combo` still has to be searched against. A combo
    /// without queries needs nothing; one never counted needs them all.
    /// A threshold counts as searched once it has a hit for the combo.
    fn unsearched<'r>(
        &self,
        combo: TrimCombo,
        references: &'r [ReferenceSet],
    ) -> Vec<&'r ReferenceSet> {
        match self.queries.iter().find(|q| q.combo() == combo) {
            None => references.iter().collect(),
            Some(count) if count.nqueries == 0 => vec![],
            Some(_) => references
                .iter()
                .filter(|r| {
                    !self.hits.iter().any(|h| {
                        h.combo() == combo && h.perc_identity == r.perc_identity
                    })
                })
                .collect(),
        }
    }

    /// Only the rows of the given combos and thresholds
    fn restricted(
        &self,
        artifacts: &[DenoiseArtifacts],
        references: &[ReferenceSet],
    ) -> SearchResults {
        let combos: HashSet<TrimCombo> = artifacts.iter().map(|a| a.combo).collect();
        let thresholds: HashSet<&str> = references
            .iter()
            .map(|r| r.perc_identity.as_str())
            .collect();

        SearchResults {
            hits: self
                .hits
                .iter()
                .filter(|h| {
                    combos.contains(&h.combo())
                        && thresholds.contains(h.perc_identity.as_str())
                })
                .cloned()
                .collect(),
            queries: self
                .queries
                .iter()
                .filter(|q| combos.contains(&q.combo()))
                .cloned()
                .collect(),
        }
    }
}

// --------------------------------------------------
/// Write the sequences of the features seen in any mock sample to a
/// FASTA file. Returns the number written.
pub fn write_queries(
    artifacts: &DenoiseArtifacts,
    mock_samples: &[String],
    outpath: &Path,
) -> Result<usize> {
    let table = artifacts.load_table()?;
    let seqs = artifacts.load_sequences()?;
    let mut output = open_for_write(outpath)?;

    let mut count = 0;
    for (feature, total) in table.row_sums(mock_samples) {
        if total > 0. {
            let seq = seqs.get(feature).ok_or_else(|| {
                anyhow!(
                    "{}: no representative sequence for {feature}",
                    artifacts.combo
                )
            })?;
            writeln!(output, ">{feature}\n{seq}")?;
            count += 1;
        }
    }

    Ok(count)
}

/// Runs the searches of a sweep, or reloads them from an earlier run
pub struct SearchRunner<'a> {
    pub evaldir: PathBuf,
    pub search: &'a dyn AlignmentSearch,
    pub observer: &'a dyn SweepObserver,
}

impl SearchRunner<'_> {
    pub fn hits_path(&self) -> PathBuf {
        self.evaldir.join("hits.tsv")
    }

    pub fn queries_path(&self) -> PathBuf {
        self.evaldir.join("queries.tsv")
    }

    // --------------------------------------------------
    /// Search the mock features of every combo against every reference
    /// set. Results from earlier runs are read back from the hit and
    /// query-count tables, and only the (combo, threshold) pairs they
    /// do not cover are searched. Both tables are rewritten when
    /// anything new was searched.
    pub fn run(
        &self,
        artifacts: &[DenoiseArtifacts],
        references: &[ReferenceSet],
        mock_samples: &[String],
    ) -> Result<SearchResults> {
        let (hits_path, queries_path) = (self.hits_path(), self.queries_path());
        let mut results = if hits_path.is_file() && queries_path.is_file() {
            info!(r#"Reading search results from "{}""#, self.evaldir.display());
            SearchResults {
                hits: read_hits(&hits_path)?,
                queries: read_query_counts(&queries_path)?,
            }
        } else {
            SearchResults::default()
        };

        let pending: Vec<(&DenoiseArtifacts, Vec<&ReferenceSet>)> = artifacts
            .iter()
            .map(|art| (art, results.unsearched(art.combo, references)))
            .filter(|(_, refs)| !refs.is_empty())
            .collect();
        if pending.is_empty() {
            info!("All combos and thresholds already searched");
            return Ok(results.restricted(artifacts, references));
        }

        fs::create_dir_all(&self.evaldir)?;
        let needed: BTreeMap<&str, &ReferenceSet> = pending
            .iter()
            .flat_map(|(_, refs)| refs.iter().map(|r| (r.perc_identity.as_str(), *r)))
            .collect();
        for reference in needed.values() {
            self.search
                .prepare(&reference.sequences)
                .with_context(|| format!("perc_identity={}", reference.perc_identity))?;
        }

        for (art, refs) in pending {
            let combo = art.combo;
            let fasta = self.evaldir.join(format!("{}_toblast.fa", combo.label()));
            let nqueries = write_queries(art, mock_samples, &fasta)?;
            if !results.queries.iter().any(|q| q.combo() == combo) {
                results.queries.push(QueryCount {
                    forward: combo.forward,
                    reverse: combo.reverse,
                    nqueries,
                });
            }

            for reference in refs {
                let hits = if nqueries > 0 {
                    self.search_one(combo, reference, &fasta)?
                } else {
                    vec![]
                };
                self.observer
                    .search_complete(combo, &reference.perc_identity, hits.len());
                results.hits.extend(
                    hits.into_iter()
                        .map(|hit| HitRecord::new(combo, &reference.perc_identity, hit)),
                );
            }
            fs::remove_file(&fasta)?;
        }

        // Queries last: its presence marks the hits table as complete
        write_hits(&results.hits, &hits_path)?;
        write_query_counts(&results.queries, &queries_path)?;
        Ok(results.restricted(artifacts, references))
    }

    fn search_one(
        &self,
        combo: TrimCombo,
        reference: &ReferenceSet,
        fasta: &Path,
    ) -> Result<Vec<AlignmentHit>> {
        self.search
            .search(fasta, &reference.sequences)
            .with_context(|| {
                format!(
                    "Search failed for {combo}, perc_identity={}",
                    reference.perc_identity
                )
            })
    }
}

// --------------------------------------------------
fn read_query_counts(path: &Path) -> Result<Vec<QueryCount>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;
    let counts: Result<Vec<QueryCount>, _> = reader.deserialize().collect();
    Ok(counts?)
}

// --------------------------------------------------
fn write_query_counts(counts: &[QueryCount], path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_writer(open_for_write(path)?);
    for count in counts {
        wtr.serialize(count)?;
    }
    wtr.flush()?;
    Ok(())
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{parse_outfmt6, write_queries, AlignmentSearch, SearchRunner};
    use crate::{
        denoise::DenoiseArtifacts,
        grid::TrimCombo,
        inputs::ReferenceSet,
        matcher::AlignmentHit,
        observe::LogObserver,
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, fs, path::Path};
    use tempfile::tempdir;

    struct OneHitSearch {
        calls: Cell<usize>,
    }

    impl AlignmentSearch for OneHitSearch {
        fn search(&self, queries: &Path, _db: &Path) -> Result<Vec<AlignmentHit>> {
            self.calls.set(self.calls.get() + 1);
            let text = fs::read_to_string(queries)?;
            Ok(text
                .lines()
                .filter_map(|l| l.strip_prefix('>'))
                .map(|id| AlignmentHit {
                    qseqid: id.to_string(),
                    sseqid: "ref1".to_string(),
                    pident: 100.,
                    bitscore: 50.,
                    qcovs: 100.,
                })
                .collect())
        }
    }

    fn artifacts(dir: &Path) -> Result<DenoiseArtifacts> {
        artifacts_for(TrimCombo::paired(250, 200), dir)
    }

    fn artifacts_for(combo: TrimCombo, dir: &Path) -> Result<DenoiseArtifacts> {
        fs::create_dir_all(dir)?;
        let art = DenoiseArtifacts::in_dir(combo, dir);
        fs::copy("tests/inputs/feature-table.tsv", &art.feature_table)?;
        fs::write(
            &art.representative_sequences,
            ">asv1\nACGT\n>asv2\nGGCC\n>asv3\nTTTT\n>asv4\nAAAA\n",
        )?;
        fs::write(&art.stats, "sample-id\tinput\nmock1\t1\n")?;
        Ok(art)
    }

    #[test]
    fn test_parse_outfmt6() -> Result<()> {
        let hits = parse_outfmt6(b"asv1\tref1\t99.5\t230\t100\nasv1\tref2\t97.0\t210\t98\n")?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].sseqid, "ref2");
        assert_eq!(hits[0].pident, 99.5);
        assert!(parse_outfmt6(b"asv1\tref1\tnot-a-number\t1\t1\n").is_err());
        Ok(())
    }

    #[test]
    fn test_write_queries() -> Result<()> {
        let dir = tempdir()?;
        let art = artifacts(dir.path())?;
        let fasta = dir.path().join("queries.fa");

        // asv3 is only in sample1
        let mocks = vec!["mock1".to_string(), "mock2".to_string()];
        assert_eq!(write_queries(&art, &mocks, &fasta)?, 3);
        let text = fs::read_to_string(&fasta)?;
        assert!(!text.contains(">asv3"));
        Ok(())
    }

    fn reference(dir: &Path, perc_identity: &str) -> ReferenceSet {
        ReferenceSet {
            perc_identity: perc_identity.to_string(),
            sequences: dir.join(format!("{perc_identity}.fasta")),
            abundances: dir.join(format!("{perc_identity}.tsv")),
        }
    }

    #[test]
    fn test_runner_reuses_tables() -> Result<()> {
        let dir = tempdir()?;
        let art = artifacts(dir.path())?;
        let refs = vec![reference(dir.path(), "97"), reference(dir.path(), "99")];
        let search = OneHitSearch { calls: Cell::new(0) };
        let observer = LogObserver;
        let runner = SearchRunner {
            evaldir: dir.path().join("evaluated"),
            search: &search,
            observer: &observer,
        };

        let mocks = vec!["mock1".to_string()];
        let results = runner.run(&[art.clone()], &refs, &mocks)?;
        assert_eq!(search.calls.get(), 2);
        assert_eq!(results.hits.len(), 6);
        assert_eq!(results.queries[0].nqueries, 3);
        assert!(!runner.evaldir.join("250-200_toblast.fa").exists());

        let again = runner.run(&[art], &refs, &mocks)?;
        assert_eq!(search.calls.get(), 2);
        assert_eq!(again.hits, results.hits);
        assert_eq!(again.queries, results.queries);
        Ok(())
    }

    #[test]
    fn test_runner_searches_new_combos() -> Result<()> {
        let dir = tempdir()?;
        let first = artifacts_for(TrimCombo::paired(250, 200), &dir.path().join("a"))?;
        let second = artifacts_for(TrimCombo::paired(240, 200), &dir.path().join("b"))?;
        let refs = vec![reference(dir.path(), "97")];
        let search = OneHitSearch { calls: Cell::new(0) };
        let observer = LogObserver;
        let runner = SearchRunner {
            evaldir: dir.path().join("evaluated"),
            search: &search,
            observer: &observer,
        };
        let mocks = vec!["mock1".to_string()];

        runner.run(&[first.clone()], &refs, &mocks)?;
        assert_eq!(search.calls.get(), 1);

        // Only the added combo is searched
        let results = runner.run(&[first.clone(), second.clone()], &refs, &mocks)?;
        assert_eq!(search.calls.get(), 2);
        assert_eq!(results.queries.len(), 2);
        assert_eq!(
            results
                .hits
                .iter()
                .filter(|h| h.combo() == TrimCombo::paired(240, 200))
                .count(),
            3
        );

        // Only the added threshold is searched, for both combos
        let refs = vec![reference(dir.path(), "97"), reference(dir.path(), "99")];
        let results = runner.run(&[first.clone(), second], &refs, &mocks)?;
        assert_eq!(search.calls.get(), 4);
        assert_eq!(results.hits.len(), 12);

        // A smaller run reuses the tables and sees only its own rows
        let results = runner.run(&[first], &refs[..1], &mocks)?;
        assert_eq!(search.calls.get(), 4);
        assert_eq!(results.hits.len(), 3);
        assert_eq!(results.queries.len(), 1);
        Ok(())
    }
}
