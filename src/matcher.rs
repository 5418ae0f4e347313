use crate::{grid::TrimCombo, open_for_write};
use anyhow::{anyhow, bail, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, io::Write, path::Path};

/// Resolved reference when several hits are best at identity and coverage
pub const MULTIPLE_PERFECT_HITS: &str = "MULTIPLE_PERFECT_HITS";

/// Resolved reference when several of the >80% hits share the top bitscore
pub const MULTIPLE_HITS: &str = "MULTIPLE_HITS";

/// Resolved reference when no best-identity/best-coverage hit has the
/// top bitscore
pub const BEST_HSP_SCORE_AMBIGUOUS: &str = "BEST_HSP_SCORE_AMBIGUOUS";

/// Resolved reference when no hit is above 80% identity
pub const OTHER: &str = "OTHER";

/// Identity above which hits that are best at only one criterion
/// are still considered
const MIN_PIDENT: f64 = 80.;

/// One alignment of a query sequence against a reference, as
/// reported by `-outfmt "6 qseqid sseqid pident bitscore qcovs"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentHit {
    pub qseqid: String,
    pub sseqid: String,
    pub pident: f64,
    pub bitscore: f64,
    pub qcovs: f64,
}

/// Why a query was resolved the way it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cause {
    MultiplePerfectHits,
    OnePerfectHit,
    Min80IsBest,
    Min80IsMultiple,
    LessThan80,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cause::MultiplePerfectHits => "MultiplePerfectHits",
            Cause::OnePerfectHit => "OnePerfectHit",
            Cause::Min80IsBest => "Min80IsBest",
            Cause::Min80IsMultiple => "Min80IsMultiple",
            Cause::LessThan80 => "LessThan80",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub reference: String,
    pub cause: Cause,
}

/// A hit tagged with the combo and identity threshold it was searched
/// under. This is the row format of the persisted hit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    pub forward: u32,
    pub reverse: Option<u32>,
    pub perc_identity: String,
    pub qseqid: String,
    pub sseqid: String,
    pub pident: f64,
    pub bitscore: f64,
    pub qcovs: f64,
}

impl HitRecord {
    pub fn new(combo: TrimCombo, perc_identity: &str, hit: AlignmentHit) -> Self {
        HitRecord {
            forward: combo.forward,
            reverse: combo.reverse,
            perc_identity: perc_identity.to_string(),
            qseqid: hit.qseqid,
            sseqid: hit.sseqid,
            pident: hit.pident,
            bitscore: hit.bitscore,
            qcovs: hit.qcovs,
        }
    }

    pub fn combo(&self) -> TrimCombo {
        TrimCombo {
            forward: self.forward,
            reverse: self.reverse,
        }
    }

    fn hit(&self) -> AlignmentHit {
        AlignmentHit {
            qseqid: self.qseqid.clone(),
            sseqid: self.sseqid.clone(),
            pident: self.pident,
            bitscore: self.bitscore,
            qcovs: self.qcovs,
        }
    }
}

/// One row of the resolution table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub forward: u32,
    pub reverse: Option<u32>,
    pub perc_identity: String,
    pub query: String,
    pub reference: String,
    pub cause: Cause,
}

impl ResolutionRecord {
    pub fn combo(&self) -> TrimCombo {
        TrimCombo {
            forward: self.forward,
            reverse: self.reverse,
        }
    }
}

// --------------------------------------------------
/// Pick the reference a query most likely comes from.
///
/// Ties are settled by how many hits share the best values, never by
/// the order of `hits`, so the result is the same for any permutation.
/// The hit set must not be empty: a query without any alignment is an
/// unmatched query and is handled by the caller.
pub fn resolve(hits: &[AlignmentHit]) -> Result<Resolution> {
    if hits.is_empty() {
        bail!("Cannot resolve a query without alignment hits");
    }

    let max_pident = max_of(hits, |hit| hit.pident);
    let max_qcovs = max_of(hits, |hit| hit.qcovs);
    let max_bitscore = max_of(hits, |hit| hit.bitscore);

    let both_best: Vec<_> = hits
        .iter()
        .filter(|hit| hit.pident == max_pident && hit.qcovs == max_qcovs)
        .collect();

    let resolution = match both_best[..] {
        [hit] => Resolution {
            reference: hit.sseqid.clone(),
            cause: Cause::OnePerfectHit,
        },
        [_, _, ..] => Resolution {
            reference: MULTIPLE_PERFECT_HITS.to_string(),
            cause: Cause::MultiplePerfectHits,
        },
        [] if max_pident > MIN_PIDENT => {
            let best_score: Vec<_> = hits
                .iter()
                .filter(|hit| hit.pident == max_pident || hit.qcovs == max_qcovs)
                .filter(|hit| hit.bitscore == max_bitscore)
                .collect();

            match best_score[..] {
                [hit] => Resolution {
                    reference: hit.sseqid.clone(),
                    cause: Cause::Min80IsBest,
                },
                [] => Resolution {
                    reference: BEST_HSP_SCORE_AMBIGUOUS.to_string(),
                    cause: Cause::Min80IsMultiple,
                },
                _ => Resolution {
                    reference: MULTIPLE_HITS.to_string(),
                    cause: Cause::Min80IsMultiple,
                },
            }
        }
        [] => Resolution {
            reference: OTHER.to_string(),
            cause: Cause::LessThan80,
        },
    };

    Ok(resolution)
}

// --------------------------------------------------
fn max_of(hits: &[AlignmentHit], value: impl Fn(&AlignmentHit) -> f64) -> f64 {
    hits.iter().map(value).fold(f64::NEG_INFINITY, f64::max)
}

// --------------------------------------------------
/// Resolve every (combo, threshold, query) group of a hit table.
/// The output is sorted by that key.
pub fn resolve_all(records: &[HitRecord]) -> Result<Vec<ResolutionRecord>> {
    let mut groups: BTreeMap<(TrimCombo, &str, &str), Vec<AlignmentHit>> =
        BTreeMap::new();
    for rec in records {
        groups
            .entry((rec.combo(), rec.perc_identity.as_str(), rec.qseqid.as_str()))
            .or_default()
            .push(rec.hit());
    }

    groups
        .into_iter()
        .map(|((combo, perc_identity, query), hits)| {
            let resolution = resolve(&hits).map_err(|e| {
                anyhow!("{combo}, perc_identity={perc_identity}, query={query}: {e}")
            })?;
            Ok(ResolutionRecord {
                forward: combo.forward,
                reverse: combo.reverse,
                perc_identity: perc_identity.to_string(),
                query: query.to_string(),
                reference: resolution.reference,
                cause: resolution.cause,
            })
        })
        .collect()
}

// --------------------------------------------------
pub fn read_hits(path: &Path) -> Result<Vec<HitRecord>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

    let mut hits = vec![];
    for res in reader.deserialize() {
        let rec: HitRecord =
            res.map_err(|e| anyhow!("{}: {e}", path.display()))?;
        hits.push(rec);
    }

    Ok(hits)
}

// --------------------------------------------------
pub fn write_hits(records: &[HitRecord], path: &Path) -> Result<()> {
    write_records(records, open_for_write(path)?)
}

// --------------------------------------------------
pub fn write_resolutions(records: &[ResolutionRecord], output: impl Write) -> Result<()> {
    write_records(records, output)
}

// --------------------------------------------------
pub fn read_resolutions(path: &Path) -> Result<Vec<ResolutionRecord>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;
    let records: Result<Vec<ResolutionRecord>, _> = reader.deserialize().collect();
    Ok(records?)
}

// --------------------------------------------------
fn write_records<T: Serialize>(records: &[T], output: impl Write) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_writer(output);
    for rec in records {
        wtr.serialize(rec)?;
    }
    wtr.flush()?;
    Ok(())
}
