use anyhow::{bail, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// One trimming-length combination, the unit of work of the sweep.
/// Single-end runs carry no reverse length.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TrimCombo {
    pub forward: u32,
    pub reverse: Option<u32>,
}

impl TrimCombo {
    pub fn paired(forward: u32, reverse: u32) -> Self {
        TrimCombo {
            forward,
            reverse: Some(reverse),
        }
    }

    pub fn single(forward: u32) -> Self {
        TrimCombo {
            forward,
            reverse: None,
        }
    }

    /// Label used for directory names, e.g. "250-200" or "250"
    pub fn label(&self) -> String {
        match self.reverse {
            Some(rev) => format!("{}-{rev}", self.forward),
            None => self.forward.to_string(),
        }
    }
}

impl fmt::Display for TrimCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reverse {
            Some(rev) => write!(f, "fwd={} rev={rev}", self.forward),
            None => write!(f, "fwd={} (single-end)", self.forward),
        }
    }
}

/// How the trimming lengths were specified
#[derive(Debug, Clone, PartialEq)]
pub enum TrimSpec {
    /// Explicit (forward, reverse) pairs
    Pairs(Vec<(u32, u32)>),

    /// One list used for both the forward and the reverse reads
    Lengths(Vec<u32>),

    /// Separate forward and reverse lists, crossed
    Separate { forward: Vec<u32>, reverse: Vec<u32> },

    /// `min..max` by `step`, max excluded, used for both reads
    Range { min: u32, max: u32, step: u32 },
}

impl Default for TrimSpec {
    fn default() -> Self {
        TrimSpec::Range {
            min: 150,
            max: 250,
            step: 25,
        }
    }
}

// --------------------------------------------------
/// Expand a trimming specification into the ordered, de-duplicated
/// combos to evaluate.
pub fn plan_combos(spec: &TrimSpec, single_end: bool) -> Result<Vec<TrimCombo>> {
    let (forwards, reverses): (Vec<u32>, Vec<u32>) = match spec {
        TrimSpec::Pairs(pairs) => {
            if single_end {
                bail!("Trim pairs cannot be used in single-end mode");
            }
            let combos: BTreeSet<_> = pairs
                .iter()
                .map(|&(fwd, rev)| TrimCombo::paired(fwd, rev))
                .collect();
            return check_nonempty(combos.into_iter().collect());
        }
        TrimSpec::Lengths(lengths) => (lengths.clone(), lengths.clone()),
        TrimSpec::Separate { forward, reverse } => {
            (forward.clone(), reverse.clone())
        }
        TrimSpec::Range { min, max, step } => {
            if *step == 0 {
                bail!("Trim range step must be greater than zero");
            }
            if min >= max {
                bail!("Trim range min ({min}) must be lower than max ({max})");
            }
            let lengths: Vec<u32> = (*min..*max).step_by(*step as usize).collect();
            (lengths.clone(), lengths)
        }
    };

    // An empty reverse list means the reads are single-end
    let combos: BTreeSet<TrimCombo> = if single_end || reverses.is_empty() {
        forwards.into_iter().map(TrimCombo::single).collect()
    } else {
        forwards
            .into_iter()
            .cartesian_product(reverses)
            .map(|(fwd, rev)| TrimCombo::paired(fwd, rev))
            .collect()
    };

    check_nonempty(combos.into_iter().collect())
}

// --------------------------------------------------
fn check_nonempty(combos: Vec<TrimCombo>) -> Result<Vec<TrimCombo>> {
    if combos.is_empty() {
        bail!("No trimming combinations to evaluate");
    }
    Ok(combos)
}

// --------------------------------------------------
/// Split the combos into `min(workers, cap)` contiguous batches whose sizes
/// differ by at most one, the earlier batches taking the remainder.
/// Empty batches are dropped.
pub fn partition(
    combos: &[TrimCombo],
    workers: usize,
    cap: usize,
) -> Vec<Vec<TrimCombo>> {
    let num_batches = batch_count(workers, cap);
    let base = combos.len() / num_batches;
    let extra = combos.len() % num_batches;

    let mut batches = vec![];
    let mut start = 0;
    for i in 0..num_batches {
        let size = base + usize::from(i < extra);
        if size > 0 {
            batches.push(combos[start..start + size].to_vec());
        }
        start += size;
    }

    batches
}

// --------------------------------------------------
fn batch_count(workers: usize, cap: usize) -> usize {
    workers.min(cap).max(1)
}
