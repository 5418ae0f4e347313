use crate::open_for_write;
use anyhow::{anyhow, bail, Result};
use csv::ReaderBuilder;
use log::{debug, info};
use regex::Regex;
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// `control_type` value of the mock community samples
const MOCK_CONTROL_TYPE: &str = "control positive";

/// Sample metadata: one row per sample, keyed by `sample_name`
#[derive(Debug, Clone)]
pub struct Metadata {
    pub samples: Vec<String>,
    pub mock_samples: Vec<String>,
}

// --------------------------------------------------
pub fn read_metadata(path: &Path) -> Result<Metadata> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

    let headers = reader.headers()?.clone();
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!(r#"{}: missing "{name}" column"#, path.display()))
    };
    let name_col = find("sample_name")?;
    let control_col = find("control_type").ok();

    let mut samples = vec![];
    let mut mock_samples = vec![];
    for res in reader.records() {
        let rec = res?;
        let name = rec.get(name_col).unwrap_or_default().trim().to_string();
        if name.is_empty() {
            continue;
        }
        if control_col.and_then(|c| rec.get(c)) == Some(MOCK_CONTROL_TYPE) {
            mock_samples.push(name.clone());
        }
        samples.push(name);
    }

    Ok(Metadata {
        samples,
        mock_samples,
    })
}

// --------------------------------------------------
/// Find each sample's R1 (and R2) gzipped FASTQ under `fastq_dir` and
/// write the tab-separated manifest the denoiser imports.
pub fn write_manifest(
    samples: &[String],
    fastq_dir: &Path,
    single_end: bool,
    outpath: &Path,
) -> Result<()> {
    let files: Vec<PathBuf> = WalkDir::new(fastq_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    let mut found: BTreeMap<&str, (PathBuf, Option<PathBuf>)> = BTreeMap::new();
    for sample in samples {
        let r1 = find_read_file(&files, sample, "R1")?;
        let r2 = if single_end {
            None
        } else {
            Some(find_read_file(&files, sample, "R2")?)
        };
        found.insert(sample.as_str(), (r1, r2));
    }

    let mut output = open_for_write(outpath)?;
    if single_end {
        writeln!(output, "sample-id\tabsolute-filepath")?;
    } else {
        writeln!(
            output,
            "sample-id\tforward-absolute-filepath\treverse-absolute-filepath"
        )?;
    }

    for (sample, (r1, r2)) in found {
        match r2 {
            Some(r2) => writeln!(
                output,
                "{sample}\t{}\t{}",
                absolute(&r1)?.display(),
                absolute(&r2)?.display()
            )?,
            None => writeln!(output, "{sample}\t{}", absolute(&r1)?.display())?,
        }
    }

    info!(
        r#"Wrote manifest for {} samples to "{}""#,
        samples.len(),
        outpath.display()
    );
    Ok(())
}

// --------------------------------------------------
fn find_read_file(files: &[PathBuf], sample: &str, read: &str) -> Result<PathBuf> {
    let pattern = Regex::new(&format!(
        r"^{}.*_{read}_.*\.fastq\.gz$",
        regex::escape(sample)
    ))?;

    let mut matches: Vec<_> = files
        .iter()
        .filter(|f| {
            f.file_name()
                .map(|n| pattern.is_match(&n.to_string_lossy()))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();

    match matches.first() {
        Some(path) => Ok(path.to_path_buf()),
        _ => bail!(r#"No {read} FASTQ found for sample "{sample}""#),
    }
}

// --------------------------------------------------
fn absolute(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| anyhow!("Cannot resolve {}: {e}", path.display()))
}

/// The mock community references clustered at one percent identity
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    pub perc_identity: String,
    pub sequences: PathBuf,
    pub abundances: PathBuf,
}

// --------------------------------------------------
/// Each `<reference_dir>/clustering/<perc_identity>/` holding both a
/// `sequences.fasta` and a `relative_abundances.tsv` is one threshold.
pub fn discover_references(reference_dir: &Path) -> Result<Vec<ReferenceSet>> {
    let clustering = reference_dir.join("clustering");
    if !clustering.is_dir() {
        bail!(r#"Missing reference directory "{}""#, clustering.display());
    }

    let mut refs = vec![];
    for entry in WalkDir::new(&clustering)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let dir = entry.path();
        let sequences = dir.join("sequences.fasta");
        let abundances = dir.join("relative_abundances.tsv");
        if sequences.is_file() && abundances.is_file() {
            refs.push(ReferenceSet {
                perc_identity: entry.file_name().to_string_lossy().to_string(),
                sequences,
                abundances,
            });
        } else {
            debug!("Ignoring incomplete reference dir {}", dir.display());
        }
    }

    if refs.is_empty() {
        bail!(r#"No reference clusters found in "{}""#, clustering.display());
    }

    Ok(refs)
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{discover_references, read_metadata, write_manifest};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{fs, path::PathBuf};
    use tempfile::tempdir;

    #[test]
    fn test_read_metadata() -> Result<()> {
        let meta = read_metadata(&PathBuf::from("tests/inputs/metadata.tsv"))?;
        assert_eq!(meta.samples, vec!["mock1", "mock2", "sample1"]);
        assert_eq!(meta.mock_samples, vec!["mock1", "mock2"]);
        Ok(())
    }

    #[test]
    fn test_discover_references() -> Result<()> {
        let refs = discover_references(&PathBuf::from("tests/inputs/refs"))?;
        let labels: Vec<_> = refs.iter().map(|r| r.perc_identity.as_str()).collect();
        assert_eq!(labels, vec!["97", "99"]);
        assert!(refs[0].sequences.ends_with("clustering/97/sequences.fasta"));

        assert!(discover_references(&PathBuf::from("tests/inputs")).is_err());
        Ok(())
    }

    #[test]
    fn test_write_manifest() -> Result<()> {
        let dir = tempdir()?;
        for name in [
            "mock1_S1_L001_R1_001.fastq.gz",
            "mock1_S1_L001_R2_001.fastq.gz",
            "sample1_S2_L001_R1_001.fastq.gz",
            "sample1_S2_L001_R2_001.fastq.gz",
        ] {
            fs::write(dir.path().join(name), "")?;
        }

        let samples = vec!["sample1".to_string(), "mock1".to_string()];
        let outpath = dir.path().join("manifest.tsv");
        write_manifest(&samples, dir.path(), false, &outpath)?;

        let manifest = fs::read_to_string(&outpath)?;
        let lines: Vec<_> = manifest.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("mock1\t"));
        assert!(lines[1].ends_with("mock1_S1_L001_R2_001.fastq.gz"));

        let samples = vec!["missing".to_string()];
        let res = write_manifest(&samples, dir.path(), true, &outpath);
        assert_eq!(
            res.unwrap_err().to_string(),
            r#"No R1 FASTQ found for sample "missing""#
        );
        Ok(())
    }
}
