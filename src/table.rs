use crate::open_for_write;
use anyhow::{anyhow, bail, Result};
use csv::{ReaderBuilder, WriterBuilder};
use itertools::Itertools;
use std::{collections::BTreeMap, path::Path};

/// A feature x sample abundance matrix, stored row-wise by feature.
/// Counts and relative frequencies are both held as `f64`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbundanceTable {
    pub index_name: String,
    pub features: Vec<String>,
    pub samples: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl AbundanceTable {
    /// Build a one-sample table from (feature, value) pairs
    pub fn from_column(
        index_name: &str,
        sample: &str,
        column: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let (features, values): (Vec<_>, Vec<_>) =
            column.into_iter().map(|(f, v)| (f, vec![v])).unzip();
        AbundanceTable {
            index_name: index_name.to_string(),
            features,
            samples: vec![sample.to_string()],
            values,
        }
    }

    pub fn sample_index(&self, sample: &str) -> Option<usize> {
        self.samples.iter().position(|s| s == sample)
    }

    /// (feature, value) pairs of one sample
    pub fn column(&self, sample: &str) -> Option<Vec<(&str, f64)>> {
        let idx = self.sample_index(sample)?;
        Some(
            self.features
                .iter()
                .zip(&self.values)
                .map(|(feature, row)| (feature.as_str(), row[idx]))
                .collect(),
        )
    }

    /// Sum of each feature across the given samples
    pub fn row_sums(&self, samples: &[String]) -> Vec<(&str, f64)> {
        let idxs: Vec<_> = samples
            .iter()
            .filter_map(|s| self.sample_index(s))
            .collect();
        self.features
            .iter()
            .zip(&self.values)
            .map(|(feature, row)| {
                (feature.as_str(), idxs.iter().map(|&i| row[i]).sum())
            })
            .collect()
    }

    /// Rename every feature and sum the rows that end up with the same
    /// name. Output features are sorted.
    pub fn collapse<F>(&self, rename: F) -> Self
    where
        F: Fn(&str) -> String,
    {
        let mut summed: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (feature, row) in self.features.iter().zip(&self.values) {
            let sums = summed
                .entry(rename(feature.as_str()))
                .or_insert_with(|| vec![0.; self.samples.len()]);
            for (acc, val) in sums.iter_mut().zip(row) {
                *acc += val;
            }
        }

        let (features, values) = summed.into_iter().unzip();
        AbundanceTable {
            index_name: self.index_name.clone(),
            features,
            samples: self.samples.clone(),
            values,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            bail!("{}: missing header", path.display());
        }
        let index_name = headers[0].to_string();
        let samples: Vec<String> =
            headers.iter().skip(1).map(|s| s.to_string()).collect();

        let mut features = vec![];
        let mut values = vec![];
        for (line, res) in reader.records().enumerate() {
            let rec = res?;
            features.push(rec[0].to_string());
            let row = rec
                .iter()
                .skip(1)
                .map(|v| parse_value(v))
                .collect::<Result<Vec<f64>>>()
                .map_err(|e| anyhow!("{} record {}: {e}", path.display(), line + 1))?;
            if row.len() != samples.len() {
                bail!(
                    "{} record {}: expected {} values, found {}",
                    path.display(),
                    line + 1,
                    samples.len(),
                    row.len()
                );
            }
            values.push(row);
        }

        Ok(AbundanceTable {
            index_name,
            features,
            samples,
            values,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(open_for_write(path)?);

        let mut header = vec![self.index_name.clone()];
        header.extend(self.samples.iter().cloned());
        wtr.write_record(&header)?;

        for (feature, row) in self.features.iter().zip(&self.values) {
            let mut rec = vec![feature.clone()];
            rec.extend(row.iter().map(|v| v.to_string()));
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;

        Ok(())
    }
}

// --------------------------------------------------
fn parse_value(val: &str) -> Result<f64> {
    match val.trim() {
        "" => Ok(f64::NAN),
        v => v.parse().map_err(|_| anyhow!(r#"invalid abundance "{v}""#)),
    }
}

// --------------------------------------------------
/// Scale a column to relative frequencies. A zero (or non-finite) total
/// cannot be scaled and yields `None`.
pub fn relative(column: &[(String, f64)]) -> Option<Vec<(String, f64)>> {
    let total: f64 = column.iter().map(|(_, v)| v).sum();
    if total > 0. && total.is_finite() {
        Some(
            column
                .iter()
                .map(|(f, v)| (f.to_string(), v / total))
                .collect(),
        )
    } else {
        None
    }
}

/// A tab-separated table kept as text, for collaborator outputs whose
/// columns are not known in advance
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TextTable {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

        let headers = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = vec![];
        for res in reader.records() {
            rows.push(res?.iter().map(|v| v.to_string()).collect());
        }

        Ok(TextTable { headers, rows })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_writer(open_for_write(path)?);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Append `(column, value)` tags to every row
    pub fn tagged(mut self, tags: &[(&str, String)]) -> Self {
        for (name, _) in tags {
            self.headers.push(name.to_string());
        }
        for row in self.rows.iter_mut() {
            row.resize(self.headers.len() - tags.len(), String::new());
            row.extend(tags.iter().map(|(_, value)| value.clone()));
        }
        self
    }

    /// Stack tables on top of each other. The columns are the union of
    /// all the headers in first-seen order; absent cells stay empty.
    pub fn concat(tables: &[TextTable]) -> Self {
        let headers: Vec<String> = tables
            .iter()
            .flat_map(|t| t.headers.iter().cloned())
            .unique()
            .collect();

        let mut rows = vec![];
        for table in tables {
            let positions: Vec<usize> = table
                .headers
                .iter()
                .filter_map(|h| headers.iter().position(|x| x == h))
                .collect();
            for row in &table.rows {
                let mut out = vec![String::new(); headers.len()];
                for (val, &pos) in row.iter().zip(&positions) {
                    out[pos] = val.clone();
                }
                rows.push(out);
            }
        }

        TextTable { headers, rows }
    }
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::{relative, AbundanceTable, TextTable};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn table() -> AbundanceTable {
        AbundanceTable {
            index_name: "featureid".to_string(),
            features: vec!["f1".into(), "f2".into(), "f3".into()],
            samples: vec!["mock1".into(), "s1".into()],
            values: vec![vec![10., 0.], vec![0., 5.], vec![30., 1.]],
        }
    }

    #[test]
    fn test_read_feature_table() -> Result<()> {
        let tab = AbundanceTable::read(&PathBuf::from(
            "tests/inputs/feature-table.tsv",
        ))?;
        assert_eq!(tab.samples, vec!["mock1", "mock2", "sample1"]);
        assert_eq!(tab.features.len(), 4);
        assert_eq!(tab.column("mock2").unwrap()[1], ("asv2", 20.));
        assert!(tab.column("missing").is_none());
        Ok(())
    }

    #[test]
    fn test_read_bad_value() -> Result<()> {
        let outdir = tempdir()?;
        let path = outdir.path().join("bad.tsv");
        std::fs::write(&path, "featureid\tmock\nf1\tabc\n")?;
        let res = AbundanceTable::read(&path);
        assert!(res.is_err());
        assert!(res.unwrap_err().to_string().contains("invalid abundance"));
        Ok(())
    }

    #[test]
    fn test_write_and_read() -> Result<()> {
        let outdir = tempdir()?;
        let path = outdir.path().join("table.tsv");
        let tab = table();
        tab.write(&path)?;
        assert_eq!(AbundanceTable::read(&path)?, tab);
        Ok(())
    }

    #[test]
    fn test_row_sums() {
        let tab = table();
        let sums = tab.row_sums(&["mock1".to_string(), "s1".to_string()]);
        assert_eq!(sums, vec![("f1", 10.), ("f2", 5.), ("f3", 31.)]);
    }

    #[test]
    fn test_collapse() {
        let tab = table().collapse(|f| {
            if f == "f3" { "f1".to_string() } else { f.to_string() }
        });
        assert_eq!(tab.features, vec!["f1", "f2"]);
        assert_eq!(tab.values, vec![vec![40., 1.], vec![0., 5.]]);
    }

    #[test]
    fn test_relative() {
        let col = vec![("a".to_string(), 1.), ("b".to_string(), 3.)];
        assert_eq!(
            relative(&col),
            Some(vec![("a".to_string(), 0.25), ("b".to_string(), 0.75)])
        );

        let zeros = vec![("a".to_string(), 0.), ("b".to_string(), 0.)];
        assert_eq!(relative(&zeros), None);
    }

    #[test]
    fn test_text_table_concat() {
        let t1 = TextTable {
            headers: vec!["Taxon".into(), "mock".into()],
            rows: vec![vec!["x".into(), "0.1".into()]],
        }
        .tagged(&[("level", "asv".to_string())]);
        let t2 = TextTable {
            headers: vec!["Taxon".into(), "extra".into()],
            rows: vec![vec!["y".into(), "1".into()]],
        }
        .tagged(&[("level", "taxonomy".to_string())]);

        let all = TextTable::concat(&[t1, t2]);
        assert_eq!(all.headers, vec!["Taxon", "mock", "level", "extra"]);
        assert_eq!(
            all.rows,
            vec![
                vec!["x", "0.1", "asv", ""],
                vec!["y", "", "taxonomy", "1"],
            ]
        );
    }
}
