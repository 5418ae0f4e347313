use crate::table::AbundanceTable;
use anyhow::{anyhow, bail, Result};
use csv::ReaderBuilder;
use regex::Regex;
use std::{collections::HashMap, path::Path};

const SEPARATOR: &str = "; ";

/// Lineage of expected references missing from the taxonomy table
pub const EXPECTED_DEFAULT_LINEAGE: &str = "d__Eukaryota";

/// Maps reference identifiers to taxonomy strings such as
/// "d__Bacteria; p__Firmicutes; c__Bacilli".
///
/// The lookup is total: identifiers it does not know, including the
/// ambiguous-resolution sentinels, get the default lineage. Expected
/// references have their own default.
#[derive(Debug, Clone)]
pub struct LineageLookup {
    ranks: Vec<String>,
    default_lineage: String,
    expected_default_lineage: String,
    lineages: HashMap<String, String>,
    rank_prefix: Regex,
}

impl LineageLookup {
    pub fn new(
        ranks: Vec<String>,
        default_lineage: &str,
        lineages: HashMap<String, String>,
    ) -> Result<Self> {
        if ranks.is_empty() {
            bail!("At least one taxonomic rank is required");
        }
        Ok(LineageLookup {
            ranks,
            default_lineage: default_lineage.to_string(),
            expected_default_lineage: EXPECTED_DEFAULT_LINEAGE.to_string(),
            lineages,
            rank_prefix: Regex::new(r"^\s*([^_;\s]+)__")?,
        })
    }

    /// Read a reference taxonomy table: the first column holds the
    /// reference id and a column named "Taxon" the lineage.
    pub fn from_file(
        path: &Path,
        ranks: Vec<String>,
        default_lineage: &str,
    ) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))?;

        let headers = reader.headers()?.clone();
        let taxon_col = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case("taxon"))
            .ok_or_else(|| {
                anyhow!(r#"{}: missing "Taxon" column"#, path.display())
            })?;

        let mut lineages = HashMap::new();
        for res in reader.records() {
            let rec = res?;
            if let (Some(id), Some(taxon)) = (rec.get(0), rec.get(taxon_col)) {
                lineages.insert(id.trim().to_string(), taxon.trim().to_string());
            }
        }

        Self::new(ranks, default_lineage, lineages)
    }

    pub fn with_expected_default(mut self, lineage: &str) -> Self {
        self.expected_default_lineage = lineage.to_string();
        self
    }

    pub fn ranks(&self) -> &[String] {
        &self.ranks
    }

    /// Number of ranks of a fully extended lineage
    pub fn full_depth(&self) -> usize {
        self.ranks.len()
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }

    /// Lineage of an observed reference, extended to every rank
    pub fn lineage(&self, reference: &str) -> String {
        self.lineage_or(reference, &self.default_lineage)
    }

    /// Lineage of an expected reference, extended to every rank
    pub fn expected_lineage(&self, reference: &str) -> String {
        self.lineage_or(reference, &self.expected_default_lineage)
    }

    fn lineage_or(&self, reference: &str, default: &str) -> String {
        let raw = self
            .lineages
            .get(reference)
            .map(String::as_str)
            .unwrap_or(default);
        self.extend(raw)
    }

    /// Lineage of a reference cut to the first `depth` ranks
    pub fn lineage_at(&self, reference: &str, depth: usize) -> String {
        cut(&self.lineage(reference), depth)
    }

    /// Append empty rank labels ("g__", "s__", ...) after the last
    /// resolved rank so every lineage has one label per rank.
    pub fn extend(&self, lineage: &str) -> String {
        let mut labels: Vec<String> = lineage
            .split(';')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if labels.is_empty() {
            labels.push(format!("{}__", self.ranks[0]));
        }

        // Position of the last label, by its rank prefix when it has one
        let last = labels
            .last()
            .and_then(|label| self.rank_prefix.captures(label))
            .and_then(|caps| caps.get(1))
            .and_then(|prefix| self.ranks.iter().position(|r| r == prefix.as_str()))
            .unwrap_or(labels.len() - 1);

        for rank in self.ranks.iter().skip(last + 1) {
            labels.push(format!("{rank}__"));
        }

        labels.join(SEPARATOR)
    }

    /// Sum the features of an observed table that share a lineage at
    /// `depth`
    pub fn project(&self, table: &AbundanceTable, depth: usize) -> AbundanceTable {
        taxon_indexed(table.collapse(|feature| self.lineage_at(feature, depth)))
    }

    /// Same as `project`, for an expected table
    pub fn project_expected(
        &self,
        table: &AbundanceTable,
        depth: usize,
    ) -> AbundanceTable {
        taxon_indexed(
            table.collapse(|feature| cut(&self.expected_lineage(feature), depth)),
        )
    }
}

// --------------------------------------------------
fn cut(lineage: &str, depth: usize) -> String {
    lineage
        .split(SEPARATOR)
        .take(depth.max(1))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

fn taxon_indexed(mut table: AbundanceTable) -> AbundanceTable {
    table.index_name = "Taxon".to_string();
    table
}

// --------------------------------------------------
#[cfg(test)]
mod tests {
    use super::LineageLookup;
    use crate::{matcher::MULTIPLE_HITS, table::AbundanceTable};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::{collections::HashMap, path::PathBuf};

    fn ranks() -> Vec<String> {
        ["d", "p", "c", "o", "f", "g", "s"]
            .iter()
            .map(|r| r.to_string())
            .collect()
    }

    fn lookup() -> Result<LineageLookup> {
        LineageLookup::new(
            ranks(),
            "d__",
            HashMap::from([
                (
                    "A".to_string(),
                    "d__Bacteria; p__Firmicutes; c__Bacilli; o__Lactobacillales; \
                     f__Listeriaceae; g__Listeria; s__monocytogenes"
                        .to_string(),
                ),
                (
                    "B".to_string(),
                    "d__Bacteria; p__Proteobacteria; c__Gammaproteobacteria; \
                     o__Enterobacterales; f__Enterobacteriaceae"
                        .to_string(),
                ),
                (
                    "C".to_string(),
                    "d__Bacteria;p__Proteobacteria;c__Gammaproteobacteria;\
                     o__Enterobacterales;f__Enterobacteriaceae"
                        .to_string(),
                ),
            ]),
        )
    }

    #[test]
    fn test_extend_partial_lineage() -> Result<()> {
        let lookup = lookup()?;
        assert_eq!(
            lookup.lineage("B"),
            "d__Bacteria; p__Proteobacteria; c__Gammaproteobacteria; \
             o__Enterobacterales; f__Enterobacteriaceae; g__; s__"
        );
        // Spacing around the separators does not matter
        assert_eq!(lookup.lineage("C"), lookup.lineage("B"));
        Ok(())
    }

    #[test]
    fn test_unknown_reference() -> Result<()> {
        let lookup = lookup()?;
        let expected = "d__; p__; c__; o__; f__; g__; s__";
        assert_eq!(lookup.lineage("not-a-reference"), expected);
        assert_eq!(lookup.lineage(MULTIPLE_HITS), expected);
        assert_eq!(lookup.lineage_at(MULTIPLE_HITS, 2), "d__; p__");
        Ok(())
    }

    #[test]
    fn test_expected_default() -> Result<()> {
        let table = AbundanceTable::from_column(
            "featureid",
            "mock",
            vec![("A".to_string(), 0.6), ("unknown".to_string(), 0.4)],
        );

        let lookup = lookup()?;
        let expected = lookup.project_expected(&table, 7);
        assert_eq!(
            expected.features[1],
            "d__Eukaryota; p__; c__; o__; f__; g__; s__"
        );
        let observed = lookup.project(&table, 7);
        assert_eq!(observed.features[0], "d__; p__; c__; o__; f__; g__; s__");

        let lookup = lookup.with_expected_default("d__Unassigned");
        assert_eq!(
            lookup.expected_lineage("unknown"),
            "d__Unassigned; p__; c__; o__; f__; g__; s__"
        );
        assert_eq!(lookup.expected_lineage("A"), lookup.lineage("A"));
        Ok(())
    }

    #[test]
    fn test_extend_without_prefix() -> Result<()> {
        let lookup = lookup()?;
        assert_eq!(
            lookup.extend("Bacteria; Firmicutes"),
            "Bacteria; Firmicutes; c__; o__; f__; g__; s__"
        );
        assert_eq!(lookup.extend(""), "d__; p__; c__; o__; f__; g__; s__");
        Ok(())
    }

    #[test]
    fn test_project() -> Result<()> {
        let lookup = lookup()?;
        let table = AbundanceTable::from_column(
            "featureid",
            "mock",
            vec![
                ("A".to_string(), 0.5),
                ("B".to_string(), 0.2),
                ("C".to_string(), 0.1),
                ("OTHER".to_string(), 0.2),
            ],
        );

        let tax = lookup.project(&table, 7);
        assert_eq!(tax.index_name, "Taxon");
        assert_eq!(tax.features.len(), 3);
        assert_eq!(
            tax.column("mock").unwrap()[1],
            (
                "d__Bacteria; p__Firmicutes; c__Bacilli; o__Lactobacillales; \
                 f__Listeriaceae; g__Listeria; s__monocytogenes",
                0.5
            )
        );

        // B and C share a phylum
        let tax = lookup.project(&table, 2);
        let column = tax.column("mock").unwrap();
        assert_eq!(column.len(), 3);
        assert!((column[2].1 - 0.3).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let lookup = LineageLookup::from_file(
            &PathBuf::from("tests/inputs/refs/taxonomy.tsv"),
            ranks(),
            "d__",
        )?;
        assert_eq!(lookup.len(), 3);
        assert!(lookup.lineage("ref1").starts_with("d__Bacteria; p__Firmicutes"));
        Ok(())
    }
}
