//! Reading rule tables into canonical rows.

use std::io::Read;

use retro_types::{archive, Result, RetroError};

/// Canonical column order of a rule table.
pub const CANONICAL_HEADER: [&str; 11] = [
    "Rule ID",
    "Rule",
    "EC number",
    "Reaction order",
    "Diameter",
    "Score",
    "Legacy ID",
    "Reaction direction",
    "Rule relative direction",
    "Rule usage",
    "Score normalized",
];

/// Column names of the TSV export, in canonical order.
pub const TSV_COLUMNS: [&str; 11] = [
    "# Rule_ID",
    "Rule_SMARTS",
    "Reaction_EC_number",
    "Rule_order",
    "Diameter",
    "Score",
    "Legacy_ID",
    "Reaction_direction",
    "Rule_relative_direction",
    "Rule_usage",
    "Score_normalized",
];

pub const DIAMETER_COLUMN: usize = 4;
pub const USAGE_COLUMN: usize = 9;

/// A header plus data rows, all in canonical column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RuleTable {
    /// Read a comma-separated table whose first row is the header.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut records = reader.records();
        let header = match records.next() {
            Some(record) => record?.iter().map(str::to_owned).collect(),
            None => Vec::new(),
        };
        let rows = records
            .map(|r| r.map(|rec| rec.iter().map(str::to_owned).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { header, rows })
    }

    /// Read a tab-separated export with named columns, reordering to canonical.
    pub fn from_tsv<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let positions = TSV_COLUMNS
            .iter()
            .map(|name| {
                headers
                    .iter()
                    .position(|h| h == *name)
                    .ok_or_else(|| RetroError::MissingColumn {
                        row: 0,
                        column: (*name).to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let row = positions
                .iter()
                .zip(TSV_COLUMNS)
                .map(|(&pos, name)| {
                    record.get(pos).map(str::to_owned).ok_or_else(|| {
                        RetroError::MissingColumn {
                            row: idx + 1,
                            column: name.to_string(),
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        Ok(Self {
            header: CANONICAL_HEADER.iter().map(|s| s.to_string()).collect(),
            rows,
        })
    }

    /// Read the single top-level `*.csv` member of a tar archive.
    pub fn from_tar(bytes: &[u8]) -> Result<Self> {
        Self::from_csv(archive::extract_single_csv(bytes)?.as_slice())
    }

    /// Serialize with every field quoted.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .flexible(true)
            .from_writer(Vec::new());
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| RetroError::Other(format!("flushing rule table: {e}")))
    }
}
