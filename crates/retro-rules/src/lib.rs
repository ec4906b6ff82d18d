//! Reaction rule selection.
//!
//! Filters a rule table by diameter and usage scope and writes the result as a
//! fully quoted CSV table or as a gzip tar holding that table as `Rules.csv`.
//! Filtering happens in memory; the destination is only written once every
//! row has been checked, so a malformed table never leaves output behind.

pub mod table;

use std::path::{Path, PathBuf};

use retro_types::archive::{self, ArchiveEntry};
use retro_types::{Diameters, Result, RetroError, RuleFormat, RuleOutputFormat, RuleScope};

pub use table::{RuleTable, CANONICAL_HEADER, TSV_COLUMNS};

/// Default location of the builtin rule tables.
pub const DEFAULT_RULES_DIR: &str = "/home/retrorules";

/// Entry name used when the filtered table is wrapped in an archive.
pub const ARCHIVE_ENTRY: &str = "Rules.csv";

/// Where the rules come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// One of the canonical tables, picked by scope.
    Builtin,
    User { path: PathBuf, format: RuleFormat },
    /// An uploaded table held in memory.
    Inline { data: Vec<u8>, format: RuleFormat },
}

/// Summary of a completed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionReport {
    pub rows_read: usize,
    pub rows_kept: usize,
    pub bytes_written: usize,
}

/// Filters rule tables.
#[derive(Debug, Clone)]
pub struct RuleSelector {
    builtin_dir: PathBuf,
}

impl Default for RuleSelector {
    fn default() -> Self {
        Self::new(DEFAULT_RULES_DIR)
    }
}

impl RuleSelector {
    pub fn new(builtin_dir: impl Into<PathBuf>) -> Self {
        Self {
            builtin_dir: builtin_dir.into(),
        }
    }

    /// Path of the builtin table for `scope`.
    pub fn builtin_table(&self, scope: RuleScope) -> PathBuf {
        let name = match scope {
            RuleScope::All => "rules_rall_rp2.csv",
            RuleScope::Forward => "rules_rall_rp2_forward.csv",
            RuleScope::Retro => "rules_rall_rp2_retro.csv",
        };
        self.builtin_dir.join(name)
    }

    /// Select rules and write them to `dest`.
    pub fn select(
        &self,
        source: &RuleSource,
        scope: RuleScope,
        diameters: &Diameters,
        output: RuleOutputFormat,
        dest: &Path,
    ) -> Result<SelectionReport> {
        let (bytes, rows_read, rows_kept) = self.render(source, scope, diameters, output)?;
        std::fs::write(dest, &bytes)?;
        tracing::info!(
            scope = %scope,
            diameters = ?diameters.as_slice(),
            rows_read,
            rows_kept,
            dest = %dest.display(),
            "rules selected"
        );
        Ok(SelectionReport {
            rows_read,
            rows_kept,
            bytes_written: bytes.len(),
        })
    }

    /// Select rules and return the packaged bytes.
    pub fn select_bytes(
        &self,
        source: &RuleSource,
        scope: RuleScope,
        diameters: &Diameters,
        output: RuleOutputFormat,
    ) -> Result<Vec<u8>> {
        self.render(source, scope, diameters, output)
            .map(|(bytes, _, _)| bytes)
    }

    fn render(
        &self,
        source: &RuleSource,
        scope: RuleScope,
        diameters: &Diameters,
        output: RuleOutputFormat,
    ) -> Result<(Vec<u8>, usize, usize)> {
        if diameters.is_empty() {
            tracing::warn!("no valid diameters requested, output will hold the header only");
        }
        let table = self.load(source, scope)?;
        let rows_read = table.rows.len();
        let filtered = filter(table, scope, diameters)?;
        let rows_kept = filtered.rows.len();
        let csv = filtered.to_csv()?;
        let bytes = match output {
            RuleOutputFormat::Csv => csv,
            RuleOutputFormat::Tar => archive::pack(&[ArchiveEntry::new(ARCHIVE_ENTRY, &csv)])?,
        };
        Ok((bytes, rows_read, rows_kept))
    }

    fn load(&self, source: &RuleSource, scope: RuleScope) -> Result<RuleTable> {
        match source {
            RuleSource::Builtin => {
                let path = self.builtin_table(scope);
                tracing::debug!(path = %path.display(), "reading builtin rules");
                RuleTable::from_csv(std::fs::File::open(path)?)
            }
            RuleSource::User { path, format } => match format {
                RuleFormat::Csv => RuleTable::from_csv(std::fs::File::open(path)?),
                RuleFormat::Tsv => RuleTable::from_tsv(std::fs::File::open(path)?),
                RuleFormat::Tar => RuleTable::from_tar(&std::fs::read(path)?),
            },
            RuleSource::Inline { data, format } => match format {
                RuleFormat::Csv => RuleTable::from_csv(data.as_slice()),
                RuleFormat::Tsv => RuleTable::from_tsv(data.as_slice()),
                RuleFormat::Tar => RuleTable::from_tar(data),
            },
        }
    }
}

/// Keep rows whose diameter is wanted and whose usage matches `scope`.
///
/// Any row with an unparseable diameter fails the whole table.
pub fn filter(table: RuleTable, scope: RuleScope, diameters: &Diameters) -> Result<RuleTable> {
    let mut kept = Vec::with_capacity(table.rows.len());
    for (idx, row) in table.rows.into_iter().enumerate() {
        let raw = row
            .get(table::DIAMETER_COLUMN)
            .ok_or_else(|| RetroError::MissingColumn {
                row: idx + 1,
                column: CANONICAL_HEADER[table::DIAMETER_COLUMN].to_string(),
            })?;
        let diameter: i64 = raw.trim().parse().map_err(|_| {
            tracing::error!(row = idx + 1, value = %raw, "cannot convert diameter to integer");
            RetroError::MalformedDiameter {
                row: idx + 1,
                value: raw.clone(),
            }
        })?;
        let wanted = u32::try_from(diameter).is_ok_and(|d| diameters.contains(d));
        let usage = row.get(table::USAGE_COLUMN).map(String::as_str);
        let in_scope = match usage {
            Some(u) => scope.matches_usage(u),
            None => scope == RuleScope::All,
        };
        if wanted && in_scope {
            kept.push(row);
        }
    }
    Ok(RuleTable {
        header: table.header,
        rows: kept,
    })
}
