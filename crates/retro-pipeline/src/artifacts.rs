//! Inspection of files left behind by external tools.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use retro_types::{Result, RetroError};

/// Number of CSV records in `path`, header included. `None` if it cannot be read.
pub(crate) fn count_rows(path: &Path) -> Option<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .ok()?;
    let mut count = 0;
    for record in reader.records() {
        record.ok()?;
        count += 1;
    }
    Some(count)
}

/// Like [`count_rows`] but distinguishes a missing file from an unreadable one.
pub(crate) fn count_rows_strict(path: &Path) -> std::io::Result<usize> {
    let file = std::fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);
    let mut count = 0;
    for record in reader.records() {
        record.map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        count += 1;
    }
    Ok(count)
}

/// Files directly inside `dir` whose name matches `pattern`, sorted.
pub(crate) fn find_matching(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = matcher(pattern)?;
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && matcher.is_match(entry.file_name()) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Names of the files in `dir`, for diagnostics.
pub(crate) fn listing(dir: &Path) -> String {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(e) => return format!("<unreadable: {e}>"),
    };
    names.sort();
    format!("[{}]", names.join(", "))
}

fn matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| RetroError::Other(format!("bad pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a,b\n1,2\n\"x\ny\",3\n").unwrap();
        assert_eq!(count_rows(&path), Some(3));
        assert_eq!(count_rows(&dir.path().join("missing.csv")), None);
        assert_eq!(
            count_rows_strict(&dir.path().join("missing.csv"))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn finds_scope_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("results.csv"), "").unwrap();
        std::fs::write(dir.path().join("target_scope.csv"), "").unwrap();
        let found = find_matching(dir.path(), "*_scope.csv").unwrap();
        assert_eq!(found, vec![dir.path().join("target_scope.csv")]);
        assert_eq!(listing(dir.path()), "[results.csv, target_scope.csv]");
    }
}
