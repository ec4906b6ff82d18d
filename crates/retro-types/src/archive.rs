//! Deterministic gzip-compressed tar archives.
//!
//! Every entry header is built from the exact byte length of its data with a
//! fixed mode and zero mtime, so identical inputs give identical archives.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{Result, RetroError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A named archive member.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveEntry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

impl<'a> ArchiveEntry<'a> {
    pub fn new(name: &'a str, data: &'a [u8]) -> Self {
        Self { name, data }
    }
}

/// Pack entries, in order, into a gzip tar.
pub fn pack(entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, entry.name, entry.data)?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Whether the bytes start with the gzip magic number.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Read every regular file of a tar archive, gzip-compressed or plain.
pub fn unpack(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    if is_gzip(bytes) {
        read_entries(GzDecoder::new(Cursor::new(bytes)))
    } else {
        read_entries(Cursor::new(bytes))
    }
}

/// Extract the one top-level `*.csv` member of an archive.
///
/// Zero or several candidates is an [`RetroError::ArchiveLayout`] error.
pub fn extract_single_csv(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut candidates: Vec<(String, Vec<u8>)> = unpack(bytes)?
        .into_iter()
        .filter(|(name, _)| is_top_level_csv(name))
        .collect();
    if candidates.len() != 1 {
        return Err(RetroError::ArchiveLayout {
            found: candidates.len(),
        });
    }
    let (name, data) = candidates.remove(0);
    tracing::debug!(entry = %name, bytes = data.len(), "extracted archive member");
    Ok(data)
}

fn is_top_level_csv(name: &str) -> bool {
    let name = name.trim_start_matches("./");
    !name.contains('/') && name.len() > ".csv".len() && name.ends_with(".csv")
}

fn read_entries<R: Read>(reader: R) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()?
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| RetroError::Other("archive entry name is not UTF-8".into()))?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        out.push((name, data));
    }
    Ok(out)
}
