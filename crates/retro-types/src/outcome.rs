//! Stage outcomes and the combined pipeline result.

use serde::{Deserialize, Serialize};

use crate::archive::{self, ArchiveEntry};
use crate::status::{EnumerationStatus, ExpansionStatus, OutcomeStatus, PipelineStatus};
use crate::{Result, RetroError};

// ---------------------------------------------------------------------------
// Source descriptor
// ---------------------------------------------------------------------------

/// The single (name, standardized identifier) pair a run starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    identifier: String,
}

impl SourceDescriptor {
    /// Whitespace is stripped from the identifier on construction.
    pub fn new(name: impl Into<String>, identifier: &str) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.chars().filter(|c| !c.is_whitespace()).collect(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Two-column `Name,InChI` table consumed by the expansion workflow.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["Name", "InChI"])?;
        writer.write_record([self.name.as_str(), self.identifier.as_str()])?;
        writer
            .into_inner()
            .map_err(|e| RetroError::Other(format!("flushing source table: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Stage outcome
// ---------------------------------------------------------------------------

/// Classified result of one external tool run.
///
/// The payload slot is only ever filled for tags that admit one (success or
/// accepted partial); constructors enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome<S, P> {
    pub status: S,
    payload: Option<P>,
    pub diagnostic: String,
}

impl<S: OutcomeStatus, P> StageOutcome<S, P> {
    /// Outcome carrying a payload. A tag that does not admit one drops it.
    pub fn with_payload(status: S, payload: P, diagnostic: impl Into<String>) -> Self {
        let payload = if status.admits_payload() {
            Some(payload)
        } else {
            tracing::warn!(status = %status, "payload discarded for non-success tag");
            None
        };
        Self {
            status,
            payload,
            diagnostic: diagnostic.into(),
        }
    }

    /// Outcome with an empty payload slot.
    pub fn failed(status: S, diagnostic: impl Into<String>) -> Self {
        Self {
            status,
            payload: None,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<P> {
        self.payload
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

/// Outcome of the expansion stage: one candidate-pathways table.
pub type ExpansionOutcome = StageOutcome<ExpansionStatus, Vec<u8>>;

/// The two tables produced by the enumeration stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationPayload {
    pub paths: Vec<u8>,
    pub compounds: Vec<u8>,
}

/// Outcome of the enumeration stage.
pub type EnumerationOutcome = StageOutcome<EnumerationStatus, EnumerationPayload>;

// ---------------------------------------------------------------------------
// Pipeline result
// ---------------------------------------------------------------------------

pub const EXPANSION_ENTRY: &str = "rp2_pathways";
pub const PATHS_ENTRY: &str = "rp2paths_pathways";
pub const COMPOUNDS_ENTRY: &str = "rp2paths_compounds";

/// Combined output of a pipeline run.
///
/// Once a stage fails, the slots it and its successors would have filled stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    #[serde(skip)]
    pub expansion_output: Vec<u8>,
    #[serde(skip)]
    pub enumeration_paths: Vec<u8>,
    #[serde(skip)]
    pub enumeration_compounds: Vec<u8>,
    pub diagnostic: String,
    /// Set when enumeration ran on a salvaged partial expansion table.
    pub partial_expansion: Option<ExpansionStatus>,
}

impl PipelineResult {
    /// Terminal failure with all payload slots empty.
    pub fn failed(status: PipelineStatus, diagnostic: impl Into<String>) -> Self {
        Self {
            status,
            expansion_output: Vec::new(),
            enumeration_paths: Vec::new(),
            enumeration_compounds: Vec::new(),
            diagnostic: diagnostic.into(),
            partial_expansion: None,
        }
    }

    pub fn success(
        expansion_output: Vec<u8>,
        enumeration: EnumerationPayload,
        partial_expansion: Option<ExpansionStatus>,
    ) -> Self {
        Self {
            status: PipelineStatus::Success,
            expansion_output,
            enumeration_paths: enumeration.paths,
            enumeration_compounds: enumeration.compounds,
            diagnostic: String::new(),
            partial_expansion,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.status.http_status()
    }

    /// Pack the three output tables as independently named archive entries.
    pub fn archive(&self) -> Result<Vec<u8>> {
        if !self.status.is_success() {
            return Err(RetroError::Other(format!(
                "no archive for a pipeline that ended with '{}'",
                self.status
            )));
        }
        archive::pack(&[
            ArchiveEntry::new(EXPANSION_ENTRY, &self.expansion_output),
            ArchiveEntry::new(PATHS_ENTRY, &self.enumeration_paths),
            ArchiveEntry::new(COMPOUNDS_ENTRY, &self.enumeration_compounds),
        ])
    }
}
