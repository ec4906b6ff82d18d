//! Stage status taxonomy.
//!
//! Every external tool run is classified into exactly one tag. Pipeline-level
//! tags prefix the stage name, so the mapping from stage tag to pipeline tag
//! (and from pipeline tag to HTTP code) is an exhaustive match.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Behaviour shared by stage status tags.
pub trait OutcomeStatus: Copy + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Full success.
    fn is_success(&self) -> bool;

    /// Accepted partial success. Partial tags may carry a salvaged payload.
    fn is_partial(&self) -> bool {
        false
    }

    /// Whether an outcome with this tag is allowed to carry a payload.
    fn admits_payload(&self) -> bool {
        self.is_success() || self.is_partial()
    }

    /// Kebab-case tag.
    fn as_str(&self) -> &'static str;

    /// Externally visible status code.
    fn http_status(&self) -> u16;
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Outcome tags of the expansion stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpansionStatus {
    Success,
    TimeoutPartial,
    TimeoutError,
    MemoryPartial,
    MemoryError,
    SourceInSink,
    SourceInSinkCheckFailed,
    NoScopePartial,
    NoResultsError,
    OsPartial,
    OsError,
    RamPartial,
    RamError,
}

impl ExpansionStatus {
    pub const ALL: [ExpansionStatus; 13] = [
        ExpansionStatus::Success,
        ExpansionStatus::TimeoutPartial,
        ExpansionStatus::TimeoutError,
        ExpansionStatus::MemoryPartial,
        ExpansionStatus::MemoryError,
        ExpansionStatus::SourceInSink,
        ExpansionStatus::SourceInSinkCheckFailed,
        ExpansionStatus::NoScopePartial,
        ExpansionStatus::NoResultsError,
        ExpansionStatus::OsPartial,
        ExpansionStatus::OsError,
        ExpansionStatus::RamPartial,
        ExpansionStatus::RamError,
    ];
}

impl OutcomeStatus for ExpansionStatus {
    fn is_success(&self) -> bool {
        matches!(self, ExpansionStatus::Success)
    }

    fn is_partial(&self) -> bool {
        matches!(
            self,
            ExpansionStatus::TimeoutPartial
                | ExpansionStatus::MemoryPartial
                | ExpansionStatus::NoScopePartial
                | ExpansionStatus::OsPartial
                | ExpansionStatus::RamPartial
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            ExpansionStatus::Success => "success",
            ExpansionStatus::TimeoutPartial => "timeout-partial",
            ExpansionStatus::TimeoutError => "timeout-error",
            ExpansionStatus::MemoryPartial => "memory-partial",
            ExpansionStatus::MemoryError => "memory-error",
            ExpansionStatus::SourceInSink => "source-in-sink",
            ExpansionStatus::SourceInSinkCheckFailed => "source-in-sink-check-failed",
            ExpansionStatus::NoScopePartial => "no-scope-partial",
            ExpansionStatus::NoResultsError => "no-results-error",
            ExpansionStatus::OsPartial => "os-partial",
            ExpansionStatus::OsError => "os-error",
            ExpansionStatus::RamPartial => "ram-partial",
            ExpansionStatus::RamError => "ram-error",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            ExpansionStatus::Success
            | ExpansionStatus::TimeoutPartial
            | ExpansionStatus::MemoryPartial
            | ExpansionStatus::NoScopePartial
            | ExpansionStatus::OsPartial
            | ExpansionStatus::RamPartial => 200,
            ExpansionStatus::TimeoutError => 408,
            ExpansionStatus::MemoryError => 403,
            ExpansionStatus::SourceInSink => 409,
            ExpansionStatus::NoResultsError => 404,
            ExpansionStatus::SourceInSinkCheckFailed
            | ExpansionStatus::OsError
            | ExpansionStatus::RamError => 500,
        }
    }
}

impl fmt::Display for ExpansionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpansionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown expansion status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Outcome tags of the enumeration stage. There is no partial salvage here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnumerationStatus {
    Success,
    Timeout,
    MemoryError,
    FileNotFound,
    /// Both output files were produced but hold nothing.
    Empty,
    OsError,
    RamError,
}

impl EnumerationStatus {
    pub const ALL: [EnumerationStatus; 7] = [
        EnumerationStatus::Success,
        EnumerationStatus::Timeout,
        EnumerationStatus::MemoryError,
        EnumerationStatus::FileNotFound,
        EnumerationStatus::Empty,
        EnumerationStatus::OsError,
        EnumerationStatus::RamError,
    ];
}

impl OutcomeStatus for EnumerationStatus {
    fn is_success(&self) -> bool {
        matches!(self, EnumerationStatus::Success)
    }

    fn as_str(&self) -> &'static str {
        match self {
            EnumerationStatus::Success => "success",
            EnumerationStatus::Timeout => "timeout",
            EnumerationStatus::MemoryError => "memory-error",
            EnumerationStatus::FileNotFound => "file-not-found",
            EnumerationStatus::Empty => "empty",
            EnumerationStatus::OsError => "os-error",
            EnumerationStatus::RamError => "ram-error",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            EnumerationStatus::Success => 200,
            EnumerationStatus::Timeout => 408,
            EnumerationStatus::MemoryError => 403,
            EnumerationStatus::Empty => 404,
            EnumerationStatus::FileNotFound
            | EnumerationStatus::OsError
            | EnumerationStatus::RamError => 500,
        }
    }
}

impl fmt::Display for EnumerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnumerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown enumeration status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pipeline-level status: the failing stage's tag prefixed by the stage name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStatus {
    Success,
    RuleSelectionFailed,
    Expansion(ExpansionStatus),
    Enumeration(EnumerationStatus),
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Success)
    }

    /// Externally visible status code. Each tag maps to exactly one code.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineStatus::Success => 200,
            PipelineStatus::RuleSelectionFailed => 400,
            PipelineStatus::Expansion(s) => s.http_status(),
            PipelineStatus::Enumeration(s) => s.http_status(),
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Success => f.write_str("success"),
            PipelineStatus::RuleSelectionFailed => f.write_str("rule-selection-failed"),
            PipelineStatus::Expansion(s) => write!(f, "expansion-{s}"),
            PipelineStatus::Enumeration(s) => write!(f, "enumeration-{s}"),
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PipelineStatus::Success),
            "rule-selection-failed" => Ok(PipelineStatus::RuleSelectionFailed),
            _ => {
                if let Some(rest) = s.strip_prefix("expansion-") {
                    rest.parse().map(PipelineStatus::Expansion)
                } else if let Some(rest) = s.strip_prefix("enumeration-") {
                    rest.parse().map(PipelineStatus::Enumeration)
                } else {
                    Err(format!("unknown pipeline status '{s}'"))
                }
            }
        }
    }
}

impl From<ExpansionStatus> for PipelineStatus {
    fn from(s: ExpansionStatus) -> Self {
        PipelineStatus::Expansion(s)
    }
}

impl From<EnumerationStatus> for PipelineStatus {
    fn from(s: EnumerationStatus) -> Self {
        PipelineStatus::Enumeration(s)
    }
}

impl Serialize for PipelineStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PipelineStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Status code for a raw tag string. Unrecognised tags map to 500.
pub fn status_code_for_tag(tag: &str) -> u16 {
    match tag.parse::<PipelineStatus>() {
        Ok(status) => status.http_status(),
        Err(_) => {
            tracing::warn!(tag, "unrecognised status tag");
            500
        }
    }
}
