//! Request parameter resolution.
//!
//! Every entry point (HTTP handlers, CLI) funnels its raw JSON parameters
//! through [`RequestParams::resolve`]. Optional fields fall back to their
//! documented defaults when missing or malformed; the few required fields are
//! a hard [`RetroError`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::outcome::SourceDescriptor;
use crate::{Result, RetroError};

/// Bytes in one "GB" as accounted by the deployed tools.
pub const BYTES_PER_GB: u64 = 1000 * 1024 * 1024;

pub fn gb_to_bytes(gb: u64) -> u64 {
    gb.saturating_mul(BYTES_PER_GB)
}

// ---------------------------------------------------------------------------
// Rule vocabulary
// ---------------------------------------------------------------------------

/// Which direction of rules to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    All,
    Forward,
    Retro,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleScope::All => "all",
            RuleScope::Forward => "forward",
            RuleScope::Retro => "retro",
        }
    }

    /// Whether a row's usage column is kept under this scope.
    pub fn matches_usage(&self, usage: &str) -> bool {
        match self {
            RuleScope::All => true,
            RuleScope::Forward => usage == "forward" || usage == "both",
            RuleScope::Retro => usage == "retro" || usage == "both",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleScope {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(RuleScope::All),
            "forward" => Ok(RuleScope::Forward),
            "retro" => Ok(RuleScope::Retro),
            other => Err(RetroError::UnknownFormat {
                kind: "rule scope".into(),
                value: other.into(),
            }),
        }
    }
}

/// Format of a user-supplied rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleFormat {
    Csv,
    Tsv,
    /// Tar archive (plain or gzip) holding exactly one CSV table.
    Tar,
}

impl FromStr for RuleFormat {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(RuleFormat::Csv),
            "tsv" => Ok(RuleFormat::Tsv),
            "tar" => Ok(RuleFormat::Tar),
            other => Err(RetroError::UnknownFormat {
                kind: "input".into(),
                value: other.into(),
            }),
        }
    }
}

/// Packaging of the filtered rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOutputFormat {
    #[default]
    Csv,
    Tar,
}

impl FromStr for RuleOutputFormat {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(RuleOutputFormat::Csv),
            "tar" => Ok(RuleOutputFormat::Tar),
            other => Err(RetroError::UnknownFormat {
                kind: "output".into(),
                value: other.into(),
            }),
        }
    }
}

/// A validated set of rule diameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diameters(Vec<u32>);

impl Diameters {
    pub const ALLOWED: [u32; 8] = [2, 4, 6, 8, 10, 12, 14, 16];

    pub fn all() -> Self {
        Self(Self::ALLOWED.to_vec())
    }

    /// Keep the allowed values, dropping the rest with a warning.
    ///
    /// May end up empty; filtering with an empty set keeps no rows.
    pub fn from_values(values: impl IntoIterator<Item = i64>) -> Self {
        let mut kept = Vec::new();
        for value in values {
            match u32::try_from(value) {
                Ok(d) if Self::ALLOWED.contains(&d) => {
                    if !kept.contains(&d) {
                        kept.push(d);
                    }
                }
                _ => tracing::warn!(
                    diameter = value,
                    "diameter must be one of 2,4,6,8,10,12,14,16; ignoring"
                ),
            }
        }
        Self(kept)
    }

    /// Parse a comma-separated list such as `"4,99,8"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        let values = list
            .split(',')
            .map(|part| {
                part.trim().parse::<i64>().map_err(|_| {
                    RetroError::BadRequest(format!("invalid diameter entry '{}'", part.trim()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_values(values))
    }

    pub fn contains(&self, diameter: u32) -> bool {
        self.0.contains(&diameter)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Diameters {
    fn default() -> Self {
        Self::all()
    }
}

// ---------------------------------------------------------------------------
// Stage parameters
// ---------------------------------------------------------------------------

/// Numeric knobs of one expansion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionParams {
    pub max_steps: u32,
    pub topx: u32,
    pub dmin: u32,
    pub dmax: u32,
    pub mwmax_source: u32,
    pub mwmax_cof: u32,
    pub timeout_minutes: f64,
    pub ram_limit_gb: u64,
    pub allow_partial: bool,
}

impl ExpansionParams {
    pub const DEFAULT_TOPX: u32 = 100;
    pub const DEFAULT_DMIN: u32 = 0;
    pub const DEFAULT_DMAX: u32 = 1000;
    pub const DEFAULT_MW_MAX: u32 = 1000;
    pub const DEFAULT_TIMEOUT_MINUTES: f64 = 120.0;
    /// Stage-level cap when the caller gives none.
    pub const DEFAULT_RAM_GB: u64 = 30;

    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps,
            topx: Self::DEFAULT_TOPX,
            dmin: Self::DEFAULT_DMIN,
            dmax: Self::DEFAULT_DMAX,
            mwmax_source: Self::DEFAULT_MW_MAX,
            mwmax_cof: Self::DEFAULT_MW_MAX,
            timeout_minutes: Self::DEFAULT_TIMEOUT_MINUTES,
            ram_limit_gb: Self::DEFAULT_RAM_GB,
            allow_partial: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        minutes(self.timeout_minutes)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        gb_to_bytes(self.ram_limit_gb)
    }
}

/// Knobs of one enumeration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationParams {
    pub timeout_minutes: f64,
    pub ram_limit_gb: u64,
}

impl EnumerationParams {
    pub const DEFAULT_TIMEOUT_MINUTES: f64 = 30.0;
    pub const DEFAULT_RAM_GB: u64 = 20;

    pub fn timeout(&self) -> Duration {
        minutes(self.timeout_minutes)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        gb_to_bytes(self.ram_limit_gb)
    }
}

impl Default for EnumerationParams {
    fn default() -> Self {
        Self {
            timeout_minutes: Self::DEFAULT_TIMEOUT_MINUTES,
            ram_limit_gb: Self::DEFAULT_RAM_GB,
        }
    }
}

fn minutes(m: f64) -> Duration {
    if m.is_finite() && m > 0.0 {
        Duration::from_secs_f64(m * 60.0)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Which entry point the parameters are resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Rules,
    Expansion,
    Enumeration,
    Pipeline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleRequest {
    pub scope: RuleScope,
    pub diameters: Diameters,
    /// Present iff a rule file was uploaded.
    pub input_format: Option<RuleFormat>,
    pub output_format: RuleOutputFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionRequest {
    pub source: SourceDescriptor,
    pub params: ExpansionParams,
    pub rules_format: RuleFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub source: SourceDescriptor,
    pub expansion: ExpansionParams,
    pub enumeration: EnumerationParams,
    pub diameters: Diameters,
    pub scope: RuleScope,
    /// Present iff a rule file was uploaded.
    pub rules_format: Option<RuleFormat>,
}

/// Validated parameters for one entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    Rules(RuleRequest),
    Expansion(ExpansionRequest),
    Enumeration(EnumerationParams),
    Pipeline(PipelineRequest),
}

/// Request-level ceiling on memory when the caller gives none.
pub const REQUEST_DEFAULT_RAM_GB: u64 = 120;
pub const DEFAULT_SOURCE_NAME: &str = "target";

impl RequestParams {
    /// Resolve raw request data for `endpoint`.
    pub fn resolve(data: &Value, endpoint: Endpoint, has_rules_file: bool) -> Result<Self> {
        let fields = Fields(data);
        match endpoint {
            Endpoint::Rules => Ok(RequestParams::Rules(RuleRequest {
                scope: fields.scope("rules_type")?,
                diameters: fields.diameters(),
                input_format: if has_rules_file {
                    Some(fields.required_str("input_format")?.parse()?)
                } else {
                    None
                },
                output_format: match fields.str("output_format") {
                    Some(s) => s.parse()?,
                    None => RuleOutputFormat::default(),
                },
            })),
            Endpoint::Expansion => Ok(RequestParams::Expansion(ExpansionRequest {
                source: fields.source()?,
                params: fields.expansion()?,
                rules_format: fields.required_str("rules_format")?.parse()?,
            })),
            Endpoint::Enumeration => Ok(RequestParams::Enumeration(EnumerationParams {
                timeout_minutes: fields.float_or(
                    "timeout",
                    EnumerationParams::DEFAULT_TIMEOUT_MINUTES,
                ),
                ram_limit_gb: fields.int_or("ram_limit", EnumerationParams::DEFAULT_RAM_GB),
            })),
            Endpoint::Pipeline => {
                let expansion = fields.expansion()?;
                let enumeration = EnumerationParams {
                    timeout_minutes: expansion.timeout_minutes,
                    ram_limit_gb: expansion.ram_limit_gb,
                };
                Ok(RequestParams::Pipeline(PipelineRequest {
                    source: fields.source()?,
                    expansion,
                    enumeration,
                    diameters: fields.diameters(),
                    scope: fields.scope("rules_type")?,
                    rules_format: if has_rules_file {
                        Some(fields.required_str("rules_format")?.parse()?)
                    } else {
                        None
                    },
                }))
            }
        }
    }
}

/// Lenient accessors over a JSON object.
struct Fields<'a>(&'a Value);

impl Fields<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn str(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn required_str(&self, key: &str) -> Result<String> {
        self.str(key)
            .ok_or_else(|| RetroError::MissingParameter(key.into()))
    }

    fn parse_int(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn int_or<T: TryFrom<i64> + Copy + fmt::Display>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(v) => match Self::parse_int(v).and_then(|i| T::try_from(i).ok()) {
                Some(parsed) => parsed,
                None => {
                    tracing::warn!(param = key, value = %v, default = %default, "malformed parameter, using default");
                    default
                }
            },
        }
    }

    fn float_or(&self, key: &str, default: f64) -> f64 {
        let parsed = self.get(key).map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        });
        match parsed {
            None => default,
            Some(Some(f)) if f.is_finite() && f > 0.0 => f,
            Some(_) => {
                tracing::warn!(param = key, default, "malformed parameter, using default");
                default
            }
        }
    }

    fn bool_flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "True" | "T" | "true"),
            _ => false,
        }
    }

    fn scope(&self, key: &str) -> Result<RuleScope> {
        match self.str(key) {
            Some(s) => s.parse(),
            None => Ok(RuleScope::default()),
        }
    }

    fn diameters(&self) -> Diameters {
        let parsed = match self.get("diameters") {
            None => return Diameters::all(),
            Some(Value::String(s)) => Diameters::parse_list(s).ok(),
            Some(Value::Array(items)) => items
                .iter()
                .map(Self::parse_int)
                .collect::<Option<Vec<_>>>()
                .map(Diameters::from_values),
            Some(_) => None,
        };
        parsed.unwrap_or_else(|| {
            tracing::warn!("malformed diameters, using all of 2,4,6,8,10,12,14,16");
            Diameters::all()
        })
    }

    fn source(&self) -> Result<SourceDescriptor> {
        let identifier = match self.get("source_inchi") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => {
                return Err(RetroError::BadRequest(
                    "source_inchi must be a non-empty string".into(),
                ))
            }
            None => return Err(RetroError::MissingParameter("source_inchi".into())),
        };
        let name = self
            .str("source_name")
            .unwrap_or_else(|| DEFAULT_SOURCE_NAME.to_string());
        Ok(SourceDescriptor::new(name, &identifier))
    }

    fn expansion(&self) -> Result<ExpansionParams> {
        let max_steps = match self.get("max_steps") {
            None => return Err(RetroError::MissingParameter("max_steps".into())),
            Some(v) => Self::parse_int(v)
                .and_then(|i| u32::try_from(i).ok())
                .ok_or_else(|| RetroError::BadRequest(format!("max_steps is malformed: {v}")))?,
        };
        Ok(ExpansionParams {
            max_steps,
            topx: self.int_or("topx", ExpansionParams::DEFAULT_TOPX),
            dmin: self.int_or("dmin", ExpansionParams::DEFAULT_DMIN),
            dmax: self.int_or("dmax", ExpansionParams::DEFAULT_DMAX),
            mwmax_source: self.int_or("mwmax_source", ExpansionParams::DEFAULT_MW_MAX),
            mwmax_cof: self.int_or("mwmax_cof", ExpansionParams::DEFAULT_MW_MAX),
            timeout_minutes: self.float_or("time_out", ExpansionParams::DEFAULT_TIMEOUT_MINUTES),
            ram_limit_gb: self.int_or("ram_limit", REQUEST_DEFAULT_RAM_GB),
            allow_partial: self.bool_flag("partial_retro"),
        })
    }
}
