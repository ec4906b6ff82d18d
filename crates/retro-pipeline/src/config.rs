use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Locations of the external tools and their data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// KNIME launcher.
    pub knime: PathBuf,
    /// The RetroPath2.0 workflow archive.
    pub workflow: PathBuf,
    /// KNIME preferences file, passed with `-preferences=` when set.
    pub preferences: Option<PathBuf>,
    /// Directory holding the builtin rule tables.
    pub rules_dir: PathBuf,
    /// Interpreter used to launch rp2paths.
    pub python: PathBuf,
    /// Working directory rp2paths is launched from.
    pub rp2paths_dir: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            knime: PathBuf::from("/usr/local/knime/knime"),
            workflow: PathBuf::from("/home/rp2/RetroPath2.0.knwf"),
            preferences: Some(PathBuf::from("/home/retrosynthesis/pref.epf")),
            rules_dir: PathBuf::from(retro_rules::DEFAULT_RULES_DIR),
            python: PathBuf::from("python3"),
            rp2paths_dir: PathBuf::from("/home/rp2paths"),
        }
    }
}
