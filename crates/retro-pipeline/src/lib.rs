//! Retrosynthesis pipeline: rule selection, expansion, enumeration.
//!
//! The two stage runners wrap opaque external tools (the KNIME RetroPath2.0
//! workflow and the rp2paths script) and classify every run into a status tag.
//! [`PipelineCoordinator`] sequences them in a private scratch directory.

mod artifacts;
pub mod config;
pub mod coordinator;
pub mod enumeration;
pub mod events;
pub mod expansion;

pub use config::ToolPaths;
pub use coordinator::{PipelineCoordinator, PipelineJob, UserRules};
pub use enumeration::{EnumerationDestinations, EnumerationStage};
pub use events::{EventEmitter, PipelineEvent, Stage};
pub use expansion::ExpansionStage;
