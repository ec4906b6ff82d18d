//! Run external tools with a memory cap and a timeout.
//!
//! Stage runners never spawn processes themselves; they hand a [`CommandSpec`]
//! to a [`ProcessRunner`]. [`LocalProcessRunner`] is the real implementation,
//! tests substitute scripted stand-ins.

pub mod clip;
pub mod local;
pub mod runner;

pub use clip::{clip, ClipMode};
pub use local::LocalProcessRunner;
pub use runner::{CommandSpec, ExecResult, ProcessRunner};
