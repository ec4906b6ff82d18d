//! Enumeration stage: rp2paths.
//!
//! Classification order: timeout marker, memory marker, missing outputs,
//! empty outputs. There is no partial salvage at this stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use retro_exec::{clip, ClipMode, CommandSpec, ProcessRunner};
use retro_types::{
    EnumerationOutcome, EnumerationParams, EnumerationPayload, EnumerationStatus, RetroError,
};

use crate::artifacts;
use crate::config::ToolPaths;

pub const PATHS_FILE: &str = "out_paths.csv";
pub const COMPOUNDS_FILE: &str = "compounds.txt";

/// Printed by rp2paths when its own timeout fires.
pub const TIMEOUT_MARKER: &str = "TIMEOUT";
/// Printed by the loader when the address-space cap is hit.
pub const MEMORY_MARKER: &str = "failed to map segment from shared object";

/// Extra wall-clock time granted past the tool's own timeout.
const SUPERVISOR_GRACE: Duration = Duration::from_secs(60);

/// Optional copies of the two output tables.
#[derive(Debug, Clone)]
pub struct EnumerationDestinations {
    pub paths: PathBuf,
    pub compounds: PathBuf,
}

#[derive(Clone)]
pub struct EnumerationStage {
    runner: Arc<dyn ProcessRunner>,
    paths: ToolPaths,
}

impl EnumerationStage {
    pub fn new(runner: Arc<dyn ProcessRunner>, paths: ToolPaths) -> Self {
        Self { runner, paths }
    }

    pub fn command(&self, pathways: &Path, params: &EnumerationParams, outdir: &Path) -> CommandSpec {
        let tool_timeout = params.timeout();
        CommandSpec::new(&self.paths.python)
            .args(["-m", "rp2paths", "all"])
            .arg(pathways.display().to_string())
            .arg("--outdir")
            .arg(format!("{}/", outdir.display()))
            .arg("--timeout")
            .arg(tool_timeout.as_secs().to_string())
            .current_dir(&self.paths.rp2paths_dir)
            .timeout(tool_timeout + SUPERVISOR_GRACE)
            .memory_limit(params.memory_limit_bytes())
    }

    /// Enumerate pathways from an expansion table into `workdir`.
    pub async fn run(
        &self,
        pathways: &Path,
        params: &EnumerationParams,
        workdir: &Path,
        destinations: Option<&EnumerationDestinations>,
    ) -> EnumerationOutcome {
        let spec = self.command(pathways, params, workdir);
        tracing::info!(
            timeout_minutes = params.timeout_minutes,
            ram_limit_gb = params.ram_limit_gb,
            "starting enumeration"
        );

        let exec = match self.runner.run(&spec).await {
            Ok(exec) => exec,
            Err(RetroError::MemoryLimit { reason, .. }) => {
                tracing::error!(%reason, "could not set up a RAM limit for enumeration");
                return EnumerationOutcome::failed(
                    EnumerationStatus::RamError,
                    context(&spec, workdir, &reason),
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "enumeration raised an OS error");
                return EnumerationOutcome::failed(
                    EnumerationStatus::OsError,
                    context(&spec, workdir, &e.to_string()),
                );
            }
        };
        let stderr = clip(&exec.stderr, 4096, ClipMode::Tail);

        if exec.timed_out || exec.stdout.contains(TIMEOUT_MARKER) {
            tracing::error!(timeout_minutes = params.timeout_minutes, "enumeration timed out");
            return EnumerationOutcome::failed(
                EnumerationStatus::Timeout,
                context(&spec, workdir, &stderr),
            );
        }
        if exec.stderr.contains(MEMORY_MARKER) {
            tracing::error!("enumeration does not have sufficient memory to continue");
            return EnumerationOutcome::failed(
                EnumerationStatus::MemoryError,
                context(&spec, workdir, &stderr),
            );
        }

        let (paths, compounds) = match (
            std::fs::read(workdir.join(PATHS_FILE)),
            std::fs::read(workdir.join(COMPOUNDS_FILE)),
        ) {
            (Ok(p), Ok(c)) => (p, c),
            (p, c) => {
                let missing: Vec<&str> = [(PATHS_FILE, p.is_err()), (COMPOUNDS_FILE, c.is_err())]
                    .into_iter()
                    .filter_map(|(name, missing)| missing.then_some(name))
                    .collect();
                tracing::error!(?missing, "cannot find the enumeration output files");
                return EnumerationOutcome::failed(
                    EnumerationStatus::FileNotFound,
                    context(&spec, workdir, &format!("missing {}\n{stderr}", missing.join(", "))),
                );
            }
        };

        if paths.is_empty() && compounds.is_empty() {
            tracing::error!("enumeration returned empty files");
            return EnumerationOutcome::failed(
                EnumerationStatus::Empty,
                context(&spec, workdir, "empty output files"),
            );
        }

        if let Some(dest) = destinations {
            let copied = std::fs::write(&dest.paths, &paths)
                .and_then(|_| std::fs::write(&dest.compounds, &compounds));
            if let Err(e) = copied {
                return EnumerationOutcome::failed(
                    EnumerationStatus::OsError,
                    context(&spec, workdir, &format!("copying outputs: {e}")),
                );
            }
        }

        tracing::info!(
            paths_bytes = paths.len(),
            compounds_bytes = compounds.len(),
            "enumeration succeeded"
        );
        EnumerationOutcome::with_payload(
            EnumerationStatus::Success,
            EnumerationPayload { paths, compounds },
            "",
        )
    }
}

fn context(spec: &CommandSpec, workdir: &Path, error: &str) -> String {
    format!(
        "Command: {spec}\nError: {error}\nScratch: {}",
        artifacts::listing(workdir)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use retro_exec::ExecResult;
    use retro_types::Result;

    struct Fixture {
        files: Vec<(&'static str, &'static str)>,
        exec: ExecResult,
    }

    #[async_trait::async_trait]
    impl ProcessRunner for Fixture {
        async fn run(&self, spec: &CommandSpec) -> Result<ExecResult> {
            let pos = spec.args.iter().position(|a| a == "--outdir").unwrap();
            let dir = PathBuf::from(spec.args[pos + 1].trim_end_matches('/'));
            for (name, body) in &self.files {
                std::fs::write(dir.join(name), body).unwrap();
            }
            Ok(self.exec.clone())
        }
    }

    async fn run_with(
        files: Vec<(&'static str, &'static str)>,
        exec: ExecResult,
    ) -> (EnumerationOutcome, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let stage = EnumerationStage::new(Arc::new(Fixture { files, exec }), ToolPaths::default());
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let dest = EnumerationDestinations {
            paths: dir.path().join("paths.csv"),
            compounds: dir.path().join("compounds.txt"),
        };
        let outcome = stage
            .run(
                Path::new("/tmp/rp2.csv"),
                &EnumerationParams::default(),
                &work,
                Some(&dest),
            )
            .await;
        (outcome, dir)
    }

    #[tokio::test]
    async fn success_copies_both_tables() {
        let (outcome, dir) = run_with(
            vec![(PATHS_FILE, "Path ID,Unit ID\n1,a\n"), (COMPOUNDS_FILE, "cmpd_id\tstructure\n")],
            ExecResult::default(),
        )
        .await;
        assert_eq!(outcome.status, EnumerationStatus::Success);
        let payload = outcome.payload().unwrap();
        assert_eq!(payload.paths, b"Path ID,Unit ID\n1,a\n");
        assert_eq!(std::fs::read(dir.path().join("compounds.txt")).unwrap(), payload.compounds);
    }

    #[tokio::test]
    async fn timeout_marker_wins() {
        let exec = ExecResult {
            stdout: "TIMEOUT reached\n".into(),
            stderr: MEMORY_MARKER.into(),
            ..Default::default()
        };
        let (outcome, _dir) = run_with(vec![], exec).await;
        assert_eq!(outcome.status, EnumerationStatus::Timeout);
        assert!(!outcome.has_payload());
    }

    #[tokio::test]
    async fn supervisor_timeout_is_timeout() {
        let exec = ExecResult {
            timed_out: true,
            ..Default::default()
        };
        let (outcome, _dir) = run_with(vec![(PATHS_FILE, "x"), (COMPOUNDS_FILE, "y")], exec).await;
        assert_eq!(outcome.status, EnumerationStatus::Timeout);
    }

    #[tokio::test]
    async fn memory_marker_in_stderr() {
        let exec = ExecResult {
            stderr: format!("ImportError: libfoo.so: {MEMORY_MARKER}"),
            ..Default::default()
        };
        let (outcome, _dir) = run_with(vec![], exec).await;
        assert_eq!(outcome.status, EnumerationStatus::MemoryError);
    }

    #[tokio::test]
    async fn missing_output_is_file_not_found() {
        let (outcome, _dir) = run_with(vec![(PATHS_FILE, "x")], ExecResult::default()).await;
        assert_eq!(outcome.status, EnumerationStatus::FileNotFound);
        assert!(outcome.diagnostic.contains(COMPOUNDS_FILE));
    }

    #[tokio::test]
    async fn empty_outputs_are_flagged() {
        let (outcome, _dir) =
            run_with(vec![(PATHS_FILE, ""), (COMPOUNDS_FILE, "")], ExecResult::default()).await;
        assert_eq!(outcome.status, EnumerationStatus::Empty);
        assert!(!outcome.has_payload());
    }

    #[test]
    fn command_passes_tool_timeout() {
        let stage = EnumerationStage::new(
            Arc::new(Fixture {
                files: vec![],
                exec: ExecResult::default(),
            }),
            ToolPaths::default(),
        );
        let spec = stage.command(
            Path::new("/s/rp2.csv"),
            &EnumerationParams::default(),
            Path::new("/s/out"),
        );
        assert_eq!(
            spec.to_string(),
            "python3 -m rp2paths all /s/rp2.csv --outdir /s/out/ --timeout 1800"
        );
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/home/rp2paths")));
        assert_eq!(spec.timeout, Some(Duration::from_secs(1860)));
        assert_eq!(spec.memory_limit_bytes, Some(20 * 1000 * 1024 * 1024));
    }
}
