//! Expansion stage: the RetroPath2.0 KNIME workflow.
//!
//! After the child exits (or is killed) the scratch directory is inspected in
//! a fixed order, each check returning immediately:
//!
//! 1. source-in-sink diagnostic table
//! 2. timeout
//! 3. out-of-memory marker in stdout
//! 4. scope file
//!
//! Launch failures and an unusable memory cap are classified before any of
//! these, since no artifacts can exist. Every non-success path that may
//! salvage a partial results table goes through [`ExpansionStage::salvage`].

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use retro_exec::{clip, ClipMode, CommandSpec, ExecResult, ProcessRunner};
use retro_types::{
    ExpansionOutcome, ExpansionParams, ExpansionStatus, RetroError, SourceDescriptor,
};

use crate::artifacts;
use crate::config::ToolPaths;

pub const SOURCE_FILE: &str = "source.csv";
pub const RESULTS_FILE: &str = "results.csv";
pub const SOURCE_IN_SINK_FILE: &str = "source-in-sink.csv";
pub const SCOPE_PATTERN: &str = "*_scope.csv";

/// Printed by the JVM when it cannot reserve its heap under the cap.
pub const MEMORY_MARKER: &str =
    "There is insufficient memory for the Java Runtime Environment to continue";

const DIAGNOSTIC_STDERR_BYTES: usize = 4096;

/// Runs the expansion workflow through an injected [`ProcessRunner`].
#[derive(Clone)]
pub struct ExpansionStage {
    runner: Arc<dyn ProcessRunner>,
    paths: ToolPaths,
}

impl ExpansionStage {
    pub fn new(runner: Arc<dyn ProcessRunner>, paths: ToolPaths) -> Self {
        Self { runner, paths }
    }

    /// Run one expansion inside `workdir`, which must be private to this run.
    pub async fn run(
        &self,
        sink: &Path,
        rules: &Path,
        source: &SourceDescriptor,
        params: &ExpansionParams,
        workdir: &Path,
    ) -> ExpansionOutcome {
        let source_path = workdir.join(SOURCE_FILE);
        let staged = source
            .to_csv()
            .and_then(|bytes| std::fs::write(&source_path, bytes).map_err(RetroError::from));
        if let Err(e) = staged {
            tracing::error!(error = %e, "cannot stage source table");
            return ExpansionOutcome::failed(
                ExpansionStatus::OsError,
                format!("Error: cannot write source table: {e}"),
            );
        }

        let spec = self.command(workdir, sink, rules, &source_path, params);
        tracing::info!(
            source = %source.name,
            max_steps = params.max_steps,
            timeout_minutes = params.timeout_minutes,
            ram_limit_gb = params.ram_limit_gb,
            "starting expansion"
        );

        let exec = match self.runner.run(&spec).await {
            Ok(exec) => exec,
            Err(RetroError::MemoryLimit { requested, reason }) => {
                tracing::error!(requested, %reason, "cannot apply memory cap to expansion");
                return self.salvage(
                    ExpansionStatus::RamPartial,
                    ExpansionStatus::RamError,
                    params,
                    workdir,
                    context(&spec, workdir, &format!("cannot cap memory: {reason}")),
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "expansion workflow raised an OS error");
                return self.salvage(
                    ExpansionStatus::OsPartial,
                    ExpansionStatus::OsError,
                    params,
                    workdir,
                    context(&spec, workdir, &e.to_string()),
                );
            }
        };

        self.classify(&spec, &exec, params, workdir)
    }

    /// Build the KNIME batch command line.
    pub fn command(
        &self,
        workdir: &Path,
        sink: &Path,
        rules: &Path,
        source: &Path,
        params: &ExpansionParams,
    ) -> CommandSpec {
        let int_var = |name: &str, value: u32| format!("-workflow.variable={name},\"{value}\",int");
        let str_var =
            |name: &str, value: &str| format!("-workflow.variable={name},\"{value}\",String");

        let mut spec = CommandSpec::new(&self.paths.knime)
            .args([
                "-nosplash",
                "-nosave",
                "-reset",
                "--launcher.suppressErrors",
                "-application",
                "org.knime.product.KNIME_BATCH_APPLICATION",
            ])
            .arg(format!("-workflowFile={}", self.paths.workflow.display()))
            .arg(int_var("input.dmin", params.dmin))
            .arg(int_var("input.dmax", params.dmax))
            .arg(int_var("input.max-steps", params.max_steps))
            .arg(str_var("input.sourcefile", &source.display().to_string()))
            .arg(str_var("input.sinkfile", &sink.display().to_string()))
            .arg(str_var("input.rulesfile", &rules.display().to_string()))
            .arg(int_var("input.topx", params.topx))
            .arg(int_var("input.mwmax-source", params.mwmax_source))
            .arg(int_var("input.mwmax-cof", params.mwmax_cof))
            .arg(str_var("output.dir", &format!("{}/", workdir.display())))
            .arg(str_var("output.solutionfile", RESULTS_FILE))
            .arg(str_var("output.sourceinsinkfile", SOURCE_IN_SINK_FILE));
        if let Some(prefs) = &self.paths.preferences {
            spec = spec.arg(format!("-preferences={}", prefs.display()));
        }
        spec.timeout(params.timeout())
            .memory_limit(params.memory_limit_bytes())
    }

    fn classify(
        &self,
        spec: &CommandSpec,
        exec: &ExecResult,
        params: &ExpansionParams,
        workdir: &Path,
    ) -> ExpansionOutcome {
        tracing::debug!(
            exit_code = ?exec.exit_code,
            timed_out = exec.timed_out,
            duration_ms = exec.duration_ms,
            files = %artifacts::listing(workdir),
            "expansion workflow finished"
        );
        let stderr = clip(&exec.stderr, DIAGNOSTIC_STDERR_BYTES, ClipMode::Tail);

        match artifacts::count_rows_strict(&workdir.join(SOURCE_IN_SINK_FILE)) {
            Ok(rows) if rows > 1 => {
                tracing::error!("source has been found in the sink");
                return ExpansionOutcome::failed(
                    ExpansionStatus::SourceInSink,
                    context(spec, workdir, "source found in sink"),
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::error!("cannot find the source-in-sink table");
                return ExpansionOutcome::failed(
                    ExpansionStatus::SourceInSinkCheckFailed,
                    context(spec, workdir, &format!("{e}\n{stderr}")),
                );
            }
            Err(e) => {
                return self.salvage(
                    ExpansionStatus::OsPartial,
                    ExpansionStatus::OsError,
                    params,
                    workdir,
                    context(spec, workdir, &format!("reading source-in-sink table: {e}")),
                );
            }
        }

        if exec.timed_out {
            tracing::warn!(timeout_minutes = params.timeout_minutes, "expansion timed out");
            return self.salvage(
                ExpansionStatus::TimeoutPartial,
                ExpansionStatus::TimeoutError,
                params,
                workdir,
                context(spec, workdir, "timeout"),
            );
        }

        if exec.stdout.contains(MEMORY_MARKER) {
            tracing::warn!("expansion does not have sufficient memory to continue");
            return self.salvage(
                ExpansionStatus::MemoryPartial,
                ExpansionStatus::MemoryError,
                params,
                workdir,
                context(spec, workdir, "memory error"),
            );
        }

        let scope = match artifacts::find_matching(workdir, SCOPE_PATTERN) {
            Ok(found) => found.into_iter().next(),
            Err(e) => {
                return self.salvage(
                    ExpansionStatus::OsPartial,
                    ExpansionStatus::OsError,
                    params,
                    workdir,
                    context(spec, workdir, &e.to_string()),
                );
            }
        };
        match scope {
            Some(path) => match std::fs::read(&path) {
                Ok(bytes) => {
                    tracing::info!(scope = %path.display(), bytes = bytes.len(), "expansion succeeded");
                    ExpansionOutcome::with_payload(ExpansionStatus::Success, bytes, "")
                }
                Err(e) => self.salvage(
                    ExpansionStatus::OsPartial,
                    ExpansionStatus::OsError,
                    params,
                    workdir,
                    context(spec, workdir, &format!("reading {}: {e}", path.display())),
                ),
            },
            None => {
                tracing::warn!("no scope file generated");
                self.salvage(
                    ExpansionStatus::NoScopePartial,
                    ExpansionStatus::NoResultsError,
                    params,
                    workdir,
                    context(spec, workdir, &format!("no scope file\n{stderr}")),
                )
            }
        }
    }

    /// Return the partial results table when allowed and non-trivial, else fail.
    fn salvage(
        &self,
        partial: ExpansionStatus,
        error: ExpansionStatus,
        params: &ExpansionParams,
        workdir: &Path,
        diagnostic: String,
    ) -> ExpansionOutcome {
        let results = workdir.join(RESULTS_FILE);
        let has_rows = artifacts::count_rows(&results).is_some_and(|rows| rows > 1);
        if params.allow_partial && has_rows {
            match std::fs::read(&results) {
                Ok(bytes) => {
                    tracing::warn!(status = %partial, "passing the partial results table instead");
                    return ExpansionOutcome::with_payload(partial, bytes, diagnostic);
                }
                Err(e) => tracing::error!(error = %e, "partial results table unreadable"),
            }
        }
        ExpansionOutcome::failed(error, diagnostic)
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
    use retro_types::{OutcomeStatus, Result};

    /// Writes fixed files into the output directory and returns a canned result.
    struct Fixture {
        files: Vec<(&'static str, &'static str)>,
        exec: ExecResult,
    }

    #[async_trait::async_trait]
    impl ProcessRunner for Fixture {
        async fn run(&self, spec: &CommandSpec) -> Result<ExecResult> {
            let dir = spec
                .arg_value("-workflow.variable=output.dir,\"")
                .and_then(|v| v.strip_suffix("/\",String"))
                .unwrap()
                .to_string();
            for (name, body) in &self.files {
                std::fs::write(Path::new(&dir).join(name), body).unwrap();
            }
            Ok(self.exec.clone())
        }
    }

    fn finished() -> ExecResult {
        ExecResult {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    async fn run_with(
        files: Vec<(&'static str, &'static str)>,
        exec: ExecResult,
        allow_partial: bool,
    ) -> ExpansionOutcome {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Fixture { files, exec });
        let stage = ExpansionStage::new(runner, ToolPaths::default());
        let mut params = ExpansionParams::new(3);
        params.allow_partial = allow_partial;
        stage
            .run(
                Path::new("/tmp/sink.csv"),
                Path::new("/tmp/rules.csv"),
                &SourceDescriptor::new("target", "InChI=1S/X"),
                &params,
                dir.path(),
            )
            .await
    }

    const EMPTY_SIS: (&str, &str) = (SOURCE_IN_SINK_FILE, "\"source\",\"sink\"\n");
    const RESULTS: (&str, &str) = (RESULTS_FILE, "Initial source,Transformation ID\nS1,T1\n");

    #[tokio::test]
    async fn scope_file_is_the_payload() {
        let outcome = run_with(
            vec![EMPTY_SIS, RESULTS, ("target_scope.csv", "scope,rows\n1,2\n")],
            finished(),
            false,
        )
        .await;
        assert_eq!(outcome.status, ExpansionStatus::Success);
        assert_eq!(outcome.payload().unwrap(), b"scope,rows\n1,2\n");
    }

    #[tokio::test]
    async fn missing_sis_table_is_check_failure() {
        let outcome = run_with(vec![RESULTS], finished(), true).await;
        assert_eq!(outcome.status, ExpansionStatus::SourceInSinkCheckFailed);
        assert!(!outcome.has_payload());
    }

    #[tokio::test]
    async fn source_in_sink_beats_timeout() {
        let timed_out = ExecResult {
            timed_out: true,
            ..Default::default()
        };
        let outcome = run_with(
            vec![(SOURCE_IN_SINK_FILE, "source,sink\nS,S\n"), RESULTS],
            timed_out,
            true,
        )
        .await;
        assert_eq!(outcome.status, ExpansionStatus::SourceInSink);
        assert!(!outcome.has_payload());
    }

    #[tokio::test]
    async fn timeout_salvages_only_when_allowed() {
        let timed_out = ExecResult {
            timed_out: true,
            ..Default::default()
        };
        let partial = run_with(vec![EMPTY_SIS, RESULTS], timed_out.clone(), true).await;
        assert_eq!(partial.status, ExpansionStatus::TimeoutPartial);
        assert!(partial.payload().unwrap().starts_with(b"Initial source"));

        let strict = run_with(vec![EMPTY_SIS, RESULTS], timed_out.clone(), false).await;
        assert_eq!(strict.status, ExpansionStatus::TimeoutError);
        assert!(!strict.has_payload());

        let header_only = run_with(
            vec![EMPTY_SIS, (RESULTS_FILE, "Initial source\n")],
            timed_out,
            true,
        )
        .await;
        assert_eq!(header_only.status, ExpansionStatus::TimeoutError);
    }

    #[tokio::test]
    async fn memory_marker_in_stdout() {
        let exec = ExecResult {
            stdout: format!("...\n# {MEMORY_MARKER}.\n"),
            exit_code: Some(1),
            ..Default::default()
        };
        let outcome = run_with(vec![EMPTY_SIS], exec, true).await;
        assert_eq!(outcome.status, ExpansionStatus::MemoryError);
    }

    #[tokio::test]
    async fn no_scope_falls_back_to_results() {
        let partial = run_with(vec![EMPTY_SIS, RESULTS], finished(), true).await;
        assert_eq!(partial.status, ExpansionStatus::NoScopePartial);
        assert!(partial.status.is_partial());

        let none = run_with(vec![EMPTY_SIS, RESULTS], finished(), false).await;
        assert_eq!(none.status, ExpansionStatus::NoResultsError);
    }

    struct Failing(fn() -> RetroError);

    #[async_trait::async_trait]
    impl ProcessRunner for Failing {
        async fn run(&self, _spec: &CommandSpec) -> Result<ExecResult> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn launch_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let params = ExpansionParams::new(3);
        let source = SourceDescriptor::new("target", "x");
        let sink = Path::new("/tmp/sink.csv");
        let rules = Path::new("/tmp/rules.csv");

        let spawn = ExpansionStage::new(
            Arc::new(Failing(|| RetroError::Spawn {
                program: "knime".into(),
                source: std::io::Error::new(ErrorKind::NotFound, "missing"),
            })),
            ToolPaths::default(),
        );
        let outcome = spawn.run(sink, rules, &source, &params, dir.path()).await;
        assert_eq!(outcome.status, ExpansionStatus::OsError);
        assert!(outcome.diagnostic.contains("knime"));

        let ram = ExpansionStage::new(
            Arc::new(Failing(|| RetroError::MemoryLimit {
                requested: 1,
                reason: "hard limit".into(),
            })),
            ToolPaths::default(),
        );
        let outcome = ram.run(sink, rules, &source, &params, dir.path()).await;
        assert_eq!(outcome.status, ExpansionStatus::RamError);
    }

    #[test]
    fn command_line_matches_workflow_bindings() {
        let stage = ExpansionStage::new(
            Arc::new(Failing(|| RetroError::Other("unused".into()))),
            ToolPaths::default(),
        );
        let mut params = ExpansionParams::new(6);
        params.ram_limit_gb = 2;
        let spec = stage.command(
            Path::new("/scratch"),
            Path::new("/scratch/sink.csv"),
            Path::new("/scratch/rules.csv"),
            Path::new("/scratch/source.csv"),
            &params,
        );
        let line = spec.to_string();
        assert!(line.starts_with("/usr/local/knime/knime -nosplash -nosave -reset"));
        assert!(line.contains("-workflowFile=/home/rp2/RetroPath2.0.knwf"));
        assert!(line.contains("-workflow.variable=input.max-steps,\"6\",int"));
        assert!(line.contains("-workflow.variable=input.sourcefile,\"/scratch/source.csv\",String"));
        assert!(line.contains("-workflow.variable=output.dir,\"/scratch/\",String"));
        assert!(line.ends_with("-preferences=/home/retrosynthesis/pref.epf"));
        assert_eq!(spec.memory_limit_bytes, Some(2_097_152_000));
        assert_eq!(spec.timeout, Some(std::time::Duration::from_secs(7200)));
    }
}
