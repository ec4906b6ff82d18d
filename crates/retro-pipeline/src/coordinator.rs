//! Pipeline coordinator: rules, then expansion, then enumeration.
//!
//! Each run gets a fresh scratch directory that is removed when the run ends,
//! so concurrent runs never observe each other's files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use retro_exec::ProcessRunner;
use retro_rules::{RuleSelector, RuleSource, RuleTable};
use retro_types::{
    EnumerationOutcome, EnumerationParams, ExpansionOutcome, ExpansionParams, OutcomeStatus,
    PipelineRequest, PipelineResult, PipelineStatus, Result, RetroError, RuleFormat,
    RuleOutputFormat, SourceDescriptor,
};
use tempfile::TempDir;

use crate::config::ToolPaths;
use crate::enumeration::EnumerationStage;
use crate::events::{EventEmitter, PipelineEvent, Stage};
use crate::expansion::ExpansionStage;

const SINK_FILE: &str = "sink.csv";
const RULES_FILE: &str = "rules.csv";
const PATHWAYS_FILE: &str = "rp2_pathways.csv";

/// A user-uploaded rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRules {
    pub data: Vec<u8>,
    pub format: RuleFormat,
}

/// Everything one pipeline run needs, owned so it can be queued.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub sink: Vec<u8>,
    pub user_rules: Option<UserRules>,
    pub request: PipelineRequest,
}

impl PipelineJob {
    /// A supplied rule file requires a format.
    pub fn new(request: PipelineRequest, sink: Vec<u8>, rules: Option<Vec<u8>>) -> Result<Self> {
        let user_rules = match (rules, request.rules_format) {
            (None, _) => None,
            (Some(data), Some(format)) => Some(UserRules { data, format }),
            (Some(_), None) => return Err(RetroError::MissingParameter("rules_format".into())),
        };
        Ok(Self {
            sink,
            user_rules,
            request,
        })
    }
}

/// Drives a full pipeline run.
#[derive(Clone)]
pub struct PipelineCoordinator {
    selector: RuleSelector,
    expansion: ExpansionStage,
    enumeration: EnumerationStage,
    events: EventEmitter,
    scratch_root: Option<PathBuf>,
}

impl PipelineCoordinator {
    pub fn new(runner: Arc<dyn ProcessRunner>, paths: ToolPaths) -> Self {
        Self {
            selector: RuleSelector::new(&paths.rules_dir),
            expansion: ExpansionStage::new(runner.clone(), paths.clone()),
            enumeration: EnumerationStage::new(runner, paths),
            events: EventEmitter::default(),
            scratch_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn selector(&self) -> &RuleSelector {
        &self.selector
    }

    fn scratch(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("retro-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Run the full pipeline.
    ///
    /// Stage failures come back as a tagged [`PipelineResult`]; `Err` is kept
    /// for failures to set up the run itself.
    pub async fn run(&self, job: &PipelineJob) -> Result<PipelineResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let scratch = self.scratch()?;
        let dir = scratch.path();
        tracing::info!(run_id = %run_id, scratch = %dir.display(), "pipeline started");
        self.events.emit(PipelineEvent::PipelineStarted {
            run_id: run_id.clone(),
            source_name: job.request.source.name.clone(),
        });

        let result = self.drive(&run_id, job, dir).await?;

        tracing::info!(run_id = %run_id, status = %result.status, "pipeline finished");
        self.events.emit(PipelineEvent::PipelineCompleted {
            run_id,
            status: result.status.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(result)
    }

    async fn drive(&self, run_id: &str, job: &PipelineJob, dir: &Path) -> Result<PipelineResult> {
        let request = &job.request;
        let sink = dir.join(SINK_FILE);
        std::fs::write(&sink, &job.sink)?;

        // Step 1: rules.
        let source = match &job.user_rules {
            Some(user) => RuleSource::Inline {
                data: user.data.clone(),
                format: user.format,
            },
            None => RuleSource::Builtin,
        };
        let rules = dir.join(RULES_FILE);
        let stage_start = self.stage_started(run_id, Stage::Rules);
        let selection = {
            let selector = self.selector.clone();
            let (scope, diameters, dest) = (request.scope, request.diameters.clone(), rules.clone());
            tokio::task::spawn_blocking(move || {
                selector.select(&source, scope, &diameters, RuleOutputFormat::Csv, &dest)
            })
            .await
            .map_err(|e| RetroError::Other(format!("rule selection task: {e}")))
            .and_then(|r| r)
        };
        match selection {
            Ok(report) => {
                tracing::debug!(run_id, rows_kept = report.rows_kept, "rules ready");
                self.stage_completed(run_id, Stage::Rules, "success", stage_start);
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "rule selection failed");
                self.stage_completed(run_id, Stage::Rules, "rule-selection-failed", stage_start);
                return Ok(PipelineResult::failed(
                    PipelineStatus::RuleSelectionFailed,
                    e.to_string(),
                ));
            }
        }

        // Step 2: expansion.
        let expansion_dir = dir.join("expansion");
        std::fs::create_dir(&expansion_dir)?;
        let stage_start = self.stage_started(run_id, Stage::Expansion);
        let outcome = self
            .expansion
            .run(&sink, &rules, &request.source, &request.expansion, &expansion_dir)
            .await;
        self.stage_completed(run_id, Stage::Expansion, outcome.status.as_str(), stage_start);

        let status = outcome.status;
        let partial_expansion = if status.is_success() {
            None
        } else if request.expansion.allow_partial && outcome.has_payload() {
            tracing::warn!(run_id, status = %status, "continuing with partial expansion results");
            Some(status)
        } else {
            return Ok(PipelineResult::failed(status.into(), outcome.diagnostic));
        };
        let Some(pathways) = outcome.into_payload() else {
            return Ok(PipelineResult::failed(
                status.into(),
                "expansion produced no payload",
            ));
        };

        // Step 3: enumeration.
        let pathways_path = dir.join(PATHWAYS_FILE);
        std::fs::write(&pathways_path, &pathways)?;
        let enumeration_dir = dir.join("enumeration");
        std::fs::create_dir(&enumeration_dir)?;
        let stage_start = self.stage_started(run_id, Stage::Enumeration);
        let outcome = self
            .enumeration
            .run(&pathways_path, &request.enumeration, &enumeration_dir, None)
            .await;
        self.stage_completed(run_id, Stage::Enumeration, outcome.status.as_str(), stage_start);

        let status = outcome.status;
        if !status.is_success() {
            return Ok(PipelineResult::failed(status.into(), outcome.diagnostic));
        }
        match outcome.into_payload() {
            Some(payload) => Ok(PipelineResult::success(pathways, payload, partial_expansion)),
            None => Ok(PipelineResult::failed(
                status.into(),
                "enumeration produced no payload",
            )),
        }
    }

    /// Expansion on its own, with user rules used as given.
    pub async fn run_expansion(
        &self,
        sink: &[u8],
        rules: &UserRules,
        source: &SourceDescriptor,
        params: &ExpansionParams,
    ) -> Result<ExpansionOutcome> {
        let scratch = self.scratch()?;
        let dir = scratch.path();
        let sink_path = dir.join(SINK_FILE);
        std::fs::write(&sink_path, sink)?;
        let rules_path = dir.join(RULES_FILE);
        let rules_csv = match rules.format {
            RuleFormat::Csv => rules.data.clone(),
            RuleFormat::Tsv => RuleTable::from_tsv(rules.data.as_slice())?.to_csv()?,
            RuleFormat::Tar => RuleTable::from_tar(&rules.data)?.to_csv()?,
        };
        std::fs::write(&rules_path, rules_csv)?;
        let workdir = dir.join("expansion");
        std::fs::create_dir(&workdir)?;
        Ok(self
            .expansion
            .run(&sink_path, &rules_path, source, params, &workdir)
            .await)
    }

    /// Enumeration on its own.
    pub async fn run_enumeration(
        &self,
        pathways: &[u8],
        params: &EnumerationParams,
    ) -> Result<EnumerationOutcome> {
        let scratch = self.scratch()?;
        let dir = scratch.path();
        let input = dir.join(PATHWAYS_FILE);
        std::fs::write(&input, pathways)?;
        let workdir = dir.join("enumeration");
        std::fs::create_dir(&workdir)?;
        Ok(self.enumeration.run(&input, params, &workdir, None).await)
    }

    fn stage_started(&self, run_id: &str, stage: Stage) -> Instant {
        tracing::info!(run_id, stage = %stage, "stage started");
        self.events.emit(PipelineEvent::StageStarted {
            run_id: run_id.to_string(),
            stage,
        });
        Instant::now()
    }

    fn stage_completed(&self, run_id: &str, stage: Stage, status: &str, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(run_id, stage = %stage, status, duration_ms, "stage completed");
        self.events.emit(PipelineEvent::StageCompleted {
            run_id: run_id.to_string(),
            stage,
            status: status.to_string(),
            duration_ms,
        });
    }
}
