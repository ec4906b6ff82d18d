//! `retro`: run retrosynthesis stages locally or serve them over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use retro_exec::LocalProcessRunner;
use retro_pipeline::{
    EnumerationDestinations, EnumerationStage, PipelineCoordinator, PipelineEvent, PipelineJob,
    ToolPaths, UserRules,
};
use retro_rules::{RuleSelector, RuleSource};
use retro_server::{AppState, ServerConfig};
use retro_types::{Endpoint, OutcomeStatus, RequestParams};
use serde_json::{json, Map, Value};

#[derive(Parser)]
#[command(name = "retro", version, about = "Retrosynthesis pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    tools: ToolArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Locations of the external tools and builtin rules.
#[derive(Args)]
struct ToolArgs {
    /// KNIME executable
    #[arg(long, global = true, env = "RETRO_KNIME")]
    knime: Option<PathBuf>,

    /// RetroPath2.0 workflow file
    #[arg(long, global = true, env = "RETRO_WORKFLOW")]
    workflow: Option<PathBuf>,

    /// KNIME preferences file
    #[arg(long, global = true, env = "RETRO_PREFERENCES")]
    preferences: Option<PathBuf>,

    /// Directory holding the builtin rule tables
    #[arg(long, global = true, env = "RETRO_RULES_DIR")]
    rules_dir: Option<PathBuf>,

    /// Python interpreter used to launch rp2paths
    #[arg(long, global = true, env = "RETRO_PYTHON")]
    python: Option<PathBuf>,

    /// Working directory for rp2paths
    #[arg(long, global = true, env = "RETRO_RP2PATHS_DIR")]
    rp2paths_dir: Option<PathBuf>,
}

impl ToolArgs {
    fn resolve(&self) -> ToolPaths {
        let defaults = ToolPaths::default();
        ToolPaths {
            knime: self.knime.clone().unwrap_or(defaults.knime),
            workflow: self.workflow.clone().unwrap_or(defaults.workflow),
            preferences: self.preferences.clone().or(defaults.preferences),
            rules_dir: self.rules_dir.clone().unwrap_or(defaults.rules_dir),
            python: self.python.clone().unwrap_or(defaults.python),
            rp2paths_dir: self.rp2paths_dir.clone().unwrap_or(defaults.rp2paths_dir),
        }
    }
}

/// Rule selection flags shared by `rules` and `run`.
#[derive(Args)]
struct RuleArgs {
    /// User rule table instead of the builtin one
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Format of --rules: csv, tsv or tar
    #[arg(long)]
    rules_format: Option<String>,

    /// Rule usage scope: all, forward or retro
    #[arg(long)]
    scope: Option<String>,

    /// Comma-separated rule diameters (default: all)
    #[arg(long)]
    diameters: Option<String>,
}

/// Expansion flags. Omitted values take the request defaults.
#[derive(Args)]
struct ExpansionArgs {
    /// Source compound InChI
    #[arg(long)]
    source_inchi: String,

    /// Source compound name
    #[arg(long)]
    source_name: Option<String>,

    #[arg(long)]
    max_steps: u32,

    #[arg(long)]
    topx: Option<u32>,

    #[arg(long)]
    dmin: Option<u32>,

    #[arg(long)]
    dmax: Option<u32>,

    #[arg(long)]
    mwmax_source: Option<u32>,

    #[arg(long)]
    mwmax_cof: Option<u32>,

    /// Wall-clock limit in minutes
    #[arg(long)]
    timeout: Option<f64>,

    /// Memory limit in GB
    #[arg(long)]
    ram_limit: Option<u64>,

    /// Accept partial expansion results
    #[arg(long)]
    partial: bool,
}

impl ExpansionArgs {
    fn insert_into(&self, data: &mut Map<String, Value>) {
        data.insert("source_inchi".into(), json!(self.source_inchi));
        data.insert("max_steps".into(), json!(self.max_steps));
        data.insert("partial_retro".into(), json!(self.partial));
        let optional = [
            ("source_name", self.source_name.as_ref().map(|v| json!(v))),
            ("topx", self.topx.map(|v| json!(v))),
            ("dmin", self.dmin.map(|v| json!(v))),
            ("dmax", self.dmax.map(|v| json!(v))),
            ("mwmax_source", self.mwmax_source.map(|v| json!(v))),
            ("mwmax_cof", self.mwmax_cof.map(|v| json!(v))),
            ("time_out", self.timeout.map(|v| json!(v))),
            ("ram_limit", self.ram_limit.map(|v| json!(v))),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                data.insert(key.into(), value);
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Filter a rule table by scope and diameter
    Rules {
        #[command(flatten)]
        rules: RuleArgs,

        /// Output format: csv or tar
        #[arg(long)]
        output_format: Option<String>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the expansion stage only
    Expand {
        /// Sink compound table
        #[arg(long)]
        sink: PathBuf,

        /// Rule table
        #[arg(long)]
        rules: PathBuf,

        /// Format of --rules: csv, tsv or tar
        #[arg(long, default_value = "csv")]
        rules_format: String,

        #[command(flatten)]
        expansion: ExpansionArgs,

        /// Where to write the expansion table
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the enumeration stage only
    Enumerate {
        /// Expansion table
        pathways: PathBuf,

        /// Wall-clock limit in minutes
        #[arg(long)]
        timeout: Option<f64>,

        /// Memory limit in GB
        #[arg(long)]
        ram_limit: Option<u64>,

        /// Directory receiving the paths and compounds tables
        #[arg(short, long)]
        outdir: PathBuf,
    },

    /// Run rules, expansion and enumeration end to end
    Run {
        /// Sink compound table
        #[arg(long)]
        sink: PathBuf,

        #[command(flatten)]
        rules: RuleArgs,

        #[command(flatten)]
        expansion: ExpansionArgs,

        /// Where to write the result archive
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "RETRO_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "RETRO_PORT", default_value = "8888")]
        port: u16,

        /// Job queue workers
        #[arg(long, env = "RETRO_WORKERS", default_value = "1")]
        workers: usize,

        /// Interval of the server-side job poll loop, in milliseconds
        #[arg(long, env = "RETRO_POLL_INTERVAL_MS", default_value = "1000")]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let paths = cli.tools.resolve();
    tracing::debug!(?paths, "tool paths");
    match cli.command {
        Commands::Rules {
            rules,
            output_format,
            output,
        } => cmd_rules(&paths, &rules, output_format, &output).await?,
        Commands::Expand {
            sink,
            rules,
            rules_format,
            expansion,
            output,
        } => cmd_expand(paths, &sink, &rules, rules_format, &expansion, &output).await?,
        Commands::Enumerate {
            pathways,
            timeout,
            ram_limit,
            outdir,
        } => cmd_enumerate(paths, &pathways, timeout, ram_limit, &outdir).await?,
        Commands::Run {
            sink,
            rules,
            expansion,
            output,
        } => cmd_run(paths, &sink, &rules, &expansion, &output).await?,
        Commands::Serve {
            host,
            port,
            workers,
            poll_interval_ms,
        } => {
            let config = ServerConfig {
                host,
                port,
                workers,
                poll_interval: Duration::from_millis(poll_interval_ms),
            };
            let state = AppState::new(coordinator(paths), &config);
            retro_server::serve(&config, state).await?;
        }
    }

    Ok(())
}

fn coordinator(paths: ToolPaths) -> PipelineCoordinator {
    PipelineCoordinator::new(Arc::new(LocalProcessRunner::new()), paths)
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn rule_data(rules: &RuleArgs, data: &mut Map<String, Value>, format_key: &str) {
    if let Some(scope) = &rules.scope {
        data.insert("rules_type".into(), json!(scope));
    }
    if let Some(diameters) = &rules.diameters {
        data.insert("diameters".into(), json!(diameters));
    }
    if let Some(format) = &rules.rules_format {
        data.insert(format_key.into(), json!(format));
    }
}

async fn cmd_rules(
    paths: &ToolPaths,
    rules: &RuleArgs,
    output_format: Option<String>,
    output: &Path,
) -> anyhow::Result<()> {
    let mut data = Map::new();
    rule_data(rules, &mut data, "input_format");
    if let Some(format) = output_format {
        data.insert("output_format".into(), json!(format));
    }
    let RequestParams::Rules(request) =
        RequestParams::resolve(&Value::Object(data), Endpoint::Rules, rules.rules.is_some())?
    else {
        anyhow::bail!("rule parameters did not resolve");
    };

    let source = match (&rules.rules, request.input_format) {
        (Some(path), Some(format)) => RuleSource::User {
            path: path.clone(),
            format,
        },
        _ => RuleSource::Builtin,
    };
    let selector = RuleSelector::new(&paths.rules_dir);
    let report = selector.select(
        &source,
        request.scope,
        &request.diameters,
        request.output_format,
        output,
    )?;
    println!(
        "Kept {} of {} rules -> {}",
        report.rows_kept,
        report.rows_read,
        output.display()
    );
    Ok(())
}

async fn cmd_expand(
    paths: ToolPaths,
    sink: &Path,
    rules: &Path,
    rules_format: String,
    expansion: &ExpansionArgs,
    output: &Path,
) -> anyhow::Result<()> {
    let mut data = Map::new();
    expansion.insert_into(&mut data);
    data.insert("rules_format".into(), json!(rules_format));
    let RequestParams::Expansion(request) =
        RequestParams::resolve(&Value::Object(data), Endpoint::Expansion, true)?
    else {
        anyhow::bail!("expansion parameters did not resolve");
    };

    let user = UserRules {
        data: read(rules)?,
        format: request.rules_format,
    };
    let outcome = coordinator(paths)
        .run_expansion(&read(sink)?, &user, &request.source, &request.params)
        .await?;
    let status = outcome.status;
    let diagnostic = outcome.diagnostic.clone();
    let Some(table) = outcome.into_payload() else {
        anyhow::bail!("expansion ended with '{status}': {diagnostic}");
    };
    std::fs::write(output, table)?;
    println!("Expansion {status} (HTTP {}) -> {}", status.http_status(), output.display());
    Ok(())
}

async fn cmd_enumerate(
    paths: ToolPaths,
    pathways: &Path,
    timeout: Option<f64>,
    ram_limit: Option<u64>,
    outdir: &Path,
) -> anyhow::Result<()> {
    let mut data = Map::new();
    if let Some(timeout) = timeout {
        data.insert("timeout".into(), json!(timeout));
    }
    if let Some(ram_limit) = ram_limit {
        data.insert("ram_limit".into(), json!(ram_limit));
    }
    let RequestParams::Enumeration(params) =
        RequestParams::resolve(&Value::Object(data), Endpoint::Enumeration, false)?
    else {
        anyhow::bail!("enumeration parameters did not resolve");
    };

    std::fs::create_dir_all(outdir)?;
    let destinations = EnumerationDestinations {
        paths: outdir.join("rp2paths_pathways.csv"),
        compounds: outdir.join("rp2paths_compounds.tsv"),
    };
    let scratch = tempfile::Builder::new().prefix("retro-").tempdir()?;
    let stage = EnumerationStage::new(Arc::new(LocalProcessRunner::new()), paths);
    let outcome = stage
        .run(pathways, &params, scratch.path(), Some(&destinations))
        .await;
    if !outcome.status.is_success() {
        anyhow::bail!("enumeration ended with '{}': {}", outcome.status, outcome.diagnostic);
    }
    println!(
        "Enumeration succeeded -> {}, {}",
        destinations.paths.display(),
        destinations.compounds.display()
    );
    Ok(())
}

async fn cmd_run(
    paths: ToolPaths,
    sink: &Path,
    rules: &RuleArgs,
    expansion: &ExpansionArgs,
    output: &Path,
) -> anyhow::Result<()> {
    let mut data = Map::new();
    expansion.insert_into(&mut data);
    rule_data(rules, &mut data, "rules_format");
    let RequestParams::Pipeline(request) =
        RequestParams::resolve(&Value::Object(data), Endpoint::Pipeline, rules.rules.is_some())?
    else {
        anyhow::bail!("pipeline parameters did not resolve");
    };
    let user_rules = rules.rules.as_deref().map(read).transpose()?;
    let job = PipelineJob::new(request, read(sink)?, user_rules)?;

    let coordinator = coordinator(paths);
    let mut events = coordinator.events().subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StageStarted { stage, .. } => println!("[{stage}] started"),
                PipelineEvent::StageCompleted {
                    stage,
                    status,
                    duration_ms,
                    ..
                } => println!("[{stage}] {status} ({duration_ms} ms)"),
                PipelineEvent::PipelineCompleted { .. } => break,
                PipelineEvent::PipelineStarted { .. } => {}
            }
        }
    });

    let result = coordinator.run(&job).await?;
    let _ = progress.await;
    if !result.status.is_success() {
        anyhow::bail!(
            "pipeline ended with '{}' (HTTP {}): {}",
            result.status,
            result.http_status(),
            result.diagnostic
        );
    }
    std::fs::write(output, result.archive()?)?;
    if let Some(partial) = result.partial_expansion {
        println!("Expansion was partial: {partial}");
    }
    println!("Pipeline succeeded -> {}", output.display());
    Ok(())
}
