//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use planindex_core::{
    ControlService, JobRegistry, Orchestrator, ProgressBroadcaster, ProgressEvent,
    ProgressUpdate, StreamItem, to_pretty_json,
};
use planindex_oracle::{OpenRouterOracle, OutputBudget, RetryPolicy, StructuredOracle};
use planindex_shared::{
    AppConfig, ProcessingConfig, RetryConfig, expand_home, init_config, load_config,
    resolve_api_key,
};
use planindex_storage::Storage;
use tracing::info;

use crate::import;
use crate::server;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PlanIndex: hierarchical context trees for construction plan sets.
#[derive(Parser)]
#[command(
    name = "planindex",
    version,
    about = "Analyze annotated plan sheets into a searchable context tree.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (overrides `[database] path`).
    #[arg(long, global = true, env = "PLANINDEX_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Import projects, documents, and annotations from a JSON manifest.
    Import {
        /// Path to the manifest file.
        manifest: PathBuf,
    },

    /// List imported projects.
    List,

    /// Run Pass 1 and Pass 2 over a project's pages, then roll up ready disciplines.
    Process {
        /// Project ID.
        project: String,

        /// Pass 1 worker pool width.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Page-level retry budget for orphaned pages.
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Run Pass 3 over disciplines whose pages are all complete.
    Disciplines {
        /// Project ID.
        project: String,
    },

    /// Show page and discipline counts by status.
    Status {
        /// Project ID.
        project: String,
    },

    /// Revert all pages to unprocessed and disciplines to waiting.
    Reset {
        /// Project ID.
        project: String,
    },

    /// Write the project's context tree as JSON.
    Export {
        /// Project ID.
        project: String,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Start the HTTP control surface.
    Serve {
        /// Address to bind (overrides `[server] bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "planindex=info",
        1 => "planindex=debug",
        _ => "planindex=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the control service over an open database.
pub(crate) fn build_control(
    config: &AppConfig,
    storage: Arc<Storage>,
    processing: ProcessingConfig,
    api_key: String,
) -> planindex_shared::Result<ControlService> {
    let oracle = OpenRouterOracle::new(&config.oracle, api_key)?;
    let structured = StructuredOracle::new(
        Arc::new(oracle),
        RetryPolicy::from(&RetryConfig::from(config)),
        OutputBudget::from(config),
    );
    let progress = Arc::new(ProgressBroadcaster::from(&config.progress));
    let orchestrator = Arc::new(Orchestrator::new(
        storage,
        structured,
        progress.clone(),
        processing,
    ));
    Ok(ControlService::new(
        orchestrator,
        Arc::new(JobRegistry::new()),
        progress,
    ))
}

async fn open_storage(config: &AppConfig, db: Option<&Path>) -> Result<Arc<Storage>> {
    let path = match db {
        Some(p) => p.to_path_buf(),
        None => expand_home(&config.database.path)?,
    };
    info!(path = %path.display(), "opening database");
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Open the database and wire the pipeline. Commands that never reach the
/// oracle run without an API key.
async fn control_for(
    config: &AppConfig,
    db: Option<&Path>,
    processing: ProcessingConfig,
    needs_oracle: bool,
) -> Result<ControlService> {
    let api_key = if needs_oracle {
        resolve_api_key(config)?
    } else {
        resolve_api_key(config).unwrap_or_default()
    };
    let storage = open_storage(config, db).await?;
    Ok(build_control(config, storage, processing, api_key)?)
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db.as_deref();
    match cli.command {
        Command::Import { manifest } => cmd_import(db, &manifest).await,
        Command::List => cmd_list(db).await,
        Command::Process {
            project,
            concurrency,
            max_retries,
        } => cmd_process(db, &project, concurrency, max_retries).await,
        Command::Disciplines { project } => cmd_disciplines(db, &project).await,
        Command::Status { project } => cmd_status(db, &project).await,
        Command::Reset { project } => cmd_reset(db, &project).await,
        Command::Export { project, out } => cmd_export(db, &project, out.as_deref()).await,
        Command::Serve { bind } => cmd_serve(db, bind).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_import(db: Option<&Path>, manifest_path: &Path) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;
    let manifest = import::read_manifest(manifest_path)?;
    let summary = import::import_manifest(&storage, &manifest).await?;

    println!();
    println!("  Imported {} project(s)", summary.projects.len());
    for (id, name) in &summary.projects {
        println!("    {id}  {name}");
    }
    println!("  Documents:   {}", summary.documents);
    println!("  Annotations: {}", summary.annotations);
    println!();
    Ok(())
}

async fn cmd_list(db: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;
    let projects = storage.list_projects().await?;
    if projects.is_empty() {
        println!("No projects. Import one with `planindex import <manifest.json>`.");
    }
    for (id, name) in projects {
        println!("{id}  {name}");
    }
    Ok(())
}

async fn cmd_process(
    db: Option<&Path>,
    project: &str,
    concurrency: Option<usize>,
    max_retries: Option<u32>,
) -> Result<()> {
    let config = load_config()?;
    let mut processing = ProcessingConfig::from(&config);
    if let Some(n) = concurrency {
        processing.concurrency = n.max(1);
    }
    if let Some(n) = max_retries {
        processing.max_page_retries = n;
    }
    let control = control_for(&config, db, processing, true).await?;

    let mut subscription = control.subscribe(project).await?;
    let (response, handle) = control.spawn_pages(project).await?;
    let handle = handle.ok_or_else(|| eyre!("a page run is already active ({})", response.job_id))?;
    if let Ok(job_id) = response.job_id.parse() {
        subscription.follow(job_id);
    }
    info!(project, job_id = %response.job_id, "page run started");

    let reporter = tokio::spawn(report_progress(subscription));
    let summary = tokio::select! {
        joined = handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            let cancelled = control.cancel(project).await?;
            info!(jobs = cancelled.len(), "cancellation requested, finishing current phase");
            // The run task is detached; wait until it ends its phase.
            return wait_for_idle(&control, project).await;
        }
    };
    let _ = reporter.await;

    println!();
    println!("  Page processing finished");
    println!("  Pass 1:  {} complete, {} errors", summary.pass1_completed, summary.pass1_errors);
    println!("  Pass 2:  {} complete, {} errors", summary.pass2_completed, summary.pass2_errors);
    println!("  Failed:  {}", summary.permanently_failed);
    println!("  Disciplines rolled up: {}", summary.disciplines_completed);
    println!("  Rounds:  {}", summary.rounds);
    println!();
    Ok(())
}

async fn wait_for_idle(control: &ControlService, project: &str) -> Result<()> {
    loop {
        let status = control.status(project).await?;
        if status.active_jobs.is_empty() {
            println!("Run cancelled.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn cmd_disciplines(db: Option<&Path>, project: &str) -> Result<()> {
    let config = load_config()?;
    let control = control_for(&config, db, ProcessingConfig::from(&config), true).await?;

    let mut subscription = control.subscribe(project).await?;
    let (response, handle) = control.spawn_disciplines(project).await?;
    let handle =
        handle.ok_or_else(|| eyre!("a discipline run is already active ({})", response.job_id))?;
    if let Ok(job_id) = response.job_id.parse() {
        subscription.follow(job_id);
    }

    let reporter = tokio::spawn(report_progress(subscription));
    let summary = handle.await??;
    let _ = reporter.await;

    println!();
    println!("  Discipline rollup finished");
    println!("  Ready:     {}", summary.disciplines_ready);
    println!("  Complete:  {}", summary.disciplines_completed);
    println!("  Failed:    {}", summary.disciplines_failed);
    println!();
    Ok(())
}

async fn cmd_status(db: Option<&Path>, project: &str) -> Result<()> {
    let config = load_config()?;
    let control = control_for(&config, db, ProcessingConfig::from(&config), false).await?;
    let status = control.status(project).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_reset(db: Option<&Path>, project: &str) -> Result<()> {
    let config = load_config()?;
    let control = control_for(&config, db, ProcessingConfig::from(&config), false).await?;
    let counts = control.reset(project).await?;
    println!(
        "Reset {} page(s) and {} discipline(s).",
        counts.pages_reset, counts.disciplines_reset
    );
    Ok(())
}

async fn cmd_export(db: Option<&Path>, project: &str, out: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let control = control_for(&config, db, ProcessingConfig::from(&config), false).await?;
    let tree = control.export(project).await?;
    let json = to_pretty_json(&tree)?;

    match out {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("Context tree written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_serve(db: Option<&Path>, bind: Option<String>) -> Result<()> {
    let config = load_config()?;
    let control = control_for(&config, db, ProcessingConfig::from(&config), true).await?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    println!("PlanIndex control surface on http://{bind}");
    server::serve(control, &bind).await
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress display
// ---------------------------------------------------------------------------

/// Drive a spinner from the progress stream until the run ends.
async fn report_progress(mut subscription: planindex_core::Subscription) {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message("Waiting for run to start");

    while let Some(item) = subscription.next().await {
        if let StreamItem::Event(update) = item {
            if let Some(line) = describe(&update) {
                spinner.println(line);
            }
            spinner.set_message(status_line(&update.event));
        }
    }
    spinner.finish_and_clear();
}

fn status_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::ProcessingStarted { pass1_total, round } => {
            format!("Round {} · Pass 1 over {pass1_total} page(s)", round + 1)
        }
        ProgressEvent::RetryRoundStarted { pass1_total, round } => {
            format!("Retry round {round} · Pass 1 over {pass1_total} page(s)")
        }
        ProgressEvent::PagePass1Complete {
            sheet_number,
            pass1_progress,
            pass1_total,
            ..
        } => format!("Pass 1 [{pass1_progress}/{pass1_total}] {sheet_number}"),
        ProgressEvent::PagePass2Complete {
            sheet_number,
            pass2_progress,
            pass2_total,
            ..
        } => format!("Pass 2 [{pass2_progress}/{pass2_total}] {sheet_number}"),
        ProgressEvent::Pass1Complete { .. } => "Resolving references".into(),
        ProgressEvent::Pass2Complete { .. } => "Sweeping orphaned pages".into(),
        ProgressEvent::DisciplineReady { discipline_name, .. } => {
            format!("Rolling up {discipline_name}")
        }
        _ => String::new(),
    }
}

/// Lines worth keeping in the scrollback.
fn describe(update: &ProgressUpdate) -> Option<String> {
    match &update.event {
        ProgressEvent::Pass1Complete {
            completed, errors, ..
        } => Some(format!("  Pass 1: {completed} complete, {errors} errors")),
        ProgressEvent::Pass2Complete { completed, errors } => {
            Some(format!("  Pass 2: {completed} complete, {errors} errors"))
        }
        ProgressEvent::DisciplineComplete {
            discipline_name,
            page_count,
            key_contents_count,
            ..
        } => Some(format!(
            "  {discipline_name}: {page_count} page(s), {key_contents_count} key item(s)"
        )),
        ProgressEvent::PageError { page_id, pass, error } => {
            Some(format!("  ! page {page_id} (pass {pass}): {error}"))
        }
        ProgressEvent::DisciplineError {
            discipline_code,
            error,
            ..
        } => Some(format!("  ! discipline {discipline_code}: {error}")),
        ProgressEvent::OrphansSwept {
            requeued,
            permanently_failed,
        } => {
            let mut lines = Vec::new();
            if !requeued.is_empty() {
                lines.push(format!("  Requeued {} unfinished page(s)", requeued.len()));
            }
            lines.extend(permanently_failed.iter().map(|p| {
                format!(
                    "  ! {} permanently failed after {} retries",
                    p.sheet_number, p.retry_count
                )
            }));
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
        ProgressEvent::ProcessingError { error } => Some(format!("  ! run failed: {error}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planindex_core::SweptPage;
    use planindex_shared::{DisciplineCode, JobId};

    #[test]
    fn cli_parses_process_flags() {
        let cli = Cli::try_parse_from([
            "planindex",
            "-v",
            "process",
            "proj-1",
            "--concurrency",
            "8",
            "--max-retries",
            "1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Process {
                project,
                concurrency,
                max_retries,
            } => {
                assert_eq!(project, "proj-1");
                assert_eq!(concurrency, Some(8));
                assert_eq!(max_retries, Some(1));
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn errors_are_kept_in_scrollback() {
        let update = ProgressUpdate {
            job_id: JobId::new(),
            event: ProgressEvent::PageError {
                page_id: "p1".into(),
                pass: 2,
                error: "oracle error: timed out".into(),
            },
        };
        let line = describe(&update).unwrap();
        assert!(line.contains("pass 2"));

        let ready = ProgressUpdate {
            job_id: JobId::new(),
            event: ProgressEvent::DisciplineReady {
                discipline_code: DisciplineCode::Mechanical,
                discipline_name: "Mechanical".into(),
            },
        };
        assert!(describe(&ready).is_none());
        assert_eq!(status_line(&ready.event), "Rolling up Mechanical");
    }

    #[test]
    fn permanent_failures_are_listed() {
        let update = ProgressUpdate {
            job_id: JobId::new(),
            event: ProgressEvent::OrphansSwept {
                requeued: vec![],
                permanently_failed: vec![SweptPage {
                    page_id: "p1".into(),
                    sheet_number: "M-201".into(),
                    retry_count: 2,
                }],
            },
        };
        let line = describe(&update).unwrap();
        assert!(line.contains("M-201 permanently failed after 2 retries"));

        let retry = ProgressEvent::RetryRoundStarted {
            pass1_total: 1,
            round: 1,
        };
        assert!(status_line(&retry).starts_with("Retry round 1"));
    }
}
