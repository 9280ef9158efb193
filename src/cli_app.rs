//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Read as _, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{ColoredString, Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use drift_ledger::core::config::{Config, MAX_MARGIN_MINUTES, MAX_TREND_WEEKS};
use drift_ledger::core::errors::DlgError;
use drift_ledger::core::time::{format_ts, parse_ts, parse_window, window_start};
use drift_ledger::daemon::{DriftDaemon, SignalHandler, process_inbox};
use drift_ledger::incidents::{
    NewIncident, PatternQuery, correlate_incident, correlate_window, create_incident,
    find_similar, generate_knowledge_pack, list_incidents, parse_knowledge_pack, parse_services,
    render_incident_knowledge, resolve_incident, show_incident,
};
use drift_ledger::ingest::{IngestReport, ingest_document};
use drift_ledger::logger::dual::{
    ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, ingest_events, reconcile_events,
    spawn_logger,
};
use drift_ledger::model::{DriftCategory, DriftObservation, ResolveOutcome, Severity};
use drift_ledger::reconcile::Reconciler;
use drift_ledger::reports::{
    load_crash_loops, load_dependency_map, load_deploy_velocity, load_host_pressure,
    load_orphaned_routes, load_platform_health, load_triangulation, load_update_backlog,
};
use drift_ledger::scoring::{SeverityWeights, build_ledger, weekly_trend};
use drift_ledger::store::{DriftFilter, Store};
use drift_ledger::timeline::{DEFAULT_LIMIT, Timeline, TimelineQuery, load_timeline};

/// Drift Ledger: fleet drift detection and incident correlation.
#[derive(Debug, Parser)]
#[command(
    name = "dlg",
    author,
    version,
    about = "Drift Ledger - desired vs. observed state reconciliation and incident correlation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the engine database path.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Evaluate time-relative queries as of this RFC 3339 instant.
    #[arg(long, global = true, value_name = "TIMESTAMP")]
    now: Option<String>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Ingest batch documents into the snapshot store.
    Ingest(IngestArgs),
    /// Run one reconciliation pass over the current snapshot.
    Reconcile,
    /// Run the periodic cycle daemon.
    Daemon(DaemonArgs),
    /// Inspect and manage drift observations.
    Drift(DriftArgs),
    /// Show the drift debt ledger.
    Debt(DebtArgs),
    /// Show weekly drift detection and resolution trend.
    DebtTrend(DebtTrendArgs),
    /// Fleet reports over the committed snapshot.
    Report(ReportArgs),
    /// Show the unified deploy/container/incident timeline.
    Timeline(TimelineArgs),
    /// Manage and correlate incidents.
    Incident(IncidentArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct IngestArgs {
    /// Batch documents to ingest; `-` reads stdin.
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
    /// Drain the configured inbox directory instead.
    #[arg(long, conflicts_with = "files")]
    inbox: bool,
}

#[derive(Debug, Clone, Args)]
struct DaemonArgs {
    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Args)]
struct DriftArgs {
    #[command(subcommand)]
    command: DriftCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum DriftCommand {
    /// List drift observations (unresolved only by default).
    List(DriftListArgs),
    /// Resolve a drift observation by id.
    Resolve(DriftResolveArgs),
    /// Check the one-unresolved-row-per-key invariant.
    Audit,
}

#[derive(Debug, Clone, Args)]
struct DriftListArgs {
    /// Only this service.
    #[arg(long)]
    service: Option<String>,
    /// Only this category (version-mismatch, route-orphaned, replica-deficit, config-drift).
    #[arg(long)]
    category: Option<String>,
    /// Include resolved rows.
    #[arg(long)]
    all: bool,
    /// Maximum rows to show.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct DriftResolveArgs {
    /// Drift observation id.
    id: i64,
    /// Resolution note.
    #[arg(long, default_value = "resolved manually")]
    resolution: String,
}

#[derive(Debug, Clone, Args)]
struct DebtArgs {
    /// Entries to show (defaults to scoring.ledger_top_n).
    #[arg(long, value_name = "N")]
    top: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct DebtTrendArgs {
    /// Weeks to cover (defaults to scoring.trend_weeks).
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_TREND_WEEKS))
    )]
    weeks: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportKind {
    Triangulation,
    OrphanedRoutes,
    Hosts,
    Deploys,
    CrashLoops,
    Backlog,
    Dependencies,
    Health,
}

impl ReportKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Triangulation => "report triangulation",
            Self::OrphanedRoutes => "report orphaned-routes",
            Self::Hosts => "report hosts",
            Self::Deploys => "report deploys",
            Self::CrashLoops => "report crash-loops",
            Self::Backlog => "report backlog",
            Self::Dependencies => "report dependencies",
            Self::Health => "report health",
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ReportArgs {
    /// Report to produce.
    #[arg(value_enum)]
    kind: ReportKind,
    /// Trailing window for the deploys report (for example: `7d`, `48h`).
    #[arg(long, default_value = "7d", value_name = "WINDOW")]
    window: String,
}

#[derive(Debug, Clone, Args)]
struct TimelineArgs {
    /// Window start (RFC 3339). Defaults to `--since` before the end.
    #[arg(long, value_name = "TIMESTAMP", conflicts_with = "since")]
    start: Option<String>,
    /// Window end (RFC 3339). Defaults to now.
    #[arg(long, value_name = "TIMESTAMP")]
    end: Option<String>,
    /// Trailing window length when no start is given.
    #[arg(long, default_value = "24h", value_name = "WINDOW")]
    since: String,
    /// Only events whose entity contains this text.
    #[arg(long)]
    entity: Option<String>,
    /// Maximum events (clamped to correlation.timeline_hard_cap).
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct IncidentArgs {
    #[command(subcommand)]
    command: IncidentCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum IncidentCommand {
    /// Record a new incident.
    Create(IncidentCreateArgs),
    /// Resolve an open incident.
    Resolve(IncidentResolveArgs),
    /// Show one incident with its knowledge.
    Show(IncidentIdArgs),
    /// List recent incidents.
    List(IncidentListArgs),
    /// Find past incidents by service overlap or keywords.
    Similar(IncidentSimilarArgs),
    /// Unified timeline around an incident or an explicit window.
    Correlate(IncidentCorrelateArgs),
    /// Generate the knowledge pack of a resolved incident.
    KnowledgePack(IncidentIdArgs),
}

#[derive(Debug, Clone, Args)]
struct IncidentCreateArgs {
    #[arg(long)]
    title: String,
    /// critical, warning or info.
    #[arg(long, default_value = "warning")]
    severity: String,
    /// Comma-separated affected services.
    #[arg(long)]
    services: String,
    /// Start instant (RFC 3339). Defaults to now.
    #[arg(long, value_name = "TIMESTAMP")]
    started_at: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct IncidentResolveArgs {
    id: i64,
    #[arg(long)]
    root_cause: String,
    #[arg(long)]
    resolution: String,
    /// Knowledge pack JSON object to attach.
    #[arg(long, value_name = "JSON")]
    knowledge_pack: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct IncidentIdArgs {
    id: i64,
}

#[derive(Debug, Clone, Args)]
struct IncidentListArgs {
    #[arg(long, default_value_t = 20, value_name = "N")]
    limit: usize,
}

#[derive(Debug, Clone, Args)]
struct IncidentSimilarArgs {
    /// Comma-separated services.
    #[arg(long, default_value = "")]
    services: String,
    /// Keyword text matched against title and root cause.
    #[arg(long)]
    keywords: Option<String>,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct IncidentCorrelateArgs {
    /// Incident id; omit to use an explicit window.
    #[arg(required_unless_present_all = ["start", "end"], conflicts_with_all = ["start", "end"])]
    id: Option<i64>,
    /// Explicit window start (RFC 3339).
    #[arg(long, value_name = "TIMESTAMP", requires = "end")]
    start: Option<String>,
    /// Explicit window end (RFC 3339).
    #[arg(long, value_name = "TIMESTAMP", requires = "start")]
    end: Option<String>,
    /// Override correlation.margin_minutes.
    #[arg(long, value_name = "MINUTES")]
    margin_minutes: Option<i64>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<DlgError> for CliError {
    fn from(e: DlgError) -> Self {
        if e.is_invariant_violation() {
            return Self::Internal(e.to_string());
        }
        match e {
            DlgError::InvalidConfig { .. }
            | DlgError::MissingConfig { .. }
            | DlgError::ConfigParse { .. }
            | DlgError::MalformedRecord { .. }
            | DlgError::MalformedSnapshot { .. } => Self::User(e.to_string()),
            _ if e.is_query_rejection() => Self::User(e.to_string()),
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Ingest(args) => run_ingest(cli, args),
        Command::Reconcile => run_reconcile(cli),
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Drift(args) => run_drift(cli, args),
        Command::Debt(args) => run_debt(cli, args),
        Command::DebtTrend(args) => run_debt_trend(cli, args),
        Command::Report(args) => run_report(cli, args),
        Command::Timeline(args) => run_timeline(cli, args),
        Command::Incident(args) => run_incident(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── shared plumbing ────────────────────

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.paths.sqlite_db.clone_from(db);
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<Store, CliError> {
    Ok(Store::open(&config.paths.sqlite_db)?)
}

fn now(cli: &Cli) -> Result<DateTime<Utc>, CliError> {
    cli.now
        .as_deref()
        .map_or_else(|| Ok(Utc::now()), |raw| parse_ts(raw).map_err(CliError::from))
}

/// Run `body` with a live activity logger, then flush it.
fn with_logger<T>(
    config: &Config,
    body: impl FnOnce(&ActivityLoggerHandle) -> Result<T, CliError>,
) -> Result<T, CliError> {
    let (handle, join) = spawn_logger(DualLoggerConfig::from_config(config))?;
    let result = body(&handle);
    handle.shutdown();
    if join.join().is_err() {
        eprintln!("[DLG-CLI] logger thread panicked");
    }
    result
}

fn emit<T: Serialize>(
    cli: &Cli,
    command: &str,
    payload: &T,
    human: impl FnOnce(),
) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            human();
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": command,
            "result": serde_json::to_value(payload)?,
        })),
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => severity.as_str().red().bold(),
        Severity::High => severity.as_str().red(),
        Severity::Medium => severity.as_str().yellow(),
        Severity::Low => severity.as_str().normal(),
    }
}

fn print_drift_row(obs: &DriftObservation) {
    let state = obs
        .resolved_at
        .map_or_else(|| "open".to_string(), |at| format!("resolved {}", format_ts(at)));
    println!(
        "#{:<5} {:<8} {:<20} {:<16} blast={} first_seen={} {}",
        obs.id,
        severity_label(obs.severity),
        obs.service_name,
        obs.category.as_str(),
        obs.blast_radius,
        format_ts(obs.first_seen_at),
        state
    );
    println!("       {}", obs.description);
}

fn print_timeline(timeline: &Timeline) {
    println!(
        "Timeline {} .. {} ({} events{})",
        format_ts(timeline.start),
        format_ts(timeline.end),
        timeline.events.len(),
        if timeline.truncated { ", truncated" } else { "" }
    );
    for event in &timeline.events {
        println!(
            "  {}  {:<8} {:<18} {}",
            format_ts(event.occurred_at),
            event.source.as_str(),
            event.event_type,
            event.entity
        );
    }
}

// ──────────────────── ingest / reconcile / daemon ────────────────────

#[derive(Debug, Serialize)]
struct FileIngest {
    source: String,
    report: IngestReport,
}

fn read_source(path: &PathBuf) -> Result<(String, Vec<u8>), CliError> {
    if path.as_os_str() == "-" {
        let mut bytes = Vec::new();
        io::stdin().read_to_end(&mut bytes)?;
        return Ok(("stdin".to_string(), bytes));
    }
    let bytes = std::fs::read(path).map_err(|e| DlgError::io(path, e))?;
    Ok((path.display().to_string(), bytes))
}

fn run_ingest(cli: &Cli, args: &IngestArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let at = now(cli)?;

    if args.inbox {
        let outcome = with_logger(&config, |logger| {
            Ok(process_inbox(&store, &config.paths.inbox_dir, logger, at)?)
        })?;
        emit(cli, "ingest", &outcome, || {
            println!(
                "Inbox {}: {} ingested, {} duplicate, {} rejected",
                config.paths.inbox_dir.display(),
                outcome.ingested.len(),
                outcome.duplicates.len(),
                outcome.rejected.len()
            );
        })?;
        if outcome.rejected.is_empty() {
            return Ok(());
        }
        return Err(CliError::Partial(format!(
            "{} inbox files rejected",
            outcome.rejected.len()
        )));
    }

    if args.files.is_empty() {
        return Err(CliError::User(
            "nothing to ingest: pass batch files, `-` for stdin, or --inbox".to_string(),
        ));
    }

    let results = with_logger(&config, |logger| {
        let mut results = Vec::with_capacity(args.files.len());
        for path in &args.files {
            let (source, bytes) = read_source(path)?;
            let report = ingest_document(&store, &source, &bytes, at)?;
            logger.send_all(ingest_events(&source, &report));
            results.push(FileIngest { source, report });
        }
        Ok(results)
    })?;

    emit(cli, "ingest", &results, || {
        for r in &results {
            if r.report.duplicate {
                println!("{}: already ingested, skipped", r.source);
                continue;
            }
            println!(
                "{}: {} records accepted, {} rejected",
                r.source,
                r.report.accepted.total(),
                r.report.rejected.len()
            );
            for rej in &r.report.rejected {
                println!("  [{}] {} #{}: {}", rej.code, rej.kind, rej.index, rej.details);
            }
        }
    })?;

    let rejected: usize = results.iter().map(|r| r.report.rejected.len()).sum();
    if rejected == 0 {
        Ok(())
    } else {
        Err(CliError::Partial(format!("{rejected} records rejected")))
    }
}

fn run_reconcile(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let at = now(cli)?;

    let report = with_logger(&config, |logger| {
        match Reconciler::new(&store, config.reconcile.clone()).run(at) {
            Ok(report) => {
                logger.send_all(reconcile_events(&report));
                Ok(report)
            }
            Err(e) => {
                if e.is_invariant_violation() {
                    logger.send(ActivityEvent::InvariantViolation {
                        code: e.code(),
                        details: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    })?;

    emit(cli, "reconcile", &report, || {
        println!(
            "Checked {} services: {} opened, {} updated, {} resolved, {} unchanged",
            report.services_checked,
            report.opened.len(),
            report.updated.len(),
            report.resolved.len(),
            report.unchanged
        );
        for obs in &report.opened {
            print_drift_row(obs);
        }
        for failure in &report.failures {
            println!(
                "  {} [{}] {}: {}",
                "FAILED".red(),
                failure.code,
                failure.service,
                failure.details
            );
        }
    })?;

    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::Partial(format!(
            "{} services failed detection",
            report.failures.len()
        )))
    }
}

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    if args.once {
        let store = open_store(&config)?;
        let at = now(cli)?;
        let summary = with_logger(&config, |logger| {
            let mut daemon = DriftDaemon::with_parts(
                config.clone(),
                store,
                logger.clone(),
                SignalHandler::unregistered(),
            );
            Ok(daemon.run_cycle_now(at)?)
        })?;
        return emit(cli, "daemon", &summary, || {
            println!(
                "Cycle complete: {} inbox files, {} services, {} opened, {} resolved, {} pending updates ({} ms)",
                summary.inbox.files_seen(),
                summary.reconcile.services_checked,
                summary.reconcile.opened.len(),
                summary.reconcile.resolved.len(),
                summary.updates_pending,
                summary.duration_ms
            );
        });
    }

    let mut daemon = DriftDaemon::new(config)?;
    daemon.run()?;
    Ok(())
}

// ──────────────────── drift / debt ────────────────────

fn run_drift(cli: &Cli, args: &DriftArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;

    match &args.command {
        DriftCommand::List(list) => {
            let category = list
                .category
                .as_deref()
                .map(|raw| {
                    DriftCategory::parse(raw)
                        .ok_or_else(|| CliError::User(format!("unknown drift category: {raw}")))
                })
                .transpose()?;
            let rows = store.list_drift(&DriftFilter {
                service: list.service.clone(),
                category,
                include_resolved: list.all,
                limit: list.limit,
            })?;
            emit(cli, "drift list", &rows, || {
                if rows.is_empty() {
                    println!("No drift.");
                }
                for obs in &rows {
                    print_drift_row(obs);
                }
            })
        }
        DriftCommand::Resolve(resolve) => {
            let at = now(cli)?;
            let outcome = with_logger(&config, |logger| {
                let outcome = store.resolve_drift(resolve.id, &resolve.resolution, at)?;
                if let ResolveOutcome::Resolved(obs) = &outcome {
                    logger.send(ActivityEvent::DriftResolved(obs.clone()));
                }
                Ok(outcome)
            })?;
            let (already, obs) = match outcome {
                ResolveOutcome::Resolved(obs) => (false, obs),
                ResolveOutcome::AlreadyResolved(obs) => (true, obs),
            };
            let payload = json!({ "already_resolved": already, "drift": obs });
            emit(cli, "drift resolve", &payload, || {
                if already {
                    println!("Drift #{} was already resolved.", obs.id);
                } else {
                    println!("Resolved drift #{}.", obs.id);
                }
                print_drift_row(&obs);
            })
        }
        DriftCommand::Audit => {
            let duplicates = store.audit_open_drift()?;
            emit(cli, "drift audit", &duplicates, || {
                if duplicates.is_empty() {
                    println!("{} at most one unresolved row per key.", "OK".green());
                }
                for d in &duplicates {
                    println!(
                        "{} {} / {}: {} unresolved rows",
                        "VIOLATION".red().bold(),
                        d.service_name,
                        d.category,
                        d.open_rows
                    );
                }
            })?;
            if duplicates.is_empty() {
                Ok(())
            } else {
                Err(CliError::Internal(format!(
                    "[DLG-2201] {} keys hold more than one unresolved drift row",
                    duplicates.len()
                )))
            }
        }
    }
}

fn run_debt(cli: &Cli, args: &DebtArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let weights = SeverityWeights::from(&config.scoring);
    let top = args.top.unwrap_or(config.scoring.ledger_top_n);
    let ledger = build_ledger(store.open_drift()?, &weights, top, now(cli)?);

    emit(cli, "debt", &ledger, || {
        println!(
            "Drift debt: {} open items, total score {}",
            ledger.total_open, ledger.total_score
        );
        for (rank, entry) in ledger.entries.iter().enumerate() {
            let obs = &entry.observation;
            println!(
                "{:>3}. {:>7}  {:<8} {:<20} {:<16} blast={} age={}d",
                rank + 1,
                entry.score,
                severity_label(obs.severity),
                obs.service_name,
                obs.category.as_str(),
                obs.blast_radius,
                entry.age_days
            );
        }
    })
}

fn run_debt_trend(cli: &Cli, args: &DebtTrendArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let weeks = args.weeks.unwrap_or(config.scoring.trend_weeks);
    let all = store.list_drift(&DriftFilter {
        include_resolved: true,
        ..DriftFilter::default()
    })?;
    let trend = weekly_trend(&all, weeks, now(cli)?);

    emit(cli, "debt-trend", &trend, || {
        println!("{:<12} {:>8} {:>8} {:>10} {:>9}", "week", "detected", "resolved", "unresolved", "avg days");
        for week in &trend {
            let avg = week
                .avg_resolution_days
                .map_or_else(|| "-".to_string(), |d| format!("{d:.1}"));
            println!(
                "{:<12} {:>8} {:>8} {:>10} {:>9}",
                week.week_start, week.detected, week.resolved, week.unresolved, avg
            );
        }
    })
}

// ──────────────────── reports ────────────────────

#[allow(clippy::too_many_lines)]
fn run_report(cli: &Cli, args: &ReportArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let at = now(cli)?;
    let label = args.kind.label();

    match args.kind {
        ReportKind::Triangulation => {
            let rows = load_triangulation(&store)?;
            emit(cli, label, &rows, || {
                for row in &rows {
                    let actual = if row.actual.is_empty() {
                        "(absent)".to_string()
                    } else {
                        row.actual.iter().cloned().collect::<Vec<_>>().join(", ")
                    };
                    let mark = if row.in_sync { "ok".green() } else { "DRIFT".yellow() };
                    println!(
                        "{:<20} desired={} actual={} latest={} [{}]",
                        row.service,
                        row.desired.as_deref().unwrap_or("-"),
                        actual,
                        row.latest.as_deref().unwrap_or("-"),
                        mark
                    );
                }
            })
        }
        ReportKind::OrphanedRoutes => {
            let routes = load_orphaned_routes(&store)?;
            emit(cli, label, &routes, || {
                if routes.is_empty() {
                    println!("No orphaned routes.");
                }
                for r in &routes {
                    println!(
                        "{:<32} -> {:<20} {} (drift #{}, since {})",
                        r.domain,
                        r.service,
                        r.actual,
                        r.drift_id,
                        format_ts(r.first_seen_at)
                    );
                }
            })
        }
        ReportKind::Hosts => {
            let hosts = load_host_pressure(&store, &config.hosts)?;
            emit(cli, label, &hosts, || {
                for h in &hosts {
                    println!(
                        "{:<20} disk={:>5.1}% mem={:>5.1}% {}",
                        h.host,
                        h.disk_usage_pct,
                        h.memory_usage_pct,
                        h.level.as_str()
                    );
                }
            })
        }
        ReportKind::Deploys => {
            let window = parse_window(&args.window)?;
            let days = load_deploy_velocity(&store, window, at)?;
            emit(cli, label, &days, || {
                for d in &days {
                    let pct = d
                        .success_pct
                        .map_or_else(|| "-".to_string(), |p| format!("{p:.1}%"));
                    println!(
                        "{}  started={} succeeded={} failed={} success={}",
                        d.day, d.started, d.succeeded, d.failed, pct
                    );
                }
            })
        }
        ReportKind::CrashLoops => {
            let loops = load_crash_loops(&store, &config.crash_loop, at)?;
            emit(cli, label, &loops, || {
                if loops.is_empty() {
                    println!("No crash loops.");
                }
                for l in &loops {
                    println!(
                        "{:<24} host={} restarts={} span={:.1}m last={}",
                        l.entity,
                        l.host,
                        l.restart_count,
                        l.span_minutes,
                        format_ts(l.last_event)
                    );
                }
            })
        }
        ReportKind::Backlog => {
            let backlog = load_update_backlog(&store)?;
            emit(cli, label, &backlog, || {
                if backlog.is_empty() {
                    println!("No pending updates.");
                }
                for s in &backlog {
                    println!(
                        "{:<20} {} -> {} {} risk={} checked={}",
                        s.service,
                        s.deployed_version,
                        s.latest_version,
                        s.status,
                        s.risk,
                        format_ts(s.last_checked)
                    );
                }
            })
        }
        ReportKind::Dependencies => {
            let deps = load_dependency_map(&store)?;
            emit(cli, label, &deps, || {
                for d in &deps {
                    println!(
                        "{:<20} blast={} networks=[{}] shares=[{}]",
                        d.service,
                        d.blast_radius,
                        d.networks.iter().cloned().collect::<Vec<_>>().join(","),
                        d.shares_with.iter().cloned().collect::<Vec<_>>().join(",")
                    );
                }
            })
        }
        ReportKind::Health => {
            let health = load_platform_health(&store, at)?;
            emit(cli, label, &health, || {
                println!("Platform health at {}", format_ts(health.generated_at));
                println!("  active drift:      {}", health.active_drift);
                println!("  OOM events (24h):  {}", health.oom_events_24h);
                println!("  pending updates:   {}", health.pending_updates);
                println!(
                    "  avg disk (24h):    {}",
                    health
                        .avg_disk_pct_24h
                        .map_or_else(|| "-".to_string(), |p| format!("{p:.1}%"))
                );
                println!(
                    "  degraded services: {}",
                    if health.degraded_services.is_empty() {
                        "none".to_string()
                    } else {
                        health.degraded_services.join(", ")
                    }
                );
            })
        }
    }
}

// ──────────────────── timeline ────────────────────

fn run_timeline(cli: &Cli, args: &TimelineArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let end = match &args.end {
        Some(raw) => parse_ts(raw)?,
        None => now(cli)?,
    };
    let start = match &args.start {
        Some(raw) => parse_ts(raw)?,
        None => window_start(end, parse_window(&args.since)?)?,
    };

    let mut query = TimelineQuery::window(start, end).with_limit(
        args.limit.unwrap_or(DEFAULT_LIMIT),
        config.correlation.timeline_hard_cap,
    );
    if let Some(entity) = &args.entity {
        query = query.with_entity(entity.clone());
    }
    let timeline = load_timeline(&store, &query)?;
    emit(cli, "timeline", &timeline, || print_timeline(&timeline))
}

// ──────────────────── incidents ────────────────────

#[allow(clippy::too_many_lines)]
fn run_incident(cli: &Cli, args: &IncidentArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;

    match &args.command {
        IncidentCommand::Create(create) => {
            let started_at = match &create.started_at {
                Some(raw) => parse_ts(raw)?,
                None => now(cli)?,
            };
            let new = NewIncident::from_raw(
                &create.title,
                &create.severity,
                &create.services,
                started_at,
            )?;
            let marker = with_logger(&config, |logger| {
                let marker = create_incident(&store, &new, config.correlation.margin_minutes)?;
                logger.send(ActivityEvent::IncidentCreated(marker.clone()));
                Ok(marker)
            })?;
            emit(cli, "incident create", &marker, || {
                println!("Created incident #{}: {}", marker.id, marker.title);
                if let Some(q) = &marker.timeline_query {
                    println!("  timeline: dlg incident {q}");
                }
            })
        }
        IncidentCommand::Resolve(resolve) => {
            let pack = resolve
                .knowledge_pack
                .as_deref()
                .map(parse_knowledge_pack)
                .transpose()?;
            let at = now(cli)?;
            let marker = with_logger(&config, |logger| {
                let marker = resolve_incident(
                    &store,
                    resolve.id,
                    &resolve.root_cause,
                    &resolve.resolution,
                    pack.as_ref(),
                    at,
                )?;
                logger.send(ActivityEvent::IncidentResolved(marker.clone()));
                Ok(marker)
            })?;
            emit(cli, "incident resolve", &marker, || {
                println!("Resolved incident #{}: {}", marker.id, marker.title);
            })
        }
        IncidentCommand::Show(show) => {
            let marker = show_incident(&store, show.id)?;
            emit(cli, "incident show", &marker, || {
                print!("{}", render_incident_knowledge(&marker));
            })
        }
        IncidentCommand::List(list) => {
            let incidents = list_incidents(&store, list.limit)?;
            emit(cli, "incident list", &incidents, || {
                if incidents.is_empty() {
                    println!("No incidents.");
                }
                for m in &incidents {
                    let status = if m.is_resolved() {
                        "resolved".green()
                    } else {
                        "ONGOING".red()
                    };
                    println!(
                        "#{:<5} {:<8} {} {:<8} {} [{}]",
                        m.id,
                        m.severity,
                        format_ts(m.started_at),
                        status,
                        m.title,
                        m.affected_services.iter().cloned().collect::<Vec<_>>().join(",")
                    );
                }
            })
        }
        IncidentCommand::Similar(similar) => {
            let query = PatternQuery {
                services: parse_services(&similar.services),
                keywords: similar.keywords.clone(),
                limit: similar.limit,
            };
            let similar = find_similar(&store, &query, &config.patterns)?;
            emit(cli, "incident similar", &similar, || {
                if similar.matches.is_empty() {
                    println!("No similar incidents.");
                }
                for m in &similar.matches {
                    println!(
                        "#{:<5} {} {} (root cause: {})",
                        m.id,
                        format_ts(m.started_at),
                        m.title,
                        m.root_cause.as_deref().unwrap_or("-")
                    );
                }
                if similar.truncated {
                    println!(
                        "(showing the newest {} matches; narrow the query or raise --limit)",
                        similar.limit
                    );
                }
            })
        }
        IncidentCommand::Correlate(correlate) => {
            let mut correlation = config.correlation.clone();
            if let Some(margin) = correlate.margin_minutes {
                if !(0..=MAX_MARGIN_MINUTES).contains(&margin) {
                    return Err(CliError::User(format!(
                        "--margin-minutes must be in 0..={MAX_MARGIN_MINUTES}"
                    )));
                }
                correlation.margin_minutes = margin;
            }
            match (correlate.id, &correlate.start, &correlate.end) {
                (Some(id), _, _) => {
                    let result = correlate_incident(&store, id, &correlation, now(cli)?)?;
                    emit(cli, "incident correlate", &result, || {
                        println!(
                            "Incident #{} {} (margin {}m)",
                            result.incident.id, result.incident.title, result.margin_minutes
                        );
                        print_timeline(&result.timeline);
                    })
                }
                (None, Some(start), Some(end)) => {
                    let timeline =
                        correlate_window(&store, parse_ts(start)?, parse_ts(end)?, &correlation)?;
                    emit(cli, "incident correlate", &timeline, || print_timeline(&timeline))
                }
                _ => Err(CliError::User(
                    "pass an incident id or both --start and --end".to_string(),
                )),
            }
        }
        IncidentCommand::KnowledgePack(kp) => {
            let pack = generate_knowledge_pack(&store, kp.id, now(cli)?)?;
            emit(cli, "incident knowledge-pack", &pack, || {
                println!("Learning: {}", pack.learning_name);
                if let Some(q) = &pack.validated_query {
                    println!("Validated query: {q}");
                }
                println!();
                print!("{}", pack.runbook);
            })
        }
    }
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match load_config(cli) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DLG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
