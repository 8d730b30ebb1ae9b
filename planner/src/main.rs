use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use planner::config::{VaultConfig, load_config};
use planner::core::Level;
use planner::period::PeriodKey;
use planner::propagate::{Clock, Context as PassContext, FixedClock, Orchestrator, PassReport, SystemClock};
use planner::section::{SectionLabel, section_tasks};
use planner::storage::{Document, FsStore, RelPath};
use planner::task::{IdentityMode, TaskSet};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "planner",
    about = "Keeps checklist tasks in step across day, week, month and project notes",
    version
)]
struct Cli {
    /// Vault root containing the planner folders.
    #[arg(long, global = true, default_value = ".")]
    vault: PathBuf,
    /// Date to treat as today (YYYY-MM-DD).
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Propagate the tasks of a document that was just edited.
    Sync(SyncArgs),

    /// Fill an empty planner document with its template.
    Open(OpenArgs),

    /// Create today's and tomorrow's planner documents.
    Init,

    /// List the tasks of a document.
    Tasks(TasksArgs),

    /// Print the vault path of a planner document.
    Path(PathArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Document that was edited (absolute or relative to the vault).
    path: PathBuf,
    /// Emit the pass report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct OpenArgs {
    /// Document being opened.
    path: PathBuf,
}

#[derive(Debug, Args)]
struct TasksArgs {
    /// Document to read.
    path: PathBuf,
    /// Only tasks below this heading (`monday`, `week 2`, ...).
    #[arg(long)]
    section: Option<String>,
    /// Emit JSON instead of checklist lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PathArgs {
    level: LevelArg,
    /// Any date inside the period; defaults to today.
    #[arg(long, conflicts_with = "name")]
    date: Option<NaiveDate>,
    /// Project name.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    Day,
    Week,
    Month,
    Project,
}

impl From<LevelArg> for Level {
    fn from(value: LevelArg) -> Self {
        match value {
            LevelArg::Day => Level::Day,
            LevelArg::Week => Level::Week,
            LevelArg::Month => Level::Month,
            LevelArg::Project => Level::Project,
        }
    }
}

/// Vault, configuration and clock shared by every command.
struct Runtime {
    vault: PathBuf,
    config: VaultConfig,
    clock: Box<dyn Clock>,
}

impl Runtime {
    fn new(vault: &Path, today: Option<NaiveDate>) -> Result<Self> {
        let vault = fs::canonicalize(vault).with_context(|| format!("opening vault {:?}", vault))?;
        let config = load_config(&vault)?;
        let clock: Box<dyn Clock> = match today {
            Some(date) => Box::new(FixedClock(date)),
            None => Box::new(SystemClock),
        };
        Ok(Self { vault, config, clock })
    }

    fn orchestrate<T>(
        &self,
        f: impl FnOnce(&mut Orchestrator<'_>) -> planner::core::Result<T>,
    ) -> Result<T> {
        let mut store = FsStore::new(&self.vault);
        let mut orchestrator = Orchestrator::new(PassContext {
            store: &mut store,
            clock: self.clock.as_ref(),
            config: &self.config,
        });
        Ok(f(&mut orchestrator)?)
    }

    /// Path of `input` inside the vault. Relative inputs are taken as
    /// vault-relative already.
    fn vault_relative(&self, input: &Path) -> Result<RelPath> {
        let relative = if input.is_absolute() {
            let canonical = fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
            canonical
                .strip_prefix(&self.vault)
                .with_context(|| format!("{:?} is outside the vault {:?}", input, self.vault))?
                .to_path_buf()
        } else {
            input.to_path_buf()
        };
        RelPath::from_path(&relative).with_context(|| format!("{:?} is not a vault path", input))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = Runtime::new(&cli.vault, cli.today)?;
    match cli.command {
        Commands::Sync(args) => handle_sync(args, &runtime),
        Commands::Open(args) => handle_open(args, &runtime),
        Commands::Init => handle_init(&runtime),
        Commands::Tasks(args) => handle_tasks(args, &runtime),
        Commands::Path(args) => handle_path(args, &runtime),
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("PLANNER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "planner=debug,info"
        } else {
            "planner=info,warn"
        })
    });

    let format = env::var("PLANNER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn handle_sync(args: SyncArgs, runtime: &Runtime) -> Result<()> {
    let SyncArgs { path, json } = args;
    let rel = runtime.vault_relative(&path)?;
    let report = runtime
        .orchestrate(|o| o.on_document_left(&rel))
        .with_context(|| format!("propagating {rel}"))?;

    match report {
        Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Some(report) => print_report(&report),
        None => eprintln!("{rel} is not a planner document; nothing to do"),
    }
    Ok(())
}

fn print_report(report: &PassReport) {
    let written = report.written();
    if written.is_empty() {
        println!("{}: everything up to date", report.origin);
        return;
    }
    println!("{}: {} document(s) changed", report.origin, written.len());
    for hop in report.hops.iter().filter(|hop| hop.outcome.wrote()) {
        println!(
            "  {:<9} {} (+{} tasks, {} re-ticked)",
            hop.outcome, hop.to, hop.inserted, hop.retoggled
        );
    }
}

fn handle_open(args: OpenArgs, runtime: &Runtime) -> Result<()> {
    let rel = runtime.vault_relative(&args.path)?;
    let filled = runtime
        .orchestrate(|o| o.fill_if_empty(&rel))
        .with_context(|| format!("filling {rel}"))?;
    if filled {
        println!("filled {rel} from template");
    }
    Ok(())
}

fn handle_init(runtime: &Runtime) -> Result<()> {
    let created = runtime
        .orchestrate(|o| o.bootstrap())
        .context("creating planner documents")?;
    for path in created {
        println!("created {path}");
    }
    Ok(())
}

fn handle_tasks(args: TasksArgs, runtime: &Runtime) -> Result<()> {
    let TasksArgs {
        path,
        section,
        json,
    } = args;
    let rel = runtime.vault_relative(&path)?;
    let tasks = read_tasks(runtime, &rel, section.as_deref())?;

    if json {
        let payload: Vec<_> = tasks.iter().collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for task in tasks.iter() {
            println!("{}", task.raw);
        }
    }
    Ok(())
}

fn read_tasks(runtime: &Runtime, rel: &RelPath, section: Option<&str>) -> Result<TaskSet> {
    let store = FsStore::new(&runtime.vault);
    let Some(doc) = Document::load(&store, rel).with_context(|| format!("reading {rel}"))? else {
        anyhow::bail!("{rel} does not exist");
    };
    Ok(match section {
        Some(label) => section_tasks(&doc.lines, &SectionLabel::parse(label), IdentityMode::Plain),
        None => TaskSet::from_lines(&doc.lines, IdentityMode::Plain),
    })
}

fn handle_path(args: PathArgs, runtime: &Runtime) -> Result<()> {
    let key = period_key(&args, runtime)?;
    println!("{}", key.path(&runtime.config.folders));
    Ok(())
}

fn period_key(args: &PathArgs, runtime: &Runtime) -> Result<PeriodKey> {
    let date = args.date.unwrap_or_else(|| runtime.clock.today());
    Ok(match Level::from(args.level) {
        Level::Day => PeriodKey::day(date),
        Level::Week => PeriodKey::week_of(date),
        Level::Month => PeriodKey::month_of(date),
        Level::Project => {
            let Some(name) = args.name.as_deref() else {
                anyhow::bail!("--name is required for project paths");
            };
            PeriodKey::parse_identifier(Level::Project, name)?
        }
    })
}
