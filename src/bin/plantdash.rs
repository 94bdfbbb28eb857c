//! Plant dashboard back-end.
//!
//! `serve` starts the JSON API. `graph` renders the task graph of a
//! configuration file. `batch` reconstructs every matching dataset and waits
//! for the jobs to end.

use std::fs;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use plantdash::batch::BatchRequest;
use plantdash::dispatcher::{self, Dashboard};
use plantdash::logging::init_logging;
use plantdash::server::{self, AppState};
use plantdash::settings::{ENV_STORE_HOST, ENV_STORE_PORT, Settings};
use plantdash::{JobState, PipelineConfig, RunMode, graph, parse, render};

#[derive(Parser, Debug)]
#[command(name = "plantdash", version, about = "Browse plant datasets and run reconstructions")]
struct Args {
    /// Settings file
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// Data store host
    #[arg(long, env = ENV_STORE_HOST)]
    store_host: Option<String>,

    /// Data store port
    #[arg(long, env = ENV_STORE_PORT)]
    store_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the dashboard API
    Serve {
        /// Address to listen on, overrides the settings file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Render the task graph of a pipeline configuration
    Graph {
        file: Utf8PathBuf,
        #[arg(long, value_enum, default_value = "svg")]
        format: GraphFormat,
        /// Keep tasks nothing depends on
        #[arg(long)]
        all: bool,
    },
    /// Reconstruct every dataset whose name matches a pattern
    Batch {
        /// Regular expression searched in dataset names
        pattern: String,
        #[arg(long)]
        task: String,
        #[arg(long, value_enum, default_value = "avoid")]
        mode: ModeArg,
        /// Pipeline configuration, the default template when missing
        #[arg(long)]
        pipeline: Option<Utf8PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GraphFormat {
    Svg,
    Mermaid,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    /// Skip datasets already reconstructed
    Avoid,
    /// Run on top of previous results
    Append,
    /// Clean previous results first
    Clean,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Avoid => RunMode::Avoid,
            ModeArg::Append => RunMode::Append,
            ModeArg::Clean => RunMode::Clean,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(host) = args.store_host {
        settings.store.host = host;
    }
    if let Some(port) = args.store_port {
        settings.store.port = port;
    }

    let _guard = init_logging(settings.log_dir.as_deref())?;

    match args.command {
        Command::Serve { bind } => serve(settings, bind),
        Command::Graph { file, format, all } => print_graph(&file, format, all),
        Command::Batch {
            pattern,
            task,
            mode,
            pipeline,
        } => run_batch(settings, pattern, task, mode.into(), pipeline),
    }
}

fn serve(settings: Settings, bind: Option<String>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
    tracing::info!(store = %settings.store, work_root = %settings.work_root, "starting plantdash");

    let dashboard = Dashboard::from_settings(&settings)?;
    let (handle, _dispatcher) = dispatcher::spawn(dashboard)?;

    let state = AppState {
        dispatcher: handle,
        store: settings.store,
    };

    server::start(bind, state)
        .join()
        .map_err(|_| anyhow::anyhow!("API server thread panicked"))?
}

fn print_graph(file: &Utf8PathBuf, format: GraphFormat, all: bool) -> anyhow::Result<()> {
    let text = fs::read_to_string(file).with_context(|| format!("Couldn't read {file}"))?;
    let graph = graph::build(&parse(&text)?)?;
    let graph = if all { graph } else { graph.without_roots() };

    match format {
        GraphFormat::Svg => println!("{}", render::render_svg(&graph)),
        GraphFormat::Mermaid => println!("{}", render::render_mermaid(&graph)),
    }
    Ok(())
}

fn run_batch(
    settings: Settings,
    pattern: String,
    task: String,
    mode: RunMode,
    pipeline: Option<Utf8PathBuf>,
) -> anyhow::Result<()> {
    let config = match pipeline {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("Couldn't read {path}"))?;
            parse(&text)?
        }
        None => PipelineConfig::default_template(),
    };

    let dashboard = Dashboard::from_settings(&settings)?;
    let summary = dashboard.batch(&BatchRequest {
        pattern,
        task,
        config,
        mode,
        store: settings.store.clone(),
    })?;

    for skipped in &summary.skipped {
        eprintln!("{} {} ({})", style("skipped").yellow(), skipped.dataset_id, skipped.reason);
    }
    if summary.submitted.is_empty() {
        eprintln!("Nothing to run");
        return Ok(());
    }

    let bar = ProgressBar::new(summary.submitted.len() as u64).with_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut failed = 0;
    for job in &summary.submitted {
        bar.set_message(job.dataset_id.clone());
        let record = loop {
            let record = dashboard
                .queue()
                .wait(&job.job_id, Duration::from_secs(1))
                .with_context(|| format!("Job {} vanished", job.job_id))?;
            if record.state.is_finished() {
                break record;
            }
            bar.tick();
        };

        let line = match record.state {
            JobState::Succeeded => style("done").green(),
            _ => {
                failed += 1;
                style("failed").red()
            }
        };
        let message = record.report.map(|r| r.message).unwrap_or_default();
        bar.println(format!("{line} {} {message}", job.dataset_id));
        bar.inc(1);
    }
    bar.finish_and_clear();

    if failed > 0 {
        anyhow::bail!("{failed} of {} jobs failed", summary.submitted.len());
    }
    Ok(())
}
