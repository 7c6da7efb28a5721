use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use coidb::error::CoidbError;
use coidb::output::{self, JsonOutput, OutputMode, TextProgress};
use coidb::pipeline::{DEFAULT_TARGETS, Pipeline, ProgressSink, RunOptions};
use coidb::registry::Registry;
use coidb::stages::download::HttpFetcher;

#[derive(Parser)]
#[command(name = "coidb")]
#[command(about = "Build COI reference databases for DADA2 from BOLD and the GBIF backbone")]
#[command(version, author)]
struct Cli {
    /// Targets to build
    targets: Vec<String>,

    #[arg(long, default_value = ".")]
    workdir: Utf8PathBuf,

    /// Show what would run without touching the working directory
    #[arg(short = 'n', long)]
    dryrun: bool,

    #[arg(short = 'j', long, default_value_t = 1)]
    cores: usize,

    /// YAML config overrides, applied in order
    #[arg(long = "config-file")]
    config_file: Vec<Utf8PathBuf>,

    /// Settings passed through to the clustering executor
    #[arg(long)]
    cluster_config: Option<Utf8PathBuf>,

    #[arg(short = 'p', long)]
    printshellcmds: bool,

    /// Remove a stale working directory lock and exit
    #[arg(long)]
    unlock: bool,

    /// Rebuild the requested targets even when they are up to date
    #[arg(short = 'f', long)]
    force: bool,

    #[arg(long)]
    show_failed_logs: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    list_targets: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(coidb) = report.downcast_ref::<CoidbError>() {
                return ExitCode::from(map_exit_code(coidb));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &CoidbError) -> u8 {
    match error {
        CoidbError::UnknownTarget(_)
        | CoidbError::InvalidTarget(_)
        | CoidbError::CyclicDependency(_)
        | CoidbError::ConfigRead(_)
        | CoidbError::ConfigParse { .. }
        | CoidbError::InvalidConfig(_) => 2,
        CoidbError::Fetch { .. }
        | CoidbError::FetchStatus { .. }
        | CoidbError::MissingTool(_)
        | CoidbError::ClusterTool { .. } => 3,
        CoidbError::LockHeld { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<bool> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("coidb=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coidb=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = Registry::standard();
    if cli.list_targets {
        for rule in registry.rules() {
            println!("{}", rule.usage);
        }
        return Ok(true);
    }

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let targets = if cli.targets.is_empty() {
        DEFAULT_TARGETS.iter().map(|target| target.to_string()).collect()
    } else {
        cli.targets
    };
    let options = RunOptions {
        targets,
        workdir: cli.workdir,
        dryrun: cli.dryrun,
        cores: cli.cores,
        config_file: cli.config_file,
        cluster_config: cli.cluster_config,
        printshellcmds: cli.printshellcmds,
        unlock: cli.unlock,
        force: cli.force,
        show_failed_logs: cli.show_failed_logs,
    };

    let pipeline = Pipeline::new(registry, HttpFetcher::new()?);
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextProgress,
    };
    let report = pipeline.run(&options, sink)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Text => output::print_summary(&report).into_diagnostic()?,
    }
    Ok(report.success)
}
