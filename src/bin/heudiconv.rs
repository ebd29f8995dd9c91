use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use heudiconv::app::Workflow;
use heudiconv::config::{BidsMode, EngineCommand, EngineConfig};
use heudiconv::domain::{Converter, GroupingMode};
use heudiconv::error::ConvertError;

#[derive(Parser)]
#[command(name = "heudiconv")]
#[command(about = "Flexible DICOM converter for organizing brain imaging data into BIDS")]
#[command(version)]
struct Cli {
    /// Location of dicomdir that can be indexed with {subject} and
    /// optionally {session}; tarballs and zips are supported
    #[arg(short = 'd', long)]
    dicom_dir_template: Option<String>,

    /// Files (archives, dicoms) or directories to process
    #[arg(long, num_args = 1..)]
    files: Vec<Utf8PathBuf>,

    /// Subject ids; required with a dicom dir template
    #[arg(short = 's', long, num_args = 1..)]
    subjects: Vec<String>,

    /// Session for longitudinal studies
    #[arg(long = "ses")]
    session: Option<String>,

    /// Study path under the output directory
    #[arg(short = 'l', long)]
    locator: Option<String>,

    /// Name of a bundled heuristic or path to a heuristic rule file
    #[arg(short = 'f', long)]
    heuristic: Option<String>,

    /// Output directory
    #[arg(short = 'o', long, default_value = ".")]
    outdir: Utf8PathBuf,

    #[arg(short = 'c', long, value_enum, default_value = "dcm2niix")]
    converter: Converter,

    /// Emit a BIDS layout; pass "notop" to suppress top-level file writes
    #[arg(short = 'b', long, num_args = 0..=1, default_missing_value = "full")]
    bids: Option<String>,

    /// Overwrite existing converted outputs
    #[arg(long)]
    overwrite: bool,

    /// Restrict sidecar JSONs to BIDS-defined fields
    #[arg(long)]
    minmeta: bool,

    #[arg(short = 'g', long, value_enum, default_value = "accession_number")]
    grouping: GroupingMode,

    /// Seed for deterministic ordering of random tie-breakers
    #[arg(long)]
    random_seed: Option<u64>,

    /// Batch system to submit per-subject jobs to (SLURM)
    #[arg(long)]
    queue: Option<String>,

    /// Additional space-separated arguments for the queue submission
    #[arg(long)]
    queue_args: Option<String>,

    /// Custom action instead of a regular conversion: ls,
    /// populate-templates, populate-intended-for, sanitize-jsons, heuristics
    #[arg(long)]
    command: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ConvertError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ConvertError) -> u8 {
    match error {
        ConvertError::Usage(_)
        | ConvertError::HeuristicNotFound(_)
        | ConvertError::InvalidLabel(_) => 2,
        ConvertError::MissingTool(_)
        | ConvertError::Transcoder { .. }
        | ConvertError::LockTimeout(_)
        | ConvertError::Queue(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(cli).into_diagnostic()?;

    tracing::info!("running heudiconv version {}", heudiconv::VERSION);
    let workflow = Workflow::new(config).into_diagnostic()?;
    let summary = workflow.run().into_diagnostic()?;

    for (subject, message) in &summary.failed_subjects {
        tracing::error!("subject {} failed: {}", subject, message);
    }
    if !summary.success() {
        return Err(ConvertError::Usage(format!(
            "{} subject(s) and {} series failed",
            summary.failed_subjects.len(),
            summary.failed_series
        ))
        .into());
    }
    Ok(())
}

fn build_config(cli: Cli) -> Result<EngineConfig, ConvertError> {
    let outdir = if cli.outdir.is_absolute() {
        cli.outdir
    } else {
        let cwd = std::env::current_dir()
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        Utf8PathBuf::from_path_buf(cwd.join(cli.outdir.as_std_path()))
            .map_err(|_| ConvertError::Filesystem("non-utf8 working directory".to_string()))?
    };

    let mut config = EngineConfig::new(outdir);
    config.dicom_dir_template = cli.dicom_dir_template;
    config.files = cli.files;
    config.subjects = cli.subjects;
    config.session = cli.session;
    config.locator = cli.locator;
    config.heuristic = cli.heuristic;
    config.converter = cli.converter;
    config.bids = match cli.bids.as_deref() {
        None => None,
        Some("full") => Some(BidsMode::Full),
        Some("notop") => Some(BidsMode::NoTop),
        Some(other) => {
            return Err(ConvertError::Usage(format!(
                "unknown --bids option {other:?} (only \"notop\")"
            )));
        }
    };
    config.overwrite = cli.overwrite;
    config.minmeta = cli.minmeta;
    config.grouping = cli.grouping;
    config.random_seed = cli.random_seed;
    config.queue = cli.queue;
    config.queue_args = cli.queue_args;
    config.command = cli.command.as_deref().map(EngineCommand::parse).transpose()?;
    Ok(config)
}
