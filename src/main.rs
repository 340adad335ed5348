//! Multi-process system stress testing

#![deny(missing_docs)]

mod report;
mod stressors;
mod thrash;

use clap::Parser;
use std::{num::ParseIntError, path::PathBuf, str::FromStr, time::Duration};
use stressrun::{
    coordinator::CoordinatorError,
    jobs::{JobFile, JobLoadError},
    registry::RegistryError,
    runs::ResolveError,
    Config, Coordinator, ExitCode, RunList, RunMode, RunRequest,
};
use thiserror::Error;

/// Stress the system with coordinated groups of worker processes
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Run every stressor one after the other, with N instances each
    /// (0 means one per CPU)
    #[clap(long, value_name = "N", conflicts_with_all = ["all", "permute"])]
    sequential: Option<u32>,

    /// Run every stressor at the same time, with N instances each
    #[clap(short, long, value_name = "N", conflicts_with = "permute")]
    all: Option<u32>,

    /// Run every non-empty subset of the stressors, with N instances each
    #[clap(long, value_name = "N")]
    permute: Option<u32>,

    /// Stressor to run, as NAME[:INSTANCES[:OPS]] (can be repeated)
    #[clap(short, long = "stressor", value_name = "SPEC")]
    stressors: Vec<StressorSpec>,

    /// JSON job file listing stressors to run
    #[clap(short, long, value_name = "FILE")]
    job: Option<PathBuf>,

    /// Run parallel instances of N randomly picked stressors
    #[clap(short, long, value_name = "N", conflicts_with_all = ["sequential", "all", "permute"])]
    random: Option<u32>,

    /// Time limit of each run, in seconds
    #[clap(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Stop every stressor as soon as one of them fails
    #[clap(long)]
    abort: bool,

    /// Ask stressors to check their results
    #[clap(long)]
    verify: bool,

    /// Try to keep stressor instances away from the OOM killer
    #[clap(long)]
    oom_avoid: bool,

    /// Keep moving stressor instances across CPUs
    #[clap(long)]
    aggressive: bool,

    /// Pin stressor instances to CPUs
    #[clap(long)]
    pin: bool,

    /// Let stressor instances keep the capabilities of this process
    #[clap(long)]
    keep_caps: bool,

    /// Nice level of stressor instances
    #[clap(long, value_name = "LEVEL", allow_hyphen_values = true)]
    nice: Option<i32>,

    /// Comma-separated list of stressors not to run
    #[clap(short = 'x', long, value_name = "LIST", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Save per-stressor summaries to a CSV file
    #[clap(long, value_name = "FILE")]
    metrics_csv: Option<PathBuf>,

    /// Thrash memory in the background while stressors run
    #[clap(long)]
    thrash: bool,

    /// List available stressors and exit
    #[clap(long)]
    list: bool,

    /// Log debugging information
    #[clap(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::Failure
        }
    };
    std::process::exit(code.code())
}

/// Execute the command line, telling how the process should exit
fn run(args: Args) -> Result<ExitCode, CliError> {
    let registry = stressors::registry()?;
    if args.list {
        report::list(&registry);
        return Ok(ExitCode::Success);
    }

    // Figure out what should run and how
    let (mode, everything) = if let Some(instances) = args.sequential {
        (RunMode::Sequential, Some(instances))
    } else if let Some(instances) = args.all {
        (RunMode::Parallel, Some(instances))
    } else if let Some(instances) = args.permute {
        (RunMode::Permute, Some(instances))
    } else if args.random.is_some() {
        (RunMode::Parallel, None)
    } else {
        (RunMode::Sequential, None)
    };
    let mut runs = if let Some(count) = args.random {
        RunList::random(&registry, count, &args.exclude, &mut fastrand::Rng::new())?
    } else {
        let mut requests = args
            .stressors
            .iter()
            .map(StressorSpec::request)
            .collect::<Vec<_>>();
        if let Some(job) = &args.job {
            requests.extend(JobFile::load(job)?.requests());
        }
        if let Some(instances) = everything {
            requests.extend(registry.iter().map(|stressor| RunRequest {
                stressor: stressor.name().to_owned(),
                instances,
                ops: 0,
            }));
        }
        RunList::resolve(&registry, &requests)?
    };
    if runs.is_empty() {
        return Err(CliError::NothingToRun);
    }

    let config = Config {
        mode,
        timeout: args.timeout.map(Duration::from_secs),
        abort_on_failure: args.abort,
        verify: args.verify,
        oom_avoid: args.oom_avoid,
        aggressive: args.aggressive,
        pin_cpus: args.pin,
        nice: args.nice,
        drop_capabilities: !args.keep_caps,
        exclude: args.exclude,
        ..Default::default()
    };
    let mut coordinator = Coordinator::new(&config);
    if args.thrash {
        coordinator = coordinator.with_background(thrash::TASK);
    }
    let result = coordinator.run(&mut runs)?;
    report::summaries(&result);

    if let Some(path) = args.metrics_csv {
        stressrun::output::save(&path, &result.summaries)
            .map_err(|e| CliError::SaveMetrics(path, e))?;
    }
    Ok(report::exit_code(&result))
}

/// Stressor requested on the command line
#[derive(Clone, Debug, Eq, PartialEq)]
struct StressorSpec(RunRequest);
//
impl StressorSpec {
    /// Matching run request
    fn request(&self) -> RunRequest {
        self.0.clone()
    }
}
//
impl FromStr for StressorSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let stressor = fields.next().unwrap_or_default();
        if stressor.is_empty() {
            return Err(SpecParseError::MissingName);
        }
        let instances = fields.next().map(str::parse::<u32>).transpose()?.unwrap_or(1);
        let ops = fields.next().map(str::parse::<u64>).transpose()?.unwrap_or(0);
        if fields.next().is_some() {
            return Err(SpecParseError::TooManyFields);
        }
        Ok(Self(RunRequest {
            stressor: stressor.to_owned(),
            instances,
            ops,
        }))
    }
}

/// Failure to parse a stressor specification
#[derive(Debug, Error, PartialEq)]
enum SpecParseError {
    /// No stressor name
    #[error("missing stressor name")]
    MissingName,

    /// Bad instance or operation count
    #[error("failed to parse a count ({0})")]
    BadCount(#[from] ParseIntError),

    /// Trailing garbage
    #[error("expected at most NAME:INSTANCES:OPS")]
    TooManyFields,
}

/// Failure of the command line application
#[derive(Debug, Error)]
enum CliError {
    /// Built-in stressor table is inconsistent
    #[error("failed to set up stressors ({0})")]
    Registry(#[from] RegistryError),

    /// Job file could not be loaded
    #[error("failed to read jobs ({0})")]
    Job(#[from] JobLoadError),

    /// Requested stressors could not be resolved
    #[error("failed to select stressors ({0})")]
    Resolve(#[from] ResolveError),

    /// Nothing was requested
    #[error("no stressor requested, see --help")]
    NothingToRun,

    /// The run itself failed
    #[error("failed to run stressors ({0})")]
    Coordinator(#[from] CoordinatorError),

    /// Summaries could not be saved
    #[error("failed to save metrics to {} ({1})", .0.display())]
    SaveMetrics(PathBuf, csv::Error),
}
