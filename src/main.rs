//! `minis-validation` command line for simulation campaigns and their
//! offline analysis.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use minis_validation::backend::{
    parse_slurm_args, BackendKind, ClusterBackend, ClusterBackendConfig, ExecutionBackend,
    LocalBackend, LocalBackendConfig, SlurmScheduler, TaskManifest, DEFAULT_UNREPORTED_POLLS,
};
use minis_validation::campaign::{Backoff, RetryPolicy};
use minis_validation::config::{load_job_configs, FrequencySet, JobConfig, Overrides};
use minis_validation::orchestrator::{
    analyze_job, analyze_jobs, CampaignContext, CampaignSettings, Orchestrator,
};
use minis_validation::runner::{SimulatorRunner, DEFAULT_SIMULATOR};

#[derive(Debug, Parser)]
#[command(name = "minis-validation")]
#[command(about = "Spontaneous minis simulation campaigns and trace analysis", version)]
struct Cli {
    /// Increase log verbosity (-v warn, -vv info, -vvv debug); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a simulation campaign, then analyze and calibrate every job config
    Simulate(SimulateArgs),
    /// Analyze the traces of every job of a `simulate` output directory
    AnalyzeJobs {
        /// Directory of `config_<CELL>_<Exc|Inh>.yaml` files
        job_configs_dir: PathBuf,
        /// Output directory of a previous `simulate`
        output_dir: PathBuf,
    },
    /// Analyze the traces of one job
    AnalyzeJob {
        /// Job config file
        job_config: PathBuf,
        /// Output directory of that job
        job_output_dir: PathBuf,
    },
    /// Run one element of a cluster array job
    #[command(hide = true)]
    RunTask {
        /// Campaign manifest
        manifest: PathBuf,
        /// Task index; read from SLURM_ARRAY_TASK_ID when omitted
        index: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Simulation descriptor handed to the simulator
    sim_config: PathBuf,
    /// TSV file with a `MINIS_FREQ` column
    frequencies: PathBuf,
    /// Directory of `config_<CELL>_<Exc|Inh>.yaml` files
    job_configs_dir: PathBuf,
    /// Output directory
    output_dir: PathBuf,

    /// Repetitions per (job config, frequency)
    #[arg(short = 'n', long, default_value_t = 1)]
    repeats: u32,

    /// Seed of repetition 0
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Override simulation duration (ms)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Override forward skip (ms)
    #[arg(long)]
    forward_skip: Option<f64>,

    /// Simulator program
    #[arg(long, default_value = DEFAULT_SIMULATOR)]
    simulator: PathBuf,

    /// Leading simulator argument (repeatable)
    #[arg(long = "simulator-arg", allow_hyphen_values = true)]
    simulator_args: Vec<String>,

    /// Scheduler log directory [default: <output-dir>/logs]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Per-task wall-clock timeout (seconds)
    #[arg(long, default_value_t = 3600)]
    timeout_s: u64,

    /// Attempts per task, first one included
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Delay between attempts
    #[arg(long, value_enum, default_value_t = BackoffKind::Exponential)]
    backoff: BackoffKind,

    /// Fixed delay, or base of the exponential delay (seconds)
    #[arg(long, default_value_t = 1.0)]
    backoff_s: f64,

    /// Local workers [default: available parallelism]
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Cluster elements running at once, retries included
    #[arg(long, default_value_t = 200)]
    array_parallelism: usize,

    /// Polls a submitted cluster element may go unreported before it fails
    #[arg(long, default_value_t = DEFAULT_UNREPORTED_POLLS)]
    unreported_polls: u32,

    /// Wall-clock budget of the whole campaign (seconds)
    #[arg(long)]
    campaign_timeout_s: Option<u64>,

    /// Interval between backend polls (milliseconds)
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Extra sbatch argument as `--slurm key value`; selects the cluster backend
    #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
    slurm: Vec<String>,
}

impl SimulateArgs {
    fn policy(&self) -> Result<RetryPolicy> {
        if !(self.backoff_s.is_finite() && self.backoff_s >= 0.0) {
            bail!("--backoff-s must be a non-negative number of seconds");
        }
        let base = Duration::from_secs_f64(self.backoff_s);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: base.max(Duration::from_secs(60)),
            },
        };
        Ok(RetryPolicy::new(
            self.max_retries,
            backoff,
            Duration::from_secs(self.timeout_s),
        )?)
    }

    fn settings(&self) -> CampaignSettings {
        CampaignSettings {
            repetitions: self.repeats,
            base_seed: self.seed,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            campaign_timeout: self.campaign_timeout_s.map(Duration::from_secs),
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_campaign<B: ExecutionBackend>(
    backend: &B,
    settings: CampaignSettings,
    context: CampaignContext,
) -> Result<()> {
    let report = Orchestrator::new(settings)
        .run(backend, context)
        .await
        .context("campaign failed")?;
    print!("{report}");
    Ok(())
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    let policy = args.policy()?;
    let settings = args.settings();
    let kind = BackendKind::from_slurm_args(parse_slurm_args(&args.slurm)?);

    let frequencies = FrequencySet::load(&args.frequencies)
        .with_context(|| format!("loading frequencies from {}", args.frequencies.display()))?;
    let overrides = Overrides {
        duration: args.duration,
        forward_skip: args.forward_skip,
    };
    let configs = load_job_configs(&args.job_configs_dir, overrides).with_context(|| {
        format!("loading job configs from {}", args.job_configs_dir.display())
    })?;
    if configs.is_empty() {
        bail!("no job configs found in {}", args.job_configs_dir.display());
    }

    let runner = SimulatorRunner::new(
        &args.simulator,
        args.simulator_args.clone(),
        &args.sim_config,
        &args.output_dir,
    );
    let context = CampaignContext::open(&args.output_dir, configs, frequencies)
        .context("creating output directory")?;

    match kind {
        BackendKind::Local => {
            let workers = args.workers.unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            });
            let backend = LocalBackend::new(runner, LocalBackendConfig::new(workers, policy)?);
            run_campaign(&backend, settings, context).await
        }
        BackendKind::Cluster { slurm_args } => {
            let config = ClusterBackendConfig {
                work_dir: args.output_dir.join("campaigns"),
                log_dir: args
                    .log_dir
                    .clone()
                    .unwrap_or_else(|| args.output_dir.join("logs")),
                array_parallelism: args.array_parallelism,
                unreported_polls: args.unreported_polls,
                policy,
                executable: std::env::current_exe().context("locating own executable")?,
            };
            let backend = ClusterBackend::new(SlurmScheduler::new(slurm_args), runner, config);
            run_campaign(&backend, settings, context).await
        }
    }
}

async fn run_task(manifest: PathBuf, index: Option<usize>) -> Result<()> {
    let index = match index {
        Some(index) => index,
        None => std::env::var("SLURM_ARRAY_TASK_ID")
            .context("no task index given and SLURM_ARRAY_TASK_ID is unset")?
            .parse()
            .context("SLURM_ARRAY_TASK_ID is not an index")?,
    };
    let manifest = TaskManifest::load(&manifest)
        .with_context(|| format!("loading manifest {}", manifest.display()))?;
    let trace = manifest
        .run(index)
        .await
        .with_context(|| format!("task {index} failed"))?;
    tracing::info!(trace = %trace.display(), "task done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::AnalyzeJobs {
            job_configs_dir,
            output_dir,
        } => {
            let summaries = analyze_jobs(&job_configs_dir, &output_dir)?;
            for summary in &summaries {
                match summary.minis_frequency {
                    Some(f) => println!("{}: minis_frequency = {f:.4}", summary.job_title),
                    None => println!("{}: no calibration fit", summary.job_title),
                }
            }
            Ok(())
        }
        Command::AnalyzeJob {
            job_config,
            job_output_dir,
        } => {
            let config = JobConfig::load(&job_config)
                .with_context(|| format!("loading job config {}", job_config.display()))?;
            let summary = analyze_job(&config, &job_output_dir)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::RunTask { manifest, index } => run_task(manifest, index).await,
    }
}
