/*
* vm-cluster Command Line Interface
* ---------------------------------
*
* Every subcommand does one thing and exits; cron (or whatever runs it)
* supplies the concurrency.
*
* vm-cluster
* ├── create   --tags T [--options O] [--profile P] [--select-algo A] [--select-arg X]
* ├── destroy  --tags T [--target H[:P]]
* ├── worker   --tube create|destroy|forward     // one job from our own queue
* ├── status                                     // one report into the log store
* ├── metrics                                    // probe, then report
* └── logs                                       // dump the log store as JSON
*
* Exit codes are sysexits(3): 0 ok, 64 usage, 65 bad job body, 69 broker
* unreachable, 70 software, 74 log storage, 78 configuration.
*/

pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{default_config_path, Settings};
use crate::core::executor::ScriptExecutor;
use crate::core::messages::Tube;
use crate::errors::handlers::report_fatal;
use crate::errors::{ClusterResult, EX_OK, EX_USAGE};
use crate::logs::LogStore;
use crate::monitoring::ScriptMetrics;
use crate::queue::BeanstalkBroker;
use crate::reporter::StatusReporter;
use crate::scheduler::{HostSelector, TcpLatencyProbe};
use crate::worker::WorkerLoop;

pub use commands::CreateArgs;

#[derive(Parser, Debug)]
#[command(name = "vm-cluster", version)]
#[command(about = "Dispatch virtual machine work across a pool of nodes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: settings.json next to the executable)
    #[arg(short, long, value_name = "CONFIG", env = "VM_CLUSTER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job for virtual machine creation
    Create {
        /// Options for the virtual machine, split like a shell would
        #[arg(long, allow_hyphen_values = true)]
        options: Option<String>,
        /// Profile with resources to allocate
        #[arg(long)]
        profile: Option<String>,
        /// Selection algorithm: all, random, less-latency or single
        #[arg(long)]
        select_algo: Option<String>,
        /// Selection argument
        #[arg(long)]
        select_arg: Option<String>,
        /// Tags to find virtual machines in later operations
        #[arg(long)]
        tags: String,
    },
    /// Print every stored status report
    Logs,
    /// Store one status report
    Status,
    /// Process one job from this node's queue
    Worker {
        #[arg(long, value_enum)]
        tube: WorkerTube,
    },
    /// Create a job for virtual machine destruction
    Destroy {
        /// Destroy virtual machines in this host only
        #[arg(long, value_name = "HOST[:PORT]")]
        target: Option<String>,
        /// Destroy virtual machines that match these tags
        #[arg(long)]
        tags: String,
    },
    /// Collect machine metrics and report them
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerTube {
    Create,
    Destroy,
    Forward,
}

impl From<WorkerTube> for Tube {
    fn from(tube: WorkerTube) -> Self {
        match tube {
            WorkerTube::Create => Tube::Create,
            WorkerTube::Destroy => Tube::Destroy,
            WorkerTube::Forward => Tube::Forward,
        }
    }
}

/// Parse the command line, run it and return the process exit code.
pub async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => EX_OK,
                _ => EX_USAGE,
            };
        }
    };

    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(()) => EX_OK,
        Err(e) => report_fatal(&e),
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn execute(cli: Cli) -> ClusterResult<()> {
    let path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = Arc::new(Settings::load(&path)?);
    let broker = Arc::new(BeanstalkBroker::new());

    match cli.command {
        Commands::Create {
            options,
            profile,
            select_algo,
            select_arg,
            tags,
        } => {
            let selector = HostSelector::new(Arc::new(TcpLatencyProbe::new()));
            let args = CreateArgs {
                options,
                profile,
                select_algo,
                select_arg,
                tags,
            };
            let reached = commands::create(&settings, broker.as_ref(), &selector, args).await?;
            info!("Create request queued on {} host(s)", reached.len());
        }
        Commands::Destroy { target, tags } => {
            let reached =
                commands::destroy(&settings, broker.as_ref(), target.as_deref(), &tags).await?;
            info!("Destroy request queued on {} host(s)", reached.len());
        }
        Commands::Logs => {
            let store = LogStore::new(settings.log_dir.clone());
            println!("{}", commands::logs(&store).await?);
        }
        Commands::Metrics => {
            let source = ScriptMetrics::new(settings.scripts.clone());
            let reporter =
                StatusReporter::new(broker.clone(), settings.reporter.clone(), settings.ttr);
            commands::metrics(&settings, &source, &reporter).await?;
        }
        Commands::Status => {
            let outcome = worker(&settings, broker).run_once(Tube::Status).await?;
            debug!(?outcome, "Status cycle finished");
        }
        Commands::Worker { tube } => {
            let outcome = worker(&settings, broker).run_once(tube.into()).await?;
            info!(?outcome, "Worker cycle finished");
        }
    }

    Ok(())
}

fn worker(settings: &Arc<Settings>, broker: Arc<BeanstalkBroker>) -> WorkerLoop {
    WorkerLoop::new(
        settings.clone(),
        broker,
        Arc::new(ScriptExecutor::new(settings.scripts.clone())),
        Arc::new(ScriptMetrics::new(settings.scripts.clone())),
    )
}
