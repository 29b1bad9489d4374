use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use replica_train::config::TrainConfig;
use replica_train::metrics::RunSummary;
use replica_train::supervisor::{install_signal_handlers, Supervisor};
use replica_train::trainer::run_training;

/// Exit status when a run fails in a way restarting cannot fix.
const FATAL_EXIT: u8 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one rank under the restart supervisor
    Train(TrainArgs),
    /// Spawn one `train` process per rank on this machine
    Launch {
        /// Number of ranks
        #[arg(long, default_value_t = 1)]
        nproc: usize,

        /// Rendezvous address handed to every rank
        #[arg(long, default_value = "127.0.0.1")]
        master_addr: String,

        /// Rendezvous port handed to every rank
        #[arg(long, default_value_t = 29500)]
        master_port: u16,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Arguments forwarded to each `train` process
        #[arg(last = true)]
        train_args: Vec<String>,
    },
    /// Generate a sample configuration file
    GenConfig {
        /// Target device (cpu, cuda, metal)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Output path
        #[arg(short, long, default_value = "config/train.json")]
        output: PathBuf,
    },
}

#[derive(Parser, Debug, Clone)]
struct TrainArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rank of this process
    #[arg(long, env = "LOCAL_RANK")]
    local_rank: Option<usize>,

    /// Number of ranks in the group
    #[arg(long, env = "WORLD_SIZE")]
    world_size: Option<usize>,

    #[arg(long, env = "MASTER_ADDR")]
    master_addr: Option<String>,

    #[arg(long, env = "MASTER_PORT")]
    master_port: Option<u16>,

    /// Override device type (cpu, cuda, metal)
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    num_epochs: Option<usize>,

    /// Per-process batch size
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    random_seed: Option<u64>,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    model_filename: Option<String>,

    /// Resume from the saved checkpoint
    #[arg(long)]
    resume: bool,

    /// Override dataset (synthetic, cifar10)
    #[arg(long)]
    dataset: Option<String>,

    /// Run training once instead of looping under the supervisor
    #[arg(long)]
    once: bool,

    /// Write each run's summary to this JSON file (rank 0 only)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl TrainArgs {
    /// File values (or device defaults), then CLI overrides.
    fn resolve(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => TrainConfig::default_for_device(self.device.as_deref().unwrap_or("cpu")),
        };

        let dist = &mut config.distributed;
        if let Some(rank) = self.local_rank {
            dist.local_rank = rank;
        }
        if let Some(world) = self.world_size {
            dist.world_size = world;
        }
        if let Some(addr) = &self.master_addr {
            dist.master_addr = addr.clone();
        }
        if let Some(port) = self.master_port {
            dist.master_port = port;
        }
        if let Some(device) = &self.device {
            dist.device_type = device.clone();
        }

        let training = &mut config.training;
        if let Some(epochs) = self.num_epochs {
            training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            training.learning_rate = lr;
        }
        if let Some(seed) = self.random_seed {
            training.random_seed = seed;
        }

        if let Some(dir) = &self.model_dir {
            config.checkpoint.model_dir = dir.clone();
        }
        if let Some(filename) = &self.model_filename {
            config.checkpoint.model_filename = filename.clone();
        }
        if self.resume {
            config.checkpoint.resume = true;
        }
        if let Some(dataset) = &self.dataset {
            config.data.dataset = dataset.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Resolves the forwarded arguments as a rank-0 member of an `nproc` group.
    fn resolve_for_launch(&self, nproc: usize) -> Result<TrainConfig> {
        let mut args = self.clone();
        args.local_rank = Some(0);
        args.world_size = Some(nproc);
        args.resolve()
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let level = match &cli.command {
        Commands::Train(args) if args.verbose => Level::DEBUG,
        Commands::Launch { verbose, .. } if *verbose => Level::DEBUG,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Train(args) => train(args).await,
        Commands::Launch {
            nproc,
            master_addr,
            master_port,
            verbose,
            train_args,
        } => launch(nproc, &master_addr, master_port, verbose, train_args),
        Commands::GenConfig { device, output } => {
            let config = TrainConfig::default_for_device(&device);
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            config.save(&output)?;
            println!("✅ Generated configuration: {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn train(args: TrainArgs) -> Result<ExitCode> {
    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!("🚨 Invalid configuration: {:#}", e);
            return Ok(ExitCode::from(FATAL_EXIT));
        }
    };
    let rank = config.distributed.local_rank;
    info!(
        "🚀 Rank {}/{} starting ({} epochs, batch {}, lr {})",
        rank,
        config.distributed.world_size,
        config.training.num_epochs,
        config.training.batch_size,
        config.training.learning_rate
    );

    // A lone process may create its own directory; under `launch` the parent does.
    if config.distributed.world_size == 1 {
        std::fs::create_dir_all(&config.checkpoint.model_dir)?;
    }
    info!("💾 Checkpoint: {}", config.checkpoint_path().display());

    let entry_config = config.clone();
    let output = args.output.clone();
    let entrypoint = move || -> replica_train::Result<RunSummary> {
        let summary = run_training(&entry_config)?;
        if summary.rank == 0 {
            println!("\n📊 Training Results:");
            println!("{}", summary.display_table());
            println!("{}", summary.display_summary());
            if let Some(path) = &output {
                summary.save_to_file(path)?;
                info!("Results saved to: {}", path.display());
            }
        }
        Ok(summary)
    };

    if args.once {
        return match tokio::task::spawn_blocking(entrypoint).await? {
            Ok(_) => Ok(ExitCode::SUCCESS),
            Err(e) if e.is_retryable() => {
                error!("❌ Training failed: {}", e);
                Ok(ExitCode::FAILURE)
            }
            Err(e) => {
                error!("🚨 Fatal: {}", e);
                Ok(ExitCode::from(FATAL_EXIT))
            }
        };
    }

    let token = CancellationToken::new();
    install_signal_handlers(token.clone());
    let supervisor = Supervisor::from_config(&config.supervisor, token);

    match supervisor.run(entrypoint).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("🚨 Fatal: {}", e);
            Ok(ExitCode::from(FATAL_EXIT))
        }
    }
}

fn launch(nproc: usize, master_addr: &str, master_port: u16, verbose: bool, train_args: Vec<String>) -> Result<ExitCode> {
    if nproc == 0 {
        bail!("--nproc must be at least 1");
    }

    // Workers never create the checkpoint directory themselves.
    let parsed = TrainArgs::try_parse_from(std::iter::once("train".to_string()).chain(train_args.iter().cloned()))?;
    let preview = parsed.resolve_for_launch(nproc)?;
    std::fs::create_dir_all(&preview.checkpoint.model_dir)?;

    let exe = std::env::current_exe()?;
    info!("🚀 Launching {} ranks via {}:{}", nproc, master_addr, master_port);

    let mut children = Vec::with_capacity(nproc);
    for rank in 0..nproc {
        let mut cmd = Command::new(&exe);
        cmd.arg("train");
        if verbose {
            cmd.arg("--verbose");
        }
        cmd.args(&train_args)
            .env("LOCAL_RANK", rank.to_string())
            .env("WORLD_SIZE", nproc.to_string())
            .env("MASTER_ADDR", master_addr)
            .env("MASTER_PORT", master_port.to_string());
        let child = cmd.spawn().with_context(|| format!("spawning rank {}", rank))?;
        children.push((rank, child));
    }

    let mut first_failure: Option<u8> = None;
    for (rank, mut child) in children {
        let status = child.wait()?;
        if status.success() {
            info!("✅ Rank {} exited cleanly", rank);
        } else {
            error!("❌ Rank {} exited with {}", rank, status);
            let code = status.code().and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
            first_failure.get_or_insert(code);
        }
    }
    Ok(first_failure.map_or(ExitCode::SUCCESS, ExitCode::from))
}
