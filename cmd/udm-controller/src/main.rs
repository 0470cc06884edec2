mod apply;

use clap::{Parser, Subcommand, ValueEnum};
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_CONTROLLER_DATA_DIR};
use pkg_constants::state::DEFAULT_REQUEST_TIMEOUT_SECS;
use pkg_controllers::{ControllerConfig, StoreRecorder, UnitedDeploymentController};
use pkg_state::{Client, StateStore};
use pkg_types::config::{ControllerConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "udm-controller", about = "UnitedDeployment controller")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, global = true, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long, global = true)]
    in_memory: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Seconds between two resyncs of every UnitedDeployment
        #[arg(long)]
        resync_interval_secs: Option<u64>,
    },
    /// Create or update the objects of a multi-document YAML manifest
    Apply {
        #[arg(long, short = 'f')]
        file: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn open_store(cli: &Cli, file_cfg: &ControllerConfigFile) -> anyhow::Result<StateStore> {
    if cli.in_memory || file_cfg.in_memory.unwrap_or(false) {
        info!("  State:     in memory");
        return Ok(StateStore::in_memory());
    }
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| file_cfg.data_dir.clone())
        .unwrap_or_else(|| DEFAULT_CONTROLLER_DATA_DIR.to_string());
    info!("  Data dir:  {}", data_dir);
    StateStore::new(&data_dir).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    let store = open_store(&cli, &file_cfg).await?;
    let timeout = Duration::from_secs(
        file_cfg
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
    );
    let client = Client::for_store(store.clone()).with_timeout(timeout);

    match &cli.command {
        Commands::Run {
            resync_interval_secs,
        } => {
            // Merge: CLI args > config file > defaults
            let mut config = ControllerConfig::from_file(&file_cfg);
            if let Some(secs) = resync_interval_secs {
                config.resync_interval = Duration::from_secs(*secs);
            }

            info!("Starting udm-controller");
            info!("  Resync:    {}s", config.resync_interval.as_secs());
            info!("  Workers:   {}", config.concurrent_reconciles);
            info!("  Timeout:   {}s", timeout.as_secs());

            let recorder = Arc::new(StoreRecorder::new(client.clone()));
            let handle = UnitedDeploymentController::new(client, recorder, config).start();

            tokio::signal::ctrl_c().await?;
            info!("Shutting down udm-controller");
            handle.abort();
        }
        Commands::Apply { file } => {
            let content = std::fs::read_to_string(file)?;
            for applied in apply::apply_manifest(&client, &content).await? {
                println!("{}", applied);
            }
        }
    }

    store.close().await?;
    Ok(())
}
