pub mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tvbridge_core::{
    load_bridge_config, ApplianceClient, BridgeConfig, CatalogSync, Discoverer, GuidePlane,
    LiveSettings, LiveStreamWorker, LiveWorkerSettings, MediaStore, TranscodeEngine,
    TranscodeSettings, TunerPool,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tvbridge_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] tvbridge_core::StoreError),
    #[error("discovery error: {0}")]
    Discovery(#[from] tvbridge_core::DiscoveryError),
    #[error("transcode error: {0}")]
    Transcode(#[from] tvbridge_core::TranscodeError),
    #[error("live error: {0}")]
    Live(#[from] tvbridge_core::LiveError),
    #[error("guide error: {0}")]
    Guide(#[from] tvbridge_core::GuideError),
    #[error("sync error: {0}")]
    Sync(#[from] tvbridge_core::SyncError),
    #[error("appliance error: {0}")]
    Appliance(#[from] tvbridge_core::ApplianceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "tvbridge command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to tvbridge.toml
    #[arg(long, default_value = "configs/tvbridge.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge service
    Serve,
    /// Run one discovery pass and print the appliance set
    Discover,
    /// Mirror series and episode catalogs from every appliance
    Sync(commands::catalog::SyncArgs),
    /// Show store counts and cached transcodes
    Status,
    /// Transcode the whole catalog in the background-safe bulk mode
    Backfill,
    /// Run the cache retention sweep once
    Cleanup,
    /// Guide operations
    #[command(subcommand)]
    Guide(commands::guide::GuideCommands),
    /// Recording-rule operations
    #[command(subcommand)]
    Rules(commands::guide::RuleCommands),
}

/// Everything a command needs, built once from the config file.
pub struct AppContext {
    pub config: BridgeConfig,
    pub store: MediaStore,
    pub client: ApplianceClient,
    pub engine: Arc<TranscodeEngine>,
    pub pool: Arc<TunerPool>,
    pub guide: Arc<GuidePlane>,
    pub discovery: Arc<Discoverer>,
    pub sync: Arc<CatalogSync>,
}

impl AppContext {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config = load_bridge_config(&cli.config)?;
        let store = MediaStore::builder()
            .path(config.database_path())
            .create_if_missing(true)
            .build()?;
        store.initialize()?;

        let client = ApplianceClient::new()?;
        let engine = Arc::new(TranscodeEngine::new(
            TranscodeSettings::from_config(&config),
            None,
        ));
        let worker = Arc::new(LiveStreamWorker::new(
            LiveWorkerSettings::from_config(&config),
            None,
        ));
        let pool = Arc::new(TunerPool::new(
            LiveSettings::from_config(&config),
            store.clone(),
            Arc::new(client.clone()),
            worker,
        )?);
        let guide = Arc::new(GuidePlane::new(
            config.guide.clone(),
            client.clone(),
            store.clone(),
        ));
        let discovery = Arc::new(Discoverer::new(
            config.discovery.clone(),
            client.clone(),
            store.clone(),
        ));
        let sync = Arc::new(CatalogSync::new(
            client.clone(),
            store.clone(),
            Arc::clone(&engine),
        ));

        Ok(Self {
            config,
            store,
            client,
            engine,
            pool,
            guide,
            discovery,
            sync,
        })
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let context = AppContext::load(&cli)?;
    match &cli.command {
        Commands::Serve => commands::serve::execute(context).await,
        Commands::Discover => commands::discover::execute(context, cli.format).await,
        Commands::Sync(args) => commands::catalog::sync(context, cli.format, args).await,
        Commands::Status => commands::catalog::status(context, cli.format).await,
        Commands::Backfill => commands::transcode::backfill(context, cli.format).await,
        Commands::Cleanup => commands::transcode::cleanup(context, cli.format).await,
        Commands::Guide(command) => commands::guide::guide(context, cli.format, command).await,
        Commands::Rules(command) => commands::guide::rules(context, cli.format, command).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
