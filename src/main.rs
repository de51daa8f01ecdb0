use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use testflow::config::{EngineConfig, LoggingConfig};
use testflow::executor::TestExecutor;
use testflow::model::{ExecutionStatus, Region, Test, TriggerMetadata, TriggerSource};
use testflow::notifier::auth::{
    encode_key, generate_signing_key, sign_token, signing_key_from_base64, Claims,
};
use testflow::probes::HttpTransport;
use testflow::storage::MemoryStore;

#[derive(Parser)]
#[command(
    name = "testflow",
    about = "Scheduled and on-demand API test execution engine",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $TESTFLOW_CONFIG, then /etc/testflow/testflow.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + queues + scheduler + notifier)
    Serve {
        /// Bind address, overriding the configuration
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute one test definition immediately and print its records
    Run {
        /// JSON test definition
        #[arg(long)]
        file: PathBuf,

        /// Region to run from; repeat for several (defaults to the test's regions)
        #[arg(long = "region")]
        regions: Vec<Region>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Generate a notifier signing key pair
    Keygen,

    /// Issue a subscriber token
    Token {
        /// Base64 signing key printed by `keygen`
        #[arg(long, env = "TESTFLOW_SIGNING_KEY")]
        signing_key: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        org: String,

        /// Lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: i64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting TestFlow daemon");
            testflow::serve(config).await?;
        }
        Commands::Run { file, regions } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let test: Test = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid test definition in {}", file.display()))?;

            let transport = Arc::new(HttpTransport::new(config.executor.max_redirects)?);
            let executor = TestExecutor::new(transport, Arc::new(MemoryStore::new()))
                .with_user_agent(config.executor.user_agent.clone());
            let records = executor
                .execute(&test, &regions, TriggerMetadata::new(TriggerSource::Manual))
                .await;

            println!("{}", serde_json::to_string_pretty(&records)?);
            if records.iter().any(|r| r.status != ExecutionStatus::Passed) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Keygen => {
            let key = generate_signing_key();
            println!("signing_key   = \"{}\"", encode_key(&key.to_bytes()));
            println!("verifying_key = \"{}\"", encode_key(key.verifying_key().as_bytes()));
        }
        Commands::Token {
            signing_key,
            user,
            org,
            ttl,
        } => {
            let key = signing_key_from_base64(&signing_key)?;
            let token = sign_token(&key, &Claims::new(user, org, ttl))?;
            println!("{}", token);
        }
    }

    Ok(ExitCode::SUCCESS)
}
