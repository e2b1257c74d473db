//! Rampart control plane CLI.
//!
//! `serve` runs the REST API together with the release dispatcher;
//! `migrate` applies the embedded database migrations and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use rampart_control::api::AppState;
use rampart_control::binding::BindingPlanner;
use rampart_control::config::{ControlConfig, Overrides};
use rampart_control::db::{create_pool, run_migrations, PgStore, ReleaseStore};
use rampart_control::release::{
    DefaultRegistryProvider, Dispatcher, ReleaseOrchestrator, TracingReporter,
};
use rampart_control::server::{self, ServerConfig};
use rampart_telemetry::{LogFormat, Telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "rampart-control", about = "Rampart release control plane", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true, env = "RAMPART_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL database URL.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control plane HTTP server and release dispatcher.
    Serve {
        /// Listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Run database migrations on startup.
        #[arg(long, default_value_t = true)]
        migrate: bool,

        /// Log level (trace, debug, info, warn, error).
        #[arg(long, env = "RAMPART_LOG_LEVEL")]
        log_level: Option<String>,

        /// Log format (json or pretty).
        #[arg(long, env = "RAMPART_LOG_FORMAT")]
        log_format: Option<String>,
    },

    /// Apply database migrations and exit.
    Migrate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ControlConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Serve {
            listen,
            migrate,
            log_level,
            log_format,
        } => {
            let config = config.apply(Overrides {
                listen,
                database_url: cli.database_url,
                log_level,
                log_format,
            });
            rt.block_on(run_server(config, migrate))
        }
        Command::Migrate => {
            let config = config.apply(Overrides {
                database_url: cli.database_url,
                ..Overrides::default()
            });
            rt.block_on(migrate_only(&config))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn database_url(config: &ControlConfig) -> anyhow::Result<&str> {
    config
        .database_url
        .as_deref()
        .context("no database URL: set --database-url, DATABASE_URL or database_url in the config file")
}

async fn migrate_only(config: &ControlConfig) -> anyhow::Result<()> {
    let pool = create_pool(database_url(config)?, config.max_connections).await?;
    run_migrations(&pool).await?;
    println!("Migrations applied.");
    Ok(())
}

async fn run_server(config: ControlConfig, migrate: bool) -> anyhow::Result<()> {
    let log_format = LogFormat::parse(&config.log.format)
        .with_context(|| format!("unknown log format '{}'", config.log.format))?;
    let telemetry = Telemetry::init(
        TelemetryConfig::new()
            .with_log_level(config.log.level.clone())
            .with_log_format(log_format),
    )?;
    rampart_telemetry::log_startup!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        "Starting rampart-control"
    );

    let pool = create_pool(database_url(&config)?, config.max_connections).await?;
    if migrate {
        tracing::info!("Running database migrations");
        run_migrations(&pool).await?;
    }

    let metrics = telemetry.metrics_clone();
    let store: Arc<dyn ReleaseStore> = Arc::new(PgStore::new(pool));
    let reporter = Arc::new(TracingReporter::new(Arc::clone(&metrics)));
    let registries = Arc::new(DefaultRegistryProvider::new(
        config.registry.key_prefix.clone(),
        config.registry.retry,
    ));
    let wake = Arc::new(Notify::new());

    let orchestrator = Arc::new(ReleaseOrchestrator::new(
        Arc::clone(&store),
        reporter.clone(),
        Arc::clone(&wake),
        config.compile_options(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        registries,
        reporter,
        Arc::clone(&metrics),
        wake,
        config.compile_options(),
        config.dispatcher_config(),
    ));
    let planner = Arc::new(BindingPlanner::new(
        Arc::clone(&store),
        Some(Arc::clone(&orchestrator)),
    ));

    server::run(ServerConfig {
        listen_addr: config.listen,
        state: AppState {
            orchestrator,
            planner,
            store,
            metrics,
        },
        dispatcher,
    })
    .await
}
