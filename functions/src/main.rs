mod config;
mod handlers;
mod logging;
mod service;
mod statsd;

use clap::{Args, Parser, Subcommand};
use config::Config;
use handlers::Handlers;
use service::PushService;
use shared::http::run_http_service;
use shared::pubsub::PubSubMessage;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "functions", about = "CIDC background functions")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve push-subscription deliveries
    Serve(ConfigArgs),
    /// Invoke the function subscribed to a topic once, with the given payload
    Run(RunArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    topic: String,
    /// Raw payload; it is base64 wrapped like a delivered message
    #[arg(long)]
    data: String,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] config::ValidationError),
    #[error("could not build functions: {0}")]
    Build(#[from] permissions::acl::AclError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Handler(#[from] handlers::HandlerError),
}

fn load_config(path: &std::path::Path) -> Result<Config, CliError> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

async fn serve(config: Config) -> Result<(), CliError> {
    let handlers = Arc::new(Handlers::from_config(&config)?);
    let service = PushService::new(handlers, config.google.project.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    run_http_service(&config.listener.host, config.listener.port, service, shutdown).await?;
    Ok(())
}

async fn run_once(config: Config, topic: &str, data: &str) -> Result<(), CliError> {
    let handlers = Handlers::from_config(&config)?;
    let message = PubSubMessage::from_data(data);
    handlers.dispatch(topic, &message).await?;
    tracing::info!(topic, "Function completed");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        CliCommand::Serve(args) => &args.config,
        CliCommand::Run(args) => &args.config,
    };
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = logging::init(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics
        && let Err(e) = statsd::init(metrics_config)
    {
        tracing::error!(error = %e, "Metrics disabled");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        match cli.command {
            CliCommand::Serve(_) => serve(config).await,
            CliCommand::Run(args) => run_once(config, &args.topic, &args.data).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting with error");
            ExitCode::FAILURE
        }
    }
}
