use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use sigil::ca::service::CertificateService;
use sigil::config::Config;
use sigil::{AcmeState, CaState};

#[derive(Parser, Debug)]
#[command(name = "sigil")]
#[command(author, version, about = "A lightweight certificate authority with an ACME front end", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sigil.yaml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Certificate authority plane
    Ca {
        #[command(subcommand)]
        command: CaCommand,
    },
    /// ACME server plane
    Acme {
        #[command(subcommand)]
        command: AcmeCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CaCommand {
    /// Run the CA HTTP API
    Serve,
    /// Issue configured certificates by name
    Issue {
        /// Certificate names from the x509_certificates config
        names: Vec<String>,
    },
    /// Print the creation status of every configured certificate
    Status,
}

#[derive(Subcommand, Debug)]
enum AcmeCommand {
    /// Run the ACME HTTP API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let default_level = match &cli.command {
        Command::Ca { .. } => &config.sigil_ca.logging.level,
        Command::Acme { .. } => &config.sigil_acme.logging.level,
    };
    let log_level = cli.log_level.as_ref().unwrap_or(default_level).clone();
    sigil::logging::init(&log_level);

    tracing::info!("Starting sigil v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Ca { command } => run_ca(config, command).await,
        Command::Acme { command } => run_acme(config, command).await,
    }
}

async fn run_ca(config: Config, command: CaCommand) -> Result<()> {
    let db = sigil::db::init(&config.sigil_ca.database.path).await?;

    match command {
        CaCommand::Serve => {
            let addr = format!(
                "{}:{}",
                config.sigil_ca.api.host, config.sigil_ca.api.port
            );
            let state = Arc::new(CaState::new(config.sigil_ca, db));
            let app = sigil::api::create_router(state);

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("CA API listening on http://{}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        CaCommand::Issue { names } => {
            let service = CertificateService::new(config.sigil_ca, db);
            for name in &names {
                let response = service.create_certificate(name).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
        }
        CaCommand::Status => {
            let service = CertificateService::new(config.sigil_ca, db);
            let statuses = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }

    tracing::info!("Done");
    Ok(())
}

async fn run_acme(config: Config, command: AcmeCommand) -> Result<()> {
    let db = sigil::db::init(&config.sigil_acme.database.path).await?;

    match command {
        AcmeCommand::Serve => {
            let addr = format!(
                "{}:{}",
                config.sigil_acme.server.host, config.sigil_acme.server.port
            );
            let state = Arc::new(AcmeState::new(config.sigil_acme, db));
            let app = sigil::acme::create_router(state);

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("ACME server listening on http://{}", addr);
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
