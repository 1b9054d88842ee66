//! aigate HTTP server
//!
//! Starts an Axum web server that fronts the governed AI assistant.

use aigate::{
    cli::{Cli, Command, generate_config_template, run_audit_cleanup},
    config::Config,
    handlers::{self, AppState},
    telemetry,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config { output }) => {
            let template = generate_config_template();
            match output {
                Some(path) => {
                    std::fs::write(&path, template)?;
                    eprintln!("Configuration template written to {}", path);
                }
                None => print!("{}", template),
            }
            Ok(())
        }
        Some(Command::AuditCleanup { retention_days }) => {
            let config = Config::from_file(&cli.config)?;
            telemetry::init(&config.observability.log_level);

            let report = run_audit_cleanup(config, retention_days).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => serve(&cli.config).await,
    }
}

async fn serve(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(config_path)?;

    telemetry::init(&config.observability.log_level);

    tracing::info!(
        "Starting aigate server on {}:{}",
        config.server.host,
        config.server.port
    );

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        config.server.port,
    ));
    let maintenance_enabled = config.maintenance.enabled;

    let state = AppState::new(Arc::new(config))?;
    tracing::info!(
        organizations = state.config().organizations.len(),
        actors = state.config().actors.len(),
        model = %state.config().provider.model,
        "Loaded tenants"
    );

    if maintenance_enabled && let Some(maintenance) = state.maintenance() {
        maintenance.clone().start();
    }

    let app = handlers::router(state);

    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
