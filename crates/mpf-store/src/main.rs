//! MPF storage command-line tool.

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mpf_store::Cli;

const DEFAULT_DIRECTIVES: &[&str] = &[
    "mpf_storage=info",
    "mpf_store=info",
    "aws_smithy_runtime=warn",
    "aws_config=warn",
];

fn install_crypto_provider() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))
}

fn env_filter() -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if let Err(e) = install_crypto_provider() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = match env_filter() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Invalid log filter: {:#}", e);
            std::process::exit(1);
        }
    };

    // Logs go to stderr, reports to stdout
    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    let cli = Cli::parse();
    info!("Starting mpf-store");

    let report = match mpf_store::run(cli).await {
        Ok(report) => report,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            std::process::exit(1);
        }
    }

    if !report.is_success() {
        std::process::exit(2);
    }
}
