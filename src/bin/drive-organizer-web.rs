// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Drive Organizer API server
//!
//! Standalone server for the tag store and auth endpoints.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use drive_organizer::config::AppConfig;
use drive_organizer::tagstore::TagStore;

#[derive(Parser, Debug)]
#[command(name = "drive-organizer-web")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Drive Organizer API server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    // tower_http request spans are logged at debug
    let filter = if args.verbose { "debug" } else { "info,tower_http=debug" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Drive Organizer API v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config)?;
    config.apply_env();
    if let Some(host) = args.host {
        config.web.host = host;
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }
    config.validate()?;

    let tag_store = TagStore::open(&config.database.path)?;
    info!("Tag store: {}", config.database.path);

    drive_organizer::web::start_server(config, tag_store).await?;
    Ok(())
}
