// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Drive Organizer: AI-powered image organization for cloud drives
//!
//! Lists the images in a drive folder, labels them with a vision model and
//! files copies into `<destination>/<category>/<year>/...`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use drive_organizer::config::AppConfig;
use drive_organizer::history::History;
use drive_organizer::organizer::{DriveOrganizer, OrganizeOptions};
use drive_organizer::recognition::get_recognizer;
use drive_organizer::storage::get_storage_provider;
use drive_organizer::tagstore::TagStore;
use drive_organizer::{OrganizerError, Result};

/// Drive Organizer CLI
#[derive(Parser, Debug)]
#[command(name = "drive-organizer")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Organize cloud drive images into folders using AI image recognition", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for results
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze and organize the images of a folder
    Organize {
        /// Source folder path (or `folder:<id>`)
        #[arg(short, long)]
        source: String,

        /// Destination root folder
        #[arg(short, long)]
        destination: String,

        /// Recognition provider (gemini, ollama, aws)
        #[arg(short, long)]
        recognition: Option<String>,

        /// Images per batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Plan placements without uploading
        #[arg(long)]
        dry_run: bool,
    },

    /// Analyze images without organizing them
    Analyze {
        /// Source folder path (or `folder:<id>`)
        #[arg(short, long)]
        source: String,

        /// Recognition provider (gemini, ollama, aws)
        #[arg(short, long)]
        recognition: Option<String>,

        /// Maximum number of images to analyze
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Write a default configuration file and test authentication
    Init {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show provider and tag store status
    Status,

    /// Tag store queries
    Tags {
        #[command(subcommand)]
        action: TagCommands,
    },

    /// Journal and undo operations
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },

    /// Run the API server
    Web {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum TagCommands {
    /// List tags with image counts
    List {
        /// Maximum number to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Search images by name, category or tag
    Search {
        query: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List images in a category (or all categories when omitted)
    Category { name: Option<String> },

    /// Show tag store statistics
    Stats,
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List recent journal entries
    List {
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// Delete recently organized copies
    Undo {
        /// Number of copies to remove (0 for all)
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear the journal
    Clear {
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_env();

    let outcome = match cli.command {
        Commands::Organize { source, destination, recognition, batch_size, dry_run } => {
            if let Some(provider) = recognition {
                config.recognition.provider = provider;
            }
            if let Some(size) = batch_size {
                config.organization.batch_size = size;
            }
            run_organize(config, &source, &destination, dry_run, cli.quiet).await
        }
        Commands::Analyze { source, recognition, limit } => {
            if let Some(provider) = recognition {
                config.recognition.provider = provider;
            }
            run_analyze(config, &source, limit, &cli.format).await
        }
        Commands::Init { force } => run_init(&cli.config, force).await,
        Commands::Status => run_status(config, &cli.config).await,
        Commands::Tags { action } => run_tags_command(config, action, &cli.format),
        Commands::History { action } => run_history_command(config, action).await,
        Commands::Web { host, port } => {
            if let Some(host) = host {
                config.web.host = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            run_web(config).await
        }
    };

    outcome.map_err(anyhow::Error::from)
}

async fn build_organizer(config: &AppConfig, dry_run: bool) -> Result<DriveOrganizer> {
    config.validate()?;

    let storage = get_storage_provider(&config.storage)?;
    let recognizer = get_recognizer(config).await?;
    let tag_store = TagStore::open(&config.database.path)?;

    let mut options = OrganizeOptions::from_config(&config.organization);
    options.dry_run = dry_run;

    Ok(DriveOrganizer::new(storage, recognizer, options)
        .with_tag_store(tag_store)
        .with_history(History::new(&config.history.path)))
}

/// Organize a folder, stopping early on Ctrl+C
async fn run_organize(config: AppConfig, source: &str, destination: &str, dry_run: bool, quiet: bool) -> Result<()> {
    if dry_run {
        warn!("DRY RUN MODE - nothing will be uploaded");
    }

    let mut organizer = build_organizer(&config, dry_run).await?;
    let progress = move |done: usize, total: usize| {
        if !quiet {
            eprint!("\rProcessed {}/{} images", done, total);
            if done == total {
                eprintln!();
            }
        }
    };

    let result = tokio::select! {
        outcome = organizer.organize_folder(source, destination, Some(&progress)) => Some(outcome),
        _ = signal::ctrl_c() => None,
    };

    let outcome = match result {
        Some(outcome) => outcome?,
        None => {
            warn!("Interrupted, finished batches are kept");
            organizer.close().await?;
            return Ok(());
        }
    };

    println!("Organized: {}", outcome.succeeded);
    println!("Skipped (duplicates): {}", outcome.skipped);
    println!("Failed: {}", outcome.failed);
    for failed in &organizer.failed_files {
        println!("  {}: {}", failed.name, failed.reason);
    }

    organizer.close().await
}

async fn run_analyze(config: AppConfig, source: &str, limit: Option<usize>, format: &str) -> Result<()> {
    let organizer = build_organizer(&config, true).await?;
    if !organizer.authenticate().await? {
        return Err(OrganizerError::Authentication("Failed to authenticate with storage provider".to_string()));
    }

    let analyzed = organizer.analyze_folder(source, limit).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&analyzed)?);
    } else {
        for item in &analyzed {
            match (&item.recognition, &item.error) {
                (Some(r), _) => println!("{}: {} [{}]", item.file.name, r.category, r.labels.join(", ")),
                (None, Some(e)) => eprintln!("{}: error: {}", item.file.name, e),
                (None, None) => {}
            }
        }
        println!("\nAnalyzed {} images", analyzed.len());
    }

    organizer.close().await
}

async fn run_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(OrganizerError::Config(format!(
            "{} already exists. Use --force to overwrite",
            config_path.display()
        )));
    }

    let mut config = AppConfig::default();
    config.save(config_path)?;
    println!("Wrote default configuration to {}", config_path.display());

    config.apply_env();
    let storage = get_storage_provider(&config.storage)?;
    match storage.authenticate().await {
        Ok(true) => println!("Authenticated with {}", storage.name()),
        Ok(false) => println!("Authentication with {} failed; check your credentials", storage.name()),
        Err(e) => println!("Authentication with {} failed: {}", storage.name(), e),
    }

    Ok(())
}

async fn run_status(config: AppConfig, config_path: &Path) -> Result<()> {
    println!("Drive Organizer v{} Status", env!("CARGO_PKG_VERSION"));
    println!("==========================");
    println!("Config: {}", config_path.display());
    println!("Storage provider: {}", config.storage.provider);
    println!("Recognition provider: {}", config.recognition.provider);

    match config.validate() {
        Ok(()) => println!("Configuration: valid"),
        Err(e) => println!("Configuration: {}", e),
    }

    match TagStore::open(&config.database.path) {
        Ok(store) => {
            let stats = store.stats()?;
            println!("\nTag store ({}):", config.database.path);
            println!("  Images: {}", stats.image_count);
            println!("  Tags: {}", stats.tag_count);
            println!("  Categories: {}", stats.category_count);
        }
        Err(e) => println!("\nTag store: error - {}", e),
    }

    let history = History::new(&config.history.path);
    println!("\nJournal ({}): {} undoable copies", config.history.path, history.get_undoable()?.len());

    println!("\nCategories:");
    for rule in &config.categories {
        println!("  {} ({} keywords)", rule.name, rule.keywords.len());
    }

    Ok(())
}

fn run_tags_command(config: AppConfig, action: TagCommands, format: &str) -> Result<()> {
    let store = TagStore::open(&config.database.path)?;
    let json = format == "json";

    match action {
        TagCommands::List { limit } => {
            let tags: Vec<_> = store.all_tags()?.into_iter().take(limit).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&tags)?);
            } else {
                println!("Tags:");
                for tag in tags {
                    println!("  {} ({})", tag.tag, tag.count);
                }
            }
        }
        TagCommands::Search { query, limit } => {
            let results = store.search(&query, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Search results for '{}':", query);
                for image in results {
                    println!("  {} [{}] {}", image.name, image.category, image.tags.join(", "));
                }
            }
        }
        TagCommands::Category { name: Some(name) } => {
            let images = store.get_many(&store.images_in_category(&name)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&images)?);
            } else {
                println!("{} ({} images):", name, images.len());
                for image in images {
                    println!("  {} -> {}", image.name, image.destination.unwrap_or_default());
                }
            }
        }
        TagCommands::Category { name: None } => {
            let categories = store.categories()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&categories)?);
            } else {
                println!("Categories:");
                for cat in categories {
                    println!("  {} ({} images)", cat.category, cat.count);
                }
            }
        }
        TagCommands::Stats => {
            let stats = store.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Tag store statistics:");
                println!("  Images: {}", stats.image_count);
                println!("  Tags: {}", stats.tag_count);
                println!("  Categories: {}", stats.category_count);
                println!("  Users: {}", stats.user_count);
            }
        }
    }

    Ok(())
}

async fn run_history_command(config: AppConfig, action: HistoryCommands) -> Result<()> {
    let history = History::new(&config.history.path);

    match action {
        HistoryCommands::List { count } => {
            let entries = history.get_recent(count)?;
            println!("Recent history ({} entries):", entries.len());
            for entry in entries {
                let status = if entry.undone { "[UNDONE]" } else { "" };
                println!(
                    "  {} {} -> {}/{} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.source_name,
                    entry.folder,
                    entry.file_name,
                    status
                );
            }
        }
        HistoryCommands::Undo { count, dry_run } => {
            if history.get_undoable()?.is_empty() {
                println!("Nothing to undo");
                return Ok(());
            }

            let storage: Arc<_> = get_storage_provider(&config.storage)?;
            if !storage.authenticate().await? {
                return Err(OrganizerError::Authentication(format!(
                    "Failed to authenticate with {}",
                    storage.name()
                )));
            }

            let tag_store = TagStore::open(&config.database.path)?;
            let report = history.undo(storage.as_ref(), Some(&tag_store), count, dry_run).await?;
            if !dry_run {
                println!("Removed {} copies ({} failed)", report.undone, report.failed);
            }
        }
        HistoryCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm clearing history");
                return Ok(());
            }
            history.clear()?;
            println!("History cleared");
        }
    }

    Ok(())
}

async fn run_web(config: AppConfig) -> Result<()> {
    config.validate()?;
    let tag_store = TagStore::open(&config.database.path)?;
    info!("Tag store: {}", config.database.path);
    drive_organizer::web::start_server(config, tag_store).await
}
