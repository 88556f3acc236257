mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbpilot_config::{AppConfig, ConfigLoader};

#[derive(Parser)]
#[command(name = "dbpilot", version, about = "Apply, inspect and roll back schema migrations")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.dbpilot/config.yml
    #[arg(long, global = true, env = "DBPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database to operate on
    #[arg(long, global = true, env = "DBPILOT_DATABASE")]
    database: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply every pending migration
    Migrate,
    /// List applied migrations, oldest first
    History {
        #[arg(long)]
        json: bool,
    },
    /// Show applied and pending migrations
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Revert the most recently applied migration
    Rollback,
    /// Clear a migration lock left behind by a crashed process
    Unlock,
}

fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let loader = ConfigLoader::new();
    let mut config: AppConfig = match &cli.config {
        Some(path) => dbpilot_config::loader::load_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => loader.load().context("failed to load config")?,
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    logging::init(&config.log)?;

    let db_path = cli
        .database
        .or_else(|| config.database.path.clone())
        .unwrap_or_else(|| loader.default_database_path());
    let conn = commands::open(&db_path, &config.database)?;

    match cli.command {
        Command::Migrate => commands::migrate(&conn, &config.database),
        Command::History { json } => commands::history(&conn, &config.database, json),
        Command::Status { json } => commands::status(&conn, &config.database, json),
        Command::Rollback => commands::rollback(&conn, &config.database),
        Command::Unlock => commands::unlock(&conn, &config.database),
    }
}
