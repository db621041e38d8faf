//! Reelbot CLI
//!
//! Command-line interface for the Reelbot Telegram movie bot

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reelbot_acl::{AccessEntry, AclStore};
use reelbot_config::{Config, CONFIG_TEMPLATE};
use reelbot_core::BotRuntime;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "reelbot")]
#[command(about = "Telegram bot that searches and requests movies from Radarr", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides core.log_level
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Print allowed and revoked users
    Users,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate the config, then print a summary without secrets
    Check,

    /// Write a config template
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.as_ref())?;
            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

            let log_level = cli
                .log_level
                .clone()
                .unwrap_or_else(|| config.log_level().to_string());
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            let runtime = BotRuntime::new(config)?;
            info!("Starting Reelbot runtime in foreground...");
            runtime.run().await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Check => {
                logging::init_stderr(cli.log_level.as_deref().unwrap_or("warn"))?;
                let config = load_config(cli.config.as_ref())?;
                println!("Configuration is valid.");
                print_summary(&config);
            }
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config.as_ref())?;
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists, use --force to overwrite",
                        path.display()
                    );
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, CONFIG_TEMPLATE)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Config template written to {}", path.display());
            }
        },

        Commands::Users => {
            logging::init_stderr(cli.log_level.as_deref().unwrap_or("warn"))?;
            let config = load_config(cli.config.as_ref())?;
            let acl = AclStore::open(
                config.acl_path(),
                &config.auth.password,
                config.auth.owner_id,
            )?;
            print_users(&acl);
        }
    }

    Ok(())
}

fn config_path(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.clone()),
        None => Config::default_path().context("Cannot determine the default config directory"),
    }
}

fn load_config(explicit: Option<&PathBuf>) -> Result<Config> {
    let path = config_path(explicit)?;
    Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn print_summary(config: &Config) {
    println!("  Data dir:      {}", config.data_dir().display());
    println!("  ACL file:      {}", config.acl_path().display());
    println!(
        "  Bot name:      {}",
        config.telegram.bot_name.as_deref().unwrap_or("(not set)")
    );
    match config.auth.owner_id {
        Some(id) => println!("  Owner:         {}", id),
        None => println!("  Owner:         first authorized user"),
    }
    println!("  Radarr:        {}", config.radarr.api_base_url());
    println!(
        "  Radarr auth:   {}",
        if config.radarr.basic_auth().is_some() {
            "api key + basic auth"
        } else {
            "api key"
        }
    );
    println!("  Session TTL:   {}s", config.session.ttl_secs);
    println!("  Log level:     {}", config.log_level());
}

fn print_entries(title: &str, entries: &[AccessEntry], owner: Option<i64>) {
    println!("{} ({})", title, entries.len());
    for entry in entries {
        let marker = if owner == Some(entry.user.id) {
            " [owner]"
        } else {
            ""
        };
        println!(
            "  {:>12}  {}{}  {}",
            entry.user.id,
            entry.user.display_name(),
            marker,
            entry.since.as_deref().unwrap_or("-")
        );
    }
}

fn print_users(acl: &AclStore) {
    println!("ACL file: {}", acl.path().display());
    match acl.owner() {
        Some(id) => println!("Owner: {}", id),
        None => println!("Owner: none"),
    }
    print_entries("Allowed users", &acl.allowed(), acl.owner());
    print_entries("Revoked users", &acl.revoked(), acl.owner());
}
