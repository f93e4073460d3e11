use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stablebill_core::db::Migrator;
use stablebill_core::repository::Database;
use stablebill_core::{Config, Result};

#[derive(Parser)]
#[command(name = "stablebill")]
#[command(about = "Stablecoin subscription-billing engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and billing workers
    Serve {
        #[arg(short = 'H', long, help = "Bind address")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Port number")]
        port: Option<u16>,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Show applied migrations
    Status,
}

fn init_logging(cli_level: Option<&str>, config: &Config) {
    let level = cli_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stablebill={},warn", level)));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path.display().to_string()),
        None => Config::from_env(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(cli.log_level.as_deref(), &config);

    if let Err(e) = run_command(cli.command, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_command(command: Commands, mut config: Config) -> Result<()> {
    match command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;

            info!("Starting stablebill v{}", stablebill_core::VERSION);
            stablebill_api::run(config).await
        }

        Commands::Db { command } => {
            let db = Database::connect(&config.database).await?;
            let migrator = Migrator::new(db.pool().clone());

            match command {
                DbCommands::Migrate => {
                    migrator.migrate().await?;
                    println!("Migrations complete");
                    Ok(())
                }
                DbCommands::Status => {
                    let applied = migrator.status().await?;
                    if applied.is_empty() {
                        println!("No migrations applied");
                    } else {
                        for migration in applied {
                            println!(
                                "{:>4}  {}  applied {}",
                                migration.version, migration.name, migration.applied_at
                            );
                        }
                    }
                    Ok(())
                }
            }
        }

        Commands::Config => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| stablebill_core::Error::config(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
    }
}
