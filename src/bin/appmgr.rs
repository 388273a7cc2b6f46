use appmgr::{
    Engine, Error, InternalResult,
    config::ManagerConfig,
    executor::{InstallRequest, OperationStatus},
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "appmgr.json", env = "APPMGR_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every root and print what changed
    Scan,
    /// Install a package file and follow its status
    Install {
        target: PathBuf,
        /// Uncompressed size in KB
        #[arg(long, default_value_t = 0)]
        uncompressed_size: u64,
        #[arg(long)]
        verify: bool,
        #[arg(long)]
        system: bool,
    },
    /// Remove a package by package id or app id
    Remove {
        id: String,
        #[arg(long, default_value = "user")]
        cause: String,
    },
    /// Which app handles a mime type, extension or URL
    Resolve {
        key: String,
        /// Treat the key as a URL
        #[arg(long)]
        url: bool,
        /// Resolve for a verb instead of the active handler
        #[arg(long)]
        verb: Option<String>,
    },
    /// Check whether a package fits on storage
    Capacity {
        size_kb: u64,
        uncompressed_size_kb: u64,
        /// Installed package whose space would be freed
        #[arg(long)]
        package: Option<String>,
    },
    /// List the routing entries owned by an app
    Handlers { app_id: String },
    /// Play a named vibration pattern
    Vibrate { pattern: String },
}

fn print_json<T: Serialize>(value: &T) -> InternalResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::internal(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Returns whether the command succeeded.
async fn run(cli: &Cli) -> InternalResult<bool> {
    let config = if cli.config.exists() {
        ManagerConfig::from_file(&cli.config)?
    } else {
        ManagerConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let engine = Engine::new(config).await?;
    let report = engine.scan().await?;

    let succeeded = match &cli.command {
        Commands::Scan => {
            print_json(&report)?;
            true
        }
        Commands::Install {
            target,
            uncompressed_size,
            verify,
            system,
        } => {
            let mut receiver = engine
                .install(InstallRequest {
                    target: target.clone(),
                    uncompressed_size_kb: *uncompressed_size,
                    verify: *verify,
                    system: *system,
                })
                .await?;
            let statuses = receiver.until_terminal().await;
            print_json(&statuses)?;
            matches!(
                statuses.last().map(|s| &s.status),
                Some(OperationStatus::Success)
            )
        }
        Commands::Remove { id, cause } => {
            let mut receiver = engine.remove(id, cause).await?;
            let statuses = receiver.until_terminal().await;
            print_json(&statuses)?;
            matches!(
                statuses.last().map(|s| &s.status),
                Some(OperationStatus::Success)
            )
        }
        Commands::Resolve { key, url, verb } => {
            match verb {
                Some(verb) => print_json(&engine.resolve_by_verb(key, verb).await)?,
                None if *url => print_json(&engine.resolve_for_url(key).await)?,
                None => print_json(&engine.resolve_resource(key).await)?,
            }
            true
        }
        Commands::Capacity {
            size_kb,
            uncompressed_size_kb,
            package,
        } => {
            let report = engine
                .query_install_capacity(package.as_deref(), *size_kb, *uncompressed_size_kb)
                .await?;
            print_json(&report)?;
            report.is_sufficient()
        }
        Commands::Handlers { app_id } => {
            print_json(&engine.list_handlers(app_id).await)?;
            true
        }
        Commands::Vibrate { pattern } => {
            engine.vibrator().vibrate_named(pattern).await?;
            true
        }
    };

    engine.shutdown().await?;
    Ok(succeeded)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
