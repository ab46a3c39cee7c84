//! CloudMount Daemon - FUSE filesystem over the caching engine
//!
//! Serves the persisted mounts, or mounts a local directory through the
//! in-memory remote for trying the engine out.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudmount_engine::db::Database;
use cloudmount_engine::fs::FusePlatform;
use cloudmount_engine::mount::{MountDescriptor, Platform};
use cloudmount_engine::remote::memory::ROOT_HANDLE;
use cloudmount_engine::remote::{MemoryClient, NodeHandle, RemoteClient};
use cloudmount_engine::{Service, ServiceConfig};

/// Environment variable naming the JSON configuration file
const ENV_CONFIG: &str = "CLOUDMOUNT_CONFIG";

/// CLI command
#[derive(Debug)]
enum Command {
    /// Enable the persisted startup mounts (default)
    Serve,
    /// Mount a copy of a local directory
    Mount { seed: PathBuf, mountpoint: PathBuf },
    /// List persisted mounts
    List,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"CloudMount Daemon - Mount cloud storage as a local drive

USAGE:
    cloudmount-daemon                          # Serve persisted mounts (default)
    cloudmount-daemon mount <seed_dir> <mountpoint>
    cloudmount-daemon list
    cloudmount-daemon help

COMMANDS:
    (none)  Enable every mount flagged for startup and wait for Ctrl+C
    mount   Copy <seed_dir> into an in-memory remote and mount it
    list    List persisted mounts
    help    Show this help message

EXAMPLES:
    # Try the engine against a scratch tree
    cloudmount-daemon mount ~/Documents /tmp/cloud

ENVIRONMENT:
    CLOUDMOUNT_CONFIG       JSON configuration file
    CLOUDMOUNT_CACHE_DIR    Cache directory (overrides the config file)
    CLOUDMOUNT_FLUSH_DELAY  Write-back delay in milliseconds
    RUST_LOG                Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "mount" => {
            if args.len() < 4 {
                return Err(anyhow!("Usage: cloudmount-daemon mount <seed_dir> <mountpoint>"));
            }
            Ok(Command::Mount {
                seed: PathBuf::from(&args[2]),
                mountpoint: PathBuf::from(&args[3]),
            })
        }
        "list" => Ok(Command::List),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

fn load_config() -> Result<ServiceConfig> {
    let path = env::var(ENV_CONFIG).ok().map(PathBuf::from).or_else(|| {
        dirs::config_dir().map(|dir| dir.join("cloudmount").join("config.json"))
    });
    ServiceConfig::load(path.as_deref())
}

/// Copy the tree under `dir` into the in-memory remote
///
/// # Returns
/// Number of files copied
fn seed(client: &MemoryClient, parent: NodeHandle, dir: &Path) -> Result<usize> {
    let mut count = 0;
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))?;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            let handle = client.add_directory(parent, &name);
            count += seed(client, handle, &path)?;
        } else {
            let content = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
            client.add_file(parent, &name, content);
            count += 1;
        }
    }
    Ok(count)
}

/// Start the service on a blocking thread, since the engine blocks on the runtime
async fn start(
    config: ServiceConfig,
    client: Arc<dyn RemoteClient>,
    platform: Arc<dyn Platform>,
) -> Result<Arc<Service>> {
    let runtime = tokio::runtime::Handle::current();
    let service =
        tokio::task::spawn_blocking(move || Service::new(config, client, runtime, platform))
            .await??;
    Ok(Arc::new(service))
}

async fn stop(service: Arc<Service>) -> Result<()> {
    tokio::task::spawn_blocking(move || service.shutdown()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let config = load_config()?;
    let platform = Arc::new(FusePlatform::new()) as Arc<dyn Platform>;

    match command {
        Command::Serve => {
            info!("Starting CloudMount daemon");

            let client = Arc::new(MemoryClient::new()) as Arc<dyn RemoteClient>;
            let service = start(config, client, platform).await?;
            let enabled = service.mounts().list(true).len();
            info!(enabled = enabled, "Daemon ready. Press Ctrl+C to stop.");

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, unmounting all volumes...");
            stop(service).await?;
            info!("Shutdown complete.");
        }
        Command::Mount { seed: dir, mountpoint } => {
            info!(seed = %dir.display(), mountpoint = %mountpoint.display(), "Starting mount...");

            let client = Arc::new(MemoryClient::new());
            let files = seed(&client, ROOT_HANDLE, &dir)?;
            info!(files = files, "Seeded in-memory remote");

            let service = start(config, Arc::clone(&client) as Arc<dyn RemoteClient>, platform).await?;

            let name = mountpoint
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cloud".to_string());
            let descriptor = MountDescriptor::new(&name, &mountpoint, ROOT_HANDLE);

            let enabling = Arc::clone(&service);
            let enabled = tokio::task::spawn_blocking(move || {
                enabling.mounts().add(descriptor)?;
                enabling.mounts().enable(&name, false)
            })
            .await?;

            if let Err(e) = enabled {
                error!(error = %e, "Failed to mount volume");
                stop(service).await?;
                return Err(e.into());
            }

            info!(
                mountpoint = %mountpoint.display(),
                "Volume mounted successfully. Press Ctrl+C to unmount."
            );

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, unmounting...");
            stop(service).await?;
            info!("Shutdown complete.");
        }
        Command::List => {
            let database = Database::open(&config.database_path())?;
            let mounts = database.mounts();
            if mounts.is_empty() {
                println!("No mounts configured.");
            } else {
                println!("Configured mounts:");
                for mount in mounts {
                    println!(
                        "  {} -> {} (remote: {}, read-only: {}, at startup: {})",
                        mount.name,
                        mount.path.display(),
                        mount.handle,
                        mount.flags.read_only,
                        mount.flags.enable_at_startup
                    );
                }
            }
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
