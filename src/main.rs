//! bucketfs -- command-line access to an S3-backed file storage.
//!
//! Every command builds one storage from the YAML configuration, runs a
//! single operation, and exits.

use std::path::PathBuf;

use bucketfs::config::LoggingConfig;
use bucketfs::{FileStorage, OpenMode, S3Storage};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Read size for streaming local files into an upload.
const CHUNK_SIZE: usize = 64 * 1024;

/// Command-line arguments for bucketfs.
#[derive(Parser, Debug)]
#[command(
    name = "bucketfs",
    version,
    about = "File storage on S3-compatible object stores"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bucketfs.example.yaml")]
    config: PathBuf,

    /// Print Prometheus metrics to stderr after the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file, streaming it in parts.
    Put {
        /// Local file to read.
        source: PathBuf,
        /// Storage name to write to.
        name: String,
    },
    /// Write a stored file to stdout.
    Cat { name: String },
    /// List directories and files under a path.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print the URL of a stored file.
    Url {
        name: String,
        /// Lifetime of a presigned URL, in seconds.
        #[arg(long)]
        expire: Option<u64>,
    },
    /// Delete a stored file.
    Rm { name: String },
    /// Print existence, size and modification time as JSON.
    Stat { name: String },
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = bucketfs::load_config(&cli.config)?;
    init_logging(&config.logging);
    info!("loaded configuration from {}", cli.config.display());

    if cli.metrics {
        bucketfs::metrics::init_metrics()?;
        bucketfs::metrics::describe_metrics();
    }

    let storage = S3Storage::from_settings(config.storage).await?;
    run(&storage, cli.command).await?;

    if cli.metrics {
        if let Some(text) = bucketfs::metrics::render() {
            eprintln!("{text}");
        }
    }
    Ok(())
}

async fn run(storage: &S3Storage, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { source, name } => {
            let mut local = tokio::fs::File::open(&source).await?;
            let mut file = storage.open(&name, OpenMode::Write).await?;
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                let n = local.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                if let Err(e) = file.write(&chunk[..n]).await {
                    file.abort().await?;
                    return Err(e.into());
                }
            }
            let outcome = file.close().await?;
            info!("stored {} as {}: {:?}", source.display(), file.name(), outcome);
            println!("{}", file.name());
        }
        Command::Cat { name } => {
            let mut file = storage.open(&name, OpenMode::Read).await?;
            let data = file.read_to_end().await?;
            file.close().await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Command::Ls { path } => {
            let (directories, files) = storage.listdir(&path).await?;
            for dir in directories {
                println!("{dir}/");
            }
            for file in files {
                println!("{file}");
            }
        }
        Command::Url { name, expire } => {
            println!("{}", storage.url(&name, expire).await?);
        }
        Command::Rm { name } => {
            storage.delete(&name).await?;
            info!("deleted {}", name);
        }
        Command::Stat { name } => {
            let stat = if storage.exists(&name).await? {
                serde_json::json!({
                    "name": name,
                    "exists": true,
                    "size": storage.size(&name).await?,
                    "modified": storage.modified_time(&name).await?.to_string(),
                })
            } else {
                serde_json::json!({ "name": name, "exists": false })
            };
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
    }
    Ok(())
}
