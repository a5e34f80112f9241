//! # blobvault CLI
//!
//! Command-line front end for the blobvault content-addressable blob
//! store: upload files, download or delete them by id, inspect what is
//! stored.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bvault_config::logging::{init_logging, LogLevel};
use bvault_config::Config;
use bvault_engine::{BlobService, CancelToken, EngineConfig, MetadataRepository};
use bvault_store::ChunkStore;

mod repo;

use repo::JsonMetadataRepository;

/// blobvault - content-addressable, deduplicating blob storage
#[derive(Parser)]
#[command(name = "blobvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Chunk storage root directory
    #[arg(long, env = "BLOBVAULT_STORAGE_ROOT")]
    root: Option<PathBuf>,

    /// Metadata file path
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Chunk size in bytes
    #[arg(long, env = "BLOBVAULT_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Worker threads per upload
    #[arg(short = 'j', long, env = "BLOBVAULT_WORKERS")]
    workers: Option<usize>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, deduplicating against existing content
    Upload {
        /// File to upload
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Display name for the record (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Abort the upload after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Download a blob by id
    Download {
        /// Record id returned by upload
        id: String,

        /// Output path (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a blob by id, freeing unreferenced chunks
    Delete {
        /// Record id returned by upload
        id: String,
    },

    /// List stored blobs
    List,

    /// Show chunk store statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    });

    let mut config = Config::load().context("loading configuration")?;
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    if let Some(metadata) = cli.metadata {
        config.storage.metadata_path = metadata;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.upload.chunk_size = chunk_size;
    }
    if let Some(workers) = cli.workers {
        config.upload.workers = workers;
    }

    let store = ChunkStore::open(&config.storage.root)
        .with_context(|| format!("opening chunk store at {}", config.storage.root.display()))?;
    let repo = Arc::new(JsonMetadataRepository::open(&config.storage.metadata_path)?);
    let meta: Arc<dyn MetadataRepository> = repo.clone();

    let service = BlobService::new(
        store,
        meta,
        EngineConfig {
            chunk_size: config.upload.chunk_size,
            workers: config.upload.workers,
            verify_reads: config.upload.verify_downloads,
        },
    );

    // Re-take the chunk references every persisted record owns, so
    // deletes in this process free storage correctly.
    let records = repo.records();
    for record in &records {
        service
            .restore(record)
            .with_context(|| format!("restoring record {}", record.id))?;
    }
    tracing::debug!(records = records.len(), "chunk references restored");

    match cli.command {
        Commands::Upload {
            file,
            name,
            timeout,
        } => {
            let display_name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string())
            });
            let reader = File::open(&file)
                .with_context(|| format!("opening {}", file.display()))?;
            let cancel = match timeout {
                Some(secs) => CancelToken::with_deadline(std::time::Duration::from_secs(secs)),
                None => CancelToken::new(),
            };

            let outcome = service.upload(&display_name, reader, &cancel)?;
            if outcome.already_existed {
                println!(
                    "already stored as {} ({})",
                    outcome.id, outcome.content_hash
                );
            } else {
                println!("{}", outcome.id);
                eprintln!(
                    "stored {} ({}) as {}",
                    display_name,
                    format_size(outcome.total_size),
                    outcome.content_hash
                );
            }
        }

        Commands::Download { id, output } => {
            let mut stream = service.download(&id)?;
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    io::copy(&mut stream, &mut file)?;
                }
                None => {
                    let stdout = io::stdout();
                    let mut handle = stdout.lock();
                    io::copy(&mut stream, &mut handle)?;
                    handle.flush()?;
                }
            }
        }

        Commands::Delete { id } => {
            service.delete(&id)?;
            eprintln!("deleted {id}");
        }

        Commands::List => {
            let records = repo.records();
            if records.is_empty() {
                eprintln!("no blobs stored");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {}  {}  {} chunks  {}",
                    record.id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    format_size(record.total_size),
                    record.chunks.len(),
                    record.display_name,
                );
            }
        }

        Commands::Stats => {
            let stats = service.store().stats()?;
            println!("chunks:      {}", stats.chunk_count);
            println!("total bytes: {}", format_size(stats.total_bytes));
            println!("records:     {}", repo.records().len());
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
