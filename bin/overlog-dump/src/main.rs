//! overlog-dump - Offline inspection of overlog metadata files
//!
//! Reads metadata block stores, shared container directories and
//! dedicated container headers without modifying them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use overlog_common::Config;
use overlog_metadata::{
    BlockReport, DedicatedContainerHeader, DedicatedHeader, LocalFileSystem, MetadataBlockStore,
    SharedContainerDirectory, StreamEntry,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "overlog-dump")]
#[command(about = "Inspect overlog metadata files")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON); OVERLOG__* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate both copies of every block of a metadata file
    Blocks {
        path: PathBuf,
        /// Number of blocks in the file
        #[arg(long)]
        block_count: u32,
        /// Block size in bytes
        #[arg(long)]
        block_size: u32,
    },
    /// List the streams of a shared container
    Shared {
        /// Metadata file of the container
        path: PathBuf,
        /// Capacity the container was created with
        #[arg(long)]
        max_streams: u32,
    },
    /// Show the header of a dedicated container
    Dedicated {
        path: PathBuf,
        /// Maximum metadata size the container was created with
        #[arg(long)]
        max_metadata_size: u32,
    },
}

/// Defaults, then the optional file, then `OVERLOG__SECTION__KEY` variables
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    let config: Config = builder
        .add_source(
            config::Environment::with_prefix("OVERLOG")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("load configuration")?
        .try_deserialize()
        .context("parse configuration")?;
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` directives when set and valid, otherwise `--log-level`
fn log_filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")))
}

#[derive(Debug, Serialize)]
struct SharedReport {
    path: PathBuf,
    max_streams: u32,
    section_count: u32,
    entries_per_section: u32,
    free_slots: u32,
    entries: Vec<StreamEntry>,
}

#[derive(Debug, Serialize)]
struct DedicatedReport {
    path: PathBuf,
    header: DedicatedHeader,
    security_descriptor_size: usize,
}

async fn dump_blocks(path: &Path, block_count: u32, block_size: u32) -> Result<Vec<BlockReport>> {
    let store = MetadataBlockStore::new(
        Arc::new(LocalFileSystem::new()),
        path,
        block_count,
        block_size,
    )?;
    store
        .inspect()
        .await
        .with_context(|| format!("inspect {}", path.display()))
}

async fn dump_shared(path: &Path, max_streams: u32, config: &Config) -> Result<SharedReport> {
    let mut entries = Vec::new();
    let directory = SharedContainerDirectory::open(
        Arc::new(LocalFileSystem::new()),
        path,
        max_streams,
        &config.metadata,
        |entry| {
            entries.push(entry.clone());
            Ok(())
        },
    )
    .await
    .with_context(|| format!("open shared container {}", path.display()))?;
    entries.sort_by_key(|entry| entry.index);
    debug!("Loaded {} entries from {:?}", entries.len(), path);

    let report = SharedReport {
        path: path.to_path_buf(),
        max_streams: directory.max_streams(),
        section_count: directory.section_count(),
        entries_per_section: directory.entries_per_section(),
        free_slots: directory.free_slots(),
        entries,
    };
    directory.close();
    Ok(report)
}

async fn dump_dedicated(path: &Path, max_metadata_size: u32) -> Result<DedicatedReport> {
    let container =
        DedicatedContainerHeader::new(Arc::new(LocalFileSystem::new()), path, max_metadata_size)?;
    container
        .open()
        .await
        .with_context(|| format!("open dedicated container {}", path.display()))?;
    let header = container
        .header()
        .context("dedicated container header not loaded")?;
    container.close();

    Ok(DedicatedReport {
        path: path.to_path_buf(),
        security_descriptor_size: header.security_descriptor.len(),
        header,
    })
}

fn print_blocks(reports: &[BlockReport]) {
    for block in reports {
        let chosen = block
            .authoritative
            .map_or_else(|| "none".to_string(), |copy| format!("{copy:?}"));
        println!("block {} (authoritative: {})", block.index, chosen);
        for copy in &block.copies {
            match (copy.generation, &copy.error) {
                (Some(generation), _) => println!(
                    "  {:?} @ {:#x}: generation {} size {}",
                    copy.copy,
                    copy.file_offset,
                    generation,
                    copy.data_size.unwrap_or(0)
                ),
                (None, error) => println!(
                    "  {:?} @ {:#x}: invalid ({})",
                    copy.copy,
                    copy.file_offset,
                    error.as_deref().unwrap_or("unknown")
                ),
            }
        }
    }
}

fn print_shared(report: &SharedReport) {
    println!("Shared container {}", report.path.display());
    println!(
        "  capacity {} in {} sections of {}, {} free",
        report.max_streams, report.section_count, report.entries_per_section, report.free_slots
    );
    for entry in &report.entries {
        println!(
            "  [{}] {} {:?} size {} record {} metadata {}",
            entry.index,
            entry.stream_id,
            entry.flags,
            entry.stream_size,
            entry.max_record_size,
            entry.max_ll_metadata_size
        );
        if let Some(alias) = &entry.alias {
            println!("      alias {alias}");
        }
        if let Some(path) = &entry.dedicated_path {
            println!("      dedicated {}", path.display());
        }
    }
}

fn print_dedicated(report: &DedicatedReport) {
    println!("Dedicated container {}", report.path.display());
    println!("  max metadata size {}", report.header.max_metadata_size);
    println!(
        "  security descriptor {} bytes",
        report.security_descriptor_size
    );
    match report.header.actual_metadata_size {
        Some(size) => println!("  metadata {size} bytes"),
        None => println!("  metadata never written"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref(), &args.log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref())?;
    info!("Loaded configuration");

    match args.command {
        Commands::Blocks {
            path,
            block_count,
            block_size,
        } => {
            let reports = dump_blocks(&path, block_count, block_size).await?;
            if args.json {
                print_json(&reports)?;
            } else {
                print_blocks(&reports);
            }
        }
        Commands::Shared { path, max_streams } => {
            let report = dump_shared(&path, max_streams, &config).await?;
            if args.json {
                print_json(&report)?;
            } else {
                print_shared(&report);
            }
        }
        Commands::Dedicated {
            path,
            max_metadata_size,
        } => {
            let report = dump_dedicated(&path, max_metadata_size).await?;
            if args.json {
                print_json(&report)?;
            } else {
                print_dedicated(&report);
            }
        }
    }

    Ok(())
}
