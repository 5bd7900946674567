//! Blockcache CLI
//!
//! ```text
//! blockcache print [-c config.yaml] [-v] <record.cinfo | directory | root://...>
//! blockcache fetch [-c config.yaml] [--local-root DIR] [--name NAME] <file>
//! ```
//!
//! `print` reports cache metadata without touching it. `fetch` reads a local
//! file end to end through the block cache, which is handy for warming a
//! cache directory and for checking the on-disk layout.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockcache::cache::{AccessStats, Cache, CacheConfig, LocalFileSource, RemoteSource};
use blockcache::inspect::{resolve_inspect_path, Inspector};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Block-based local disk cache for remote files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache metadata records
    Print {
        /// Cache configuration file, needed to resolve root:// paths
        #[arg(short, long, env = "BLOCKCACHE_CONFIG")]
        config: Option<PathBuf>,

        /// Print the presence grid for every record
        #[arg(short, long)]
        verbose: bool,

        /// Metadata record, directory, or root:// path
        path: String,
    },

    /// Read a local file through the block cache
    Fetch {
        /// Cache configuration file
        #[arg(short, long, env = "BLOCKCACHE_CONFIG")]
        config: Option<PathBuf>,

        /// Override the cache root directory
        #[arg(long, env = "BLOCKCACHE_LOCAL_ROOT")]
        local_root: Option<PathBuf>,

        /// Override the default block size in bytes
        #[arg(long)]
        block_size: Option<u64>,

        /// Name the file is cached under (defaults to the file path)
        #[arg(long)]
        name: Option<String>,

        /// Size of each read issued against the cache
        #[arg(long, default_value = "1048576")]
        read_size: usize,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,

        /// File to read
        file: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct FetchReport {
    path: String,
    file_size: u64,
    block_size: u64,
    blocks: u64,
    bytes_read: u64,
    access: AccessStats,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    match args.command {
        Command::Print {
            config,
            verbose,
            path,
        } => print(config, verbose, &path),
        Command::Fetch {
            config,
            local_root,
            block_size,
            name,
            read_size,
            json,
            file,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(root) = local_root {
                config.local_root = root;
            }
            if let Some(size) = block_size {
                config.block_size = size;
            }
            let report = fetch(config, &file, name, read_size).await?;
            let mut out = io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut out, &report)?;
                writeln!(out)?;
            } else {
                writeln!(
                    out,
                    "{}: {} bytes in {} blocks of {}, bytesDisk={}, bytesRAM={}, bytesMissed={}",
                    report.path,
                    report.bytes_read,
                    report.blocks,
                    report.block_size,
                    report.access.bytes_disk,
                    report.access.bytes_ram,
                    report.access.bytes_missed
                )?;
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(CacheConfig::default()),
    }
}

fn print(config: Option<PathBuf>, verbose: bool, path: &str) -> anyhow::Result<()> {
    let local_root = match &config {
        Some(path) => Some(load_config(Some(path))?.local_root),
        None => None,
    };
    let target = resolve_inspect_path(path, local_root.as_deref())?;

    let stdout = io::stdout().lock();
    let mut inspector = Inspector::new(stdout, verbose);
    let summary = inspector.inspect(&target)?;
    info!(
        "Printed {} records ({} complete, {} unreadable)",
        summary.records, summary.complete, summary.errors
    );
    Ok(())
}

async fn fetch(
    config: CacheConfig,
    file: &PathBuf,
    name: Option<String>,
    read_size: usize,
) -> anyhow::Result<FetchReport> {
    if read_size == 0 {
        bail!("--read-size must be positive");
    }
    let name = name.unwrap_or_else(|| file.display().to_string());
    let source = LocalFileSource::open(file, name)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let remote: Arc<dyn RemoteSource> = Arc::new(source);

    let cache = Cache::with_local_root(config)?;
    fetch_through(&cache, remote, read_size).await
}

/// Read `remote` end to end through `cache`, detaching even when a read fails
async fn fetch_through(
    cache: &Cache,
    remote: Arc<dyn RemoteSource>,
    read_size: usize,
) -> anyhow::Result<FetchReport> {
    let handle = cache.attach(remote)?;
    info!(
        "Fetching {} ({} bytes, {} blocks)",
        handle.path(),
        handle.file_size(),
        handle.block_count()
    );

    let mut buf = vec![0u8; read_size];
    let mut offset = 0u64;
    let outcome = loop {
        if offset >= handle.file_size() {
            break Ok(());
        }
        match handle.read(&mut buf, offset).await {
            Ok(0) => break Ok(()),
            Ok(n) => offset += n as u64,
            Err(e) => break Err(e),
        }
    };

    let report = FetchReport {
        path: handle.path().to_string(),
        file_size: handle.file_size(),
        block_size: handle.block_size(),
        blocks: handle.block_count(),
        bytes_read: offset,
        access: AccessStats::default(),
    };
    handle.detach().await;
    outcome.with_context(|| format!("reading {} at offset {}", report.path, offset))?;

    Ok(FetchReport {
        access: cache.stats().access,
        ..report
    })
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so printed reports stay clean on stdout
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blockcache::cache::{InMemorySource, InMemoryStore, LocalStore};
    use blockcache::info::InfoFile;

    /// Serves the first `good` bytes and fails past them
    struct CutOffSource {
        good: u64,
        size: u64,
    }

    #[async_trait]
    impl RemoteSource for CutOffSource {
        fn path(&self) -> &str {
            "/cut"
        }

        fn fsize(&self) -> u64 {
            self.size
        }

        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> blockcache::Result<usize> {
            if offset + buf.len() as u64 > self.good {
                return Err(blockcache::Error::Internal("gone".to_string()));
            }
            buf.fill(1);
            Ok(buf.len())
        }
    }

    fn cache(store: Arc<InMemoryStore>) -> Cache {
        let config = CacheConfig {
            block_size: 1000,
            buffer_size: 100,
            ..Default::default()
        };
        Cache::new(config, store).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reports_whole_file() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache(store);
        let remote = Arc::new(InMemorySource::new("/f", vec![5u8; 2500]));

        let report = fetch_through(&cache, remote, 700).await.unwrap();
        assert_eq!(report.bytes_read, 2500);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.access.total(), 2500);
        assert!(!cache.is_attached("/f"));
    }

    #[tokio::test]
    async fn test_fetch_detaches_after_read_error() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache(store.clone());
        let remote = Arc::new(CutOffSource {
            good: 1000,
            size: 3000,
        });

        let result = fetch_through(&cache, remote, 4000).await;
        assert!(result.is_err());
        assert_eq!(cache.stats().files_detached, 1);
        assert!(!cache.is_attached("/cut"));

        let store: &dyn LocalStore = store.as_ref();
        let info = InfoFile::load(store, std::path::Path::new("cut___1000_0.cinfo"))
            .await
            .unwrap();
        assert_eq!(info.access_count(), 1);
    }
}
