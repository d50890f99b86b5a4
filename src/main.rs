use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use video_cache::cache::VideoCache;
use video_cache::config::CacheConfig;
use video_cache::download::HttpDownloader;

#[derive(Parser)]
#[command(name = "video_cache", about = "Persistent LRU cache for downloaded videos")]
struct Cli {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Cache capacity in bytes.
    #[arg(long)]
    capacity: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a video into the cache unless it is already there.
    Prefetch { uri: String },
    /// Adopt an already downloaded file or directory as the cached copy of a uri.
    Store { path: PathBuf, uri: String },
    /// Print the cached location of a uri.
    Lookup { uri: String },
    Remove { uri: String },
    Clear,
    SetCapacity { bytes: u64 },
    /// Print the cache index.
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("video_cache=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }
    if cli.capacity.is_some() {
        config.max_size = cli.capacity;
    }

    let downloader = HttpDownloader::new(config.download_dir(), config.download_timeout());
    let cache = VideoCache::open(&config, Arc::new(downloader)).await?;

    match cli.command {
        Command::Prefetch { uri } => cache.prefetch(&uri).await,
        Command::Store { path, uri } => cache.store(&path, &uri).await,
        Command::Lookup { uri } => match cache.cached_location(&uri).await {
            Some(path) => println!("{}", path.display()),
            None => {
                println!("not cached");
                std::process::exit(1);
            }
        },
        Command::Remove { uri } => cache.remove(&uri).await,
        Command::Clear => cache.clear().await,
        Command::SetCapacity { bytes } => cache.set_capacity(bytes).await,
        Command::Status => {
            let index = cache.snapshot().await?;
            println!(
                "{} records, {} / {} bytes",
                index.records().len(),
                index.current_size(),
                index.max_size()
            );
            for record in index.records() {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.last_accessed_at.to_rfc3339(),
                    record.byte_size,
                    record.uri,
                    record.file_reference.path.display()
                );
            }
        }
    }

    Ok(())
}
