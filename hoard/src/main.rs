use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hoard_core::cache::{self, DiskCache};
use hoard_core::crypt::{RepoKeys, load_key_file};
use hoard_core::refs::{self, Ref};
use hoard_core::remote::{LocalRepository, PackRepository};
use hoard_core::store::StoreReader;
use hoard_core::{GcOptions, StoreConfig, gc, parse_size};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod output;

use output::{DaemonOutput, GcOutput, InitOutput, OutputWriter, TagInfo, TagsOutput};

/// Hoard - an encrypted, content-addressed backup store
#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "Operator tools for a hoard pack repository", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository directory (defaults to HOARD_REPO env var or ./hoard-repo)
    #[arg(short, long, global = true)]
    repo: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository
    Init,

    /// Serve a persistent blob cache over HTTP
    CacheDaemon {
        /// Cache database file
        #[arg(long)]
        db: PathBuf,

        /// Cache budget, with an optional K/M/G suffix (defaults to the
        /// configured disk_cache_size)
        #[arg(long)]
        max_size: Option<String>,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: String,

        /// Store config file (key=value)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of tokio worker threads
        #[arg(long, default_value_t = 4)]
        worker_threads: usize,
    },

    /// Drop packed blobs that no tag can reach
    Gc {
        /// File holding the 32-byte repository key
        #[arg(long)]
        key_file: PathBuf,

        /// Plan the sweep without writing or deleting packs
        #[arg(long)]
        dry_run: bool,

        /// Store config file (key=value)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List tags and the snapshots they point at
    Tags {
        /// Repository key; when given, tag signatures are verified and the
        /// newest snapshot of each tag is shown
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Store config file (key=value)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let out = OutputWriter::new(cli.json);
    match run(cli, &out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            out.write_error(&err, 1);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli, out: &OutputWriter) -> Result<()> {
    // Repository: CLI arg > HOARD_REPO env var > ./hoard-repo default
    let repo = cli
        .repo
        .or_else(|| std::env::var("HOARD_REPO").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./hoard-repo"));

    match cli.command {
        Commands::Init => cmd_init(&repo, out),
        Commands::CacheDaemon {
            db,
            max_size,
            listen,
            config,
            worker_threads,
        } => cmd_cache_daemon(
            &db,
            max_size.as_deref(),
            &listen,
            config.as_deref(),
            worker_threads,
            out,
        ),
        Commands::Gc {
            key_file,
            dry_run,
            config,
        } => cmd_gc(&repo, &key_file, dry_run, config.as_deref(), out),
        Commands::Tags { key_file, config } => {
            cmd_tags(&repo, key_file.as_deref(), config.as_deref(), out)
        }
    }
}

fn open_repo(repo: &Path) -> Result<LocalRepository> {
    LocalRepository::open(repo)
        .with_context(|| format!("Failed to open repository at {}", repo.display()))
}

fn load_keys(key_file: &Path) -> Result<RepoKeys> {
    load_key_file(key_file)
        .with_context(|| format!("Failed to load key file {}", key_file.display()))
}

/// Config file (or defaults), then environment overrides.
fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    let mut config = match path {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(dir) = std::env::var_os("HOARD_CACHE_DIR") {
        config.cache_dir = Some(PathBuf::from(dir));
    }
    Ok(config)
}

fn cmd_init(repo: &Path, out: &OutputWriter) -> Result<()> {
    LocalRepository::init(repo)
        .with_context(|| format!("Failed to initialize repository at {}", repo.display()))?;

    let output = InitOutput {
        success: true,
        result_code: 0,
        repo: repo.display().to_string(),
    };
    out.write(&output, || {
        format!("Initialized hoard repository at {}\n", repo.display())
    })
}

/// `--max-size` when given, else the configured disk cache size.
fn cache_budget(max_size: Option<&str>, config: Option<&Path>) -> Result<u64> {
    match max_size {
        Some(size) => parse_size(size).with_context(|| format!("Invalid --max-size {:?}", size)),
        None => Ok(load_config(config)?.disk_cache_size),
    }
}

fn cmd_cache_daemon(
    db: &Path,
    max_size: Option<&str>,
    listen: &str,
    config: Option<&Path>,
    worker_threads: usize,
    out: &OutputWriter,
) -> Result<()> {
    let max_size = cache_budget(max_size, config)?;
    let disk = DiskCache::open(db, max_size)
        .with_context(|| format!("Failed to open cache database {}", db.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to listen on {}", listen))?;
        let local = listener.local_addr().context("Failed to read listen address")?;

        let output = DaemonOutput {
            success: true,
            result_code: 0,
            listen: local.to_string(),
            db: db.display().to_string(),
            max_size,
            entries: disk.len(),
            size: disk.size(),
        };
        out.write(&output, || {
            format!(
                "Cache daemon listening on http://{} ({} entries, {} of {} bytes)\n",
                output.listen, output.entries, output.size, output.max_size
            )
        })?;

        info!(addr = %local, "serving cache");
        cache::serve(listener, Arc::new(disk))
            .await
            .context("Cache daemon stopped")
    })
}

fn cmd_gc(
    repo: &Path,
    key_file: &Path,
    dry_run: bool,
    config: Option<&Path>,
    out: &OutputWriter,
) -> Result<()> {
    let config = load_config(config)?;
    let keys = load_keys(key_file)?;
    let repository: Arc<dyn PackRepository> = Arc::new(open_repo(repo)?);

    let options = GcOptions {
        dry_run,
        ..GcOptions::from_config(&config)
    };
    let stats = gc::collect(repository, &keys, &config, &options)
        .context("Garbage collection failed")?;

    let output = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        stats,
    };
    out.write(&output, || output.to_text())
}

fn cmd_tags(
    repo: &Path,
    key_file: Option<&Path>,
    config: Option<&Path>,
    out: &OutputWriter,
) -> Result<()> {
    let repository: Arc<dyn PackRepository> = Arc::new(open_repo(repo)?);
    let mut names = repository.list_tags().context("Failed to list tags")?;
    names.sort();

    let verified = match key_file {
        Some(key_file) => {
            let keys = load_keys(key_file)?;
            let config = load_config(config)?;
            let reader = StoreReader::open(Arc::clone(&repository), keys.pack.clone(), &config)
                .context("Failed to open store")?;
            Some((keys, reader))
        }
        None => None,
    };

    let mut tags = Vec::with_capacity(names.len());
    for name in names {
        let value = repository
            .get_tag(&name)
            .with_context(|| format!("Failed to read tag {}", name))?;
        let mut info = TagInfo {
            name,
            value,
            root: None,
            created_at: None,
            versions: None,
        };
        if let Some((keys, reader)) = &verified {
            let head = refs::verify_tag(&keys.refs, &info.value)
                .with_context(|| format!("Tag {} failed verification", info.name))?;
            let chain = refs::history(reader, head)
                .collect::<hoard_core::Result<Vec<(_, Ref)>>>()
                .with_context(|| format!("Failed to read history of tag {}", info.name))?;
            if let Some((_, newest)) = chain.first() {
                info.root = Some(newest.root.to_string());
                info.created_at = Some(newest.created_at);
            }
            info.versions = Some(chain.len());
        }
        tags.push(info);
    }

    let output = TagsOutput {
        success: true,
        result_code: 0,
        tags,
    };
    out.write(&output, || output.to_text())
}
