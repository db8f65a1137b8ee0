//! sync-daemon: keeps a local file store in sync with a Google Drive folder.
//!
//! One-shot commands edit the store (`put`, `mv`, `rm`, ...); `sync` runs a
//! single pass and `watch` keeps syncing on an interval until Ctrl+C.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sync_core::path::is_within;
use sync_core::{
    Content, NoopIndexer, RecordStore, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncOutcome,
    Tags, Vault,
};
use sync_daemon::{DaemonConfig, DriveClient, JsonFileBackend, PdfToTextExtractor};

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Local-first file store synced with Google Drive")]
struct Args {
    /// Directory holding the local store (overrides SYNC_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Name of the Drive folder to sync with
    #[arg(long, global = true)]
    root_name: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass
    Sync,
    /// Sync repeatedly until interrupted
    Watch {
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// List files
    Ls {
        /// Only paths at or below this folder
        #[arg(default_value = "")]
        prefix: String,
        /// Only files carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Print a file
    Cat { path: String },
    /// Write a file from stdin or another file
    Put {
        path: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
        /// Tag to set (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Append text instead of replacing
        #[arg(long)]
        append: bool,
    },
    /// Create a folder
    Mkdir { path: String },
    /// Move a file or folder
    Mv { from: String, to: String },
    /// Delete a file or folder
    Rm { path: String },
    /// Forget remote state (or everything, with --factory)
    Reset {
        #[arg(long)]
        factory: bool,
    },
}

type Engine = SyncEngine<DriveClient, JsonFileBackend>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = DaemonConfig::from_env()?;
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir);
    }
    debug!("Data directory: {}", config.data_dir.display());

    let store = Arc::new(
        RecordStore::open(JsonFileBackend::in_dir(&config.data_dir))
            .await
            .with_context(|| format!("opening store in {}", config.data_dir.display()))?,
    );
    let vault = Vault::new(Arc::clone(&store), Arc::new(NoopIndexer));

    match args.command {
        Command::Sync => {
            let engine = build_engine(&config, args.root_name, store)?;
            let _logging = log_events(&engine);
            report(engine.sync().await)?;
        }
        Command::Watch { interval } => {
            let engine = Arc::new(build_engine(&config, args.root_name, store)?);
            let _logging = log_events(&engine);
            watch(engine, Duration::from_secs(interval.max(1))).await?;
        }
        Command::Ls { prefix, tag } => {
            let files = match tag {
                Some(tag) => vault.files_by_tag(&tag).await,
                None => vault.list_files(&prefix).await,
            };
            for file in files.iter().filter(|f| is_within(&f.path, &prefix)) {
                let marker = match (file.is_folder(), file.dirty) {
                    (true, _) => "d",
                    (false, true) => "*",
                    (false, false) => " ",
                };
                println!("{marker} {}", file.path);
            }
        }
        Command::Cat { path } => match vault.read_file(&path).await {
            Some(Content::Text(text)) => println!("{text}"),
            Some(Content::Binary(bytes)) => bail!("{path} is binary ({} bytes)", bytes.len()),
            None => bail!("{path} not found"),
        },
        Command::Put {
            path,
            from,
            tags,
            append,
        } => {
            let content = read_input(from).await?;
            let tags = (!tags.is_empty()).then(|| tags.into_iter().collect::<Tags>());
            match (append, content) {
                (true, Content::Text(text)) => vault.append_file(&path, &text).await?,
                (true, Content::Binary(_)) => bail!("cannot append binary content"),
                (false, content) => vault.save_file(&path, content, tags, None).await?,
            }
            info!("Saved {}", path);
        }
        Command::Mkdir { path } => vault.create_folder(&path).await?,
        Command::Mv { from, to } => vault.rename(&from, &to).await?,
        Command::Rm { path } => vault.delete(&path).await?,
        Command::Reset { factory } => {
            if factory {
                vault.factory_reset().await?;
                info!("Store reset to default folders");
            } else {
                vault.reset_sync_state().await?;
                info!("Sync state cleared; next sync re-uploads everything");
            }
        }
    }
    Ok(())
}

fn build_engine(
    config: &DaemonConfig,
    root_name: Option<String>,
    store: Arc<RecordStore<JsonFileBackend>>,
) -> Result<Engine> {
    let drive = DriveClient::new(config.drive()?)?;
    let mut sync_config = SyncConfig::default();
    if let Some(name) = root_name {
        sync_config.root_folder_name = name;
    }
    info!("Syncing with Drive folder {}", sync_config.root_folder_name);

    Ok(SyncEngine::new(
        drive,
        store,
        Arc::new(PdfToTextExtractor::default()),
        Arc::new(NoopIndexer),
        sync_config,
    ))
}

fn log_events(engine: &Engine) -> sync_core::Subscription {
    engine.events().subscribe(|event| match event {
        SyncEvent::Progress { message, .. } => info!("{}", message),
        SyncEvent::RecordFailed { path, error, .. } => warn!("{}: {}", path, error),
        other => debug!("{:?}", other),
    })
}

/// Log a pass result. Only a credential failure is fatal.
fn report(result: std::result::Result<SyncOutcome, SyncError>) -> Result<()> {
    match result {
        Ok(SyncOutcome::Completed { pull_failed: false }) => info!("Sync complete"),
        Ok(SyncOutcome::Completed { pull_failed: true }) => {
            warn!("Sync finished without pulling remote changes")
        }
        Ok(SyncOutcome::AlreadyRunning) => debug!("Previous pass still running"),
        Err(e @ SyncError::Unauthorized(_)) => {
            return Err(e).context("Drive rejected the access token; refresh DRIVE_ACCESS_TOKEN");
        }
        Err(e) => error!("Sync failed: {}", e),
    }
    Ok(())
}

async fn watch(engine: Arc<Engine>, interval: Duration) -> Result<()> {
    info!("Watching, one pass every {:?}. Press Ctrl+C to stop.", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut running: Option<JoinHandle<std::result::Result<SyncOutcome, SyncError>>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(pass) = running.take() {
                    if !pass.is_finished() {
                        debug!("Previous pass still running, skipping tick");
                        running = Some(pass);
                        continue;
                    }
                    report(pass.await?)?;
                }
                running = Some(engine.spawn_sync());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Some(pass) = running {
        info!("Waiting for the running pass to finish");
        report(pass.await?)?;
    }
    Ok(())
}

/// Content from a file, or text from stdin.
async fn read_input(from: Option<PathBuf>) -> Result<Content> {
    let bytes = match from {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };
    Ok(match String::from_utf8(bytes) {
        Ok(text) => Content::Text(text),
        Err(e) => Content::Binary(e.into_bytes()),
    })
}
