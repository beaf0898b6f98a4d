use super::demo;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsync::{ConnectionConfig, SyncConfig, SyncEngine};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "Batch document synchronization over a pooled store")]
pub struct Cli {
    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Also append errors to this file
    #[arg(long, global = true)]
    error_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed an in-memory store and sync it into a catalog collection
    Demo {
        #[arg(long, default_value_t = 250)]
        documents: u64,
        #[arg(long, default_value_t = 3)]
        workers: usize,
        #[arg(long, default_value_t = 100)]
        batch_size: u64,
        /// Stop each task after this many records (0 = no limit)
        #[arg(long, default_value_t = 0)]
        limit: u64,
        #[arg(long, default_value_t = 10)]
        max_connections: usize,
        /// Compute writes without applying them
        #[arg(long)]
        dry_run: bool,
        /// Pause after each record in dry-run mode [default: 1000]
        #[arg(long)]
        pacing_ms: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the endpoint URI built from loose connection settings
    Uri {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 27017)]
        port: u16,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Show the password instead of masking it
        #[arg(long)]
        reveal: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        init_tracing(&self.log_level, self.error_log.as_deref())?;

        match self.command {
            Command::Demo {
                documents,
                workers,
                batch_size,
                limit,
                max_connections,
                dry_run,
                pacing_ms,
                json,
            } => {
                let store = docsync::storage::MemoryStore::new();
                demo::seed(&store, documents);

                let mut config = SyncConfig::new().batch_size(batch_size).workers(workers);
                config = match (dry_run, pacing_ms) {
                    (true, Some(ms)) => config.dry_run(Duration::from_millis(ms)),
                    (true, None) => config.enable_dry_run(),
                    (false, _) => config,
                };
                let connection = ConnectionConfig::default()
                    .name("demo")
                    .max_connections(max_connections);

                let mut engine = SyncEngine::with_config(connection, config, store.connector())
                    .context("invalid demo settings")?;
                let tally = demo::register(&mut engine, limit)?;

                let report = engine.run_default().await?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print!("{}", report);
                    println!("{}", tally);
                    println!("{}", engine.pool().stats().await);
                    println!(
                        "catalog now holds {} documents",
                        store.documents(&demo::catalog()).len()
                    );
                }
                Ok(())
            }
            Command::Uri {
                host,
                port,
                username,
                password,
                reveal,
            } => {
                let mut config = ConnectionConfig::new(&host, port);
                if let (Some(user), Some(pass)) = (&username, &password) {
                    config = config.credentials(user, pass);
                }
                config.validate()?;

                if reveal {
                    println!("{}", config.endpoint()?);
                } else {
                    println!("{}", config.to_url());
                }
                Ok(())
            }
        }
    }
}

fn init_tracing(default_level: &str, error_log: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let error_file = error_log.map(open_error_log).transpose()?;

    let _ = subscriber(filter, error_file).try_init();
    Ok(())
}

fn open_error_log(path: &Path) -> Result<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open error log {}", path.display()))?;
    Ok(Arc::new(file))
}

/// Console output under `filter`, plus ERROR events copied to `error_file`
fn subscriber(filter: EnvFilter, error_file: Option<Arc<File>>) -> impl Subscriber + Send + Sync {
    let error_layer = error_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .with_filter(LevelFilter::ERROR)
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(filter),
        )
        .with(error_layer)
}
