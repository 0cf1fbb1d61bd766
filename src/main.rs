use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dosguard::config::DosConfig;
use dosguard::dos::{DosEngine, EngineBuilder};
use dosguard::executor::WorkerPool;
use dosguard::parse_threshold;
use dosguard::store::{JsonLinesAuditLog, YamlRuleStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Admission control and DoS protection")]
struct Cli {
    /// Path to configuration YAML file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a threshold expression such as "2 r/s, 5m"
    Parse { expression: String },
    /// List the stored rules
    Rules,
    /// Read keys from stdin, one per line, and print a decision for each
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config =
        DosConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Parse { expression } => {
            let threshold = parse_threshold(&expression)?;
            println!("{}", threshold);
            println!("  request rate:    {}", threshold.request_rate());
            println!("  window:          {:?}", threshold.window());
            println!("  blocking period: {:?}", threshold.blocking_period());
        }
        Command::Rules => {
            let engine = engine_builder(&config)?.start()?;
            for rule in engine.rules() {
                println!("{}", rule.to_description());
            }
        }
        Command::Run => run(config).await?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// An engine builder wired to the configured storage.
fn engine_builder(config: &DosConfig) -> anyhow::Result<EngineBuilder> {
    let mut builder = DosEngine::builder(config.clone());
    if let Some(path) = &config.storage.rules_path {
        builder = builder.rule_store(Arc::new(YamlRuleStore::new(path)));
    }
    if let Some(path) = &config.storage.audit_path {
        let log = JsonLinesAuditLog::open(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        builder = builder.audit_sink(Arc::new(log));
    }
    Ok(builder)
}

async fn run(config: DosConfig) -> anyhow::Result<()> {
    info!("Starting dosguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pool = Arc::new(WorkerPool::new(
        config.audit.queue_capacity,
        config.audit.workers,
    ));
    let engine = Arc::new(
        engine_builder(&config)?
            .executor(pool.clone())
            .start()
            .context("failed to start engine")?,
    );
    let maintenance = engine.spawn_maintenance(config.maintenance_interval());
    info!(
        rules = engine.rules().len(),
        maintenance_interval = ?config.maintenance_interval(),
        reload_interval = ?config.reload_interval(),
        "Reading keys from stdin"
    );

    let mut keys = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = keys.next() => match line {
                Some(Ok(line)) => {
                    let key = line.trim();
                    if key.is_empty() {
                        continue;
                    }
                    let decision = engine.evaluate(key);
                    stdout.write_all(format!("{} {}\n", key, decision).as_bytes()).await?;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to read from stdin");
                    break;
                }
                None => {
                    info!("End of input");
                    break;
                }
            },
        }
    }

    stdout.flush().await?;
    maintenance.abort();
    pool.shutdown().await;

    info!(tracked = engine.tracked_windows(), "dosguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
