use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alert_dispatch::channel::registry::ChannelRegistry;
use alert_dispatch::condition::Condition;
use alert_dispatch::condition::registry::ConditionRegistry;
use alert_dispatch::config::{self, AppConfig};
use alert_dispatch::engine::{Engine, EngineConfig};
use alert_dispatch::manager::NotificationManager;
use alert_dispatch::model::MarketSnapshot;
use alert_dispatch::pipeline::Pipeline;
use alert_dispatch::storage::Storage;
use alert_dispatch::storage::sqlite::SqliteStorage;
use alert_dispatch::template::TemplateEngine;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "alert-dispatch", about = "Market condition alerts with multi-channel delivery")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Test every configured channel's connection and exit
    #[arg(long)]
    test_channels: bool,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(report) => {
            eprintln!("{report:?}");
            1
        }
    };
    // A pending stdin read would otherwise keep the runtime alive.
    std::process::exit(code);
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    // ── Storage ───────────────────────────────────────────────────────────────
    let storage: Option<Arc<dyn Storage>> = if config.general.audit {
        let db_path = Path::new(&config.general.data_dir).join("alert-dispatch.db");
        let storage = SqliteStorage::open(&db_path)
            .await
            .change_context(AppError::Storage)?;
        info!(path = %db_path.display(), "audit storage opened");
        Some(Arc::new(storage))
    } else {
        None
    };

    // ── Templates ─────────────────────────────────────────────────────────────
    let templates = Arc::new(TemplateEngine::new());
    for template in &config.templates {
        templates
            .templates()
            .create_custom_template(&template.name, &template.text, &template.description, false)
            .change_context(AppError::Config)
            .attach_with(|| format!("templates[\"{}\"]", template.name))?;
    }

    // ── Conditions ────────────────────────────────────────────────────────────
    let registry = Arc::new(ConditionRegistry::new());
    for entry in &config.conditions {
        let condition = Condition::from_config(entry).change_context(AppError::Config)?;
        if let Some(storage) = &storage
            && let Err(e) = storage.save_condition(&condition).await
        {
            warn!(condition_id = %condition.id(), error = ?e, "failed to persist condition");
        }
        registry
            .register(condition)
            .change_context(AppError::Config)?;
    }

    // ── Channels ──────────────────────────────────────────────────────────────
    let mut manager = NotificationManager::from_config(
        &config,
        &ChannelRegistry::with_builtin(),
        Arc::clone(&templates),
    )
    .change_context(AppError::Config)?;
    if let Some(storage) = &storage {
        manager = manager.with_storage(Arc::clone(storage));
    }
    let manager = Arc::new(manager);

    if cli.test_channels {
        let mut all_ok = true;
        for (name, status) in manager.test_all().await {
            all_ok &= status.ok;
            println!("{name}: {} ({})", if status.ok { "ok" } else { "FAILED" }, status.message);
        }
        manager.cleanup().await;
        if !all_ok {
            return Err(Report::new(AppError::Runtime).attach("one or more channels failed"));
        }
        return Ok(());
    }

    // ── Engine ────────────────────────────────────────────────────────────────
    let engine = Arc::new(Engine::new(
        Arc::clone(&registry),
        EngineConfig::from_general(&config.general),
    ));
    engine.start();

    let mut pipeline = Pipeline::new(Arc::clone(&engine), Arc::clone(&manager));
    if let Some(storage) = &storage {
        pipeline = pipeline.with_storage(Arc::clone(storage));
    }

    // ── Snapshot feed ─────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let (snapshot_tx, snapshot_rx) = mpsc::channel::<MarketSnapshot>(1024);
    let reader = tokio::spawn(read_snapshots(snapshot_tx, cancel.clone()));
    let mut pipeline_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run(snapshot_rx, cancel).await })
    };

    info!(
        conditions = registry.len(),
        channels = manager.channel_names().len(),
        "alert-dispatch running, reading snapshots from stdin"
    );

    // ── Shutdown ──────────────────────────────────────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.change_context(AppError::Runtime)?;
            info!("ctrl+c received, shutting down");
        }
        _ = &mut pipeline_handle => {
            info!("snapshot feed ended, shutting down");
        }
    }

    cancel.cancel();
    engine.stop().await;
    let _ = reader.await;
    if !pipeline_handle.is_finished() {
        // Deliveries still queued get a grace period before being cancelled.
        if tokio::time::timeout(Duration::from_secs(5), &mut pipeline_handle)
            .await
            .is_err()
        {
            manager.shutdown();
            let _ = pipeline_handle.await;
        }
    }
    manager.cleanup().await;

    let stats = manager.statistics();
    for channel in &stats.channels {
        info!(
            channel = %channel.name,
            kind = %channel.kind,
            sent = channel.stats.total_sent,
            successful = channel.stats.successful,
            failed = channel.stats.failed,
            "channel statistics"
        );
    }
    info!(
        sent = stats.totals.total_sent,
        success_rate = stats.totals.success_rate(),
        "shutdown complete"
    );
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    // stdout is left to --test-channels output; logs go to stderr.
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// One JSON `MarketSnapshot` per line on stdin.
async fn read_snapshots(tx: mpsc::Sender<MarketSnapshot>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MarketSnapshot>(&line) {
            Ok(snapshot) => {
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed snapshot line"),
        }
    }
}
