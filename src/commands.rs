//! CLI command implementations.
//!
//! Each `run_*` function backs one `mmsync` subcommand. Command output goes
//! to stdout; logs and progress go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::Broker;
use crate::checkpoint::SqliteCheckpointStore;
use crate::config::Config;
use crate::controller::SyncController;
use crate::db;
use crate::error::SyncError;
use crate::migrate;
use crate::models::SourceKind;
use crate::pipeline::FetchPipeline;
use crate::progress::{format_number, Notification, ProgressEvent, ProgressMode};
use crate::server;
use crate::service::SyncService;
use crate::sink::ChromaSink;
use crate::sync_state::{Flag, SyncStateStore};
use crate::traits::{NotificationTransport, VectorSink};
use crate::upstream::MattermostClient;

/// Open the checkpoint store and load the typed sync state.
async fn open_state(config: &Config) -> Result<Arc<SyncStateStore>> {
    let pool = db::connect(config).await?;
    let store = SqliteCheckpointStore::open(pool).await?;
    let state = SyncStateStore::initialize(Arc::new(store), config.sync.fetch_interval_secs).await?;
    Ok(state)
}

/// Wire the upstream client, sink, pipeline and controller from config.
async fn build_controller(config: &Config) -> Result<Arc<SyncController>> {
    let state = open_state(config).await?;
    let upstream = MattermostClient::from_config(&config.upstream)?;
    let sink = ChromaSink::from_config(&config.sink)?;
    let pipeline = FetchPipeline::new(
        Arc::new(upstream),
        Arc::new(sink),
        state,
        config.upstream.page_size,
    );
    Ok(SyncController::new(Arc::new(pipeline)))
}

/// Forward pipeline events to a transport until the sender side closes.
fn spawn_relay(
    transport: Box<dyn NotificationTransport>,
) -> (mpsc::Sender<ProgressEvent>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let notification = Notification::from(event);
            if let Err(e) = transport.publish(&notification).await {
                tracing::warn!(error = %e, "failed to write progress");
            }
        }
    });
    (tx, handle)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
            trigger.cancel();
        }
    });
    token
}

// ============ init ============

pub async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteCheckpointStore::open(pool).await?;
    let state = SyncStateStore::initialize(Arc::new(store), config.sync.fetch_interval_secs).await?;
    let interval = state.fetch_interval().await?;
    println!("Checkpoint store initialized at {}", config.db.path.display());
    println!("  fetch interval: {}s", interval);
    Ok(())
}

// ============ status ============

pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let state = open_state(config).await?;
    let snapshot = state.snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("sync status");
    println!("  fetch interval:      {}s", snapshot.fetch_interval);
    println!("  sync in progress:    {}", snapshot.is_sync_in_progress);
    println!("  fetch in progress:   {}", snapshot.is_fetch_in_progress);
    println!(
        "  total fetched posts: {}",
        format_number(snapshot.total_fetched_posts)
    );
    match snapshot.last_fetched_at {
        Some(at) => println!("  last fetched at:     {}", at.to_rfc3339()),
        None => println!("  last fetched at:     never"),
    }
    Ok(())
}

// ============ interval ============

pub async fn run_interval(config: &Config, secs: Option<i64>) -> Result<()> {
    let state = open_state(config).await?;
    match secs {
        Some(secs) => {
            let secs = state.set_fetch_interval(secs).await?;
            println!("fetch interval set to {}s", secs);
        }
        None => println!("{}", state.fetch_interval().await?),
    }
    Ok(())
}

// ============ sync once ============

pub async fn run_sync_once(config: &Config, mode: ProgressMode) -> Result<()> {
    let controller = build_controller(config).await?;
    let cancel = cancel_on_ctrl_c();
    let (events, relay) = spawn_relay(mode.transport());

    let result = controller.start_fetch(&cancel, &events).await;
    drop(events);
    let _ = relay.await;

    match result {
        Ok(summary) => {
            println!("sync once");
            println!("  channels: {}", summary.channels);
            println!("  pages: {}", summary.pages);
            println!("  upserted: {}", format_number(summary.upserted));
            println!("  deleted: {}", format_number(summary.deleted));
            println!("  skipped: {}", format_number(summary.skipped));
            println!("ok");
            Ok(())
        }
        Err(SyncError::Cancelled) => {
            println!("cancelled; checkpoint left at its previous value");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// ============ sync run ============

pub async fn run_sync_loop(config: &Config, mode: ProgressMode) -> Result<()> {
    let controller = build_controller(config).await?;
    let cancel = cancel_on_ctrl_c();
    let (events, relay) = spawn_relay(mode.transport());

    let result = controller.start_sync(&cancel, events).await;
    let _ = relay.await;

    match result {
        Ok(()) | Err(SyncError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============ reset ============

/// `--flags-only` force-clears both flags. A full reset instead takes the
/// fetch flag for its duration and refuses to run while a pass holds it.
pub async fn run_reset(config: &Config, flags_only: bool) -> Result<()> {
    let state = open_state(config).await?;

    if flags_only {
        state.clear(Flag::Sync).await?;
        state.clear(Flag::Fetch).await?;
        println!("cleared in-progress flags");
        return Ok(());
    }

    let lease = state
        .acquire(Flag::Fetch)
        .await
        .context("cannot reset while a fetch pass is running")?;

    let collection = SourceKind::Mattermost.collection_name();
    let result = async {
        let sink = ChromaSink::from_config(&config.sink)?;
        sink.reset(collection)
            .await
            .with_context(|| format!("failed to drop collection '{}'", collection))?;
        state.clear_cursor().await?;
        anyhow::Ok(())
    }
    .await;
    lease.release().await;
    result?;

    println!("dropped collection '{}' and cleared the cursor", collection);
    Ok(())
}

// ============ serve ============

pub async fn run_serve(config: &Config) -> Result<()> {
    let controller = build_controller(config).await?;
    let (broker, _dispatch) = Broker::spawn(config.broker.subscriber_buffer);
    let service = Arc::new(SyncService::new(
        controller,
        broker,
        config.broker.subscriber_buffer,
    ));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    let shutdown = CancellationToken::new();
    let signal_service = Arc::clone(&service);
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            signal_service.shutdown().await;
            signal_shutdown.cancel();
        }
    });

    println!("sync server listening on http://{}", config.server.bind);
    server::serve(listener, service, shutdown).await
}
