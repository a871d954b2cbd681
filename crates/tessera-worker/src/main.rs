//! tessera background worker.
//!
//! Reads line-delimited JSON requests from stdin (see [`requests`]) and
//! runs the resulting work on the coalescing scheduler, alongside the
//! periodic event-log flush. Stops at end of input or on interrupt, then
//! runs everything still queued before exiting.

mod requests;
mod settings;

use std::sync::Arc;

use tessera_core::{InMemoryAnnotationStore, InMemoryLearningRecordStore, LearningRecordStore};
use tessera_jobs::{EventLog, Scheduler, SchedulerEvent};
use tessera_recommend::{PredictionStore, VisibilityEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::requests::{parse_line, RequestHandler};
use crate::settings::WorkerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: info for the tessera crates)
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "tessera_worker=info,tessera_jobs=info,tessera_recommend=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tessera-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let settings = WorkerSettings::from_env();
    settings.validate()?;
    info!(
        workers = settings.scheduler.workers,
        queue_capacity = settings.scheduler.queue_capacity,
        max_suggestions = settings.visibility.max_suggestions,
        min_confidence = settings.visibility.min_confidence,
        event_log_batch = settings.event_log.batch_size,
        "Configuration loaded"
    );

    // Standalone mode keeps annotations and learning records in memory.
    let annotations = Arc::new(InMemoryAnnotationStore::new());
    let records = Arc::new(InMemoryLearningRecordStore::new());
    let record_store: Arc<dyn LearningRecordStore> = records.clone();

    let engine = Arc::new(VisibilityEngine::new(
        settings.visibility.clone(),
        annotations.clone(),
        record_store.clone(),
    ));
    let predictions = Arc::new(PredictionStore::new());
    let event_log = Arc::new(EventLog::new(record_store, settings.event_log.clone()));

    let scheduler = Scheduler::start(settings.scheduler.clone())?;
    let flush_handle = event_log.clone().start_periodic_flush();

    let mut events = scheduler.events();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::TaskFailed { task_id, kind, error }) => {
                    warn!(%task_id, task_kind = %kind, error = %error, "Task failed");
                }
                Ok(SchedulerEvent::SchedulerStopped) | Err(RecvError::Closed) => break,
                Ok(other) => debug!(event = ?other, "Scheduler event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event logger lagged"),
            }
        }
    });

    let handler = RequestHandler::new(annotations, engine, predictions, event_log.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut handled: u64 = 0;

    info!("Worker ready, reading requests from stdin");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!(pending = scheduler.pending(), "Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => match parse_line(&line) {
                    Ok(Some(request)) => {
                        handled += 1;
                        if let Some(outcome) = handler.handle(&scheduler, request) {
                            debug!(outcome = ?outcome, "Request handled");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Malformed request skipped"),
                },
                None => {
                    info!(handled, pending = scheduler.pending(), "End of input");
                    break;
                }
            },
        }
    }

    scheduler.shutdown_and_flush().await;
    flush_handle.abort();
    match event_log.flush().await {
        Ok(count) => info!(count, "Final event log flush"),
        Err(e) => warn!(error = %e, pending = event_log.pending(), "Final event log flush failed"),
    }
    if let Err(e) = event_logger.await {
        debug!(error = %e, "Event logger ended abnormally");
    }

    let stats = scheduler.stats();
    info!(
        submitted = stats.submitted,
        replaced = stats.replaced,
        completed = stats.completed,
        failed = stats.failed,
        stored_records = records.len(),
        "Worker stopped"
    );
    Ok(())
}
