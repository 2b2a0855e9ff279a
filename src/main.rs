//! CLI entry point for the reconciliation engine.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use reconciler_core::analyzer::Thresholds;
use reconciler_core::config::{Config, LogFormat};
use reconciler_core::engine::{ReconcileError, ReconciliationEngine, TrackerLists};
use reconciler_core::manager::{ManagerClient, ManagerClientConfig, RetryPolicy};
use reconciler_core::metrics::Metrics;
use reconciler_core::scheduler::{DelayedTaskScheduler, Trigger};
use reconciler_core::webhook::{self, WebhookState};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod cli;

use cli::Args;

/// Grace period given to in-flight reconciles and the webhook server to
/// drain once a shutdown signal is received.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(args, config))
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Human => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run(args: Args, config: Config) -> ExitCode {
    let dry_run = args.dry_run || config.dry_run;
    info!(dry_run, once = args.once, "reconciler starting");

    let client = ManagerClient::new(ManagerClientConfig {
        base_url: config.manager.url.clone(),
        api_key: config.manager.api_key.clone(),
        timeout: Duration::from_secs(config.manager.timeout_s),
        retry_policy: RetryPolicy::default(),
        ..Default::default()
    });

    let trackers =
        TrackerLists { private: config.trackers.private.clone(), public: config.trackers.public.clone() };
    let thresholds = Thresholds {
        force_import_threshold: config.monitoring.force_import_threshold,
        protect_unknown_trackers: config.monitoring.protect_private_ratio,
    };
    let metrics = Arc::new(Metrics::new());
    let engine = ReconciliationEngine::new(client.clone(), trackers, thresholds, dry_run, metrics.clone())
        .with_remove_public_failures(config.monitoring.remove_public_failures);

    if args.once {
        return match engine.scan_once().await {
            Ok(()) => {
                info!("single scan complete");
                ExitCode::from(0)
            }
            Err(ReconcileError::Unauthorized(err)) => {
                error!(error = %err, "manager rejected credentials");
                ExitCode::from(2)
            }
        };
    }

    let scheduler = Arc::new(DelayedTaskScheduler::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scan_task = {
        let engine = engine.clone();
        let interval = Duration::from_secs(config.monitoring.interval_s);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            // `interval()`'s first tick resolves immediately, so the scan
            // loop's first iteration runs right away rather than waiting a
            // full period.
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(ReconcileError::Unauthorized(err)) = engine.scan_once().await {
                            error!(error = %err, "manager rejected credentials; stopping scan loop");
                            return Err(ReconcileError::Unauthorized(err));
                        }
                    }
                    _ = shutdown_rx.recv() => return Ok(()),
                }
            }
        })
    };

    let scheduler_task = {
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    task = scheduler.next_due() => {
                        match task.trigger {
                            Trigger::PostGrabCheck | Trigger::Retry => {
                                if let Err(ReconcileError::Unauthorized(err)) =
                                    engine.handle_post_grab_check(&task.fingerprint).await
                                {
                                    error!(error = %err, "manager rejected credentials; stopping scheduler loop");
                                    return Err(ReconcileError::Unauthorized(err));
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => return Ok(()),
                }
            }
        })
    };

    let webhook_task = if config.webhook.enabled {
        let secret = config.webhook.secret.clone().unwrap_or_else(|| {
            let generated: String = rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(32)
                .map(char::from)
                .collect();
            warn!("no webhook secret configured; generated a random one for this run only");
            generated
        });

        let state = Arc::new(WebhookState {
            client: client.clone(),
            engine: engine.clone(),
            scheduler: scheduler.clone(),
            metrics: metrics.clone(),
            secret: Some(secret),
            rate_limiter: webhook::rate_limit::RateLimiter::new(config.webhook.rate_limit_per_min),
            dedup: reconciler_core::cache::TtlCache::new(),
            import_check_delay: Duration::from_secs(config.webhook.import_check_delay_s),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        });

        let addr: SocketAddr = match format!("{}:{}", config.webhook.host, config.webhook.port).parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(error = %err, "invalid webhook host/port");
                return ExitCode::from(1);
            }
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("failed to bind webhook listener")?;
            info!(%addr, "webhook server listening");
            axum::serve(listener, webhook::router(state).into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .context("webhook server failed")
        }))
    } else {
        None
    };

    let mut scan_task = scan_task;
    let mut scheduler_task = scheduler_task;
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            ExitCode::from(0)
        }
        result = &mut scan_task => exit_code_for(result, "scan loop"),
        result = &mut scheduler_task => exit_code_for(result, "scheduler loop"),
    };

    let _ = shutdown_tx.send(());

    let drain = async {
        if !scan_task.is_finished() {
            let _ = scan_task.await;
        }
        if !scheduler_task.is_finished() {
            let _ = scheduler_task.await;
        }
        if let Some(task) = webhook_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain).await.is_err() {
        warn!("shutdown grace period elapsed before all tasks drained");
    }

    exit_code
}

/// Maps a background task's join result to the process exit code: a clean
/// `Ok` (only reachable if the loop returned before a shutdown signal fired,
/// which it never does on its own) is normal; an unauthorized manager
/// response is an unrecoverable auth failure; a panic inside the task is a
/// runtime panic (spec.md §6 exit codes).
fn exit_code_for(result: Result<Result<(), ReconcileError>, tokio::task::JoinError>, task_name: &str) -> ExitCode {
    match result {
        Ok(Ok(())) => ExitCode::from(0),
        Ok(Err(ReconcileError::Unauthorized(err))) => {
            error!(error = %err, task = task_name, "manager rejected credentials");
            ExitCode::from(2)
        }
        Err(join_err) => {
            error!(error = %join_err, task = task_name, "task terminated unexpectedly");
            ExitCode::from(3)
        }
    }
}
