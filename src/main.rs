// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use haloyd::certificates::{CertificatesManager, CertificatesManagerConfig};
use haloyd::config::{self, HaloydConfig};
use haloyd::constants::{
    API_SERVER_PORT, CERTIFICATES_HTTP_PROVIDER_PORT, CERT_STORAGE_DIR, DB_DIR, DB_FILE_NAME,
    DOCKER_NETWORK, ENV_VAR_API_TOKEN, ENV_VAR_DEBUG, HAPROXY_CONFIG_DIR, VERSION,
};
use haloyd::debouncer::{AppDebouncer, DebouncedAppEvent};
use haloyd::docker;
use haloyd::haproxy::HAProxyManager;
use haloyd::logging::{DeploymentLogger, LogBroker};
use haloyd::registry::DeploymentManager;
use haloyd::storage::Db;
use haloyd::updater::{TriggerReason, TriggeredByApp, Updater};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval for periodic maintenance tasks.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Quiet period for debouncing container events.
const EVENT_DEBOUNCE_DELAY: Duration = Duration::from_secs(5);

/// Max time for a single update operation.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const TOKIO_WORKER_THREADS: usize = 4;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("haloyd")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise defaults to INFO level.
/// Respects `RUST_LOG_FORMAT` environment variable for output format (json or text).
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

async fn async_main() -> Result<()> {
    initialize_logging();

    let debug_mode = std::env::var(ENV_VAR_DEBUG).map_or(false, |v| v == "true" || v == "1");

    // Allow streaming logs to the API server.
    let broker = LogBroker::new();
    let logger = DeploymentLogger::general(broker.clone());

    info!(
        version = VERSION,
        network = DOCKER_NETWORK,
        debug = debug_mode,
        "haloyd started"
    );
    if debug_mode {
        info!("Debug mode enabled: No changes will be applied to HAProxy. Staging certificates will be used for all domains.");
    }

    let data_dir = config::data_dir().context("failed to get data directory")?;
    let config_dir = config::config_dir().context("failed to get haloyd config directory")?;

    let haloyd_config =
        HaloydConfig::load(&config_dir).context("failed to load configuration file")?;

    let db = Db::connect(&data_dir.join(DB_DIR).join(DB_FILE_NAME))
        .await
        .context("failed to initialize database")?;
    info!("Database initialized successfully");

    let docker_client = docker::new_client().context("failed to create Docker client")?;

    let api_token = std::env::var(ENV_VAR_API_TOKEN)
        .with_context(|| format!("{ENV_VAR_API_TOKEN} environment variable not set"))?;

    // API server runs for the life of the process.
    let api_state = haloyd::api::ApiState::new(
        docker_client.clone(),
        db.clone(),
        broker.clone(),
        api_token,
    );
    tokio::spawn(async move {
        info!("Starting API server on :{API_SERVER_PORT}...");
        if let Err(err) = haloyd::api::serve(api_state, API_SERVER_PORT).await {
            error!("API server failed: {err:#}");
            std::process::exit(1);
        }
    });

    // Channel for signaling cert updates needing a HAProxy reload.
    let (cert_update_tx, mut cert_update_rx) = mpsc::channel::<String>(5);

    let registry = Arc::new(DeploymentManager::new(
        docker_client.clone(),
        haloyd_config.clone(),
    ));
    let cert_manager = CertificatesManager::new(
        CertificatesManagerConfig {
            cert_dir: data_dir.join(CERT_STORAGE_DIR),
            http_provider_port: CERTIFICATES_HTTP_PROVIDER_PORT,
            tls_staging: debug_mode,
        },
        cert_update_tx,
    )
    .context("failed to create certificate manager")?;
    let haproxy_manager = Arc::new(HAProxyManager::new(
        docker_client.clone(),
        haloyd_config.clone(),
        data_dir.join(HAPROXY_CONFIG_DIR),
        debug_mode,
    ));

    let updater = Arc::new(Updater::new(
        docker_client.clone(),
        Arc::clone(&registry),
        Arc::clone(&cert_manager),
        Arc::clone(&haproxy_manager),
    ));

    if let Err(err) = updater
        .update(&logger, TriggerReason::Initial, None)
        .await
    {
        error!("Initial update failed: {err:#}");
    }

    // Signals setup tooling that initialization is complete.
    logger.init_complete("haloyd successfully initialized");

    // Docker event listener.
    let (events_tx, mut events_rx) = mpsc::channel(100);
    let (event_errors_tx, mut event_errors_rx) = mpsc::channel(10);
    tokio::spawn(docker::listen_for_container_events(
        docker_client.clone(),
        events_tx,
        event_errors_tx,
    ));

    let (debounced_tx, mut debounced_rx) = mpsc::channel::<DebouncedAppEvent>(100);
    let app_debouncer = AppDebouncer::new(EVENT_DEBOUNCE_DELAY, debounced_tx);

    let mut maintenance = tokio::time::interval_at(
        tokio::time::Instant::now() + MAINTENANCE_INTERVAL,
        MAINTENANCE_INTERVAL,
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    // Main event loop.
    loop {
        tokio::select! {
            // All docker events are piped to the debouncer.
            Some(event) = events_rx.recv() => {
                app_debouncer.capture_event(event);
            }

            // Debounced docker events trigger per-app updates.
            Some(debounced) = debounced_rx.recv() => {
                let updater = Arc::clone(&updater);
                let broker = broker.clone();
                tokio::spawn(async move {
                    run_app_update(&updater, broker, debounced).await;
                });
            }

            // Renewed certificates require a proxy reload.
            Some(domain_updated) = cert_update_rx.recv() => {
                info!(domain = %domain_updated, "Received cert update signal");
                let updater = Arc::clone(&updater);
                let broker = broker.clone();
                tokio::spawn(async move {
                    let logger = DeploymentLogger::general(broker);
                    // Only the config needs re-applying; the deployment
                    // state that triggered the renewal is assumed valid.
                    let deployments = updater.registry().deployments();
                    let apply = updater.haproxy().apply_config(&logger, &deployments);
                    match tokio::time::timeout(Duration::from_secs(60), apply).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!("Background HAProxy update failed after cert update: {err:#}"),
                        Err(_) => error!("Background HAProxy update timed out after cert update"),
                    }
                });
            }

            _ = maintenance.tick() => {
                info!("Performing periodic maintenance...");
                if let Err(err) = docker::prune_images(&docker_client).await {
                    warn!("Failed to prune images: {err:#}");
                }
                let updater = Arc::clone(&updater);
                let broker = broker.clone();
                tokio::spawn(async move {
                    let logger = DeploymentLogger::general(broker);
                    if let Err(err) = updater
                        .update(&logger, TriggerReason::PeriodicRefresh, None)
                        .await
                    {
                        error!("Background update failed: {err:#}");
                    }
                });
            }

            Some(err) = event_errors_rx.recv() => {
                error!("Error from docker events: {err:#}");
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, stopping haloyd...");
                break;
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping haloyd...");
                break;
            }
        }
    }

    // Graceful shutdown: stop timers, close streams, flush the database.
    app_debouncer.stop();
    cert_manager.stop();
    broker.close();
    db.close().await;
    info!("Graceful shutdown completed successfully");

    Ok(())
}

/// Handle one debounced burst: run the update pipeline for the app and emit
/// the terminal deployment record.
async fn run_app_update(updater: &Updater, broker: LogBroker, debounced: DebouncedAppEvent) {
    let logger = DeploymentLogger::deployment(broker, &debounced.deployment_id);

    let app = TriggeredByApp {
        app_name: debounced.app_name.clone(),
        domains: debounced.domains.clone(),
        deployment_id: debounced.deployment_id.clone(),
        event_action: debounced.action.clone(),
    };

    if let Err(err) = app.validate() {
        logger.error(format!("App data not valid: {err:#}"));
        return;
    }

    let update = updater.update(&logger, TriggerReason::AppUpdated, Some(&app));
    match tokio::time::timeout(UPDATE_TIMEOUT, update).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            logger.deployment_failed(&debounced.app_name, "Deployment failed", &err);
            return;
        }
        Err(_) => {
            logger.deployment_failed(
                &debounced.app_name,
                "Deployment failed",
                &anyhow::anyhow!("update timed out"),
            );
            return;
        }
    }

    // A start event in the burst means a new deployment came up; close the
    // stream with the completion record.
    if debounced.saw_start {
        let canonical_domains: Vec<String> = debounced
            .domains
            .iter()
            .map(|domain| domain.canonical.clone())
            .collect();
        logger.deployment_complete(
            &debounced.app_name,
            &canonical_domains,
            format!("Successfully deployed {}", debounced.app_name),
        );
    }

    debug!(app = %debounced.app_name, "App update finished");
}
