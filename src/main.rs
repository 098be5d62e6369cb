//! snapdog - Multi-room audio control plane for Snapcast.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapdog::adapters::{knx::KnxAdapter, mqtt::MqttAdapter, snapcast::SnapcastAdapter};
use snapdog::bus::commands::{CommandKind, CommandSource};
use snapdog::bus::{events::Notification, Mediator};
use snapdog::handlers::{bridge::SnapcastBridge, ClientHandler, ZoneHandler};
use snapdog::orchestrator::{
    NetworkTarget, Orchestrator, EXIT_ERROR, EXIT_OK, EXIT_STARTUP_FAILURE,
};
use snapdog::publisher::{knx::KnxPublisher, mqtt::MqttPublisher};
use snapdog::{api, config, grouping, publisher, state, stats};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!(
            "snapdog {} ({})",
            env!("SNAPDOG_VERSION"),
            env!("SNAPDOG_GIT_SHA")
        );
        return ExitCode::from(EXIT_OK as u8);
    }

    // Initialize logging (RUST_LOG > LOG_LEVEL > default)
    let log_filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "snapdog=info,tower_http=warn".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting snapdog v{} ({})",
        env!("SNAPDOG_VERSION"),
        env!("SNAPDOG_GIT_SHA")
    );

    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "unhandled error");
            ExitCode::from(EXIT_ERROR as u8)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let started_at = Instant::now();

    // Load and log configuration (credentials masked)
    let app_config = match config::load_config() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid");
            return Ok(ExitCode::from(EXIT_STARTUP_FAILURE as u8));
        }
    };
    config::log_config(&app_config);

    let shutdown = CancellationToken::new();
    let stats = Arc::new(stats::Stats::new());

    // Authoritative state tables, seeded from configuration
    let store: state::SharedStore = Arc::new(state::StateStore::from_config(&app_config));
    if let Err(e) = store.seed_zone_membership().await {
        tracing::error!(error = %e, "seeding zone membership failed");
        return Ok(ExitCode::from(EXIT_STARTUP_FAILURE as u8));
    }

    // Mediator: notification sink first, handlers after the adapters exist
    let builder = Mediator::builder();
    let notify = builder.notification_tx();

    // Snapcast adapter + its event stream
    let (snapcast, snapcast_events) = SnapcastAdapter::new(
        app_config.services.snapcast.clone(),
        stats.clone(),
        shutdown.clone(),
    );
    tokio::spawn(snapcast.clone().run());

    // Subsonic (optional)
    let subsonic = match &app_config.services.subsonic {
        Some(cfg) => match snapdog::adapters::subsonic::SubsonicAdapter::new(cfg.clone()) {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                tracing::error!(error = %e, "subsonic client construction failed");
                return Ok(ExitCode::from(EXIT_STARTUP_FAILURE as u8));
            }
        },
        None => None,
    };

    // Grouping service (reconciliation)
    let grouping = grouping::GroupingService::new(
        store.clone(),
        snapcast.clone(),
        notify.clone(),
        stats.clone(),
        app_config.reconcile.clone(),
    );

    // Handlers + registry
    let zone_handler = ZoneHandler::new(
        store.clone(),
        snapcast.clone(),
        subsonic.clone(),
        notify.clone(),
    );
    let client_handler = ClientHandler::new(
        store.clone(),
        snapcast.clone(),
        grouping.clone(),
        notify.clone(),
        stats.clone(),
    );
    let mediator = Arc::new(
        builder
            .register_all(
                &[
                    CommandKind::ZonePlayback,
                    CommandKind::ZoneTrackNav,
                    CommandKind::ZonePlayTrack,
                    CommandKind::ZoneLoadPlaylist,
                    CommandKind::ZoneVolume,
                    CommandKind::ZoneMute,
                    CommandKind::ZoneModeFlags,
                    CommandKind::ZoneSyncPosition,
                ],
                zone_handler,
            )
            .register_all(
                &[
                    CommandKind::ClientVolume,
                    CommandKind::ClientMute,
                    CommandKind::ClientLatency,
                    CommandKind::ClientZone,
                    CommandKind::ClientPresence,
                ],
                client_handler,
            )
            .build(),
    );
    if let Err(e) = mediator.verify_registry() {
        tracing::error!(error = %e, "command registry incomplete");
        return Ok(ExitCode::from(EXIT_ERROR as u8));
    }

    // Snapcast events feed back in as internal commands
    let bridge = SnapcastBridge::new(
        store.clone(),
        mediator.clone(),
        grouping.clone(),
        stats.clone(),
    );
    tokio::spawn(bridge.run(snapcast_events, shutdown.clone()));

    // MQTT adapter + publisher (optional)
    let mqtt = match &app_config.services.mqtt {
        Some(cfg) => {
            let adapter = MqttAdapter::new(
                cfg.clone(),
                &app_config,
                mediator.clone(),
                stats.clone(),
                shutdown.clone(),
            );
            if let Err(e) = adapter.start().await {
                tracing::warn!(error = %e, "mqtt start failed, continuing without");
            }
            let publisher = MqttPublisher::new(adapter.clone(), &app_config, stats.clone());
            tokio::spawn(publisher.run(notify.clone(), shutdown.clone()));
            Some(adapter)
        }
        None => None,
    };

    // KNX adapter + publisher (optional)
    let knx = match &app_config.services.knx {
        Some(cfg) => {
            let adapter = KnxAdapter::new(
                cfg.clone(),
                &app_config,
                mediator.clone(),
                stats.clone(),
                shutdown.clone(),
            );
            tokio::spawn(adapter.clone().run());
            let publisher = KnxPublisher::new(adapter.clone(), &app_config, stats.clone());
            tokio::spawn(publisher.run(notify.clone(), shutdown.clone()));
            Some(adapter)
        }
        None => None,
    };

    // Connectivity watches (constant `false` when an integration is absent)
    let mqtt_connected = mqtt
        .as_ref()
        .map(|m| m.connected_watch())
        .unwrap_or_else(|| watch::channel(false).1);
    let knx_connected = knx
        .as_ref()
        .map(|k| k.connected_watch())
        .unwrap_or_else(|| watch::channel(false).1);

    // =========================================================================
    // Startup validation
    // =========================================================================

    let orchestrator = Orchestrator::new();

    let mut ports: Vec<(&'static str, u16)> = vec![("api", app_config.api.port)];
    if app_config.services.snapcast.expect_free_port {
        ports.push(("snapcast", app_config.services.snapcast.port));
    }
    if let Some(mqtt_cfg) = &app_config.services.mqtt {
        if mqtt_cfg.expect_free_port {
            ports.push(("mqtt", mqtt_cfg.port));
        }
    }
    if orchestrator.validate_ports(&ports).await.is_err() {
        orchestrator.mark_shutdown();
        shutdown.cancel();
        return Ok(ExitCode::from(EXIT_STARTUP_FAILURE as u8));
    }

    let mut targets = vec![NetworkTarget {
        service: "snapcast",
        host: app_config.services.snapcast.host.clone(),
        port: app_config.services.snapcast.port,
    }];
    if let Some(cfg) = &app_config.services.mqtt {
        targets.push(NetworkTarget {
            service: "mqtt",
            host: cfg.host.clone(),
            port: cfg.port,
        });
    }
    if let Some(cfg) = &app_config.services.subsonic {
        if let Ok(parsed) = url::Url::parse(&cfg.url) {
            if let Some(host) = parsed.host_str() {
                targets.push(NetworkTarget {
                    service: "subsonic",
                    host: host.to_string(),
                    port: parsed.port_or_known_default().unwrap_or(80),
                });
            }
        }
    }
    orchestrator.validate_network(&targets).await;

    if orchestrator
        .validate_directories(&app_config.directories)
        .await
        .is_err()
    {
        orchestrator.mark_shutdown();
        shutdown.cancel();
        return Ok(ExitCode::from(EXIT_STARTUP_FAILURE as u8));
    }

    orchestrator.wait_for_snapcast(&snapcast).await;

    // Initial reconciliation, then the full-state publish
    orchestrator.mark_reconciling();
    if snapcast.is_connected() {
        let outcome = grouping.reconcile().await;
        tracing::info!(
            health = ?outcome.health,
            mutations = outcome.mutations,
            "initial reconciliation"
        );
    }
    tokio::spawn(grouping.clone().run_interval(shutdown.clone()));

    // API state assembled before the publish so the status snapshot is real
    let app_state = api::AppState {
        store: store.clone(),
        mediator: mediator.clone(),
        snapcast: snapcast.clone(),
        subsonic: subsonic.clone(),
        grouping: grouping.clone(),
        stats: stats.clone(),
        startup: orchestrator.state_watch(),
        started_at,
        mqtt_connected: mqtt_connected.clone(),
        knx_connected: knx_connected.clone(),
        icons: api::AppState::icons_from_config(&app_config),
    };

    orchestrator.mark_publishing();
    publisher::publish_full_state(&notify, &store, app_state.system_status()).await;

    // Connectivity transitions publish SystemStatusChanged
    {
        let notify = notify.clone();
        let app_state = app_state.clone();
        let shutdown = shutdown.clone();
        let mut snapcast_watch = snapcast.connected_watch();
        let mut mqtt_watch = mqtt_connected.clone();
        let mut knx_watch = knx_connected.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = snapcast_watch.changed() => if r.is_err() { break },
                    r = mqtt_watch.changed() => if r.is_err() { break },
                    r = knx_watch.changed() => if r.is_err() { break },
                }
                notify.publish(
                    CommandSource::Internal,
                    Notification::SystemStatusChanged {
                        status: app_state.system_status(),
                    },
                );
            }
        });
    }

    // =========================================================================
    // Serve
    // =========================================================================

    let router = api::build_router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], app_config.api.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    orchestrator.mark_running();

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // =========================================================================
    // Shutdown
    // =========================================================================

    orchestrator.mark_shutdown();
    tracing::info!("Shutting down adapters...");
    shutdown.cancel();
    if let Some(mqtt) = &mqtt {
        mqtt.stop().await;
    }
    // Give background tasks a moment to observe the cancellation
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!("Shutdown complete");

    Ok(ExitCode::from(EXIT_OK as u8))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
#[allow(clippy::expect_used)] // Signal handlers must succeed for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
