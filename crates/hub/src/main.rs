mod actuation;
mod backup;
mod cache;
mod config;
mod db;
mod ingest;
mod maintenance;
mod mqtt;
mod registry;
mod state;
mod timeseries;
mod web;
mod weather;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuation::MqttActuator;
use backup::BackupLog;
use cache::LatestStateCache;
use config::Settings;
use db::Db;
use ingest::{Dispatcher, Pipeline, THINGY_QUEUE};
use maintenance::MaintenanceTracker;
use mqtt::SHADOW_UPDATE_FILTER;
use registry::DeviceRegistry;
use state::{SharedState, SystemState};
use timeseries::{InfluxWriter, TimeSeriesSink};
use weather::{LightQualityState, OpenWeatherClient, WeatherPoller};

const CLIENT_ID: &str = "thingy-hub";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let settings = Settings::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Config file (seed plants) ───────────────────────────────────
    let cfg = config::load(&settings.config_path)?;
    config::apply(&cfg, &db).await?;

    let plants = db.load_plants().await?;
    if plants.is_empty() {
        warn!("no plants configured — weather polling has nothing to do");
    }

    // Anything still in maintenance was left there by a previous run.
    let maintenance = Arc::new(MaintenanceTracker::new(db.clone()));
    maintenance
        .reset_all()
        .await
        .context("failed to reset maintenance state")?;

    let registry = Arc::new(DeviceRegistry::load(db.clone()).await?);
    info!(
        plants = plants.len(),
        thingies = registry.snapshot().await.len(),
        "db ready"
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    // ── Backup writer ───────────────────────────────────────────────
    // Stopped only after the thingy workers have drained.
    let backup_cancel = CancellationToken::new();
    let (backup, backup_task) = backup::spawn_writer(
        BackupLog::new(&settings.data_dir),
        settings.backup_queue,
        backup_cancel.clone(),
    );

    // ── Time-series sink ────────────────────────────────────────────
    let sink = match &settings.influx {
        Some(influx) => {
            info!(url = %influx.url, bucket = %influx.bucket, "time-series sink enabled");
            let writer = InfluxWriter::new(&influx.url, &influx.org, &influx.bucket, &influx.token)
                .context("failed to build influxdb client")?;
            TimeSeriesSink::new(Arc::new(writer))
        }
        None => {
            warn!("INFLUXDB_URL not set — time-series sink disabled");
            TimeSeriesSink::disabled()
        }
    };

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(CLIENT_ID, &settings.mqtt_host, settings.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Some(user) = &settings.mqtt_username {
        mqttoptions.set_credentials(user, settings.mqtt_password.as_deref().unwrap_or(""));
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    wait_for_connack(&mut eventloop, &client, &shared)
        .await
        .with_context(|| {
            format!(
                "failed to connect to mqtt broker at {}:{}",
                settings.mqtt_host, settings.mqtt_port
            )
        })?;

    // ── Weather poller ──────────────────────────────────────────────
    let cache = Arc::new(LatestStateCache::new());
    let light = Arc::new(LightQualityState::new());
    let poller = WeatherPoller::new(
        db.clone(),
        Arc::new(
            OpenWeatherClient::new(&settings.weather_api_url, &settings.weather_api_key)
                .context("failed to build weather client")?,
        ),
        Arc::new(MqttActuator::new(client.clone())),
        Arc::clone(&light),
        Arc::clone(&shared),
    );
    // LED publishes only leave once the event loop below is polled, so the
    // first cycle runs inside the poller task rather than here.
    let poller_task = tokio::spawn(weather::run(poller, settings.weather_poll, cancel.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        cache: Arc::clone(&cache),
        maintenance: Arc::clone(&maintenance),
        light,
        registry: Arc::clone(&registry),
        db,
    };
    let web_cancel = cancel.clone();
    let web_port = settings.web_port;
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port, web_cancel.clone()).await {
            error!("web server failed: {e:#}");
            web_cancel.cancel();
        }
    });

    // ── Ingestion loop ──────────────────────────────────────────────
    let pipeline = Pipeline::new(registry, cache, maintenance, sink, backup, Arc::clone(&shared));
    let dispatcher = Dispatcher::new(pipeline, THINGY_QUEUE);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                dispatcher.dispatch(&p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt reconnected");
                subscribe(&client);
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    info!("shutting down");
    dispatcher.shutdown().await;
    backup_cancel.cancel();
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }
    for (name, task) in [("weather poller", poller_task), ("web server", web_task)] {
        if let Err(e) = task.await {
            error!("{name} task failed: {e}");
        }
    }
    if let Err(e) = backup_task.await {
        error!("backup writer task failed: {e}");
    }
    info!("hub stopped");

    Ok(())
}

/// Drive the event loop until the broker acknowledges the first connection.
/// Any error before that is fatal.
async fn wait_for_connack(
    eventloop: &mut EventLoop,
    client: &AsyncClient,
    shared: &SharedState,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != rumqttc::ConnectReturnCode::Success {
                    bail!("broker refused connection: {:?}", ack.code);
                }
                info!("mqtt connected");
                subscribe(client);
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Queue the shadow-update subscription without blocking the event loop.
fn subscribe(client: &AsyncClient) {
    match client.try_subscribe(SHADOW_UPDATE_FILTER, QoS::AtLeastOnce) {
        Ok(()) => info!("subscribed to {SHADOW_UPDATE_FILTER}"),
        Err(e) => error!("subscribe to {SHADOW_UPDATE_FILTER} failed: {e}"),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
        () = cancel.cancelled() => {}
    }
    cancel.cancel();
}
