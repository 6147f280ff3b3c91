mod persist;
mod sensor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use statesync_core::pedometer::PEDOMETER_EVENT;
use statesync_core::{
    ConfigStorage, EventEndpoint, EventHub, FsPersistence, HttpEndpoint, JsonCodec, MqttSettings,
    NtpSettings, PedometerData, PedometerService, RestEndpoint, StateCodec, StatefulService,
    Validate, WifiSettings,
};
use statesync_server::{EventSocketServer, FileConfigStorage, ServerConfig};
use statesync_web::{create_router, ServerState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SENSOR_PERIOD: Duration = Duration::from_millis(500);
const PEDOMETER_WRITE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,statesync_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("statesync server starting...");

    let config = load_config()?;
    let storage: Arc<dyn ConfigStorage> = Arc::new(
        FileConfigStorage::open(&config.data_dir)
            .with_context(|| format!("opening {}", config.data_dir.display()))?,
    );
    let hub = Arc::new(EventHub::new());
    let wiring = Wiring {
        storage: storage.clone(),
        hub: hub.clone(),
    };

    let wifi = wiring.service::<WifiSettings>("wifiSettings", "wifi", WriteMode::OnChange)?;
    let ntp = wiring.service::<NtpSettings>("ntpSettings", "ntp", WriteMode::OnChange)?;
    let mqtt = wiring.service::<MqttSettings>("mqttSettings", "mqtt", WriteMode::OnChange)?;
    // Steps arrive every few hundred milliseconds; write them out periodically.
    let pedometer =
        wiring.service::<PedometerData>("pedometer", PEDOMETER_EVENT, WriteMode::Periodic)?;

    let pedometer_service = Arc::new(PedometerService::new(pedometer.service.clone(), hub.clone()));
    pedometer_service
        .begin()
        .context("registering pedometer events")?;

    let state = ServerState::new(config.name.clone())
        .with_firmware(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .with_endpoint("wifiSettings", wifi.rest)
        .with_endpoint("ntpSettings", ntp.rest)
        .with_endpoint("mqttSettings", mqtt.rest)
        .with_endpoint("pedometer", pedometer.rest)
        .with_feature("ntp", true)
        .with_feature("mqtt", true)
        .with_feature("pedometer", true)
        .with_feature("upload_firmware", false)
        .with_feature("download_firmware", false)
        .with_feature("analytics", false)
        .with_ntp(ntp.service.clone())
        .with_hub(hub.clone());

    // Start WebSocket event server
    let ws_addr = config.ws_addr;
    let server = EventSocketServer::new(hub.clone());
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = server.run(ws_addr).await {
            tracing::error!("Event server error: {}", e);
        }
    });

    // Start HTTP API server
    let http_addr = config.http_addr;
    let app = create_router(Arc::new(state));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_addr, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    // Start simulated step sensor
    let sensor_handle = tokio::spawn(sensor::run(pedometer_service.clone(), SENSOR_PERIOD));
    let persist_handle = tokio::spawn(persist::persist_every(
        pedometer.persistence.clone(),
        PEDOMETER_WRITE_PERIOD,
    ));

    tracing::info!("statesync server ready");
    tracing::info!("   Events:   ws://{}", ws_addr);
    tracing::info!("   REST API: http://{}/rest/{{service}}", http_addr);
    tracing::info!("   Status:   http://{}/api/v1/system/status", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = ws_handle => {
            tracing::warn!("Event server stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = sensor_handle => {
            tracing::warn!("Step sensor stopped");
        }
        _ = persist_handle => {
            tracing::warn!("Pedometer writer stopped");
        }
    }

    persist::flush(pedometer.persistence.clone()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Start the HTTP API server
async fn start_http_server(addr: SocketAddr, app: axum::Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Defaults overridden by `STATESYNC_NAME`, `STATESYNC_WS_ADDR`,
/// `STATESYNC_HTTP_ADDR` and `STATESYNC_DATA_DIR`.
fn load_config() -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Ok(name) = std::env::var("STATESYNC_NAME") {
        config.name = name;
    }
    if let Ok(addr) = std::env::var("STATESYNC_WS_ADDR") {
        config.ws_addr = parse_addr("STATESYNC_WS_ADDR", &addr)?;
    }
    if let Ok(addr) = std::env::var("STATESYNC_HTTP_ADDR") {
        config.http_addr = parse_addr("STATESYNC_HTTP_ADDR", &addr)?;
    }
    if let Ok(dir) = std::env::var("STATESYNC_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }

    Ok(config)
}

fn parse_addr(var: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{var}={value} is not a socket address"))
}

/// When a service's state reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// On every change.
    OnChange,
    /// Only when the caller writes, see [`persist::persist_every`].
    Periodic,
}

/// A service built by [`Wiring::service`].
struct Wired<T> {
    service: Arc<StatefulService<T>>,
    persistence: Arc<FsPersistence<T>>,
    rest: Arc<dyn RestEndpoint>,
}

/// Shared collaborators for building services.
struct Wiring {
    storage: Arc<dyn ConfigStorage>,
    hub: Arc<EventHub>,
}

impl Wiring {
    /// Build a persisted service published on `event` and return it with
    /// its persistence and REST endpoint.
    fn service<T>(&self, key: &str, event: &str, mode: WriteMode) -> anyhow::Result<Wired<T>>
    where
        T: Default + Serialize + DeserializeOwned + Validate + PartialEq + Send + 'static,
    {
        let service = Arc::new(StatefulService::new(T::default()));
        let codec: Arc<dyn StateCodec<T>> = Arc::new(JsonCodec::<T>::new());

        let persistence = Arc::new(FsPersistence::new(
            service.clone(),
            codec.clone(),
            self.storage.clone(),
            key,
        ));
        if let Err(e) = persistence.read_from_storage() {
            tracing::warn!(key, error = %e, "could not persist initial settings");
        }
        if mode == WriteMode::OnChange {
            persistence.enable_update_handler();
        }

        EventEndpoint::new(service.clone(), codec.clone(), self.hub.clone(), event)
            .begin()
            .with_context(|| format!("registering event {event}"))?;

        tracing::debug!(key, event, ?mode, "service ready");
        let rest: Arc<dyn RestEndpoint> = Arc::new(HttpEndpoint::new(service.clone(), codec));
        Ok(Wired {
            service,
            persistence,
            rest,
        })
    }
}
