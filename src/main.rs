use color_eyre::{eyre::eyre, Result};
use luxbridge::bridge::Bridge;
use luxbridge::mqtt::{BrokerTransport, ConnectionManager, RumqttTransport, SimulatedBroker};
use luxbridge::persistence::{default_config_path, load_or_create, AppConfig, TransportKind};
use luxbridge::sensor::SimulatedLightSensor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = load_or_create(&config_path).await?;
    info!(
        "Loaded settings from {} (transport: {})",
        config_path.display(),
        config.transport
    );

    let bridge = build_bridge(&config);

    // A bad configuration is reported but keeps the process up for status output
    if let Err(e) = bridge.start(&config.broker).await {
        error!("Bridge could not be switched on: {}", e);
    }

    let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
                info!("Ctrl-C received, shutting down");
                break;
            }
            _ = status_timer.tick() => info!("{}", bridge.status_line()),
        }
    }

    bridge.stop().await;
    info!("{}", bridge.status_line());
    Ok(())
}

fn build_bridge(config: &AppConfig) -> Bridge {
    let transport: Arc<dyn BrokerTransport> = match config.transport {
        TransportKind::Mqtt => Arc::new(RumqttTransport),
        TransportKind::Simulated => Arc::new(SimulatedBroker::new()),
    };
    info!("Using {} transport", transport.name());

    let connection = ConnectionManager::new(transport, config.connection.clone());
    let sensor = Arc::new(SimulatedLightSensor::new(config.sensor.clone()));

    Bridge::new(connection, sensor, config.bridge.clone())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
