mod config;
mod triggers;

use config::ServiceConfig;
use enroll_common::domain::DomainResult;
use enroll_common::storage::{
    KeyValueNotificationOutbox, KeyValuePendingRegistrationRepository, KeyValueProfileRepository,
    KeyValueStore, SqliteKeyValueStore,
};
use enroll_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use enroll_runner::Runner;
use enrollment_engine::mqtt::RumqttDeviceConnector;
use enrollment_engine::{EnrollmentEngine, EnrollmentEngineConfig, ResultSink};
use std::sync::Arc;
use tracing::{debug, error, info};
use triggers::{ConnectivityWatcher, ForegroundSignalListener, TcpReachabilityProbe};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(provider) => provider,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        sqlite_path = %config.sqlite_path,
        default_device_id = %config.default_device_id,
        "Starting face enrollment service"
    );
    debug!("Configuration: {:?}", config);

    let engine = match initialize_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to initialize enrollment engine: {}", e);
            std::process::exit(1);
        }
    };

    match engine.queue().len().await {
        Ok(pending) => info!(pending, "pending enrollments found at startup"),
        Err(e) => error!("Failed to read enrollment queue: {}", e),
    }

    let trigger = engine.trigger();

    let probe = match TcpReachabilityProbe::for_broker(
        &config.default_broker_url,
        config.connectivity_probe_timeout(),
    ) {
        Ok(probe) => probe,
        Err(e) => {
            error!("Invalid default broker url: {}", e);
            std::process::exit(1);
        }
    };
    let connectivity_watcher = ConnectivityWatcher::new(
        Arc::new(probe),
        config.connectivity_probe_interval(),
        trigger.clone(),
    );

    let foreground_listener = match ForegroundSignalListener::bind(trigger) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to install foreground signal handler: {}", e);
            std::process::exit(1);
        }
    };

    let runner = Runner::new()
        .with_named_process("queue_processor", engine.into_runner_process())
        .with_named_process(
            "connectivity_watcher",
            connectivity_watcher.into_runner_process(),
        )
        .with_named_process(
            "foreground_listener",
            foreground_listener.into_runner_process(),
        )
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            // Flush pending spans
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(config.closer_timeout());

    runner.run().await;
}

fn initialize_engine(config: &ServiceConfig) -> DomainResult<EnrollmentEngine> {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::open(&config.sqlite_path)?);

    let sink = Arc::new(ResultSink::new(
        Arc::new(KeyValueProfileRepository::new(Arc::clone(&store))),
        Arc::new(KeyValuePendingRegistrationRepository::new(Arc::clone(&store))),
        Arc::new(KeyValueNotificationOutbox::new(Arc::clone(&store))),
    ));

    Ok(EnrollmentEngine::new(
        store,
        Arc::new(RumqttDeviceConnector::new()),
        sink,
        EnrollmentEngineConfig {
            engine: config.engine_config(),
            default_device_id: config.default_device_id.clone(),
            default_channel_endpoint: config.default_broker_url.clone(),
        },
    ))
}
