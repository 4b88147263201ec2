//! core_engine - Fuse slot analytics and gate events into the published parking state.
//!
//! Starts one ingestion worker for the video plugin topics and one for the gate
//! topic, then runs the reconciliation loop on the main thread:
//! 1. Wait up to `sleep_duration` for an inbound message and apply it
//! 2. Reload reservations when the refresh interval has elapsed
//! 3. Check that every worker is still alive (a dead worker is fatal)
//!
//! Ctrl-C stops the workers and exits cleanly.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use parking_core::transport::{
    parse_mqtt_endpoint, IngestWorker, MqttEndpoint, MqttPublisher, MqttSettings, TlsMaterials,
};
use parking_core::{
    EngineConfig, EngineError, FileReservations, InboundMessage, Reconciler, ReconcilerSettings,
    ReservationSchedule, SourceRouter,
};

const ENGINE_NAME: &str = "core_engine";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parking occupancy reconciliation engine"
)]
struct Args {
    /// Engine configuration file (JSON, or TOML with a .toml extension).
    #[arg(env = "CORE_ENGINE_CONFIG")]
    config: PathBuf,

    /// Reservations file: JSON object mapping slot ids to reservation codes.
    #[arg(env = "CORE_ENGINE_RESERVATIONS")]
    reservations: PathBuf,

    /// Broker address overriding `mq_host`/`mq_port` from the config file.
    #[arg(long, env = "MQTT_BROKER_ADDR")]
    mqtt_broker_addr: Option<String>,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (implied by mqtts:// addresses).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// Prefix for the MQTT client identifiers of the workers and the publisher.
    #[arg(long, env = "MQTT_CLIENT_PREFIX", default_value = ENGINE_NAME)]
    mqtt_client_prefix: String,
}

impl Args {
    fn mqtt_settings(&self, cfg: &EngineConfig) -> Result<MqttSettings> {
        let endpoint = match &self.mqtt_broker_addr {
            Some(addr) => parse_mqtt_endpoint(addr, self.mqtt_use_tls)?,
            None => MqttEndpoint::new(cfg.mq_host.clone(), cfg.mq_port, self.mqtt_use_tls),
        };
        let tls = TlsMaterials::load(
            self.mqtt_tls_ca_path.as_ref(),
            self.mqtt_tls_client_cert_path.as_ref(),
            self.mqtt_tls_client_key_path.as_ref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            tls,
            client_prefix: self.mqtt_client_prefix.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EngineConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    log::info!(
        "{} config loaded: windowing {} (window {}), event ttl {:?}",
        ENGINE_NAME,
        cfg.windowing.strategy,
        cfg.windowing.window_size,
        cfg.event_ttl
    );

    let mut schedule = ReservationSchedule::start(
        FileReservations::new(&args.reservations),
        cfg.reservations_refresh,
    )?;
    let mut reconciler = Reconciler::new(
        ReconcilerSettings::from_config(&cfg),
        SourceRouter::from_config(&cfg),
        schedule.current(),
    );

    let settings = args.mqtt_settings(&cfg)?;
    let mut publisher = MqttPublisher::connect(&settings, cfg.output_topic.clone())?;

    let (tx, rx) = mpsc::channel::<InboundMessage>();
    let workers = vec![
        IngestWorker::spawn(
            "video_plugin",
            &settings,
            cfg.video_plugin_topics.clone(),
            tx.clone(),
        )?,
        IngestWorker::spawn(
            "gate_plugin",
            &settings,
            vec![cfg.gate_plugin_topic.clone()],
            tx,
        )?,
    ];

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("{} running, publishing to {}", ENGINE_NAME, cfg.output_topic);
    let outcome = (|| -> Result<()> {
        while running.load(Ordering::SeqCst) {
            match rx.recv_timeout(cfg.sleep_duration) {
                Ok(message) => reconciler.dispatch(&message, &mut publisher)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::WorkerLiveness(
                        "all ingestion workers have exited".to_string(),
                    )
                    .into());
                }
            }

            if let Some(reservations) = schedule.poll(Instant::now()) {
                reconciler.replace_reservations(reservations);
            }

            if let Some(dead) = workers.iter().find(|worker| !worker.is_alive()) {
                return Err(EngineError::WorkerLiveness(format!(
                    "worker {} is not running",
                    dead.name()
                ))
                .into());
            }
        }
        log::info!("shutdown signal received, stopping workers...");
        Ok(())
    })();

    if let Err(e) = &outcome {
        log::error!("{} stopping: {:#}", ENGINE_NAME, e);
    }
    for worker in workers {
        if let Err(e) = worker.stop() {
            log::warn!("{:#}", e);
        }
    }
    publisher.disconnect()?;
    outcome
}
