//! MQTT ingestion workers and the outbound publisher.
//!
//! Each worker owns one broker connection and forwards every publish it receives
//! into the engine channel. Workers resubscribe on every ConnAck so broker restarts
//! are survived; after `MAX_CONSECUTIVE_FAILURES` connection errors in a row the
//! worker thread exits and reports itself dead.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::endpoint::{MqttEndpoint, TlsMaterials};
use crate::engine::InboundMessage;
use crate::output::OutputSink;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 10;
const MAX_CONSECUTIVE_FAILURES: u32 = 12;

/// Everything needed to open a broker connection.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    fn options(&self, role: &str, clean_start: bool) -> Result<MqttOptions> {
        let client_id = format!("{}-{}", self.client_prefix, role);
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(clean_start);
        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        options.set_transport(self.tls.build_transport(&self.endpoint)?);
        Ok(options)
    }
}

fn publish_topic(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(topic) => Some(topic.to_string()),
        Err(e) => {
            log::warn!("skipping publish with invalid topic: {}", e);
            None
        }
    }
}

/// Background subscriber for one group of topics.
pub struct IngestWorker {
    name: String,
    client: Client,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IngestWorker {
    pub fn spawn(
        name: &str,
        settings: &MqttSettings,
        topics: Vec<String>,
        tx: Sender<InboundMessage>,
    ) -> Result<Self> {
        if topics.is_empty() {
            return Err(anyhow!("worker {} has no topics to subscribe to", name));
        }
        let options = settings.options(&format!("{}_client", name), false)?;
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        let worker_name = name.to_string();
        let thread_client = client.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("ingest-{}", name))
            .spawn(move || {
                run_ingest(&worker_name, thread_client, connection, &topics, &tx, &thread_stop)
            })
            .with_context(|| format!("failed to spawn ingest worker {}", name))?;

        log::info!("started ingest worker {} on {}", name, settings.endpoint);
        Ok(Self {
            name: name.to_string(),
            client,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Asks the worker to stop and waits for its thread.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("worker {} disconnect request failed: {}", self.name, e);
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("ingest worker {} panicked", self.name))?;
        }
        log::info!("stopped ingest worker {}", self.name);
        Ok(())
    }
}

fn run_ingest(
    name: &str,
    client: Client,
    mut connection: Connection,
    topics: &[String],
    tx: &Sender<InboundMessage>,
    stop: &AtomicBool,
) {
    let mut failures = 0u32;
    for event in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                failures = 0;
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        log::error!("worker {} failed to subscribe to {}: {}", name, topic, e);
                        return;
                    }
                    log::info!("worker {} subscribed to {}", name, topic);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let Some(topic) = publish_topic(&publish.topic) else {
                    continue;
                };
                if tx.send(InboundMessage::new(topic, publish.payload.to_vec())).is_err() {
                    log::debug!("worker {}: engine channel closed", name);
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!(
                        "worker {} giving up after {} connection errors: {}",
                        name,
                        failures,
                        e
                    );
                    return;
                }
                log::warn!("worker {} connection error: {}. Reconnecting...", name, e);
                std::thread::sleep(RECONNECT_DELAY);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

// -------------------- Output --------------------

/// Publishes to a single topic at QoS 0, not retained.
pub struct MqttPublisher {
    topic: String,
    client: Client,
    stop: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings, topic: impl Into<String>) -> Result<Self> {
        let options = settings.options("publisher", true)?;
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("publisher".to_string())
            .spawn(move || {
                for event in connection.iter() {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = event {
                        log::warn!("publisher connection error: {}. Reconnecting...", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            })
            .context("failed to spawn publisher connection thread")?;

        log::info!(
            "publisher connected to {} (auth: {})",
            settings.endpoint,
            settings.username.is_some()
        );
        Ok(Self {
            topic: topic.into(),
            client,
            stop,
            connection_handle: Some(handle),
        })
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("publisher disconnect request failed: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl OutputSink for MqttPublisher {
    fn publish(&mut self, state: &Value) -> Result<()> {
        let payload = serde_json::to_vec(state)?;
        log::debug!("publishing state to {} ({} bytes)", self.topic, payload.len());
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .with_context(|| format!("failed to publish to {}", self.topic))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(use_tls: bool) -> MqttSettings {
        MqttSettings {
            endpoint: MqttEndpoint::new("mosquitto", 1883, use_tls),
            tls: TlsMaterials::default(),
            client_prefix: "core_engine".to_string(),
            username: Some("engine".to_string()),
            password: None,
        }
    }

    #[test]
    fn client_ids_carry_prefix_and_role() {
        let options = settings(false).options("video_plugin_client", false).unwrap();
        assert_eq!(options.client_id(), "core_engine-video_plugin_client");
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(!options.clean_start());
    }

    #[test]
    fn invalid_topic_bytes_are_skipped() {
        assert_eq!(publish_topic(b"/plugins/gate").as_deref(), Some("/plugins/gate"));
        assert!(publish_topic(&[0xff, 0xfe]).is_none());
    }
}
