//! Broker plumbing: endpoint parsing, TLS, ingestion workers and the publisher.

mod endpoint;
mod mqtt;

pub use endpoint::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
pub use mqtt::{IngestWorker, MqttPublisher, MqttSettings};
