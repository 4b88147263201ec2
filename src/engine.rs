//! Reconciliation state machine.
//!
//! The reconciler is the only mutator of the store and the ledger. It starts
//! uninitialized: gate events are ledgered but nothing is emitted until the first
//! valid slot batch creates the store. From then on every message produces exactly
//! one outbound state.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{is_recoverable, EngineError};
use crate::events::{EventLedger, GateCrossing};
use crate::output::{build_output, OutputSink};
use crate::state::{ParkingStateStore, Reservations, SlotBatch};
use crate::windowing::WindowingConfig;

/// Raw message as delivered by an ingestion worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    SlotBatch,
    Gate,
}

/// Maps topics to sources.
#[derive(Clone, Debug)]
pub struct SourceRouter {
    video_topics: Vec<String>,
    gate_topic: String,
}

impl SourceRouter {
    pub fn new(video_topics: Vec<String>, gate_topic: impl Into<String>) -> Self {
        Self {
            video_topics,
            gate_topic: gate_topic.into(),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.video_plugin_topics.clone(), cfg.gate_plugin_topic.clone())
    }

    pub fn route(&self, topic: &str) -> Result<Source, EngineError> {
        if self.video_topics.iter().any(|t| t == topic) {
            Ok(Source::SlotBatch)
        } else if self.gate_topic == topic {
            Ok(Source::Gate)
        } else {
            Err(EngineError::UnknownSource(topic.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct GateMessage {
    entered: i64,
}

fn parse_gate(topic: &str, payload: &[u8]) -> Result<GateCrossing, EngineError> {
    let message: GateMessage =
        serde_json::from_slice(payload).map_err(|e| EngineError::malformed(topic, e))?;
    GateCrossing::from_code(message.entered).ok_or_else(|| {
        EngineError::malformed(
            topic,
            format!("unsupported gate 'entered' value {}", message.entered),
        )
    })
}

#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    pub windowing: WindowingConfig,
    pub event_ttl: Duration,
    pub static_metadata: Value,
}

impl ReconcilerSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            windowing: cfg.windowing,
            event_ttl: cfg.event_ttl,
            static_metadata: cfg.static_metadata.clone(),
        }
    }
}

pub struct Reconciler {
    settings: ReconcilerSettings,
    router: SourceRouter,
    reservations: Arc<Reservations>,
    store: Option<ParkingStateStore>,
    ledger: EventLedger,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        router: SourceRouter,
        reservations: Arc<Reservations>,
    ) -> Self {
        Self {
            settings,
            router,
            reservations,
            store: None,
            ledger: EventLedger::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&ParkingStateStore> {
        self.store.as_ref()
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// Swaps the reservation mapping; the next batch picks it up.
    pub fn replace_reservations(&mut self, reservations: Arc<Reservations>) {
        if let Some(store) = self.store.as_mut() {
            store.replace_reservations(Arc::clone(&reservations));
        }
        self.reservations = reservations;
    }

    /// Handles one message and publishes the resulting state.
    ///
    /// Recoverable errors are logged and the message dropped. A failed publish is
    /// logged too; the next message carries the full state again.
    pub fn dispatch<S: OutputSink + ?Sized>(
        &mut self,
        message: &InboundMessage,
        sink: &mut S,
    ) -> Result<()> {
        match self.handle(message) {
            Ok(Some(state)) => {
                if let Err(e) = sink.publish(&state) {
                    log::warn!("failed to publish parking state: {:#}", e);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if is_recoverable(&e) => {
                log::warn!("dropping message from {}: {:#}", message.topic, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn handle(&mut self, message: &InboundMessage) -> Result<Option<Value>> {
        self.handle_at(message, Instant::now())
    }

    /// Processes one message and returns the outbound state, if any.
    ///
    /// Unknown topics and malformed payloads are returned as `EngineError`s; the
    /// caller decides whether to continue.
    pub fn handle_at(&mut self, message: &InboundMessage, now: Instant) -> Result<Option<Value>> {
        let source = self.router.route(&message.topic)?;
        log::debug!("applying message from {} ({:?})", message.topic, source);

        match source {
            Source::Gate => {
                let crossing = parse_gate(&message.topic, &message.payload)?;
                self.ledger.record_gate(crossing);
            }
            Source::SlotBatch => {
                let batch = SlotBatch::parse(&message.payload)
                    .map_err(|e| EngineError::malformed(&message.topic, e))?;
                match self.store.as_mut() {
                    Some(store) => self.ledger.record_batch(store, &batch),
                    None => {
                        log::info!(
                            "initialising parking state with {} slots",
                            batch.readings.len()
                        );
                        self.store = Some(ParkingStateStore::new(
                            &batch,
                            Arc::clone(&self.reservations),
                            self.settings.windowing,
                        ));
                    }
                }
            }
        }

        let pruned = self.ledger.prune_at(now, self.settings.event_ttl);
        if pruned > 0 {
            log::debug!("pruned {} expired ledger entries", pruned);
        }

        Ok(self
            .store
            .as_ref()
            .map(|store| build_output(&self.ledger, store, &self.settings.static_metadata)))
    }
}
