//! Aggregated counters and the outbound message.
//!
//! The outbound message is the last slot batch with its slot list, `parking`
//! counters and `metadata` rewritten. Any other passthrough fields are kept as-is.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::events::{EventKind, EventLedger};
use crate::state::{ParkingStateStore, ReservationKind, SlotStatus};

pub const ACTIVATION_TIME_KEY: &str = "core_engine_activation_time";
pub const STATIC_METADATA_KEY: &str = "static_metadata";

/// Destination for outbound parking states.
pub trait OutputSink {
    fn publish(&mut self, state: &Value) -> Result<()>;
}

/// Keeps every published state in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub published: Vec<Value>,
}

impl OutputSink for MemorySink {
    fn publish(&mut self, state: &Value) -> Result<()> {
        self.published.push(state.clone());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ParkingCounters {
    pub free: usize,
    pub occupied: usize,
    pub in_movement: usize,
    /// Not clamped: a negative value points at a reservation or movement miscount.
    pub free_to_display: i64,
}

impl ParkingCounters {
    pub fn compute(ledger: &EventLedger, store: &ParkingStateStore) -> Self {
        let in_movement = in_movement(ledger);
        let free = store.slots().filter(|(_, slot)| slot.is_free()).count();
        let occupied = store.len() - free;
        let reserved_free = reserved_and_free(store);
        Self {
            free,
            occupied,
            in_movement,
            free_to_display: free as i64 - in_movement as i64 - reserved_free as i64,
        }
    }
}

/// Vehicles that passed the gate but have not been seen in a slot yet. Never negative.
pub fn in_movement(ledger: &EventLedger) -> usize {
    let entered = ledger.count(|kind| *kind == EventKind::GateEntered);
    let parked = ledger.count(|kind| matches!(kind, EventKind::PlaceEntered(_)));
    entered.saturating_sub(parked)
}

/// Reserved slots currently free. Reservation ids unknown to the store are ignored.
pub fn reserved_and_free(store: &ParkingStateStore) -> usize {
    store
        .reservations()
        .keys()
        .filter(|id| store.slot(id).map(|slot| slot.is_free()).unwrap_or(false))
        .count()
}

#[derive(Debug, Serialize)]
struct SlotEntry<'a> {
    id: &'a str,
    status: SlotStatusTuple,
}

/// `[status, confidence]`, with the reservation kind appended when set.
#[derive(Debug)]
struct SlotStatusTuple {
    status: SlotStatus,
    confidence: f64,
    reservation: Option<ReservationKind>,
}

impl Serialize for SlotStatusTuple {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let len = if self.reservation.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.status)?;
        seq.serialize_element(&self.confidence)?;
        if let Some(kind) = &self.reservation {
            seq.serialize_element(kind)?;
        }
        seq.end()
    }
}

pub fn slot_list(store: &ParkingStateStore) -> Value {
    let entries: Vec<SlotEntry<'_>> = store
        .slots()
        .map(|(id, slot)| SlotEntry {
            id,
            status: SlotStatusTuple {
                status: slot.status,
                confidence: slot.confidence,
                reservation: slot.reservation,
            },
        })
        .collect();
    serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new()))
}

pub fn build_output(
    ledger: &EventLedger,
    store: &ParkingStateStore,
    static_metadata: &Value,
) -> Value {
    build_output_at(ledger, store, static_metadata, unix_time_secs())
}

/// Assembles the outbound message with an explicit processing timestamp.
pub fn build_output_at(
    ledger: &EventLedger,
    store: &ParkingStateStore,
    static_metadata: &Value,
    processed_at: f64,
) -> Value {
    let counters = ParkingCounters::compute(ledger, store);
    let mut message = match store.last_raw_message() {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    message.insert("parking_places".to_string(), slot_list(store));

    let mut parking = take_object(&mut message, "parking");
    parking.insert("free".to_string(), json!(counters.free));
    parking.insert("occupied".to_string(), json!(counters.occupied));
    parking.insert("in_movement".to_string(), json!(counters.in_movement));
    parking.insert("free_to_display".to_string(), json!(counters.free_to_display));
    message.insert("parking".to_string(), Value::Object(parking));

    let mut metadata = take_object(&mut message, "metadata");
    metadata.insert(ACTIVATION_TIME_KEY.to_string(), json!(processed_at));
    metadata.insert(STATIC_METADATA_KEY.to_string(), static_metadata.clone());
    message.insert("metadata".to_string(), Value::Object(metadata));

    Value::Object(message)
}

/// Removes `map[key]`, keeping it only if it is an object.
fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    }
}

fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::state::{Reservations, SlotBatch};
    use crate::windowing::{WindowingConfig, WindowingStrategy};
    use std::sync::Arc;

    fn store(json: &str, reservations: Reservations) -> ParkingStateStore {
        let windowing = WindowingConfig {
            strategy: WindowingStrategy::None,
            window_size: 1,
            defined_min: 0.3,
            defined_max: 0.7,
        };
        let batch = SlotBatch::parse(json.as_bytes()).expect("batch");
        ParkingStateStore::new(&batch, Arc::new(reservations), windowing)
    }

    #[test]
    fn in_movement_never_negative() {
        let mut ledger = EventLedger::new();
        for id in ["1", "2", "3"] {
            ledger.push(Event::new(EventKind::PlaceEntered(id.to_string())));
        }
        assert_eq!(in_movement(&ledger), 0);
        ledger.push(Event::new(EventKind::GateEntered));
        assert_eq!(in_movement(&ledger), 0);
    }

    #[test]
    fn in_movement_counts_unmatched_gate_entries() {
        let mut ledger = EventLedger::new();
        ledger.push(Event::new(EventKind::GateEntered));
        ledger.push(Event::new(EventKind::GateEntered));
        ledger.push(Event::new(EventKind::PlaceEntered("4".to_string())));
        ledger.push(Event::new(EventKind::GateExited));
        assert_eq!(in_movement(&ledger), 1);
    }

    #[test]
    fn free_to_display_is_not_clamped() {
        let mut reservations = Reservations::new();
        reservations.insert("a".to_string(), ReservationKind::Dynamic);
        reservations.insert("ghost".to_string(), ReservationKind::Static);
        let store = store(
            r#"{"parking_places": {"a": [0, 0.1], "b": [1, 0.9]}}"#,
            reservations,
        );
        let mut ledger = EventLedger::new();
        ledger.push(Event::new(EventKind::GateEntered));
        ledger.push(Event::new(EventKind::GateEntered));

        let counters = ParkingCounters::compute(&ledger, &store);
        assert_eq!(
            counters,
            ParkingCounters {
                free: 1,
                occupied: 1,
                in_movement: 2,
                free_to_display: -2,
            }
        );
    }

    #[test]
    fn output_rewrites_blocks_and_keeps_passthrough_fields() {
        let mut reservations = Reservations::new();
        reservations.insert("b".to_string(), ReservationKind::Disabled);
        let store = store(
            r#"{
                "parking_places": {"a": [1, 0.95], "b": [0, 0.05]},
                "parking": {"name": "north lot", "free": 99},
                "metadata": {"camera": "cam-1"},
                "frame_id": 42
            }"#,
            reservations,
        );
        let out = build_output_at(&EventLedger::new(), &store, &json!({"site": "A"}), 1234.5);

        assert_eq!(out["frame_id"], 42);
        assert_eq!(out["parking"]["name"], "north lot");
        assert_eq!(out["parking"]["free"], 1);
        assert_eq!(out["parking"]["occupied"], 1);
        assert_eq!(out["parking"]["in_movement"], 0);
        assert_eq!(out["parking"]["free_to_display"], 0);
        assert_eq!(out["metadata"]["camera"], "cam-1");
        assert_eq!(out["metadata"][ACTIVATION_TIME_KEY], 1234.5);
        assert_eq!(out["metadata"][STATIC_METADATA_KEY]["site"], "A");
        assert_eq!(
            out["parking_places"],
            json!([
                {"id": "a", "status": [1, 1.0]},
                {"id": "b", "status": [0, 0.0, 4]},
            ])
        );
    }

    #[test]
    fn output_creates_missing_blocks() {
        let store = store(r#"{"parking_places": {"a": [0, 0.5]}}"#, Reservations::new());
        let out = build_output_at(&EventLedger::new(), &store, &Value::Null, 1.0);
        assert_eq!(out["parking"]["free"], 1);
        assert_eq!(out["parking_places"][0]["status"], json!([0, 0.5]));
        assert!(out["metadata"].is_object());
    }
}
