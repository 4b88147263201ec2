//! Parking state store.
//!
//! Holds the authoritative occupancy of every slot seen so far. Each slot owns its
//! debouncer; the store is rebuilt from every slot batch but never forgets a slot
//! that drops out of a batch.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::windowing::{Debouncer, WindowingConfig};

pub type SlotId = String;

// -------------------- Status codes --------------------

/// Occupancy status. Codes match the upstream model's raw status values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Free = 0,
    Occupied = 1,
}

impl SlotStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Status is derived from the debounced confidence only.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.5 {
            Self::Occupied
        } else {
            Self::Free
        }
    }
}

impl Serialize for SlotStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReservationKind {
    Dynamic = 2,
    Static = 3,
    Disabled = 4,
}

impl ReservationKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReservationKind {
    type Error = anyhow::Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            2 => Ok(Self::Dynamic),
            3 => Ok(Self::Static),
            4 => Ok(Self::Disabled),
            other => Err(anyhow!(
                "unknown reservation kind {}: expected 2 (dynamic), 3 (static) or 4 (disabled)",
                other
            )),
        }
    }
}

impl Serialize for ReservationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ReservationKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        ReservationKind::try_from(code).map_err(serde::de::Error::custom)
    }
}

/// Slot id → reservation kind. Swapped as a whole, never edited in place.
pub type Reservations = HashMap<SlotId, ReservationKind>;

// -------------------- Inbound batch --------------------

/// One `[rawStatus, rawProbability]` pair from the upstream model.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct SlotReading(pub u8, pub f64);

impl SlotReading {
    pub fn raw_status(&self) -> u8 {
        self.0
    }

    pub fn probability(&self) -> f64 {
        self.1
    }
}

#[derive(Debug, Deserialize)]
struct SlotBatchWire {
    parking_places: BTreeMap<SlotId, SlotReading>,
}

/// A parsed slot-probability batch plus the verbatim payload it came from.
#[derive(Clone, Debug)]
pub struct SlotBatch {
    pub readings: BTreeMap<SlotId, SlotReading>,
    pub raw: Value,
}

impl SlotBatch {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(payload)?;
        if !raw.is_object() {
            return Err(anyhow!("slot batch must be a JSON object"));
        }
        let wire = SlotBatchWire::deserialize(&raw)?;
        for (id, reading) in &wire.parking_places {
            if !(0.0..=1.0).contains(&reading.probability()) {
                return Err(anyhow!(
                    "probability {} for slot {} is outside 0..1",
                    reading.probability(),
                    id
                ));
            }
        }
        Ok(Self {
            readings: wire.parking_places,
            raw,
        })
    }
}

// -------------------- Slot --------------------

#[derive(Clone, Debug)]
pub struct Slot {
    pub status: SlotStatus,
    /// Debounced "probability occupied": 0.0, 0.5 or 1.0.
    pub confidence: f64,
    pub reservation: Option<ReservationKind>,
    debouncer: Debouncer,
}

impl Slot {
    fn new(windowing: WindowingConfig) -> Self {
        Self {
            status: SlotStatus::Free,
            confidence: 0.0,
            reservation: None,
            debouncer: Debouncer::new(windowing),
        }
    }

    fn observe(&mut self, probability: f64, reservation: Option<ReservationKind>) {
        if reservation.is_some() {
            self.reservation = reservation;
        }
        self.confidence = self.debouncer.observe(probability).confidence();
        self.status = SlotStatus::from_confidence(self.confidence);
    }

    pub fn is_free(&self) -> bool {
        self.status == SlotStatus::Free
    }
}

// -------------------- Store --------------------

pub struct ParkingStateStore {
    windowing: WindowingConfig,
    slots: BTreeMap<SlotId, Slot>,
    reservations: Arc<Reservations>,
    last_raw_message: Value,
    general_purpose_slots: usize,
    updated_at: Instant,
}

impl ParkingStateStore {
    /// Builds the store from the first slot batch.
    pub fn new(
        batch: &SlotBatch,
        reservations: Arc<Reservations>,
        windowing: WindowingConfig,
    ) -> Self {
        let mut store = Self {
            windowing,
            slots: BTreeMap::new(),
            reservations,
            last_raw_message: Value::Null,
            general_purpose_slots: 0,
            updated_at: Instant::now(),
        };
        store.apply_batch(batch);
        store
    }

    /// Routes every reading through its slot's debouncer and records the payload.
    pub fn apply_batch(&mut self, batch: &SlotBatch) {
        let start = Instant::now();
        let mut general_purpose = 0;
        for (id, reading) in &batch.readings {
            let reservation = self.reservations.get(id).copied();
            if reservation.is_none() {
                general_purpose += 1;
            }
            let windowing = self.windowing;
            self.slots
                .entry(id.clone())
                .or_insert_with(|| Slot::new(windowing))
                .observe(reading.probability(), reservation);
        }
        self.general_purpose_slots = general_purpose;
        self.last_raw_message = batch.raw.clone();
        self.updated_at = Instant::now();
        log::debug!(
            "parking state and windows calculation took {:.6}s",
            start.elapsed().as_secs_f64()
        );
    }

    /// Ids in both `batch` and the store whose raw status differs from the stored one.
    /// Must run before `apply_batch` for the same batch.
    pub fn diff(&self, batch: &SlotBatch) -> BTreeSet<SlotId> {
        batch
            .readings
            .iter()
            .filter(|(id, reading)| {
                self.slots
                    .get(*id)
                    .map(|slot| slot.status.code() != reading.raw_status())
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn replace_reservations(&mut self, reservations: Arc<Reservations>) {
        self.reservations = reservations;
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    pub fn slot(&self, id: &str) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&SlotId, &Slot)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn last_raw_message(&self) -> &Value {
        &self.last_raw_message
    }

    pub fn general_purpose_slots(&self) -> usize {
        self.general_purpose_slots
    }

    pub fn since_update(&self) -> Duration {
        self.updated_at.elapsed()
    }
}
