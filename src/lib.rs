//! Parking Core Engine
//!
//! Fuses per-slot occupancy probabilities from video analytics with gate
//! crossing events into one debounced parking state, published on every
//! inbound message.
//!
//! # Module Structure
//!
//! - `windowing`: Probability thresholds and sliding-window debouncing
//! - `state`: Slot store, reservation overlay, raw batch diffing
//! - `events`: Time-bounded ledger of gate and slot transitions
//! - `output`: Counters and the outbound message
//! - `engine`: Topic routing and the reconciliation state machine
//! - `reservations`: Periodic reload of the reservation mapping
//! - `transport`: MQTT ingestion workers and publisher
//! - `config`: Engine configuration file and environment overrides

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod output;
pub mod reservations;
pub mod state;
pub mod transport;
pub mod windowing;

pub use config::EngineConfig;
pub use engine::{InboundMessage, Reconciler, ReconcilerSettings, Source, SourceRouter};
pub use error::{is_recoverable, EngineError};
pub use events::{Event, EventKind, EventLedger, GateCrossing};
pub use output::{build_output, build_output_at, MemorySink, OutputSink, ParkingCounters};
pub use reservations::{FileReservations, ReservationSchedule, ReservationSource};
pub use state::{
    ParkingStateStore, ReservationKind, Reservations, Slot, SlotBatch, SlotId, SlotReading,
    SlotStatus,
};
pub use windowing::{Classification, Debouncer, WindowingConfig, WindowingStrategy};
