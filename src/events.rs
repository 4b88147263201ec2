//! Gate and place transition ledger.
//!
//! Events are kept newest-first in insertion order. Pruning always works from the
//! oldest end: an expired `GateEntered` or `PlaceExited` takes its oldest pending
//! counterpart (`GateExited` or `PlaceEntered`) with it, so a resolved crossing is not
//! counted as movement any longer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::state::{ParkingStateStore, SlotBatch, SlotId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    GateEntered,
    GateExited,
    /// A vehicle moved into the slot (slot went from free to occupied).
    PlaceEntered(SlotId),
    /// A vehicle left the slot.
    PlaceExited(SlotId),
}

impl EventKind {
    /// Entries whose expiry also retires one pair-mate.
    fn opens_pair(&self) -> bool {
        matches!(self, Self::GateEntered | Self::PlaceExited(_))
    }

    fn is_pair_mate(&self) -> bool {
        matches!(self, Self::GateExited | Self::PlaceEntered(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub created_at: Instant,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self::at(kind, Instant::now())
    }

    pub fn at(kind: EventKind, created_at: Instant) -> Self {
        Self { kind, created_at }
    }
}

/// Gate sensor reading: `0` entered, `1` exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateCrossing {
    Entered,
    Exited,
}

impl GateCrossing {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Entered),
            1 => Some(Self::Exited),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventLedger {
    /// Front is newest, back is oldest.
    events: VecDeque<Event>,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_front(event);
    }

    pub fn record_gate(&mut self, crossing: GateCrossing) {
        let kind = match crossing {
            GateCrossing::Entered => EventKind::GateEntered,
            GateCrossing::Exited => EventKind::GateExited,
        };
        log::debug!("ledger: {:?}", kind);
        self.push(Event::new(kind));
    }

    /// Records place transitions for `batch` against the pre-update `store`, then
    /// applies the batch. Reserved slots never produce place events.
    pub fn record_batch(&mut self, store: &mut ParkingStateStore, batch: &SlotBatch) {
        for id in store.diff(batch) {
            let Some(slot) = store.slot(&id) else {
                continue;
            };
            if slot.reservation.is_some() {
                continue;
            }
            let kind = if slot.is_free() {
                EventKind::PlaceEntered(id)
            } else {
                EventKind::PlaceExited(id)
            };
            log::debug!("ledger: {:?}", kind);
            self.push(Event::new(kind));
        }
        store.apply_batch(batch);
    }

    pub fn prune(&mut self, ttl: Duration) -> usize {
        self.prune_at(Instant::now(), ttl)
    }

    /// Removes every tail entry whose age at `now` is at least `ttl`, plus one pair-mate
    /// per expired pair opener. Returns the number of removed entries.
    pub fn prune_at(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut removed = 0;
        while let Some(oldest) = self.events.back() {
            if now.saturating_duration_since(oldest.created_at) < ttl {
                break;
            }
            let Some(expired) = self.events.pop_back() else {
                break;
            };
            removed += 1;
            if expired.kind.opens_pair() {
                if let Some(index) = self.events.iter().rposition(|e| e.kind.is_pair_mate()) {
                    self.events.remove(index);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(&e.kind)).count()
    }
}
