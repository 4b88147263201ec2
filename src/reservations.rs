//! Reservation mapping refresh.
//!
//! The mapping lives outside the engine (a JSON file maintained by the booking
//! side). It is re-read on a fixed interval and swapped in whole.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::state::Reservations;

pub trait ReservationSource {
    fn load(&self) -> Result<Reservations>;
}

/// `{ "<slot id>": <kind code> }` read from disk.
#[derive(Clone, Debug)]
pub struct FileReservations {
    path: PathBuf,
}

impl FileReservations {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReservationSource for FileReservations {
    fn load(&self) -> Result<Reservations> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read reservations {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid reservations file {}", self.path.display()))
    }
}

/// Reloads reservations once `interval` has elapsed since the last attempt.
pub struct ReservationSchedule<S> {
    source: S,
    interval: Duration,
    last_refresh: Instant,
    current: Arc<Reservations>,
}

impl<S: ReservationSource> ReservationSchedule<S> {
    /// Performs the initial load. A failure here is fatal to the caller.
    pub fn start(source: S, interval: Duration) -> Result<Self> {
        Self::start_at(source, interval, Instant::now())
    }

    pub fn start_at(source: S, interval: Duration, now: Instant) -> Result<Self> {
        let current = Arc::new(source.load()?);
        log::info!("loaded {} reservations", current.len());
        Ok(Self {
            source,
            interval,
            last_refresh: now,
            current,
        })
    }

    pub fn current(&self) -> Arc<Reservations> {
        Arc::clone(&self.current)
    }

    /// Returns the new mapping when a refresh happened. A failed reload keeps the
    /// previous mapping and is retried after the next interval.
    pub fn poll(&mut self, now: Instant) -> Option<Arc<Reservations>> {
        if now.saturating_duration_since(self.last_refresh) < self.interval {
            return None;
        }
        self.last_refresh = now;
        match self.source.load() {
            Ok(reservations) => {
                log::debug!("refreshed {} reservations", reservations.len());
                self.current = Arc::new(reservations);
                Some(self.current())
            }
            Err(e) => {
                log::warn!("reservations refresh failed, keeping previous mapping: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReservationKind;
    use std::cell::RefCell;
    use std::io::Write;

    struct Scripted {
        responses: RefCell<Vec<Result<Reservations>>>,
    }

    impl ReservationSource for Scripted {
        fn load(&self) -> Result<Reservations> {
            self.responses.borrow_mut().remove(0)
        }
    }

    fn mapping(id: &str, kind: ReservationKind) -> Reservations {
        let mut map = Reservations::new();
        map.insert(id.to_string(), kind);
        map
    }

    #[test]
    fn refreshes_only_after_interval() {
        let base = Instant::now();
        let source = Scripted {
            responses: RefCell::new(vec![
                Ok(mapping("1", ReservationKind::Static)),
                Ok(mapping("2", ReservationKind::Dynamic)),
            ]),
        };
        let mut schedule =
            ReservationSchedule::start_at(source, Duration::from_secs(60), base).unwrap();
        assert!(schedule.poll(base + Duration::from_secs(59)).is_none());

        let refreshed = schedule.poll(base + Duration::from_secs(60)).expect("refresh");
        assert_eq!(refreshed.get("2"), Some(&ReservationKind::Dynamic));
        assert!(schedule.current().get("1").is_none());
    }

    #[test]
    fn failed_refresh_keeps_previous_mapping() {
        let base = Instant::now();
        let source = Scripted {
            responses: RefCell::new(vec![
                Ok(mapping("1", ReservationKind::Disabled)),
                Err(anyhow::anyhow!("file vanished")),
            ]),
        };
        let mut schedule =
            ReservationSchedule::start_at(source, Duration::from_secs(1), base).unwrap();
        assert!(schedule.poll(base + Duration::from_secs(2)).is_none());
        assert_eq!(schedule.current().get("1"), Some(&ReservationKind::Disabled));
    }

    #[test]
    fn file_source_parses_kind_codes() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(br#"{"A1": 3, "A2": 4}"#).expect("write");
        let loaded = FileReservations::new(file.path()).load().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["A1"], ReservationKind::Static);
    }

    #[test]
    fn file_source_rejects_unknown_codes() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(br#"{"A1": 9}"#).expect("write");
        assert!(FileReservations::new(file.path()).load().is_err());
    }
}
