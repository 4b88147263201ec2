//! Per-slot windowing debouncer.
//!
//! The upstream classifier emits one occupancy probability per slot per frame.
//! Single-frame misclassifications are common, so each slot keeps a short history
//! and reports a stabilised ternary classification instead of the raw value.
//!
//! - `most_freq`: mode of the classified medians over the window.
//! - `most_freq_of_max`: mode of the per-step maximum class, biased toward the most
//!   confident recent class.
//! - `none`: direct threshold decision, no history.

use anyhow::Result;
use serde::Deserialize;
use std::collections::VecDeque;
use std::str::FromStr;

use crate::error::EngineError;

// -------------------- Classification --------------------

/// Stabilised decision for a slot. The numeric codes are part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Classification {
    Undefined = 0,
    Free = 1,
    Occupied = 2,
}

impl Classification {
    const ALL: [Classification; 3] = [
        Classification::Undefined,
        Classification::Free,
        Classification::Occupied,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Collapsed "probability occupied" reported for the slot.
    pub fn confidence(self) -> f64 {
        match self {
            Self::Occupied => 1.0,
            Self::Free => 0.0,
            Self::Undefined => 0.5,
        }
    }

    fn from_thresholds(value: f64, defined_min: f64, defined_max: f64) -> Self {
        if value < defined_min {
            Self::Free
        } else if value > defined_max {
            Self::Occupied
        } else {
            Self::Undefined
        }
    }
}

// -------------------- Configuration --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WindowingStrategy {
    #[default]
    MostFreq,
    MostFreqOfMax,
    None,
}

impl FromStr for WindowingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "most_freq" => Ok(Self::MostFreq),
            "most_freq_of_max" => Ok(Self::MostFreqOfMax),
            "none" => Ok(Self::None),
            other => Err(EngineError::config(format!(
                "wrong windowing strategy '{}' in 'windowing.strategy': expected one of \
                 'most_freq', 'most_freq_of_max', 'none'",
                other
            ))
            .into()),
        }
    }
}

impl std::fmt::Display for WindowingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MostFreq => write!(f, "most_freq"),
            Self::MostFreqOfMax => write!(f, "most_freq_of_max"),
            Self::None => write!(f, "none"),
        }
    }
}

/// `windowing` block of the engine configuration file.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct WindowingConfigFile {
    pub strategy: Option<String>,
    pub window_size: Option<usize>,
    pub defined_min: Option<f64>,
    pub defined_max: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowingConfig {
    pub strategy: WindowingStrategy,
    pub window_size: usize,
    /// Medians below this classify as free.
    pub defined_min: f64,
    /// Medians above this classify as occupied.
    pub defined_max: f64,
}

impl WindowingConfig {
    pub(crate) fn from_file(file: WindowingConfigFile) -> Result<Self> {
        let strategy = file
            .strategy
            .ok_or_else(|| EngineError::config("missing 'windowing.strategy'"))?
            .parse()?;
        let cfg = Self {
            strategy,
            window_size: file
                .window_size
                .ok_or_else(|| EngineError::config("missing 'windowing.window_size'"))?,
            defined_min: file
                .defined_min
                .ok_or_else(|| EngineError::config("missing 'windowing.defined_min'"))?,
            defined_max: file
                .defined_max
                .ok_or_else(|| EngineError::config("missing 'windowing.defined_max'"))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(EngineError::config("'windowing.window_size' must be positive").into());
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.defined_min) || !in_unit(self.defined_max) {
            return Err(EngineError::config(
                "'windowing.defined_min' and 'windowing.defined_max' must be within 0..1",
            )
            .into());
        }
        if self.defined_min > self.defined_max {
            return Err(EngineError::config(
                "'windowing.defined_min' must not exceed 'windowing.defined_max'",
            )
            .into());
        }
        Ok(())
    }
}

// -------------------- Debouncer --------------------

/// Sliding window that evicts its oldest entry once `capacity` is reached.
#[derive(Clone, Debug)]
struct Window<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> Window<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.items.iter().copied()
    }
}

/// One debouncer per slot. Owned by the slot record, never shared.
#[derive(Clone, Debug)]
pub struct Debouncer {
    config: WindowingConfig,
    samples: Window<f64>,
    medians: Window<f64>,
    /// Only fed by `most_freq_of_max`.
    class_maxima: Window<Classification>,
}

impl Debouncer {
    pub fn new(config: WindowingConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            config,
            samples: Window::new(capacity),
            medians: Window::new(capacity),
            class_maxima: Window::new(capacity),
        }
    }

    pub fn strategy(&self) -> WindowingStrategy {
        self.config.strategy
    }

    /// Number of raw samples currently buffered. Always zero for `none`.
    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    pub fn observe(&mut self, probability: f64) -> Classification {
        let WindowingConfig {
            defined_min,
            defined_max,
            ..
        } = self.config;

        if self.config.strategy == WindowingStrategy::None {
            return Classification::from_thresholds(probability, defined_min, defined_max);
        }

        self.samples.push(probability);
        self.medians.push(median(self.samples.iter()));
        let classes = self
            .medians
            .iter()
            .map(|m| Classification::from_thresholds(m, defined_min, defined_max));

        match self.config.strategy {
            WindowingStrategy::MostFreq => most_frequent(classes),
            WindowingStrategy::MostFreqOfMax => {
                let max = classes.max().unwrap_or(Classification::Undefined);
                self.class_maxima.push(max);
                most_frequent(self.class_maxima.iter())
            }
            WindowingStrategy::None => unreachable!("handled above"),
        }
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return 0.5;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Mode of the classes; ties resolve to the lowest code.
fn most_frequent(classes: impl Iterator<Item = Classification>) -> Classification {
    let mut counts = [0usize; 3];
    for class in classes {
        counts[class.code() as usize] += 1;
    }
    let mut best = Classification::Undefined;
    for class in Classification::ALL {
        if counts[class.code() as usize] > counts[best.code() as usize] {
            best = class;
        }
    }
    best
}
