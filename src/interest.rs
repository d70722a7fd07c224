use crate::error::{RelayError, Result};
use crate::muscles::Quality;
use serde::{Deserialize, Serialize};

/// Distance-driven send policy. All distances are squared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestConfig {
    pub base_interval_ms: f32,
    pub base_multiplier: f32,
    pub increase_rate: f32,
    pub min_interval_ms: u8,
    pub max_interval_ms: u8,
    pub high_threshold: f32,
    pub medium_threshold: f32,
    pub low_threshold: f32,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 10.0,
            base_multiplier: 1.0,
            increase_rate: 0.01,
            min_interval_ms: 1,
            max_interval_ms: u8::MAX,
            high_threshold: 25.0,
            medium_threshold: 100.0,
            low_threshold: 400.0,
        }
    }
}

impl InterestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_interval(mut self, ms: f32) -> Self {
        self.base_interval_ms = ms;
        self
    }

    pub fn with_base_multiplier(mut self, multiplier: f32) -> Self {
        self.base_multiplier = multiplier;
        self
    }

    pub fn with_increase_rate(mut self, rate: f32) -> Self {
        self.increase_rate = rate;
        self
    }

    pub fn with_interval_bounds(mut self, min_ms: u8, max_ms: u8) -> Self {
        self.min_interval_ms = min_ms;
        self.max_interval_ms = max_ms;
        self
    }

    pub fn with_thresholds(mut self, high: f32, medium: f32, low: f32) -> Self {
        self.high_threshold = high;
        self.medium_threshold = medium;
        self.low_threshold = low;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.high_threshold <= self.medium_threshold && self.medium_threshold <= self.low_threshold) {
            return Err(RelayError::InvalidConfig(format!(
                "quality thresholds must be non-decreasing: {} / {} / {}",
                self.high_threshold, self.medium_threshold, self.low_threshold
            )));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(RelayError::InvalidConfig(format!(
                "min interval {} exceeds max interval {}",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if !(self.base_interval_ms >= 0.0 && self.base_multiplier >= 0.0 && self.increase_rate >= 0.0) {
            return Err(RelayError::InvalidConfig(
                "interval parameters must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// `base × (multiplier + d² × rate)`, clamped into the wire byte.
    pub fn send_interval_ms(&self, distance_sq: f32) -> u8 {
        let raw = self.base_interval_ms * (self.base_multiplier + distance_sq * self.increase_rate);
        let (min, max) = (self.min_interval_ms as f32, self.max_interval_ms as f32);
        if !raw.is_finite() {
            return self.max_interval_ms;
        }
        raw.round().max(min).min(max) as u8
    }

    pub fn quality_for(&self, distance_sq: f32) -> Quality {
        if distance_sq <= self.high_threshold {
            Quality::High
        } else if distance_sq <= self.medium_threshold {
            Quality::Medium
        } else if distance_sq <= self.low_threshold {
            Quality::Low
        } else {
            Quality::VeryLow
        }
    }
}

/// Outbound queue gate: a receiver at or above the limit gets nothing this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    pub limit: usize,
}

impl Backpressure {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn is_congested(&self, pending: usize) -> bool {
        pending >= self.limit
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new(2048)
    }
}
