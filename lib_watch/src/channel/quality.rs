//! Connection-quality scoring from rolling link statistics.
//!
//! Quality is a pure function of recent latency and message-arrival cadence,
//! recomputed once per second. The published value moves at most one band per
//! recomputation: a link never jumps from excellent straight to critical
//! without passing through the intermediate bands.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

/// Derived connection quality, ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Critical,
    Poor,
    Good,
    Excellent,
}

// Latency bands in milliseconds, ascending severity.
const LATENCY_EXCELLENT_MS: f64 = 100.0;
const LATENCY_GOOD_MS: f64 = 250.0;
const LATENCY_POOR_MS: f64 = 600.0;

// Arrival-rate bands in messages per second.
const RATE_EXCELLENT: f64 = 5.0;
const RATE_GOOD: f64 = 1.0;

/// Rolling latency samples plus an arrival counter for the current quality
/// window. Owned by the channel client, mutated only from its loops.
pub struct LinkStats {
    latency_ms: VecDeque<f64>,
    latency_window: usize,
    arrivals: u64,
    window_started: Instant,
}

impl LinkStats {
    pub fn new(latency_window: usize) -> Self {
        Self {
            latency_ms: VecDeque::with_capacity(latency_window),
            latency_window: latency_window.max(1),
            arrivals: 0,
            window_started: Instant::now(),
        }
    }

    pub fn record_latency(&mut self, ms: f64) {
        if self.latency_ms.len() == self.latency_window {
            self.latency_ms.pop_front();
        }
        self.latency_ms.push_back(ms);
    }

    pub fn record_arrival(&mut self) {
        self.arrivals += 1;
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_ms.is_empty() {
            return None;
        }
        Some(self.latency_ms.iter().sum::<f64>() / self.latency_ms.len() as f64)
    }

    /// Drains the arrival counter and returns the rate over the elapsed
    /// window, resetting the window for the next tick.
    pub fn take_rate(&mut self) -> f64 {
        let elapsed = self.window_started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.arrivals as f64 / elapsed
        } else {
            0.0
        };
        self.arrivals = 0;
        self.window_started = Instant::now();
        rate
    }

    pub fn reset(&mut self) {
        self.latency_ms.clear();
        self.arrivals = 0;
        self.window_started = Instant::now();
    }
}

/// The band the current metrics point at, before hysteresis.
pub fn target_band(avg_latency_ms: Option<f64>, msgs_per_sec: f64) -> ConnectionQuality {
    let latency_band = match avg_latency_ms {
        // No samples yet: judge on cadence alone.
        None => ConnectionQuality::Excellent,
        Some(ms) if ms < LATENCY_EXCELLENT_MS => ConnectionQuality::Excellent,
        Some(ms) if ms < LATENCY_GOOD_MS => ConnectionQuality::Good,
        Some(ms) if ms < LATENCY_POOR_MS => ConnectionQuality::Poor,
        Some(_) => ConnectionQuality::Critical,
    };
    let rate_band = if msgs_per_sec >= RATE_EXCELLENT {
        ConnectionQuality::Excellent
    } else if msgs_per_sec >= RATE_GOOD {
        ConnectionQuality::Good
    } else if msgs_per_sec > 0.0 {
        ConnectionQuality::Poor
    } else {
        ConnectionQuality::Critical
    };
    latency_band.min(rate_band)
}

/// Moves the published quality one band toward the target.
pub fn step_toward(current: ConnectionQuality, target: ConnectionQuality) -> ConnectionQuality {
    use ConnectionQuality::*;
    if current == target {
        return current;
    }
    let ladder = [Critical, Poor, Good, Excellent];
    let pos = ladder.iter().position(|q| *q == current).unwrap_or(0);
    if target > current {
        ladder[(pos + 1).min(ladder.len() - 1)]
    } else {
        ladder[pos.saturating_sub(1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_band_takes_the_worse_of_latency_and_rate() {
        assert_eq!(target_band(Some(50.0), 10.0), ConnectionQuality::Excellent);
        assert_eq!(target_band(Some(50.0), 2.0), ConnectionQuality::Good);
        assert_eq!(target_band(Some(300.0), 10.0), ConnectionQuality::Poor);
        assert_eq!(target_band(Some(900.0), 10.0), ConnectionQuality::Critical);
        assert_eq!(target_band(Some(50.0), 0.0), ConnectionQuality::Critical);
    }

    #[test]
    fn quality_degrades_one_band_per_step() {
        use ConnectionQuality::*;
        let mut q = Excellent;
        let observed: Vec<_> = (0..3)
            .map(|_| {
                q = step_toward(q, Critical);
                q
            })
            .collect();
        assert_eq!(observed, vec![Good, Poor, Critical]);
        // And it stays put once it reaches the target.
        assert_eq!(step_toward(Critical, Critical), Critical);
    }

    #[test]
    fn quality_recovers_one_band_per_step() {
        use ConnectionQuality::*;
        assert_eq!(step_toward(Critical, Excellent), Poor);
        assert_eq!(step_toward(Poor, Excellent), Good);
        assert_eq!(step_toward(Good, Excellent), Excellent);
    }

    #[test]
    fn latency_average_is_bounded_by_the_window() {
        let mut stats = LinkStats::new(3);
        for ms in [100.0, 200.0, 300.0, 400.0] {
            stats.record_latency(ms);
        }
        // Oldest sample (100) fell out of the window.
        assert_eq!(stats.avg_latency_ms(), Some(300.0));
    }
}
