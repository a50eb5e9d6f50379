use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Smoothed transfer speed from periodic `(time, cumulative bytes)` samples.
///
/// Each accepted sample contributes one instantaneous rate (bytes since the
/// previous sample divided by the elapsed time). The reported speed is the
/// arithmetic mean of the last `window` rates. Samples arriving sooner than
/// `min_interval` after the previous one are not recorded.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: usize,
    min_interval: Duration,
    rates: VecDeque<f64>,
    last: Option<(Instant, u64)>,
}

impl RateEstimator {
    pub fn new(window: usize, min_interval: Duration) -> Self {
        Self {
            window: window.max(1),
            min_interval,
            rates: VecDeque::with_capacity(window.max(1)),
            last: None,
        }
    }

    /// Records a sample if the interval gate allows it and returns the current speed.
    pub fn sample(&mut self, now: Instant, cumulative_bytes: u64) -> f64 {
        let Some((last_time, last_bytes)) = self.last else {
            self.last = Some((now, cumulative_bytes));
            return self.speed();
        };
        let elapsed = now.saturating_duration_since(last_time);
        if elapsed < self.min_interval || elapsed.is_zero() {
            return self.speed();
        }
        let delta = cumulative_bytes.saturating_sub(last_bytes);
        self.rates.push_back(delta as f64 / elapsed.as_secs_f64());
        while self.rates.len() > self.window {
            self.rates.pop_front();
        }
        self.last = Some((now, cumulative_bytes));
        self.speed()
    }

    pub fn speed(&self) -> f64 {
        if self.rates.is_empty() {
            return 0.0;
        }
        self.rates.iter().sum::<f64>() / self.rates.len() as f64
    }

    /// Seconds left at the current speed; 0 when the speed is not positive.
    pub fn eta(&self, remaining_bytes: u64) -> f64 {
        eta_seconds(remaining_bytes, self.speed())
    }
}

fn eta_seconds(remaining_bytes: u64, speed: f64) -> f64 {
    if speed.is_nan() || speed <= 0.0 {
        return 0.0;
    }
    remaining_bytes as f64 / speed
}
