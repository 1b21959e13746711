// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Minimum number of samples before `predict` switches from `last()` to the
/// least-squares extrapolation.
const MIN_PREDICT_SAMPLES: usize = 5;

/// Sliding time window over telemetry samples.
///
/// Samples older than the window width are evicted on every `add`, so all
/// aggregates are computed over a bounded, recent slice of the signal.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl TimeWindow {
    pub fn new(minutes: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            window: Duration::from_secs(minutes * 60),
        }
    }

    /// Append a sample stamped with the current time and evict expired ones.
    pub fn add(&mut self, value: f64) {
        self.add_at(Instant::now(), value);
    }

    fn add_at(&mut self, now: Instant, value: f64) {
        self.samples.push_back((now, value));
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Arithmetic mean, 0 when empty
    pub fn avg(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / n as f64
    }

    /// Weighted moving average with linear weights 1..n (newest weighs most)
    pub fn wavg(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, (_, v))| v * (i + 1) as f64)
            .sum();
        weighted / ((n * (n + 1)) as f64 / 2.0)
    }

    /// Weighted moving average with quadratic weights (i+1)^2
    pub fn qwavg(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, (_, v))| v * ((i + 1) * (i + 1)) as f64)
            .sum();
        weighted / ((n * (n + 1) * (2 * n + 1)) as f64 / 6.0)
    }

    /// Most recent sample, 0 when empty
    pub fn last(&self) -> f64 {
        self.samples.back().map_or(0.0, |(_, v)| *v)
    }

    /// Second most recent sample, 0 when unavailable
    pub fn previous(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        self.samples.get(n - 2).map_or(0.0, |(_, v)| *v)
    }

    /// Drop all history except the most recent sample
    pub fn clear(&mut self) {
        if let Some(newest) = self.samples.pop_back() {
            self.samples.clear();
            self.samples.push_back(newest);
        }
    }

    /// Replace history with one sample per second reaching `duration_secs`
    /// into the past, all equal to `value`. Used to hard-reset the smoothed
    /// view after a detected rapid demand change.
    pub fn populate(&mut self, duration_secs: u64, value: f64) {
        let now = Instant::now();
        self.samples.clear();
        for age in (1..=duration_secs).rev() {
            self.samples
                .push_back((now - Duration::from_secs(age), value));
        }
    }

    /// One-step-ahead value from a least-squares line over sample index.
    ///
    /// Falls back to `last()` while fewer than five samples are buffered.
    pub fn predict(&self) -> f64 {
        let n = self.samples.len();
        if n < MIN_PREDICT_SAMPLES {
            return self.last();
        }
        let nf = n as f64;
        let x_mean = (nf - 1.0) / 2.0;
        let y_mean = self.avg();
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (i, (_, v)) in self.samples.iter().enumerate() {
            let dx = i as f64 - x_mean;
            sxy += dx * (v - y_mean);
            sxx += dx * dx;
        }
        if sxx == 0.0 {
            return self.last();
        }
        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;
        slope * nf + intercept
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for (i, (_, v)) in self.samples.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v:>3.1}")?;
        }
        write!(f, " ]")
    }
}
