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

use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{publish_or_log, SharedPublisher, TriggerSender, TriggerSource};
use crate::telemetry::TimeWindow;
use gridflow_types::{DtuKind, DtuSettings};

/// AC power delta that triggers the decision procedure (W)
const TRIGGER_DIFF: f64 = 30.0;
/// Samples needed before the discovered max capacity is trusted
const MAX_POWER_SAMPLES: usize = 5;
/// Default band within which a new limit is considered identical (W)
const LIMIT_DEADBAND: f64 = 6.0;
/// AC overshoot above the configured limit still treated as acceptable (W)
const ACCEPTABLE_OVERAGE: f64 = 20.0;
/// Band just below the AC limit where the limit is nudged upwards (W)
const NEAR_LIMIT_BAND: f64 = 10.0;

/// Microinverter gateway model (OpenDTU / AhoyDTU).
///
/// Tracks per-channel DC power (index 0 carries the AC total), discovers the
/// inverter's max capacity from limit reports, and applies guarded absolute
/// limits. The two gateway variants differ only in topic schema and in the
/// unit suffix their limit topic expects.
pub struct Dtu {
    kind: DtuKind,
    base_topic: String,
    limit_topic: String,
    limit_unit: &'static str,
    inverter_name: String,
    inverter_max_power: f64,
    pub ac_limit: f64,
    ac_power: TimeWindow,
    dc_power: TimeWindow,
    channels_dc_power: Vec<f64>,
    sf_channels: Vec<usize>,
    limit_absolute: f64,
    limit_relative: f64,
    max_power_values: Vec<f64>,
    max_power: f64,
    efficiency_pct: f64,
    producing: bool,
    reachable: bool,
    dry_run: bool,
    last_limit_ts: Option<Instant>,
    ac_update_ts: Option<Instant>,
    last_trigger_value: f64,
    trigger: TriggerSender,
    publisher: SharedPublisher,
}

impl Dtu {
    pub fn new(
        settings: &DtuSettings,
        ac_limit: f64,
        trigger: TriggerSender,
        publisher: SharedPublisher,
    ) -> Self {
        let (base_topic, limit_topic, limit_unit) = match settings.kind {
            DtuKind::OpenDtu => {
                let serial = settings.inverter_serial.as_deref().unwrap_or_default();
                let base = format!("{}/{}", settings.base_topic, serial);
                let limit = format!("{base}/cmd/limit_nonpersistent_absolute");
                (base, limit, "")
            }
            DtuKind::AhoyDtu => {
                let base = settings.base_topic.clone();
                let limit = format!("{base}/ctrl/limit/{}", settings.inverter_id);
                (base, limit, "W")
            }
        };
        info!(
            "🔌 Using {}: Base topic: {}, Limit topic: {}, SF Channels: {:?}, AC Limit: {}W",
            settings.kind, base_topic, limit_topic, settings.sf_inverter_channels, ac_limit
        );
        Self {
            kind: settings.kind,
            base_topic,
            limit_topic,
            limit_unit,
            inverter_name: settings.inverter_name.clone(),
            inverter_max_power: settings.inverter_max_power,
            ac_limit,
            ac_power: TimeWindow::new(1),
            dc_power: TimeWindow::new(1),
            channels_dc_power: Vec::new(),
            sf_channels: settings.sf_inverter_channels.clone(),
            limit_absolute: 0.0,
            limit_relative: -1.0,
            max_power_values: Vec::new(),
            // AhoyDTU reports relative limits only; seed capacity from config
            max_power: settings.inverter_max_power,
            efficiency_pct: 95.0,
            producing: true,
            reachable: true,
            dry_run: false,
            last_limit_ts: None,
            ac_update_ts: None,
            last_trigger_value: 0.0,
            trigger,
            publisher,
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = match self.kind {
            DtuKind::OpenDtu => vec![
                format!("{}/0/powerdc", self.base_topic),
                format!("{}/+/power", self.base_topic),
                format!("{}/0/efficiency", self.base_topic),
                format!("{}/status/producing", self.base_topic),
                format!("{}/status/reachable", self.base_topic),
                format!("{}/status/limit_absolute", self.base_topic),
                format!("{}/status/limit_relative", self.base_topic),
            ],
            DtuKind::AhoyDtu => vec![
                format!("{}/{}/+/P_DC", self.base_topic, self.inverter_name),
                format!("{}/{}/ch0/P_AC", self.base_topic, self.inverter_name),
                format!("{}/{}/ch0/active_PowerLimit", self.base_topic, self.inverter_name),
                format!("{}/status", self.base_topic),
            ],
        };
        topics.push("solarflow-hub/+/control/dryRun".into());
        topics
    }

    pub fn ready(&self) -> bool {
        !self.channels_dc_power.is_empty()
    }

    // ============= Telemetry Updates =============

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.trim(),
            Err(_) => return,
        };
        if topic.starts_with("solarflow-hub") && topic.ends_with("/control/dryRun") {
            self.set_dry_run(text);
            return;
        }
        if !topic.starts_with(&self.base_topic) || text.is_empty() {
            return;
        }
        let Ok(value) = text.parse::<f64>() else {
            debug!("🔌 DTU ignoring non-numeric payload on {}: {}", topic, text);
            return;
        };
        let mut parts = topic.rsplit('/');
        let metric = parts.next().unwrap_or_default();
        let parent = parts.next().unwrap_or_default();
        debug!("🔌 DTU received {}:{}", metric, value);
        match self.kind {
            DtuKind::OpenDtu => match metric {
                "powerdc" => self.upd_total_power_dc(value),
                "power" => {
                    if let Ok(channel) = parent.parse::<usize>() {
                        self.upd_channel_power(channel, value);
                    }
                }
                "efficiency" => self.upd_efficiency(value),
                "producing" => self.producing = value != 0.0,
                "reachable" => self.reachable = value != 0.0,
                "limit_absolute" => self.upd_limit_absolute(value),
                "limit_relative" => self.upd_limit_relative(value),
                _ => debug!("🔌 Ignoring inverter metric: {}", metric),
            },
            DtuKind::AhoyDtu => match metric {
                "P_AC" => self.upd_channel_power(0, value),
                "P_DC" => {
                    let channel = parent
                        .strip_prefix("ch")
                        .and_then(|c| c.parse::<usize>().ok());
                    match channel {
                        Some(0) => self.upd_total_power_dc(value),
                        Some(channel) => self.upd_channel_power(channel, value),
                        None => {}
                    }
                }
                "active_PowerLimit" => {
                    self.upd_limit_relative(value);
                    if self.inverter_max_power > 0.0 {
                        self.upd_limit_absolute(self.inverter_max_power * value / 100.0);
                    }
                }
                "status" => self.producing = value != 0.0,
                _ => debug!("🔌 Ignoring inverter metric: {}", metric),
            },
        }
    }

    /// Record a per-channel DC reading; channel 0 carries the AC total
    pub fn upd_channel_power(&mut self, channel: usize, value: f64) {
        while self.channels_dc_power.len() <= channel {
            self.channels_dc_power.push(0.0);
        }
        if channel == 0 {
            let previous_ac = self.ac_power.last();
            self.ac_power.add(value);
            self.ac_update_ts = Some(Instant::now());
            if (value - previous_ac).abs() >= TRIGGER_DIFF {
                debug!(
                    "🔌 DTU triggers limit function: {:.1} -> {:.1}",
                    previous_ac, value
                );
                self.last_trigger_value = value;
                self.trigger.trigger(TriggerSource::Dtu, false);
            }
        }
        self.channels_dc_power[channel] = value;
    }

    pub fn upd_total_power_dc(&mut self, value: f64) {
        self.dc_power.add(value);
    }

    pub fn upd_limit_absolute(&mut self, value: f64) {
        self.limit_absolute = value;
    }

    fn upd_efficiency(&mut self, value: f64) {
        // some firmwares report a fraction, others a percentage
        self.efficiency_pct = if value <= 1.0 { value * 100.0 } else { value };
    }

    /// Track relative-limit reports until five consecutive capacity
    /// estimates agree, which fixes the inverter's max power.
    pub fn upd_limit_relative(&mut self, value: f64) {
        self.limit_relative = value;
        if self.limit_relative <= 0.0 || self.limit_absolute <= 0.0 {
            return;
        }
        let power = (self.limit_absolute / self.limit_relative * 100.0 / 100.0).round() * 100.0;
        if self.max_power_values.len() < MAX_POWER_SAMPLES {
            self.max_power_values.push(power);
        }
        let avg =
            self.max_power_values.iter().sum::<f64>() / self.max_power_values.len() as f64;
        if self.max_power_values.len() >= MAX_POWER_SAMPLES {
            if avg != self.max_power_values[0] {
                // not stable yet, drop the oldest estimate
                self.max_power_values.remove(0);
            }
            if avg == self.max_power_values[0] && avg > 100.0 && self.max_power != avg {
                self.max_power = avg;
                info!("🔌 Determined inverter's max capacity: {}W", self.max_power);
            }
        }
    }

    pub fn set_dry_run(&mut self, value: &str) {
        self.dry_run = matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE");
        info!("🔌 {} set DryRun: {}", self.kind, self.dry_run);
    }

    // ============= Getters =============

    pub fn get_ac_power(&self) -> f64 {
        self.ac_power.qwavg()
    }

    pub fn get_current_ac_power(&self) -> f64 {
        self.ac_power.last()
    }

    pub fn get_current_dc_power(&self) -> f64 {
        self.dc_power.last()
    }

    pub fn get_predicted_ac_power(&self) -> f64 {
        self.ac_power.predict()
    }

    /// Efficiency as a fraction (0..1)
    pub fn efficiency(&self) -> f64 {
        self.efficiency_pct / 100.0
    }

    pub fn get_limit(&self) -> f64 {
        self.limit_absolute
    }

    /// Current absolute limit as applied per channel
    pub fn channel_limit(&self) -> f64 {
        self.limit_absolute / self.n_total_channels().max(1) as f64
    }

    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// DC readings of panels wired directly to the inverter
    pub fn direct_dc_power_values(&self) -> Vec<f64> {
        let direct: Vec<f64> = self
            .channels_dc_power
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(idx, _)| !self.sf_channels.contains(idx))
            .map(|(_, v)| *v)
            .collect();
        if direct.is_empty() {
            // inverter down or all channels hub-fed
            return vec![0.0];
        }
        direct
    }

    pub fn direct_dc_power(&self) -> f64 {
        self.direct_dc_power_values().iter().sum()
    }

    /// DC readings of channels fed by the hub
    pub fn hub_dc_power_values(&self) -> Vec<f64> {
        self.channels_dc_power
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(idx, _)| self.sf_channels.contains(idx))
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn hub_dc_power(&self) -> f64 {
        self.hub_dc_power_values().iter().sum()
    }

    pub fn n_total_channels(&self) -> usize {
        self.channels_dc_power.len().saturating_sub(1)
    }

    pub fn n_hub_channels(&self) -> usize {
        self.sf_channels.len()
    }

    pub fn n_direct_channels(&self) -> usize {
        self.n_total_channels().saturating_sub(self.n_hub_channels())
    }

    pub fn n_producing_channels(&self) -> usize {
        self.channels_dc_power
            .iter()
            .skip(1)
            .filter(|v| **v > 0.0)
            .count()
            .max(1)
    }

    pub fn is_within(&self, a: f64, b: f64, range: f64) -> bool {
        b - range < a && a < b + range
    }

    /// A limit was sent but no AC reading has confirmed it yet
    pub fn has_pending_update(&self) -> bool {
        match (self.last_limit_ts, self.ac_update_ts) {
            (Some(limit_ts), Some(ac_ts)) => limit_ts > ac_ts,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Effective total limit that keeps the AC output at `ac_limit`, given
    /// that the inverter spreads its absolute limit evenly across channels.
    pub fn get_ac_limit(&self) -> f64 {
        let n_total = self.n_total_channels().max(1) as f64;
        if self.hub_dc_power() <= 0.0 {
            self.ac_limit / self.n_direct_channels().max(1) as f64 * n_total
        } else {
            self.ac_limit / self.n_producing_channels() as f64 * n_total
        }
    }

    // ============= Limit Application =============

    /// Apply a per-channel demand as an absolute inverter limit.
    ///
    /// `grid_power` is the smart meter's current reading minus its zero
    /// offset; it decides whether an acceptable AC overage may stand.
    /// Returns the effective limit, whether or not it was published.
    pub fn set_limit(&mut self, limit: f64, grid_power: f64) -> f64 {
        // a zero limit is unsafe on some firmwares, keep a minimum
        let limit = limit.max(10.0);

        // the inverter applies its absolute limit per MPPT, so scale the
        // per-channel demand to the whole device
        let mut inv_limit = limit * self.n_total_channels().max(1) as f64;

        if self.max_power > 0.0 && inv_limit > self.max_power * 1.125 {
            inv_limit = self.max_power * 1.125;
        }
        inv_limit = inv_limit.max(10.0);

        let mut within_range = LIMIT_DEADBAND;
        let current_ac = self.get_current_ac_power();
        if current_ac > self.ac_limit {
            if current_ac - self.ac_limit <= ACCEPTABLE_OVERAGE {
                if grid_power > 0.0 {
                    // still importing: the overage serves real demand
                    inv_limit = self.limit_absolute;
                } else {
                    inv_limit = self.get_ac_limit();
                }
            } else {
                warn!(
                    "🔌 Inverter AC output {:.1}W exceeds the configured limit ({:.0}W), capping",
                    current_ac, self.ac_limit
                );
                inv_limit = self.get_ac_limit();
            }
            within_range = 0.0;
        } else if self.ac_limit - current_ac <= NEAR_LIMIT_BAND {
            // just below the cap: inch upwards instead of jumping
            inv_limit = self.limit_absolute + 2.0;
            within_range = 0.0;
        }

        if (inv_limit - self.limit_absolute).abs() > within_range && self.reachable {
            if !self.dry_run {
                publish_or_log(
                    &self.publisher,
                    &self.limit_topic,
                    format!("{}{}", inv_limit.round() as i64, self.limit_unit),
                    false,
                );
            }
            self.last_limit_ts = Some(Instant::now());
            info!(
                "🔌 {}Setting inverter output limit to {:.0}W ({:.0}W x {} channels)",
                if self.dry_run { "[DRYRUN] " } else { "" },
                inv_limit,
                limit,
                self.n_total_channels().max(1)
            );
        } else if !self.reachable {
            info!("🔌 Inverter is not reachable/down. Can't set limit");
        } else {
            debug!("🔌 Not setting inverter output limit as it is identical to current limit!");
        }

        inv_limit
    }
}

impl fmt::Display for Dtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self
            .channels_dc_power
            .iter()
            .skip(1)
            .map(|v| format!("{v:>3.1}"))
            .collect::<Vec<_>>()
            .join("|");
        write!(
            f,
            "INV: AC:{:>3.1}W, AC_Prediction: {:>3.1}W, DC:{:>3.1}W ({channels}), L:{:>3.0}W [{:>3.0}W]",
            self.get_current_ac_power(),
            self.get_predicted_ac_power(),
            self.get_current_dc_power(),
            self.limit_absolute,
            self.max_power
        )
    }
}
