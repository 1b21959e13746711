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

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bridge::{publish_or_log, SharedPublisher, TriggerSender, TriggerSource};
use crate::telemetry::TimeWindow;
use gridflow_types::config::HUB2000_PRODUCT_ID;
use gridflow_types::{BatteryTarget, BypassMode, ChargeThroughStage, HubSettings};

/// Solar-input delta that triggers the decision procedure (W)
const TRIGGER_DIFF: f64 = 30.0;
/// No solar-input report for this long means the panels are dark
const SOLAR_INPUT_STALE_SECS: i64 = 120;
/// Minimum spacing between output-limit commands
const LIMIT_COMMAND_SPACING: Duration = Duration::from_secs(30);

/// Whether a charge-through request can currently be honored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeThroughVerdict {
    Allowed,
    /// Hub SoC limits not read yet; retry on the next limit update
    Unknown,
    /// Hub SoC limits contradict the request and we may not rewrite them
    Denied,
}

/// Model of the Solarflow hub (battery + MPPT unit).
///
/// Fans the vendor's raw property reports out to normalized telemetry
/// topics, tracks SoC and power flows, owns the charge-through state
/// machine, and writes the hub's `outputLimit` with quantization and
/// command spacing the firmware tolerates.
pub struct Hub {
    product_id: String,
    device_id: String,
    fw_version: String,
    pub control_bypass: bool,
    control_soc: bool,
    allow_full_cycle: bool,
    dry_run: bool,

    solar_input: TimeWindow,
    solar_input_power: f64,
    output_pack_power: f64,
    pack_input_power: f64,
    output_home_power: f64,
    bypass: bool,
    bypass_mode: BypassMode,
    allow_bypass: bool,
    electric_level: i64,
    battery_socs: BTreeMap<String, i64>,
    battery_voltages: BTreeMap<String, f64>,
    output_limit: f64,
    last_commanded_limit: Option<i64>,
    inverse_max_power: f64,
    last_full_ts: Option<DateTime<Utc>>,
    last_empty_ts: Option<DateTime<Utc>>,
    last_solar_input_ts: Option<DateTime<Utc>>,
    last_limit_ts: Option<Instant>,
    battery_target: BatteryTarget,
    charge_through: bool,
    charge_through_stage: ChargeThroughStage,
    pending_charge_through: bool,
    battery_target_soc_min: Option<u32>,
    battery_target_soc_max: Option<u32>,
    battery_low: u32,
    battery_high: u32,
    full_charge_interval_hrs: u32,
    sunrise_soc: Option<i64>,
    sunset_soc: Option<i64>,
    fw_updated: bool,
    trigger: TriggerSender,
    publisher: SharedPublisher,
}

impl Hub {
    pub fn new(
        settings: &HubSettings,
        battery_low: u32,
        battery_high: u32,
        full_charge_interval_hrs: u32,
        trigger: TriggerSender,
        publisher: SharedPublisher,
    ) -> Self {
        info!(
            "🔋 Using Solarflow hub {}/{} (bypass control: {}, SoC control: {}, full cycle: {})",
            settings.product_id,
            settings.device_id,
            settings.control_bypass,
            settings.control_soc,
            settings.allow_full_cycle
        );
        Self {
            product_id: settings.product_id.clone(),
            device_id: settings.device_id.clone(),
            fw_version: "unknown".into(),
            control_bypass: settings.control_bypass,
            control_soc: settings.control_soc,
            allow_full_cycle: settings.allow_full_cycle,
            dry_run: settings.dry_run,
            solar_input: TimeWindow::new(1),
            solar_input_power: -1.0,
            output_pack_power: 0.0,
            pack_input_power: 0.0,
            output_home_power: -1.0,
            bypass: false,
            bypass_mode: BypassMode::Auto,
            allow_bypass: true,
            electric_level: -1,
            battery_socs: BTreeMap::new(),
            battery_voltages: BTreeMap::new(),
            output_limit: -1.0,
            last_commanded_limit: None,
            inverse_max_power: -1.0,
            last_full_ts: None,
            last_empty_ts: None,
            last_solar_input_ts: None,
            last_limit_ts: None,
            battery_target: BatteryTarget::Idle,
            charge_through: false,
            charge_through_stage: ChargeThroughStage::Idle,
            pending_charge_through: false,
            battery_target_soc_min: None,
            battery_target_soc_max: None,
            battery_low,
            battery_high,
            full_charge_interval_hrs,
            sunrise_soc: None,
            sunset_soc: None,
            fw_updated: false,
            trigger,
            publisher,
        }
    }

    // ============= Topics =============

    fn report_topic(&self) -> String {
        format!("/{}/{}/properties/report", self.product_id, self.device_id)
    }

    fn write_topic(&self) -> String {
        format!("iot/{}/{}/properties/write", self.product_id, self.device_id)
    }

    fn read_topic(&self) -> String {
        format!("iot/{}/{}/properties/read", self.product_id, self.device_id)
    }

    fn timesync_topic(&self) -> String {
        format!("iot/{}/{}/time-sync/reply", self.product_id, self.device_id)
    }

    fn telemetry_topic(&self, property: &str) -> String {
        format!("solarflow-hub/{}/telemetry/{property}", self.device_id)
    }

    fn control_topic(&self, setting: &str) -> String {
        format!("solarflow-hub/{}/control/{setting}", self.device_id)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.report_topic()];
        for property in [
            "solarInputPower",
            "electricLevel",
            "outputPackPower",
            "packInputPower",
            "outputHomePower",
            "outputLimit",
            "inverseMaxPower",
            "masterSoftVersion",
            "pass",
            "passMode",
            "socSet",
            "minSoc",
        ] {
            topics.push(self.telemetry_topic(property));
        }
        topics.push(self.telemetry_topic("batteries/+/socLevel"));
        topics.push(self.telemetry_topic("batteries/+/totalVol"));
        topics
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn fw_version(&self) -> &str {
        &self.fw_version
    }

    pub fn battery_serials(&self) -> Vec<String> {
        self.battery_socs.keys().cloned().collect()
    }

    pub fn ready(&self) -> bool {
        self.electric_level > -1 && self.solar_input_power > -1.0
    }

    // ============= Message Handling =============

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        if topic == self.report_topic() {
            self.fan_out_report(payload);
            return;
        }
        let prefix = format!("solarflow-hub/{}/", self.device_id);
        if !topic.starts_with(&prefix) || payload.is_empty() {
            return;
        }
        let Ok(value) = std::str::from_utf8(payload) else {
            return;
        };
        let value = value.trim();

        // no solar-input report for a while means production stopped; make
        // the window reflect that instead of averaging stale sunshine
        let now = Utc::now();
        if let Some(last) = self.last_solar_input_ts {
            if (now - last).num_seconds() > SOLAR_INPUT_STALE_SECS {
                self.upd_solar_input(0.0);
            }
        }

        let mut parts = topic.rsplit('/');
        let metric = parts.next().unwrap_or_default();
        let parent = parts.next().unwrap_or_default();
        match metric {
            "electricLevel" => {
                if let Ok(level) = value.parse::<i64>() {
                    self.upd_electric_level(level);
                }
            }
            "solarInputPower" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.upd_solar_input(watts);
                }
            }
            "outputPackPower" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.output_pack_power = watts;
                }
            }
            "packInputPower" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.pack_input_power = watts;
                }
            }
            "outputHomePower" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.output_home_power = watts;
                }
            }
            "outputLimit" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.output_limit = watts;
                }
            }
            "inverseMaxPower" => {
                if let Ok(watts) = value.parse::<f64>() {
                    self.inverse_max_power = watts;
                }
            }
            "masterSoftVersion" => {
                if let Ok(raw) = value.parse::<i64>() {
                    self.upd_master_soft_version(raw);
                }
            }
            "pass" => {
                if let Ok(raw) = value.parse::<i64>() {
                    self.bypass = raw != 0;
                }
            }
            "passMode" => {
                if let Ok(raw) = value.parse::<i64>() {
                    self.upd_pass_mode(raw);
                }
            }
            "socSet" => {
                if let Ok(raw) = value.parse::<f64>() {
                    self.battery_target_soc_max = Some((raw / 10.0).round() as u32);
                    self.reevaluate_pending_charge_through();
                }
            }
            "minSoc" => {
                if let Ok(raw) = value.parse::<f64>() {
                    self.battery_target_soc_min = Some((raw / 10.0).round() as u32);
                    self.reevaluate_pending_charge_through();
                }
            }
            "socLevel" => {
                if let Ok(level) = value.parse::<i64>() {
                    self.battery_socs.insert(parent.to_owned(), level);
                }
            }
            "totalVol" => {
                if let Ok(raw) = value.parse::<f64>() {
                    self.battery_voltages.insert(parent.to_owned(), raw / 100.0);
                }
            }
            "chargeThrough" => {
                let on = matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE");
                self.set_charge_through(on);
            }
            "dryRun" => {
                self.dry_run = matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE");
                info!("🔋 Hub set DryRun: {}", self.dry_run);
            }
            "batteryTarget" => {
                // retained restore only; live transitions originate here
                if self.battery_target == BatteryTarget::Idle {
                    if let Ok(target) = value.parse() {
                        self.battery_target = target;
                    }
                }
            }
            "chargeThroughState" => {
                if self.charge_through_stage == ChargeThroughStage::Idle {
                    if let Ok(stage) = value.parse() {
                        self.charge_through_stage = stage;
                    }
                }
            }
            "lastFullTimestamp" => {
                if self.last_full_ts.is_none() {
                    if let Ok(epoch) = value.parse::<i64>() {
                        self.last_full_ts = DateTime::<Utc>::from_timestamp(epoch, 0);
                    }
                }
            }
            "lastEmptyTimestamp" => {
                if self.last_empty_ts.is_none() {
                    if let Ok(epoch) = value.parse::<i64>() {
                        self.last_empty_ts = DateTime::<Utc>::from_timestamp(epoch, 0);
                    }
                }
            }
            _ => debug!("🔋 Ignoring solarflow-hub metric: {}", metric),
        }
    }

    /// Re-publish each vendor property on its normalized telemetry topic and
    /// each per-battery pack entry under `batteries/{sn}/...`.
    fn fan_out_report(&mut self, payload: &[u8]) {
        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("⚠️ Dropping malformed hub report: {}", e);
                return;
            }
        };
        if let Some(props) = parsed.get("properties").and_then(Value::as_object) {
            for (prop, val) in props {
                publish_or_log(
                    &self.publisher,
                    &self.telemetry_topic(prop),
                    render_value(val),
                    false,
                );
            }
        }
        if let Some(packs) = parsed.get("packData").and_then(Value::as_array) {
            for pack in packs {
                let Some(sn) = pack.get("sn").and_then(Value::as_str) else {
                    continue;
                };
                let Some(entries) = pack.as_object() else {
                    continue;
                };
                for (prop, val) in entries {
                    if prop == "sn" {
                        continue;
                    }
                    publish_or_log(
                        &self.publisher,
                        &self.telemetry_topic(&format!("batteries/{sn}/{prop}")),
                        render_value(val),
                        false,
                    );
                }
            }
        }
    }

    // ============= Telemetry Updates =============

    pub fn upd_solar_input(&mut self, value: f64) {
        let previous = self.solar_input.last();
        self.solar_input.add(value);
        self.solar_input_power = self.solar_input.wavg();
        self.last_solar_input_ts = Some(Utc::now());
        if (previous - value).abs() >= TRIGGER_DIFF {
            debug!("🔋 Solar input change triggers limit function: {:.1} -> {:.1}", previous, value);
            self.trigger.trigger(TriggerSource::HubSolar, false);
        }
    }

    /// SoC state machine: transitions at empty, low, high and full
    pub fn upd_electric_level(&mut self, value: i64) {
        if value == 100 {
            self.set_battery_target(BatteryTarget::Discharging);
            self.last_full_ts = Some(Utc::now());
            publish_or_log(
                &self.publisher,
                &self.control_topic("lastFullTimestamp"),
                format!("{}", self.last_full_ts.map(|ts| ts.timestamp()).unwrap_or_default()),
                true,
            );
            if self.control_bypass && self.allow_bypass {
                info!("🔋 Battery is full, turning on bypass");
                self.set_bypass(true);
                self.allow_bypass = false;
            }
            if self.charge_through {
                if self.allow_full_cycle {
                    self.set_charge_through_stage(ChargeThroughStage::Discharging);
                } else {
                    self.exit_charge_through("battery reached 100%");
                }
            }
        } else if value >= 0 && value as u32 >= self.battery_high && !self.charge_through {
            self.set_battery_target(BatteryTarget::Discharging);
        }

        if value == 0 {
            self.set_battery_target(BatteryTarget::Charging);
            self.last_empty_ts = Some(Utc::now());
            publish_or_log(
                &self.publisher,
                &self.control_topic("lastEmptyTimestamp"),
                format!("{}", self.last_empty_ts.map(|ts| ts.timestamp()).unwrap_or_default()),
                true,
            );
            if self.charge_through {
                self.exit_charge_through("battery is empty");
            }
        } else if value > 0 && (value as u32) <= self.battery_low && !self.charge_through {
            self.set_battery_target(BatteryTarget::Charging);
        }

        self.electric_level = value;
    }

    fn upd_master_soft_version(&mut self, raw: i64) {
        let major = (raw & 0xf000) >> 12;
        let minor = (raw & 0x0f00) >> 8;
        let build = raw & 0x00ff;
        let version = format!("{major}.{minor}.{build}");
        if version != self.fw_version {
            self.fw_version = version;
            self.fw_updated = true;
        }
    }

    fn upd_pass_mode(&mut self, raw: i64) {
        let Some(mode) = BypassMode::from_raw(raw) else {
            warn!("⚠️ Hub reported unknown passMode: {}", raw);
            return;
        };
        self.bypass_mode = mode;
        // firmware occasionally resets bypass to automatic; when we own the
        // bypass we must put it back under manual control
        if self.control_bypass && mode == BypassMode::Auto {
            info!("🔋 Hub reverted to automatic bypass, re-asserting manual off");
            self.set_bypass(false);
        }
    }

    /// Hand the engine a one-shot "firmware version changed" signal
    pub fn take_fw_updated(&mut self) -> bool {
        std::mem::take(&mut self.fw_updated)
    }

    fn set_battery_target(&mut self, target: BatteryTarget) {
        if self.battery_target != target {
            self.battery_target = target;
            self.publish_battery_target(target);
        }
    }

    /// Set and re-publish the target regardless of the current state; used
    /// by the morning path, which always restarts the day charging.
    pub fn force_battery_target(&mut self, target: BatteryTarget) {
        self.battery_target = target;
        self.publish_battery_target(target);
    }

    pub fn publish_battery_target(&self, target: BatteryTarget) {
        publish_or_log(
            &self.publisher,
            &self.control_topic("batteryTarget"),
            target.to_string(),
            true,
        );
    }

    // ============= Charge-through FSM =============

    fn charge_through_verdict(&self) -> ChargeThroughVerdict {
        if self.control_soc {
            return ChargeThroughVerdict::Allowed;
        }
        let Some(soc_max) = self.battery_target_soc_max else {
            return ChargeThroughVerdict::Unknown;
        };
        if soc_max != 100 {
            return ChargeThroughVerdict::Denied;
        }
        if self.allow_full_cycle {
            match self.battery_target_soc_min {
                None => ChargeThroughVerdict::Unknown,
                Some(0) => ChargeThroughVerdict::Allowed,
                Some(_) => ChargeThroughVerdict::Denied,
            }
        } else {
            ChargeThroughVerdict::Allowed
        }
    }

    pub fn set_charge_through(&mut self, on: bool) {
        if !on {
            self.pending_charge_through = false;
            if self.charge_through {
                self.exit_charge_through("requested off");
            }
            return;
        }
        if self.charge_through {
            return;
        }
        match self.charge_through_verdict() {
            ChargeThroughVerdict::Allowed => self.enter_charge_through(),
            ChargeThroughVerdict::Unknown => {
                info!("🔋 Charge-through requested before hub SoC limits were read, deferring");
                self.pending_charge_through = true;
            }
            ChargeThroughVerdict::Denied => {
                warn!(
                    "⚠️ Charge-through rejected: SoC control is disallowed and hub limits are {:?}/{:?}",
                    self.battery_target_soc_min, self.battery_target_soc_max
                );
                self.pending_charge_through = true;
            }
        }
    }

    fn reevaluate_pending_charge_through(&mut self) {
        if self.pending_charge_through && !self.charge_through {
            self.set_charge_through(true);
        }
    }

    fn enter_charge_through(&mut self) {
        info!("🔋 Entering charge-through (full cycle: {})", self.allow_full_cycle);
        self.charge_through = true;
        self.pending_charge_through = false;
        self.set_charge_through_stage(ChargeThroughStage::Charging);
        publish_or_log(&self.publisher, &self.control_topic("chargeThrough"), "ON".into(), true);
        self.set_battery_high_soc(100, true);
        let low = if self.allow_full_cycle { 0 } else { self.battery_low };
        self.set_battery_low_soc(low, true);
    }

    fn exit_charge_through(&mut self, reason: &str) {
        info!("🔋 Leaving charge-through: {}", reason);
        self.charge_through = false;
        self.set_charge_through_stage(ChargeThroughStage::Idle);
        publish_or_log(&self.publisher, &self.control_topic("chargeThrough"), "OFF".into(), true);
        let high = self.battery_high;
        let low = self.battery_low;
        self.set_battery_high_soc(high, true);
        self.set_battery_low_soc(low, true);
    }

    fn set_charge_through_stage(&mut self, stage: ChargeThroughStage) {
        if self.charge_through_stage != stage {
            self.charge_through_stage = stage;
            publish_or_log(
                &self.publisher,
                &self.control_topic("chargeThroughState"),
                stage.to_string(),
                true,
            );
        }
    }

    /// Decide at sunrise whether today needs a full charge cycle, given the
    /// expected daylight.
    pub fn check_charge_through(&mut self, daylight_hours: f64) {
        let interval = self.full_charge_interval_hrs as f64;
        let fullage = self.get_last_full_battery_hours();
        if fullage < 0.0 || fullage > interval || fullage + daylight_hours > interval {
            info!(
                "🔋 Battery hasn't fully charged for {:.1}h (interval {:.0}h, daylight {:.1}h), requesting charge-through",
                fullage, interval, daylight_hours
            );
            self.set_charge_through(true);
        }
    }

    pub fn upd_full_charge_interval(&mut self, hours: u32) {
        self.full_charge_interval_hrs = hours;
    }

    // ============= Output Limit =============

    /// Command the hub's home-output limit.
    ///
    /// Returns the limit that is considered in force, which is the current
    /// one when the call is refused for spacing.
    pub fn set_output_limit(&mut self, limit: f64) -> f64 {
        if let Some(ts) = self.last_limit_ts {
            if ts.elapsed() < LIMIT_COMMAND_SPACING {
                debug!(
                    "🔋 Hub limit command too soon after the previous one, keeping {:.0}W",
                    self.output_limit
                );
                return self.output_limit;
            }
        }

        let mut limit = limit.max(0.0).round() as i64;
        if self.electric_level == 0 {
            limit = 0;
        }
        if self.charge_through && self.battery_target == BatteryTarget::Charging && limit > 0 {
            info!("🔋 Charge-through wants the battery full first, not discharging");
            limit = 0;
        }

        // below 100W the hub only accepts 30W steps
        if limit <= 100 {
            let (steps, remainder) = (limit / 30, limit % 30);
            limit = 30 * steps + 30 * (remainder / 15);
        }

        if self.last_commanded_limit != Some(limit) {
            let payload = json!({"properties": {"outputLimit": limit}});
            if !self.dry_run {
                publish_or_log(&self.publisher, &self.write_topic(), payload.to_string(), false);
            }
            info!(
                "🔋 {}Setting solarflow output limit to {}W",
                if self.dry_run { "[DRYRUN] " } else { "" },
                limit
            );
            self.last_commanded_limit = Some(limit);
            self.last_limit_ts = Some(Instant::now());
        } else {
            debug!("🔋 Not setting solarflow output limit as it is identical to current limit!");
        }
        limit as f64
    }

    // ============= Property Setters =============

    fn write_property(&self, name: &str, value: Value) {
        let payload = json!({"properties": {name: value}});
        if self.dry_run {
            info!("🔋 [DRYRUN] Would write hub property {} = {}", name, payload);
            return;
        }
        publish_or_log(&self.publisher, &self.write_topic(), payload.to_string(), false);
    }

    pub fn set_buzzer(&self, on: bool) {
        self.write_property("buzzerSwitch", json!(i32::from(on)));
    }

    pub fn set_bypass(&mut self, on: bool) {
        let mode = if on { BypassMode::ManualOn } else { BypassMode::ManualOff };
        self.write_property("passMode", json!(mode.as_raw()));
        self.bypass_mode = mode;
        self.bypass = on;
    }

    pub fn set_autorecover(&self, on: bool) {
        self.write_property("autoRecover", json!(i32::from(on)));
    }

    pub fn set_inverse_max_power(&mut self, watts: f64) {
        let watts = watts.max(100.0);
        self.write_property("inverseMaxPower", json!(watts as i64));
        self.inverse_max_power = watts;
    }

    pub fn set_pv_brand(&self, brand: i64) {
        self.write_property("pvBrand", json!(brand));
    }

    pub fn set_battery_high_soc(&mut self, level: u32, temporary: bool) {
        let level = level.clamp(40, 100);
        if self.control_soc {
            self.write_property("socSet", json!(level * 10));
        }
        if !temporary {
            self.battery_high = level;
        }
    }

    pub fn set_battery_low_soc(&mut self, level: u32, temporary: bool) {
        let level = level.clamp(0, 60);
        if self.control_soc {
            self.write_property("minSoc", json!(level * 10));
        }
        if !temporary {
            self.battery_low = level;
        }
    }

    /// Configured SoC ceiling changed via control topic
    pub fn apply_configured_high(&mut self, level: u32) {
        if self.charge_through {
            self.battery_high = level.clamp(40, 100);
        } else {
            self.set_battery_high_soc(level, false);
        }
    }

    /// Configured SoC floor changed via control topic
    pub fn apply_configured_low(&mut self, level: u32) {
        if self.charge_through {
            self.battery_low = level.clamp(0, 60);
        } else {
            self.set_battery_low_soc(level, false);
        }
    }

    pub fn set_allow_bypass(&mut self, allow: bool) {
        self.allow_bypass = allow;
    }

    pub fn set_control_bypass(&mut self, on: bool) {
        self.control_bypass = on;
    }

    /// Reply to the hub's clock with ours; the hub drifts over weeks
    pub fn time_sync(&self, epoch_secs: i64) {
        let payload = json!({
            "zoneOffset": "+00:00",
            "messageId": 123,
            "timestamp": epoch_secs,
        });
        publish_or_log(&self.publisher, &self.timesync_topic(), payload.to_string(), false);
    }

    /// Ask the hub for a full property dump
    pub fn request_full_report(&self) {
        publish_or_log(
            &self.publisher,
            &self.read_topic(),
            json!({"properties": ["getAll"]}).to_string(),
            false,
        );
    }

    /// Re-publish the retained control-state snapshot
    pub fn publish_state(&self) {
        self.publish_battery_target(self.battery_target);
        publish_or_log(
            &self.publisher,
            &self.control_topic("chargeThroughState"),
            self.charge_through_stage.to_string(),
            true,
        );
        publish_or_log(
            &self.publisher,
            &self.control_topic("chargeThrough"),
            if self.charge_through { "ON" } else { "OFF" }.into(),
            true,
        );
        if let Some(ts) = self.last_full_ts {
            publish_or_log(
                &self.publisher,
                &self.control_topic("lastFullTimestamp"),
                format!("{}", ts.timestamp()),
                true,
            );
        }
        if let Some(ts) = self.last_empty_ts {
            publish_or_log(
                &self.publisher,
                &self.control_topic("lastEmptyTimestamp"),
                format!("{}", ts.timestamp()),
                true,
            );
        }
    }

    // ============= Getters =============

    pub fn get_electric_level(&self) -> i64 {
        self.electric_level
    }

    pub fn get_solar_input_power(&self) -> f64 {
        self.solar_input_power
    }

    pub fn get_limit(&self) -> f64 {
        self.output_limit
    }

    pub fn get_inverse_max_power(&self) -> f64 {
        self.inverse_max_power
    }

    /// Battery discharge towards the house (W)
    pub fn get_discharge_power(&self) -> f64 {
        self.pack_input_power
    }

    /// Battery charging power (W)
    pub fn get_charge_power(&self) -> f64 {
        self.output_pack_power
    }

    pub fn battery_target(&self) -> BatteryTarget {
        self.battery_target
    }

    pub fn charge_through(&self) -> bool {
        self.charge_through
    }

    pub fn charge_through_stage(&self) -> ChargeThroughStage {
        self.charge_through_stage
    }

    /// Effective bypass state.
    ///
    /// The HUB2000 keeps reporting `bypass == false` in manual-on mode, so
    /// for that product the mode report is authoritative.
    pub fn get_bypass(&self) -> bool {
        if self.product_id == HUB2000_PRODUCT_ID && self.bypass_mode == BypassMode::ManualOn {
            return true;
        }
        self.bypass
    }

    pub fn get_last_full_battery_hours(&self) -> f64 {
        self.last_full_ts
            .map_or(-1.0, |ts| (Utc::now() - ts).num_seconds() as f64 / 3600.0)
    }

    pub fn get_last_empty_battery_hours(&self) -> f64 {
        self.last_empty_ts
            .map_or(-1.0, |ts| (Utc::now() - ts).num_seconds() as f64 / 3600.0)
    }

    pub fn set_sunrise_soc(&mut self, level: i64) {
        self.sunrise_soc = Some(level);
    }

    pub fn set_sunset_soc(&mut self, level: i64) {
        self.sunset_soc = Some(level);
    }

    /// Battery percentage consumed between sunset and the following sunrise
    pub fn get_night_consumption(&self) -> i64 {
        match (self.sunset_soc, self.sunrise_soc) {
            (Some(sunset), Some(sunrise)) => sunset - sunrise,
            _ => 0,
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let batteries = self
            .battery_socs
            .values()
            .map(|v| format!("{v:>2}"))
            .collect::<Vec<_>>()
            .join("|");
        write!(
            f,
            "HUB: S:{:>3.1}W {}, B:{:>3}% ({batteries}), C:{:>4.0}W, F:{:3.1}h, E:{:3.1}h, H:{:>3.0}W, L:{:>3.0}W",
            self.solar_input_power,
            self.solar_input,
            self.electric_level,
            self.output_pack_power - self.pack_input_power,
            self.get_last_full_battery_hours(),
            self.get_last_empty_battery_hours(),
            self.output_home_power,
            self.output_limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TriggerSender;
    use crate::testutil::RecordingPublisher;
    use std::sync::Arc;

    fn settings() -> HubSettings {
        HubSettings {
            device_id: "5ak8yGU7".into(),
            product_id: "73bkTV".into(),
            control_bypass: false,
            control_soc: true,
            allow_full_cycle: false,
            dry_run: false,
        }
    }

    fn hub_with(settings: HubSettings) -> (Arc<RecordingPublisher>, Hub) {
        let (recorder, publisher) = RecordingPublisher::shared();
        let (trigger, _rx) = TriggerSender::new();
        (recorder, Hub::new(&settings, 10, 98, 72, trigger, publisher))
    }

    fn hub() -> (Arc<RecordingPublisher>, Hub) {
        hub_with(settings())
    }

    #[test]
    fn test_report_fan_out() {
        let (recorder, mut hub) = hub();
        let payload = br#"{
            "properties": {"electricLevel": 55, "solarInputPower": 320},
            "packData": [{"sn": "CO4X1234", "socLevel": 54, "totalVol": 4850}]
        }"#;
        hub.handle_message("/73bkTV/5ak8yGU7/properties/report", payload);
        assert_eq!(
            recorder.payloads_for("solarflow-hub/5ak8yGU7/telemetry/electricLevel"),
            vec!["55"]
        );
        assert_eq!(
            recorder.payloads_for("solarflow-hub/5ak8yGU7/telemetry/batteries/CO4X1234/socLevel"),
            vec!["54"]
        );
    }

    #[test]
    fn test_full_battery_transitions() {
        let (recorder, mut hub) = hub();
        hub.upd_electric_level(100);
        assert_eq!(hub.battery_target(), BatteryTarget::Discharging);
        assert!(hub.get_last_full_battery_hours() >= 0.0);
        assert_eq!(
            recorder.payloads_for("solarflow-hub/5ak8yGU7/control/batteryTarget"),
            vec!["discharging"]
        );
    }

    #[test]
    fn test_empty_battery_transitions() {
        let (_recorder, mut hub) = hub();
        hub.upd_electric_level(0);
        assert_eq!(hub.battery_target(), BatteryTarget::Charging);
        assert!(hub.get_last_empty_battery_hours() >= 0.0);
    }

    #[test]
    fn test_soc_thresholds_respect_charge_through() {
        let (_recorder, mut hub) = hub();
        hub.upd_electric_level(50);
        hub.set_charge_through(true);
        assert!(hub.charge_through());
        // below the normal floor, but charge-through suppresses the flip
        hub.upd_electric_level(5);
        assert_ne!(hub.battery_target(), BatteryTarget::Charging);
    }

    #[test]
    fn test_full_battery_turns_on_bypass_once() {
        let mut cfg = settings();
        cfg.control_bypass = true;
        let (recorder, mut hub) = hub_with(cfg);
        hub.upd_electric_level(100);
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert!(writes.iter().any(|w| w.contains("\"passMode\":2")));
        recorder.clear();
        // second full report must not re-enable bypass
        hub.upd_electric_level(100);
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert!(!writes.iter().any(|w| w.contains("\"passMode\":2")));
    }

    #[test]
    fn test_auto_pass_mode_reasserted() {
        let mut cfg = settings();
        cfg.control_bypass = true;
        let (recorder, mut hub) = hub_with(cfg);
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/passMode", b"0");
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert!(writes.iter().any(|w| w.contains("\"passMode\":1")));
        assert!(!hub.get_bypass());
    }

    #[test]
    fn test_hub2000_trusts_manual_on() {
        let mut cfg = settings();
        cfg.product_id = HUB2000_PRODUCT_ID.into();
        let (_recorder, mut hub) = hub_with(cfg);
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/passMode", b"2");
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/pass", b"0");
        assert!(hub.get_bypass());
    }

    #[test]
    fn test_charge_through_forces_zero_limit() {
        let (recorder, mut hub) = hub();
        hub.upd_electric_level(40);
        hub.set_charge_through(true);
        // charging leg of the cycle: nothing may leave the battery
        hub.upd_electric_level(41);
        assert_eq!(hub.battery_target(), BatteryTarget::Idle);
        // force the charging target the way the morning path does
        hub.force_battery_target(BatteryTarget::Charging);
        hub.upd_electric_level(9);
        recorder.clear();
        let effective = hub.set_output_limit(200.0);
        assert_eq!(effective, 0.0);
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert_eq!(writes, vec![r#"{"properties":{"outputLimit":0}}"#]);
    }

    #[test]
    fn test_output_limit_quantized_below_100() {
        let (recorder, mut hub) = hub();
        hub.upd_electric_level(50);
        let effective = hub.set_output_limit(85.0);
        assert_eq!(effective, 90.0);
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert!(writes.iter().any(|w| w.contains("\"outputLimit\":90")));
    }

    #[test]
    fn test_output_limit_spacing() {
        let (recorder, mut hub) = hub();
        hub.upd_electric_level(50);
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/outputLimit", b"120");
        hub.set_output_limit(120.0);
        recorder.clear();
        // second command within 30s is refused and reports the current limit
        let effective = hub.set_output_limit(300.0);
        assert_eq!(effective, 120.0);
        assert!(recorder
            .payloads_for("iot/73bkTV/5ak8yGU7/properties/write")
            .is_empty());
    }

    #[test]
    fn test_empty_battery_forces_zero_limit() {
        let (_recorder, mut hub) = hub();
        hub.upd_electric_level(0);
        let effective = hub.set_output_limit(250.0);
        assert_eq!(effective, 0.0);
    }

    #[test]
    fn test_charge_through_deferred_until_limits_known() {
        let mut cfg = settings();
        cfg.control_soc = false;
        let (_recorder, mut hub) = hub_with(cfg);
        hub.set_charge_through(true);
        assert!(!hub.charge_through());
        // hub reports its SoC window: ceiling at 100% allows the cycle
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/socSet", b"1000");
        assert!(hub.charge_through());
        assert_eq!(hub.charge_through_stage(), ChargeThroughStage::Charging);
    }

    #[test]
    fn test_charge_through_full_cycle_needs_zero_floor() {
        let mut cfg = settings();
        cfg.control_soc = false;
        cfg.allow_full_cycle = true;
        let (_recorder, mut hub) = hub_with(cfg);
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/socSet", b"1000");
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/minSoc", b"100");
        hub.set_charge_through(true);
        assert!(!hub.charge_through(), "10% floor must deny a full cycle");
        hub.handle_message("solarflow-hub/5ak8yGU7/telemetry/minSoc", b"0");
        assert!(hub.charge_through());
    }

    #[test]
    fn test_check_charge_through_on_stale_full() {
        let (_recorder, mut hub) = hub();
        // never been full -> request the cycle
        hub.check_charge_through(8.0);
        assert!(hub.charge_through());
    }

    #[test]
    fn test_battery_soc_setters_clamped() {
        let (recorder, mut hub) = hub();
        hub.set_battery_high_soc(120, false);
        hub.set_battery_low_soc(80, false);
        let writes = recorder.payloads_for("iot/73bkTV/5ak8yGU7/properties/write");
        assert!(writes.iter().any(|w| w.contains("\"socSet\":1000")));
        assert!(writes.iter().any(|w| w.contains("\"minSoc\":600")));
    }

    #[test]
    fn test_time_sync_payload() {
        let (recorder, hub) = hub();
        hub.time_sync(1_700_000_000);
        let replies = recorder.payloads_for("iot/73bkTV/5ak8yGU7/time-sync/reply");
        assert_eq!(replies.len(), 1);
        let parsed: Value = serde_json::from_str(&replies[0]).expect("json");
        assert_eq!(parsed["zoneOffset"], "+00:00");
        assert_eq!(parsed["messageId"], 123);
        assert_eq!(parsed["timestamp"], 1_700_000_000);
    }

    #[test]
    fn test_retained_state_restore() {
        let (_recorder, mut hub) = hub();
        hub.handle_message("solarflow-hub/5ak8yGU7/control/batteryTarget", b"discharging");
        hub.handle_message("solarflow-hub/5ak8yGU7/control/lastFullTimestamp", b"1700000000");
        assert_eq!(hub.battery_target(), BatteryTarget::Discharging);
        assert!(hub.get_last_full_battery_hours() > 0.0);
    }

    #[test]
    fn test_night_consumption() {
        let (_recorder, mut hub) = hub();
        hub.set_sunset_soc(80);
        hub.set_sunrise_soc(35);
        assert_eq!(hub.get_night_consumption(), 45);
    }
}
