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

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::time::Instant;
use tracing::{debug, info};

use crate::bridge::{EngineEvent, EngineEventChannel, SharedPublisher, TriggerChannel};
use crate::discovery;
use crate::dtu::Dtu;
use crate::hub::Hub;
use crate::smartmeter::Smartmeter;
use crate::sun::SunClock;
use gridflow_types::{BatteryTarget, ControlSettings};

/// Demand below this is not worth asking the hub for (W)
const MIN_HUB_ASK: f64 = 5.0;
/// Window after sunrise/before sunset within which the SoC bookmarks are
/// taken and the morning routine runs
const SUN_EVENT_WINDOW: i64 = 3;

/// The closed-loop control engine.
///
/// Owns all mutable control state; every inbound message, timer tick and
/// polled sample is funneled through `run`, so the decision procedure is
/// never interleaved with itself.
pub struct ControlEngine {
    pub hub: Hub,
    pub dtu: Dtu,
    pub meter: Smartmeter,
    settings: ControlSettings,
    sun: SunClock,
    publisher: SharedPublisher,
    triggers: TriggerChannel,
    last_trigger_ts: Option<Instant>,
}

impl ControlEngine {
    pub fn new(
        hub: Hub,
        dtu: Dtu,
        meter: Smartmeter,
        settings: ControlSettings,
        sun: SunClock,
        publisher: SharedPublisher,
        triggers: TriggerChannel,
    ) -> Self {
        Self {
            hub,
            dtu,
            meter,
            settings,
            sun,
            publisher,
            triggers,
            last_trigger_ts: None,
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Drain the event queue until shutdown. This is the single serialized
    /// decision path; nothing else mutates the models.
    pub async fn run(mut self, mut events: EngineEventChannel) {
        info!("✅ Control engine running");
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Message { topic, payload } => self.dispatch(&topic, &payload),
                EngineEvent::MeterSample(watts) => {
                    self.meter.ingest_sample("poweropti", watts);
                    self.after_dispatch();
                }
                EngineEvent::HubRefreshTick => self.hub.request_full_report(),
                EngineEvent::SafetyTick => {
                    self.limit_home_input();
                    self.hub.publish_state();
                }
                EngineEvent::DiscoveryTick => self.publish_discovery(),
                EngineEvent::Shutdown => break,
            }
        }
        info!("👋 Control engine stopped");
    }

    /// Deliver one inbound bus message to every model and to the engine's
    /// own control-parameter handler.
    pub fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        self.hub.handle_message(topic, payload);
        self.dtu.handle_message(topic, payload);
        self.meter.handle_message(topic, payload);
        self.handle_control(topic, payload);
        self.after_dispatch();
    }

    fn after_dispatch(&mut self) {
        if self.hub.take_fw_updated() {
            self.publish_discovery();
        }
        if let Some(request) = self.triggers.drain() {
            debug!("🔁 Trigger from {:?} (force: {})", request.source, request.force);
            self.limit_callback(request.force);
        }
        // aggressively avoid feed-in when it is the battery paying for it
        if self.meter.feed_in_persisting() && self.hub.get_discharge_power() > 0.0 {
            self.limit_callback(false);
        }
    }

    /// Live updates of the retained control parameters
    fn handle_control(&mut self, topic: &str, payload: &[u8]) {
        if !topic.starts_with("solarflow-hub") || !topic.contains("/control/") {
            return;
        }
        let Ok(value) = std::str::from_utf8(payload) else {
            return;
        };
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let parameter = topic.rsplit('/').next().unwrap_or_default();
        match parameter {
            "sunriseOffset" => {
                if let Ok(minutes) = value.parse() {
                    if self.settings.sunrise_offset_min != minutes {
                        info!("🔧 Updating SUNRISE_OFFSET to {} minutes", minutes);
                    }
                    self.settings.sunrise_offset_min = minutes;
                }
            }
            "sunsetOffset" => {
                if let Ok(minutes) = value.parse() {
                    if self.settings.sunset_offset_min != minutes {
                        info!("🔧 Updating SUNSET_OFFSET to {} minutes", minutes);
                    }
                    self.settings.sunset_offset_min = minutes;
                }
            }
            "minChargePower" => {
                if let Ok(watts) = value.parse() {
                    if self.settings.min_charge_power != watts {
                        info!("🔧 Updating MIN_CHARGE_POWER to {}W", watts);
                    }
                    self.settings.min_charge_power = watts;
                }
            }
            "maxDischargePower" => {
                if let Ok(watts) = value.parse() {
                    if self.settings.max_discharge_power != watts {
                        info!("🔧 Updating MAX_DISCHARGE_POWER to {}W", watts);
                    }
                    self.settings.max_discharge_power = watts;
                }
            }
            "dischargeDuringDaytime" => {
                let on = matches!(value.to_lowercase().as_str(), "true" | "1" | "on");
                if self.settings.discharge_during_daytime != on {
                    info!("🔧 Updating DISCHARGE_DURING_DAYTIME to {}", on);
                }
                self.settings.discharge_during_daytime = on;
            }
            "batteryTargetSoCMin" => {
                if let Ok(level) = value.parse() {
                    if self.settings.battery_low != level {
                        info!("🔧 Updating BATTERY_LOW to {}%", level);
                    }
                    self.settings.battery_low = level;
                    self.hub.apply_configured_low(level);
                }
            }
            "batteryTargetSoCMax" => {
                if let Ok(level) = value.parse() {
                    if self.settings.battery_high != level {
                        info!("🔧 Updating BATTERY_HIGH to {}%", level);
                    }
                    self.settings.battery_high = level;
                    self.hub.apply_configured_high(level);
                }
            }
            "controlBypass" => {
                let on = matches!(value.to_lowercase().as_str(), "true" | "1" | "on");
                info!("🔧 Updating control bypass to {}", on);
                self.hub.set_control_bypass(on);
            }
            "fullChargeInterval" => {
                if let Ok(hours) = value.parse() {
                    info!("🔧 Updating full charge interval to {}hrs", hours);
                    self.settings.full_charge_interval_hrs = hours;
                    self.hub.upd_full_charge_interval(hours);
                }
            }
            _ => {}
        }
    }

    /// Rate-limited entry into the decision procedure.
    ///
    /// Returns whether a decision pass actually ran.
    pub fn limit_callback(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let Some(last) = self.last_trigger_ts else {
            self.last_trigger_ts = Some(now);
            self.limit_home_input();
            return true;
        };
        if force && self.dtu.has_pending_update() {
            info!("🔁 Force update blocked due to pending DTU update!");
            return false;
        }
        let elapsed = now.duration_since(last).as_secs_f64();
        if elapsed >= self.settings.steering_interval_secs as f64 || force {
            self.last_trigger_ts = Some(now);
            self.limit_home_input();
            true
        } else {
            false
        }
    }

    pub fn limit_home_input(&mut self) {
        let now = self.sun.now();
        self.limit_home_input_at(now);
    }

    fn publish_discovery(&self) {
        discovery::publish_discovery(
            &self.publisher,
            self.hub.device_id(),
            self.hub.fw_version(),
            &self.hub.battery_serials(),
        );
    }

    // ============= Decision Procedure =============

    /// Exponential saturation towards the maximum inverter limit; keeps the
    /// ramp-up gentle in low light instead of slamming the limit open.
    fn limited_rise(&self, x: f64) -> f64 {
        let max = self.settings.max_inverter_limit;
        let start = self.settings.inverter_start_limit;
        let rise = max - (max - start) * (-max / self.settings.limited_rise_divisor * x).exp();
        debug!("🔆 Adjusting inverter limit from {:.1}W to {:.1}W", x, rise);
        rise
    }

    /// Safe per-channel limit for the directly connected panels
    fn get_direct_panel_limit(&mut self) -> f64 {
        let efficiency = self.dtu.efficiency();
        let bypass = self.hub.get_bypass();
        // a hub in bypass feeds solar straight through: treat its channels
        // like direct panels
        let direct_panel_power = self.dtu.direct_dc_power() * efficiency
            + if bypass {
                self.dtu.hub_dc_power() * efficiency
            } else {
                0.0
            };
        if direct_panel_power < self.settings.max_inverter_limit {
            let mut dc_values = self.dtu.direct_dc_power_values();
            if bypass {
                dc_values.extend(self.dtu.hub_dc_power_values());
            }
            let max_channel_ac =
                dc_values.iter().copied().fold(0.0_f64, f64::max) * efficiency;
            if self.meter.get_power() - self.meter.zero_offset < 0.0 {
                max_channel_ac.ceil()
            } else {
                self.limited_rise(max_channel_ac)
            }
        } else {
            self.settings.max_inverter_limit * self.dtu.n_hub_channels() as f64
                / self.dtu.n_producing_channels() as f64
        }
    }

    /// How much the hub is willing to contribute towards `demand`, factoring
    /// in bypass, charge reservation and the day/night discharge policy.
    ///
    /// Also carries the sunrise/sunset side effects: SoC bookmarks, hub
    /// clock sync, the morning reset and the full-charge check.
    fn get_sf_power_limit(&mut self, demand: f64, now: DateTime<Tz>) -> f64 {
        let soc = self.hub.get_electric_level();
        let solar = self.hub.get_solar_input_power();
        let (sunrise, sunset) = self.sun.sun_times(now.date_naive());
        let sunrise_off = Duration::minutes(self.settings.sunrise_offset_min);
        let sunset_off = Duration::minutes(self.settings.sunset_offset_min);
        let night = now < sunrise + sunrise_off || now > sunset - sunset_off;
        let mut path = String::new();

        // fallback in case bypass is not yet identifiable after a change
        let mut limit = self.hub.get_limit();

        if self.hub.get_bypass() {
            path.push_str("0.");
            // leave bypass outside the solar window once the house needs
            // more than the panels deliver
            if night && self.hub.control_bypass && demand > solar {
                self.hub.set_allow_bypass(false);
                self.hub.set_bypass(false);
                path.push_str("1.");
            } else {
                path.push_str("2.");
                limit = self.hub.get_inverse_max_power();
            }
        }

        if !self.hub.get_bypass() {
            if solar - demand > self.settings.min_charge_power {
                path.push_str("1.");
                if solar - self.settings.min_charge_power < self.settings.max_discharge_power {
                    path.push_str("1.");
                    limit = demand.min(self.settings.max_discharge_power);
                } else {
                    path.push_str("2.");
                    limit = demand.min(solar - self.settings.min_charge_power);
                }
            }
            if solar - demand <= self.settings.min_charge_power {
                path.push_str("2.");
                if night || self.settings.discharge_during_daytime {
                    path.push_str("1.");
                    // right after sunrise a battery that has barely started
                    // charging must not be drained again
                    if sunrise < now
                        && now < sunrise + sunrise_off
                        && soc <= self.settings.battery_discharge_start as i64
                        && self.hub.battery_target() != BatteryTarget::Discharging
                    {
                        path.push_str("1.");
                        limit = 0.0;
                    } else {
                        path.push_str("2.");
                        limit = demand.min(self.settings.max_discharge_power);
                    }
                } else {
                    path.push_str("2.");
                    limit = (solar - self.settings.min_charge_power).max(0.0);
                }
            }
            if demand < 0.0 {
                limit = 0.0;
            }
        }

        let window = Duration::minutes(SUN_EVENT_WINDOW);
        if now > sunset && now < sunset + window {
            self.hub.set_sunset_soc(soc);
        }
        if now > sunrise && now < sunrise + window {
            self.hub.set_sunrise_soc(soc);
            info!(
                "🌅 Good morning! We have consumed {}% of the battery tonight!",
                self.hub.get_night_consumption()
            );
            let epoch = Utc::now().timestamp();
            info!("🕒 Syncing time of solarflow hub (UTC): {}", epoch);
            self.hub.time_sync(epoch);
            self.hub.force_battery_target(BatteryTarget::Charging);

            // sometimes bypass resets to default (auto)
            if self.hub.control_bypass {
                self.hub.set_allow_bypass(true);
                self.hub.set_bypass(false);
                self.hub.set_autorecover(false);
            }

            let daylight = (sunset - sunrise).num_seconds() as f64 / 3600.0;
            self.hub.check_charge_through(daylight);
        }

        info!(
            "🔆 Based on time, solarpower ({:4.1}W), minimum charge power ({}W) and bypass state ({}), hub could contribute {:4.1}W - Decision path: {}",
            solar, self.settings.min_charge_power, self.hub.get_bypass(), limit, path
        );
        limit
    }

    /// One full decision pass: compute and apply (inverter limit, hub limit)
    /// from the current household demand.
    pub fn limit_home_input_at(&mut self, now: DateTime<Tz>) {
        info!("{}", self.hub);
        info!("{}", self.dtu);
        info!("{}", self.meter);

        // ensure we have data to work on
        if !(self.hub.ready() && self.dtu.ready() && self.meter.ready()) {
            info!("⏳ Models not ready yet, skipping control step");
            return;
        }

        let mut inv_limit = self.dtu.get_limit();
        let mut hub_limit = self.hub.get_limit();
        let mut direct_limit: Option<f64> = None;

        let efficiency = self.dtu.efficiency();
        // DC below 10W is treated as 0 to avoid flapping in very low light
        let mut direct_panel_power = self.dtu.direct_dc_power() * efficiency;
        if direct_panel_power < 10.0 {
            direct_panel_power = 0.0;
        }
        let hub_power = self.dtu.hub_dc_power() * efficiency;

        let grid_power = self.meter.get_power() - self.meter.zero_offset;
        let demand = grid_power + direct_panel_power + hub_power;
        let remainder = demand - direct_panel_power - hub_power;
        let hub_contribution_ask = (hub_power + remainder).max(0.0);

        if direct_panel_power > 0.0 {
            if demand < direct_panel_power {
                info!(
                    "🔆 Direct connected panels ({:.1}W) can cover demand ({:.1}W)",
                    direct_panel_power, demand
                );
                direct_limit = Some(self.get_direct_panel_limit());
                hub_limit = self.hub.set_output_limit(0.0);
            } else {
                info!(
                    "🔆 Direct connected panels ({:.1}W) can't cover demand ({:.1}W), trying to get {:.1}W from hub.",
                    direct_panel_power, demand, hub_contribution_ask
                );
                if hub_contribution_ask > MIN_HUB_ASK {
                    let max_direct_ac = self
                        .dtu
                        .direct_dc_power_values()
                        .iter()
                        .copied()
                        .fold(0.0_f64, f64::max)
                        * efficiency;
                    let near_channel_limit = self.dtu.is_within(
                        max_direct_ac,
                        self.dtu.channel_limit(),
                        10.0 * self.dtu.n_total_channels() as f64,
                    );
                    if near_channel_limit {
                        // panels may still have headroom; raise the inverter
                        // limit towards them before opening the battery
                        info!(
                            "🔆 Max direct channel power {:.1}W is close to the channel limit {:.1}W, trying to get more from direct panels.",
                            max_direct_ac,
                            self.dtu.channel_limit()
                        );
                        let sf_contribution = self.get_sf_power_limit(hub_contribution_ask, now);
                        hub_limit = self.hub.get_limit();
                        if sf_contribution < hub_limit {
                            hub_limit = self.hub.set_output_limit(sf_contribution);
                        }
                        direct_limit = Some(self.get_direct_panel_limit());
                    } else {
                        let mut sf_contribution = self.get_sf_power_limit(hub_contribution_ask, now);
                        if sf_contribution * efficiency + direct_panel_power > self.dtu.ac_limit {
                            info!(
                                "🔆 Hub could contribute {:.1}W, but this would exceed the configured AC limit ({:.0}W), so only asking for {:.1}W",
                                sf_contribution,
                                self.dtu.ac_limit,
                                self.dtu.ac_limit - direct_panel_power
                            );
                            sf_contribution = self.dtu.ac_limit - direct_panel_power;
                        }
                        let n_hub_channels = self.dtu.n_hub_channels().max(1) as f64;
                        // per-channel comparison: the inverter spreads one
                        // absolute cap across all MPPTs symmetrically
                        if sf_contribution / n_hub_channels >= max_direct_ac {
                            info!(
                                "🔆 Hub should contribute more ({:.1}W) than the panel max ({:.1}W), we will use the inverter for fast/precise limiting!",
                                sf_contribution, max_direct_ac
                            );
                            hub_limit = if self.hub.get_bypass() {
                                self.hub.set_output_limit(0.0)
                            } else {
                                let open = self.hub.get_inverse_max_power();
                                self.hub.set_output_limit(open)
                            };
                            direct_limit = Some(sf_contribution / n_hub_channels);
                        } else {
                            hub_limit = if self.hub.get_bypass() {
                                self.hub.set_output_limit(0.0)
                            } else {
                                self.hub.set_output_limit(sf_contribution)
                            };
                            info!(
                                "🔆 Hub is willing to contribute {:.1}W of the requested {:.1}W!",
                                hub_limit.min(hub_contribution_ask),
                                hub_contribution_ask
                            );
                            direct_limit = Some(self.get_direct_panel_limit());
                        }
                    }
                }
            }
        } else {
            // likely no sun: everything comes from the hub; open it wide and
            // let the inverter do the precise limiting
            info!(
                "🔆 Direct connected panels are producing {:.1}W, trying to get {:.1}W from hub.",
                direct_panel_power, hub_contribution_ask
            );
            let sf_contribution = self.get_sf_power_limit(hub_contribution_ask, now);
            let open = self.hub.get_inverse_max_power();
            hub_limit = self.hub.set_output_limit(open);
            direct_limit = Some(sf_contribution / self.dtu.n_hub_channels().max(1) as f64);
            info!(
                "🔆 Solarflow is willing to contribute {:.1}W (per channel) of the requested {:.1}W!",
                hub_limit.min(direct_limit.unwrap_or_default()),
                hub_contribution_ask
            );
        }

        if let Some(direct_limit) = direct_limit {
            let mut limit = direct_limit;
            // keep the hub limit slightly above the inverter limit so the
            // MPPT doesn't hunt between the two caps
            if hub_limit > direct_limit && direct_limit > hub_limit - 10.0 {
                limit = hub_limit - 10.0;
            }
            if direct_limit < hub_limit - 10.0 && hub_limit < self.hub.get_inverse_max_power() {
                limit = hub_limit - 10.0;
            }
            inv_limit = self.dtu.set_limit(limit, grid_power);
        }

        if remainder < 0.0 {
            let mut source = format!("unknown: {:.1}W", -remainder);
            if direct_panel_power == 0.0 && hub_power > 0.0 && self.hub.get_discharge_power() > 0.0
            {
                source = format!("battery: {:.1}W", -grid_power);
            }
            // the inverter limit is rarely zero, so a trickle of 10-15W from
            // the hub is normal and not worth calling out
            if direct_panel_power == 0.0
                && hub_power > 15.0
                && self.hub.get_discharge_power() == 0.0
                && !self.hub.get_bypass()
            {
                source = format!("hub solarpower: {:.1}W", -grid_power);
            }
            if direct_panel_power > 0.0
                && hub_power > 15.0
                && self.hub.get_discharge_power() == 0.0
                && self.hub.get_bypass()
            {
                source = format!("hub bypass: {:.1}W", -grid_power);
            }
            if direct_panel_power > 0.0 && hub_power < 15.0 {
                source = format!("panels connected directly to inverter: {:.1}W", -remainder);
            }
            info!("⚠️ Grid feed in from {}!", source);
        }

        let (sunrise, sunset) = self.sun.sun_times(now.date_naive());
        info!(
            "☀️ Sun: {} - {} Demand: {:.1}W, Panel DC: ({:.1}W), Hub DC: ({:.1}W), Inverter Limit: {:.1}W, Hub Limit: {:.1}W",
            sunrise.format("%H:%M"),
            sunset.format("%H:%M"),
            demand,
            direct_panel_power,
            hub_power,
            inv_limit,
            hub_limit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TriggerSender;
    use crate::smartmeter::Smartmeter;
    use crate::testutil::RecordingPublisher;
    use gridflow_types::{
        DtuKind, DtuSettings, HubSettings, MeterKind, MeterSettings,
    };
    use std::sync::Arc;

    fn build_engine() -> (Arc<RecordingPublisher>, ControlEngine) {
        let (recorder, publisher) = RecordingPublisher::shared();
        let (trigger, triggers) = TriggerSender::new();

        let hub_settings = HubSettings {
            device_id: "5ak8yGU7".into(),
            product_id: "73bkTV".into(),
            control_bypass: false,
            control_soc: true,
            allow_full_cycle: false,
            dry_run: false,
        };
        let dtu_settings = DtuSettings {
            kind: DtuKind::OpenDtu,
            base_topic: "solar".into(),
            inverter_serial: Some("116491132532".into()),
            inverter_id: 0,
            inverter_name: "inverter".into(),
            inverter_max_power: -1.0,
            sf_inverter_channels: vec![1],
        };
        let meter_settings = MeterSettings {
            kind: MeterKind::VzLogger,
            base_topic: "tele/meter".into(),
            cur_accessor: "Power.Power_curr".into(),
            rapid_change_diff: 500.0,
            zero_offset: 0.0,
            scaling_factor: 1.0,
            powerfox_user: None,
            powerfox_password: None,
            poll_interval_secs: 5,
        };
        let mut settings = ControlSettings::default();
        settings.min_charge_power = 125.0;
        settings.battery_high = 98;
        settings.battery_low = 10;

        let hub = Hub::new(&hub_settings, 10, 98, 72, trigger.clone(), publisher.clone());
        let dtu = Dtu::new(&dtu_settings, 800.0, trigger.clone(), publisher.clone());
        let meter = Smartmeter::new(&meter_settings, trigger, publisher.clone());
        let sun = SunClock::new(52.52, 13.405, "Europe/Berlin").expect("tz");
        let engine = ControlEngine::new(hub, dtu, meter, settings, sun, publisher, triggers);
        (recorder, engine)
    }

    #[test]
    fn test_rate_limit_one_run_per_interval() {
        let (_recorder, mut engine) = build_engine();
        assert!(engine.limit_callback(false), "first call always runs");
        assert!(!engine.limit_callback(false), "second call within interval is skipped");
    }

    #[test]
    fn test_force_bypasses_rate_limit() {
        let (_recorder, mut engine) = build_engine();
        assert!(engine.limit_callback(false));
        assert!(engine.limit_callback(true));
    }

    #[test]
    fn test_not_ready_is_a_no_op() {
        let (recorder, mut engine) = build_engine();
        recorder.clear();
        engine.limit_home_input();
        // neither actuator was touched
        let limits: Vec<_> = recorder
            .messages
            .lock()
            .iter()
            .filter(|(t, _, _)| t.contains("limit") || t.contains("properties/write"))
            .cloned()
            .collect();
        assert!(limits.is_empty());
    }

    #[test]
    fn test_control_topic_updates_settings() {
        let (_recorder, mut engine) = build_engine();
        engine.dispatch("solarflow-hub/5ak8yGU7/control/maxDischargePower", b"200");
        assert_eq!(engine.settings().max_discharge_power, 200.0);
        engine.dispatch("solarflow-hub/5ak8yGU7/control/dischargeDuringDaytime", b"true");
        assert!(engine.settings().discharge_during_daytime);
        engine.dispatch("solarflow-hub/5ak8yGU7/control/sunriseOffset", b"90");
        assert_eq!(engine.settings().sunrise_offset_min, 90);
    }

    #[test]
    fn test_limited_rise_bounds() {
        let (_recorder, engine) = build_engine();
        let low = engine.limited_rise(0.0);
        assert!((low - engine.settings().inverter_start_limit).abs() < 1e-6);
        let high = engine.limited_rise(100_000.0);
        assert!(high <= engine.settings().max_inverter_limit);
        assert!(high > engine.settings().max_inverter_limit * 0.95);
        assert!(engine.limited_rise(200.0) < engine.limited_rise(400.0));
    }
}
