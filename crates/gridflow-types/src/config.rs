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

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::control::{ControlSettings, DtuKind, MeterKind};

/// Default product id of the Solarflow HUB1200
pub const DEFAULT_PRODUCT_ID: &str = "73bkTV";
/// Product id of the Solarflow HUB2000 (needs the bypass-report workaround)
pub const HUB2000_PRODUCT_ID: &str = "A8yh63";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no MQTT broker configured (set [mqtt] host, MQTT_HOST or --broker)")]
    MissingBroker,
    #[error("no Solarflow device id configured (set [hub] device_id, SF_DEVICE_ID or --device)")]
    MissingDeviceId,
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

// ============= File-level Sections =============
//
// Every field is optional: the file wins over the environment, the
// environment wins over the built-in default. Resolution happens once at
// startup in `AppConfig::resolve`.

/// Top-level structure of `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub dtu: DtuSection,
    #[serde(default)]
    pub smartmeter: MeterSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub location: LocationSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqttSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSection {
    pub device_id: Option<String>,
    pub product_id: Option<String>,
    pub control_bypass: Option<bool>,
    pub control_soc: Option<bool>,
    pub allow_full_cycle: Option<bool>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DtuSection {
    pub kind: Option<DtuKind>,
    pub base_topic: Option<String>,
    pub inverter_serial: Option<String>,
    pub inverter_id: Option<u32>,
    pub inverter_name: Option<String>,
    pub inverter_max_power: Option<f64>,
    pub sf_inverter_channels: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterSection {
    pub kind: Option<MeterKind>,
    pub base_topic: Option<String>,
    pub cur_accessor: Option<String>,
    pub rapid_change_diff: Option<f64>,
    pub zero_offset: Option<f64>,
    pub scaling_factor: Option<f64>,
    pub powerfox_user: Option<String>,
    pub powerfox_password: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlSection {
    pub min_charge_power: Option<f64>,
    pub max_discharge_power: Option<f64>,
    pub max_inverter_limit: Option<f64>,
    pub max_inverter_input: Option<f64>,
    pub inverter_start_limit: Option<f64>,
    pub limited_rise_divisor: Option<f64>,
    pub battery_low: Option<u32>,
    pub battery_high: Option<u32>,
    pub battery_discharge_start: Option<u32>,
    pub sunrise_offset: Option<i64>,
    pub sunset_offset: Option<i64>,
    pub steering_interval: Option<u64>,
    pub discharge_during_daytime: Option<bool>,
    pub full_charge_interval: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationSection {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
}

// ============= Resolved Runtime Configuration =============

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mqtt: MqttSettings,
    pub hub: HubSettings,
    pub dtu: DtuSettings,
    pub meter: MeterSettings,
    pub control: ControlSettings,
    pub location: LocationSettings,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub device_id: String,
    pub product_id: String,
    pub control_bypass: bool,
    pub control_soc: bool,
    pub allow_full_cycle: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct DtuSettings {
    pub kind: DtuKind,
    pub base_topic: String,
    pub inverter_serial: Option<String>,
    pub inverter_id: u32,
    pub inverter_name: String,
    pub inverter_max_power: f64,
    pub sf_inverter_channels: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct MeterSettings {
    pub kind: MeterKind,
    pub base_topic: String,
    pub cur_accessor: String,
    pub rapid_change_diff: f64,
    pub zero_offset: f64,
    pub scaling_factor: f64,
    pub powerfox_user: Option<String>,
    pub powerfox_password: Option<String>,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LocationSettings {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: String,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl AppConfig {
    /// Resolve the layered configuration (file > environment > default) into
    /// concrete runtime settings.
    ///
    /// Broker host and hub device id are the only fatal omissions; everything
    /// else has a workable default. Retained `control/*` topics are applied
    /// later, on top of the result.
    pub fn resolve(&self) -> Result<RuntimeConfig, ConfigError> {
        let mqtt = MqttSettings {
            host: self
                .mqtt
                .host
                .clone()
                .or_else(|| env_str("MQTT_HOST"))
                .ok_or(ConfigError::MissingBroker)?,
            port: self
                .mqtt
                .port
                .or_else(|| env_parse("MQTT_PORT"))
                .unwrap_or(1883),
            username: self.mqtt.username.clone().or_else(|| env_str("MQTT_USER")),
            password: self.mqtt.password.clone().or_else(|| env_str("MQTT_PWD")),
        };

        let hub = HubSettings {
            device_id: self
                .hub
                .device_id
                .clone()
                .or_else(|| env_str("SF_DEVICE_ID"))
                .ok_or(ConfigError::MissingDeviceId)?,
            product_id: self
                .hub
                .product_id
                .clone()
                .or_else(|| env_str("SF_PRODUCT_ID"))
                .unwrap_or_else(|| DEFAULT_PRODUCT_ID.into()),
            control_bypass: self
                .hub
                .control_bypass
                .or_else(|| env_bool("CONTROL_BYPASS"))
                .unwrap_or(false),
            control_soc: self
                .hub
                .control_soc
                .or_else(|| env_bool("CONTROL_SOC"))
                .unwrap_or(false),
            allow_full_cycle: self
                .hub
                .allow_full_cycle
                .or_else(|| env_bool("ALLOW_FULL_CYCLE"))
                .unwrap_or(false),
            dry_run: self.hub.dry_run.unwrap_or(false),
        };

        let dtu_kind = match self.dtu.kind {
            Some(kind) => kind,
            None => match env_str("DTU_TYPE") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("DTU_TYPE: {e}")))?,
                None => DtuKind::OpenDtu,
            },
        };
        let dtu = DtuSettings {
            kind: dtu_kind,
            base_topic: self
                .dtu
                .base_topic
                .clone()
                .or_else(|| env_str("DTU_BASE_TOPIC"))
                .unwrap_or_else(|| "solar".into()),
            inverter_serial: self.dtu.inverter_serial.clone(),
            inverter_id: self.dtu.inverter_id.unwrap_or(0),
            inverter_name: self
                .dtu
                .inverter_name
                .clone()
                .unwrap_or_else(|| "inverter".into()),
            inverter_max_power: self.dtu.inverter_max_power.unwrap_or(-1.0),
            sf_inverter_channels: self.dtu.sf_inverter_channels.clone().unwrap_or_default(),
        };
        if dtu.kind == DtuKind::OpenDtu && dtu.inverter_serial.is_none() {
            return Err(ConfigError::Invalid(
                "OpenDTU requires [dtu] inverter_serial".into(),
            ));
        }

        let meter_kind = match self.smartmeter.kind {
            Some(kind) => kind,
            None => match env_str("SMARTMETER_TYPE") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("SMARTMETER_TYPE: {e}")))?,
                None => MeterKind::Smartmeter,
            },
        };
        let meter = MeterSettings {
            kind: meter_kind,
            base_topic: self
                .smartmeter
                .base_topic
                .clone()
                .unwrap_or_else(|| "smartmeter".into()),
            cur_accessor: self
                .smartmeter
                .cur_accessor
                .clone()
                .unwrap_or_else(|| "Power.Power_curr".into()),
            rapid_change_diff: self.smartmeter.rapid_change_diff.unwrap_or(500.0),
            zero_offset: self.smartmeter.zero_offset.unwrap_or(0.0),
            scaling_factor: self.smartmeter.scaling_factor.unwrap_or(1.0),
            powerfox_user: self.smartmeter.powerfox_user.clone(),
            powerfox_password: self.smartmeter.powerfox_password.clone(),
            poll_interval_secs: self.smartmeter.poll_interval_secs.unwrap_or(5),
        };
        if meter.kind == MeterKind::Powerfox
            && (meter.powerfox_user.is_none() || meter.powerfox_password.is_none())
        {
            return Err(ConfigError::Invalid(
                "Powerfox requires [smartmeter] powerfox_user and powerfox_password".into(),
            ));
        }

        let defaults = ControlSettings::default();
        let c = &self.control;
        let control = ControlSettings {
            min_charge_power: c
                .min_charge_power
                .or_else(|| env_parse("MIN_CHARGE_POWER"))
                .unwrap_or(defaults.min_charge_power),
            max_discharge_power: c
                .max_discharge_power
                .or_else(|| env_parse("MAX_DISCHARGE_POWER"))
                .unwrap_or(defaults.max_discharge_power),
            max_inverter_limit: c
                .max_inverter_limit
                .or_else(|| env_parse("MAX_INVERTER_LIMIT"))
                .unwrap_or(defaults.max_inverter_limit),
            max_inverter_input: c
                .max_inverter_input
                .or_else(|| env_parse("MAX_INVERTER_INPUT"))
                .unwrap_or(defaults.max_inverter_input),
            inverter_start_limit: c
                .inverter_start_limit
                .unwrap_or(defaults.inverter_start_limit),
            limited_rise_divisor: c
                .limited_rise_divisor
                .unwrap_or(defaults.limited_rise_divisor),
            battery_low: c
                .battery_low
                .or_else(|| env_parse("BATTERY_LOW"))
                .unwrap_or(defaults.battery_low),
            battery_high: c
                .battery_high
                .or_else(|| env_parse("BATTERY_HIGH"))
                .unwrap_or(defaults.battery_high),
            battery_discharge_start: c
                .battery_discharge_start
                .or_else(|| env_parse("BATTERY_DISCHARGE_START"))
                .unwrap_or(defaults.battery_discharge_start),
            sunrise_offset_min: c
                .sunrise_offset
                .or_else(|| env_parse("SUNRISE_OFFSET"))
                .unwrap_or(defaults.sunrise_offset_min),
            sunset_offset_min: c
                .sunset_offset
                .or_else(|| env_parse("SUNSET_OFFSET"))
                .unwrap_or(defaults.sunset_offset_min),
            steering_interval_secs: c
                .steering_interval
                .or_else(|| env_parse("STEERING_INTERVAL"))
                .unwrap_or(defaults.steering_interval_secs),
            discharge_during_daytime: c
                .discharge_during_daytime
                .or_else(|| env_bool("DISCHARGE_DURING_DAYTIME"))
                .unwrap_or(defaults.discharge_during_daytime),
            full_charge_interval_hrs: c
                .full_charge_interval
                .or_else(|| env_parse("FULL_CHARGE_INTERVAL"))
                .unwrap_or(defaults.full_charge_interval_hrs),
        };

        let location = LocationSettings {
            latitude: self.location.latitude.or_else(|| env_parse("LATITUDE")),
            longitude: self.location.longitude.or_else(|| env_parse("LONGITUDE")),
            timezone: self
                .location
                .timezone
                .clone()
                .unwrap_or_else(|| "Europe/Berlin".into()),
        };

        Ok(RuntimeConfig {
            mqtt,
            hub,
            dtu,
            meter,
            control,
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        AppConfig {
            mqtt: MqttSection {
                host: Some("broker.local".into()),
                ..Default::default()
            },
            hub: HubSection {
                device_id: Some("5ak8yGU7".into()),
                ..Default::default()
            },
            dtu: DtuSection {
                inverter_serial: Some("116491132532".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_minimal_config() {
        let cfg = minimal().resolve().expect("resolve");
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.hub.product_id, DEFAULT_PRODUCT_ID);
        assert_eq!(cfg.dtu.kind, DtuKind::OpenDtu);
        assert_eq!(cfg.meter.cur_accessor, "Power.Power_curr");
        assert_eq!(cfg.control.max_inverter_limit, 800.0);
        assert_eq!(cfg.location.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_resolve_requires_broker_and_device() {
        let mut cfg = minimal();
        cfg.mqtt.host = None;
        assert!(matches!(cfg.resolve(), Err(ConfigError::MissingBroker)));

        let mut cfg = minimal();
        cfg.hub.device_id = None;
        assert!(matches!(cfg.resolve(), Err(ConfigError::MissingDeviceId)));
    }

    #[test]
    fn test_resolve_rejects_opendtu_without_serial() {
        let mut cfg = minimal();
        cfg.dtu.inverter_serial = None;
        assert!(matches!(cfg.resolve(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_values_win() {
        let mut cfg = minimal();
        cfg.control.max_discharge_power = Some(200.0);
        cfg.control.battery_high = Some(95);
        let resolved = cfg.resolve().expect("resolve");
        assert_eq!(resolved.control.max_discharge_power, 200.0);
        assert_eq!(resolved.control.battery_high, 95);
    }
}
