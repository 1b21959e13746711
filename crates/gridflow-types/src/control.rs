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

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============= DTU Type Enum =============

/// Supported microinverter gateway (DTU) types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DtuKind {
    /// OpenDTU gateway (plain integer limit payloads)
    OpenDtu,
    /// AhoyDTU gateway (limit payloads carry a "W" unit suffix)
    AhoyDtu,
}

impl DtuKind {
    /// Get human-readable name for the DTU type
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::OpenDtu => "OpenDTU",
            Self::AhoyDtu => "AhoyDTU",
        }
    }

    /// Get config string value (kebab-case)
    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::OpenDtu => "opendtu",
            Self::AhoyDtu => "ahoydtu",
        }
    }

    /// List all supported DTU types
    pub fn all() -> &'static [DtuKind] {
        &[Self::OpenDtu, Self::AhoyDtu]
    }
}

impl fmt::Display for DtuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for DtuKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "opendtu" => Ok(Self::OpenDtu),
            "ahoydtu" => Ok(Self::AhoyDtu),
            _ => Err(anyhow::anyhow!(
                "Unknown DTU type: '{}'. Supported types: {}",
                s,
                Self::all()
                    .iter()
                    .map(|t| t.to_config_value())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

// ============= Smart-meter Type Enum =============

/// Supported smart-meter front-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeterKind {
    /// Generic JSON meter readout with a dotted accessor path
    Smartmeter,
    /// VZLogger: a single topic carrying the current reading
    VzLogger,
    /// Shelly 3EM: one topic per phase
    Shelly3Em,
    /// Powerfox/Poweropti: polled over HTTPS instead of subscribed
    Powerfox,
}

impl MeterKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Smartmeter => "Smartmeter",
            Self::VzLogger => "VZLogger",
            Self::Shelly3Em => "Shelly 3EM",
            Self::Powerfox => "Powerfox",
        }
    }

    pub fn to_config_value(&self) -> &'static str {
        match self {
            Self::Smartmeter => "smartmeter",
            Self::VzLogger => "vzlogger",
            Self::Shelly3Em => "shelly3em",
            Self::Powerfox => "powerfox",
        }
    }

    pub fn all() -> &'static [MeterKind] {
        &[Self::Smartmeter, Self::VzLogger, Self::Shelly3Em, Self::Powerfox]
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for MeterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "smartmeter" => Ok(Self::Smartmeter),
            "vzlogger" => Ok(Self::VzLogger),
            "shelly3em" => Ok(Self::Shelly3Em),
            "powerfox" | "poweropti" => Ok(Self::Powerfox),
            _ => Err(anyhow::anyhow!(
                "Unknown smart-meter type: '{}'. Supported types: {}",
                s,
                Self::all()
                    .iter()
                    .map(|t| t.to_config_value())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

// ============= Hub Operating Enums =============

/// Where the battery should be heading, derived from SoC and policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatteryTarget {
    #[default]
    Idle,
    Charging,
    Discharging,
}

impl fmt::Display for BatteryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Charging => write!(f, "charging"),
            Self::Discharging => write!(f, "discharging"),
        }
    }
}

impl FromStr for BatteryTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "charging" => Ok(Self::Charging),
            "discharging" => Ok(Self::Discharging),
            _ => Err(anyhow::anyhow!("Unknown battery target: '{}'", s)),
        }
    }
}

/// Bypass mode as reported/written via the hub's `passMode` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BypassMode {
    #[default]
    Auto,
    ManualOff,
    ManualOn,
}

impl BypassMode {
    /// Decode the vendor's numeric `passMode` value
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Auto),
            1 => Some(Self::ManualOff),
            2 => Some(Self::ManualOn),
            _ => None,
        }
    }

    /// Encode for the vendor's `properties/write` payload
    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Auto => 0,
            Self::ManualOff => 1,
            Self::ManualOn => 2,
        }
    }
}

impl fmt::Display for BypassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::ManualOff => write!(f, "manual-off"),
            Self::ManualOn => write!(f, "manual-on"),
        }
    }
}

/// Charge-through cycle progress: idle -> charging -> discharging -> idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChargeThroughStage {
    #[default]
    Idle,
    Charging,
    Discharging,
}

impl fmt::Display for ChargeThroughStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Charging => write!(f, "charging"),
            Self::Discharging => write!(f, "discharging"),
        }
    }
}

impl FromStr for ChargeThroughStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "charging" => Ok(Self::Charging),
            "discharging" => Ok(Self::Discharging),
            _ => Err(anyhow::anyhow!("Unknown charge-through stage: '{}'", s)),
        }
    }
}

// ============= Control Settings =============

/// Runtime policy parameters of the control engine.
///
/// Seeded from config file and environment, then owned by the engine and
/// mutated only through the retained `control/*` topic update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Power reserved for charging whenever solar input allows it (W)
    #[serde(default = "default_min_charge_power")]
    pub min_charge_power: f64,
    /// Maximum battery discharge towards the house (W)
    #[serde(default = "default_max_discharge_power")]
    pub max_discharge_power: f64,
    /// Legal/configured cap for the inverter's AC output (W)
    #[serde(default = "default_max_inverter_limit")]
    pub max_inverter_limit: f64,
    /// Maximum power the hub may feed into the inverter (W)
    #[serde(default = "default_max_inverter_input")]
    pub max_inverter_input: f64,
    /// Lower anchor of the limited-growth ramp (W)
    #[serde(default = "default_inverter_start_limit")]
    pub inverter_start_limit: f64,
    /// Divisor of the limited-growth exponent; larger values ramp slower
    #[serde(default = "default_limited_rise_divisor")]
    pub limited_rise_divisor: f64,
    /// SoC floor for normal (non charge-through) cycling (%)
    #[serde(default = "default_battery_low")]
    pub battery_low: u32,
    /// SoC ceiling for normal (non charge-through) cycling (%)
    #[serde(default = "default_battery_high")]
    pub battery_high: u32,
    /// SoC required before morning discharge may start (%)
    #[serde(default = "default_battery_discharge_start")]
    pub battery_discharge_start: u32,
    /// Minutes after sunrise still treated as "night" for discharge policy
    #[serde(default = "default_sun_offset")]
    pub sunrise_offset_min: i64,
    /// Minutes before sunset already treated as "night"
    #[serde(default = "default_sun_offset")]
    pub sunset_offset_min: i64,
    /// Minimum spacing of decision-procedure runs (s)
    #[serde(default = "default_steering_interval")]
    pub steering_interval_secs: u64,
    /// Allow battery discharge outside the night window
    #[serde(default)]
    pub discharge_during_daytime: bool,
    /// Hours the battery may go without a full charge before a
    /// charge-through cycle is requested
    #[serde(default = "default_full_charge_interval")]
    pub full_charge_interval_hrs: u32,
}

fn default_min_charge_power() -> f64 {
    0.0
}
fn default_max_discharge_power() -> f64 {
    145.0
}
fn default_max_inverter_limit() -> f64 {
    800.0
}
fn default_max_inverter_input() -> f64 {
    400.0
}
fn default_inverter_start_limit() -> f64 {
    5.0
}
fn default_limited_rise_divisor() -> f64 {
    100_000.0
}
fn default_battery_low() -> u32 {
    10
}
fn default_battery_high() -> u32 {
    98
}
fn default_battery_discharge_start() -> u32 {
    10
}
fn default_sun_offset() -> i64 {
    60
}
fn default_steering_interval() -> u64 {
    15
}
fn default_full_charge_interval() -> u32 {
    72
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            min_charge_power: default_min_charge_power(),
            max_discharge_power: default_max_discharge_power(),
            max_inverter_limit: default_max_inverter_limit(),
            max_inverter_input: default_max_inverter_input(),
            inverter_start_limit: default_inverter_start_limit(),
            limited_rise_divisor: default_limited_rise_divisor(),
            battery_low: default_battery_low(),
            battery_high: default_battery_high(),
            battery_discharge_start: default_battery_discharge_start(),
            sunrise_offset_min: default_sun_offset(),
            sunset_offset_min: default_sun_offset(),
            steering_interval_secs: default_steering_interval(),
            discharge_during_daytime: false,
            full_charge_interval_hrs: default_full_charge_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtu_kind_roundtrip() {
        for kind in DtuKind::all() {
            assert_eq!(kind.to_config_value().parse::<DtuKind>().unwrap(), *kind);
        }
        assert!("fronius".parse::<DtuKind>().is_err());
    }

    #[test]
    fn test_meter_kind_accepts_legacy_name() {
        assert_eq!("poweropti".parse::<MeterKind>().unwrap(), MeterKind::Powerfox);
    }

    #[test]
    fn test_bypass_mode_raw_roundtrip() {
        for raw in 0..=2 {
            assert_eq!(BypassMode::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert!(BypassMode::from_raw(3).is_none());
    }

    #[test]
    fn test_control_settings_defaults() {
        let settings = ControlSettings::default();
        assert_eq!(settings.max_discharge_power, 145.0);
        assert_eq!(settings.max_inverter_limit, 800.0);
        assert_eq!(settings.battery_high, 98);
        assert_eq!(settings.steering_interval_secs, 15);
        assert!(!settings.discharge_during_daytime);
    }
}
