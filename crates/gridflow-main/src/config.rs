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

use anyhow::{Context, Result};
use std::path::Path;
use tracing::error;

use gridflow_types::AppConfig;

/// Load the configuration file; a missing file is fine (environment
/// variables and retained topics still apply), a malformed one is not.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            error!(
                "No configuration file ({}) found in execution directory! Using environment variables.",
                path.display()
            );
            return Ok(AppConfig::default());
        }
    };
    toml::from_str(&raw).with_context(|| format!("invalid configuration file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("defaults");
        assert!(config.mqtt.host.is_none());
    }

    #[test]
    fn test_full_file_parses() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
[mqtt]
host = "broker.local"
port = 1883

[hub]
device_id = "5ak8yGU7"
control_bypass = true

[dtu]
kind = "opendtu"
base_topic = "solar"
inverter_serial = "116491132532"
sf_inverter_channels = [1]

[smartmeter]
kind = "shelly3em"
base_topic = "shellies/shellyem3"

[control]
min_charge_power = 125
max_discharge_power = 145
battery_low = 10
battery_high = 98

[location]
latitude = 52.52
longitude = 13.405
timezone = "Europe/Berlin"
"#
        )
        .expect("write");

        let config = load_config(file.path()).expect("parse");
        assert_eq!(config.mqtt.host.as_deref(), Some("broker.local"));
        assert_eq!(config.control.min_charge_power, Some(125.0));
        let resolved = config.resolve().expect("resolve");
        assert_eq!(resolved.meter.base_topic, "shellies/shellyem3");
        assert_eq!(resolved.dtu.sf_inverter_channels, vec![1]);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "[mqtt\nhost=").expect("write");
        assert!(load_config(file.path()).is_err());
    }
}
