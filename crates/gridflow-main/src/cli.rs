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

use clap::Parser;
use std::path::PathBuf;

use gridflow_types::AppConfig;

/// Control agent for a Zendure Solarflow hub, a microinverter DTU and a
/// household smart meter
#[derive(Parser, Debug)]
#[command(name = "gridflow", version)]
pub struct Cli {
    /// MQTT broker host
    #[arg(short = 'b', long = "broker")]
    pub broker: Option<String>,

    /// MQTT broker port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// MQTT username
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// MQTT password
    #[arg(short = 's', long = "password")]
    pub password: Option<String>,

    /// Solarflow hub device id
    #[arg(short = 'd', long = "device")]
    pub device: Option<String>,

    /// Path to the configuration file
    #[arg(long = "config", default_value = "config.toml")]
    pub config: PathBuf,
}

impl Cli {
    /// Command-line flags beat the configuration file
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(broker) = &self.broker {
            config.mqtt.host = Some(broker.clone());
        }
        if let Some(port) = self.port {
            config.mqtt.port = Some(port);
        }
        if let Some(user) = &self.user {
            config.mqtt.username = Some(user.clone());
        }
        if let Some(password) = &self.password {
            config.mqtt.password = Some(password.clone());
        }
        if let Some(device) = &self.device {
            config.hub.device_id = Some(device.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "gridflow", "-b", "broker.local", "-p", "8883", "-d", "5ak8yGU7",
        ]);
        let mut config = AppConfig::default();
        config.mqtt.host = Some("other.host".into());
        cli.apply_to(&mut config);
        assert_eq!(config.mqtt.host.as_deref(), Some("broker.local"));
        assert_eq!(config.mqtt.port, Some(8883));
        assert_eq!(config.hub.device_id.as_deref(), Some("5ak8yGU7"));
    }
}
