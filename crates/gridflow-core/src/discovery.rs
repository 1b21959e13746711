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

use serde_json::{json, Value};

use crate::bridge::{publish_or_log, SharedPublisher};

struct SensorSpec {
    property: &'static str,
    name: &'static str,
    unit: &'static str,
    device_class: &'static str,
}

const HUB_SENSORS: &[SensorSpec] = &[
    SensorSpec {
        property: "electricLevel",
        name: "Battery SoC",
        unit: "%",
        device_class: "battery",
    },
    SensorSpec {
        property: "solarInputPower",
        name: "Solar Input Power",
        unit: "W",
        device_class: "power",
    },
    SensorSpec {
        property: "outputPackPower",
        name: "Battery Charge Power",
        unit: "W",
        device_class: "power",
    },
    SensorSpec {
        property: "packInputPower",
        name: "Battery Discharge Power",
        unit: "W",
        device_class: "power",
    },
    SensorSpec {
        property: "outputHomePower",
        name: "Home Output Power",
        unit: "W",
        device_class: "power",
    },
    SensorSpec {
        property: "outputLimit",
        name: "Home Output Limit",
        unit: "W",
        device_class: "power",
    },
];

fn device_block(device_id: &str, fw_version: &str) -> Value {
    json!({
        "identifiers": [format!("solarflow-hub-{device_id}")],
        "name": format!("Solarflow Hub {device_id}"),
        "manufacturer": "Zendure",
        "model": "SolarFlow",
        "sw_version": fw_version,
    })
}

/// Publish retained Home Assistant MQTT-discovery payloads for the hub's
/// telemetry and for each known battery pack. Re-run periodically and on
/// firmware-version changes; retained duplicates are harmless.
pub fn publish_discovery(
    publisher: &SharedPublisher,
    device_id: &str,
    fw_version: &str,
    battery_serials: &[String],
) {
    let device = device_block(device_id, fw_version);

    for sensor in HUB_SENSORS {
        let object_id = format!("solarflow-hub-{device_id}-{}", sensor.property);
        let config = json!({
            "name": sensor.name,
            "state_topic": format!("solarflow-hub/{device_id}/telemetry/{}", sensor.property),
            "unique_id": object_id.clone(),
            "unit_of_measurement": sensor.unit,
            "device_class": sensor.device_class,
            "state_class": "measurement",
            "device": device.clone(),
        });
        publish_or_log(
            publisher,
            &format!("homeassistant/sensor/{object_id}/config"),
            config.to_string(),
            true,
        );
    }

    for (index, serial) in battery_serials.iter().enumerate() {
        let specs = [
            ("socLevel", format!("Battery {} SoC", index + 1), "%", "battery"),
            ("totalVol", format!("Battery {} Voltage", index + 1), "V", "voltage"),
        ];
        for (property, name, unit, device_class) in specs {
            let object_id = format!("solarflow-hub-{device_id}-{serial}-{property}");
            let config = json!({
                "name": name,
                "state_topic":
                    format!("solarflow-hub/{device_id}/telemetry/batteries/{serial}/{property}"),
                "unique_id": object_id.clone(),
                "unit_of_measurement": unit,
                "device_class": device_class,
                "state_class": "measurement",
                "device": device.clone(),
            });
            publish_or_log(
                publisher,
                &format!("homeassistant/sensor/{object_id}/config"),
                config.to_string(),
                true,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingPublisher;

    #[test]
    fn test_discovery_payloads_retained_and_linked() {
        let (recorder, publisher) = RecordingPublisher::shared();
        publish_discovery(&publisher, "5ak8yGU7", "2.1.14", &["CO4X1234".into()]);

        let messages = recorder.messages.lock();
        // six hub sensors plus two per battery
        assert_eq!(messages.len(), 8);
        assert!(messages.iter().all(|(_, _, retain)| *retain));

        let (topic, payload, _) = messages
            .iter()
            .find(|(t, _, _)| t.contains("solarInputPower"))
            .expect("solar sensor config");
        assert_eq!(
            topic,
            "homeassistant/sensor/solarflow-hub-5ak8yGU7-solarInputPower/config"
        );
        let parsed: serde_json::Value = serde_json::from_str(payload).expect("json");
        assert_eq!(
            parsed["state_topic"],
            "solarflow-hub/5ak8yGU7/telemetry/solarInputPower"
        );
        assert_eq!(parsed["device"]["sw_version"], "2.1.14");
    }
}
