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

mod cli;
mod config;
mod geoip;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use gridflow_core::bridge::{EngineEvent, EngineEventSender, TriggerSender};
use gridflow_core::{ControlEngine, Dtu, Hub, PowerfoxPoller, RepeatingTimer, Smartmeter, SunClock};
use gridflow_mqtt::MqttBus;
use gridflow_types::{MeterKind, RuntimeConfig};

/// How long retained control topics are collected before the static
/// configuration fills the gaps
const RETAINED_DRAIN_WINDOW: Duration = Duration::from_secs(5);
const HUB_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const SAFETY_TICK_INTERVAL: Duration = Duration::from_secs(120);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with env filter support
    // Respects RUST_LOG environment variable
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = cli::Cli::parse();
    let mut app_config = config::load_config(&cli.config)?;
    cli.apply_to(&mut app_config);
    let runtime = app_config.resolve()?;

    info!("🚀 Starting GridFlow - Solarflow hub control");
    info!("📋 Configuration Summary:");
    info!("   MQTT Host: {}:{}", runtime.mqtt.host, runtime.mqtt.port);
    if runtime.mqtt.username.is_none() || runtime.mqtt.password.is_none() {
        info!("   MQTT User is not set, assuming authentication not needed");
    }
    info!(
        "   Solarflow Hub: {}/{}",
        runtime.hub.product_id, runtime.hub.device_id
    );
    info!("   DTU: {} on {}", runtime.dtu.kind, runtime.dtu.base_topic);
    info!("   Smartmeter: {}", runtime.meter.kind);

    let (latitude, longitude) = resolve_location(&runtime).await;
    let sun = SunClock::new(latitude, longitude, &runtime.location.timezone)?;

    // connect and read retained control settings first; they beat the
    // static configuration and enable on-the-fly updates
    let (bus, mut eventloop) = MqttBus::connect(&runtime.mqtt);
    bus.subscribe(&format!(
        "solarflow-hub/{}/control/#",
        runtime.hub.device_id
    ))
    .await?;
    info!("📡 Reading retained config settings from MQTT...");
    info!("📡 Note: GridFlow persists initial configuration settings in your MQTT broker and will use those first (if found) to allow on-the-fly updates!");
    info!("📡 If you want to override these values from your config file you need to clear those retained topics in your broker first!");
    let retained = gridflow_mqtt::drain_retained(&mut eventloop, RETAINED_DRAIN_WINDOW).await;

    let (events, event_channel) = EngineEventSender::new();
    let (trigger, triggers) = TriggerSender::new();
    let publisher = bus.publisher();

    let hub = Hub::new(
        &runtime.hub,
        runtime.control.battery_low,
        runtime.control.battery_high,
        runtime.control.full_charge_interval_hrs,
        trigger.clone(),
        publisher.clone(),
    );
    let dtu = Dtu::new(
        &runtime.dtu,
        runtime.control.max_inverter_limit,
        trigger.clone(),
        publisher.clone(),
    );
    let meter = Smartmeter::new(&runtime.meter, trigger, publisher.clone());

    let mut engine = ControlEngine::new(
        hub,
        dtu,
        meter,
        runtime.control.clone(),
        sun,
        publisher.clone(),
        triggers,
    );

    // replay the retained control topics through the normal dispatch path,
    // then seed (and persist) whatever was not found on the broker
    for (topic, value) in &retained {
        engine.dispatch(topic, value.as_bytes());
    }
    seed_control_params(engine.settings(), &publisher, &retained, &runtime.hub.device_id);

    let settings = engine.settings();
    info!("🔧 Control Parameters:");
    info!("   MIN_CHARGE_POWER = {}", settings.min_charge_power);
    info!("   MAX_DISCHARGE_POWER = {}", settings.max_discharge_power);
    info!("   MAX_INVERTER_LIMIT = {}", settings.max_inverter_limit);
    info!("   MAX_INVERTER_INPUT = {}", settings.max_inverter_input);
    info!("   SUNRISE_OFFSET = {}", settings.sunrise_offset_min);
    info!("   SUNSET_OFFSET = {}", settings.sunset_offset_min);
    info!("   BATTERY_LOW = {}", settings.battery_low);
    info!("   BATTERY_HIGH = {}", settings.battery_high);
    info!(
        "   BATTERY_DISCHARGE_START = {}",
        settings.battery_discharge_start
    );
    info!(
        "   DISCHARGE_DURING_DAYTIME = {}",
        settings.discharge_during_daytime
    );

    // subscribe the models' topics so they can react to received messages
    bus.subscribe_all(&engine.hub.subscriptions()).await?;
    bus.subscribe_all(&engine.dtu.subscriptions()).await?;
    bus.subscribe_all(&engine.meter.subscriptions()).await?;

    // bring the hub into a known state
    let battery_high = engine.settings().battery_high;
    let battery_low = engine.settings().battery_low;
    let max_inverter_input = engine.settings().max_inverter_input;
    if !engine.hub.charge_through() {
        engine.hub.set_battery_high_soc(battery_high, false);
        engine.hub.set_battery_low_soc(battery_low, false);
    }
    // the buzzer acknowledges every settings write; nobody wants that
    engine.hub.set_buzzer(false);
    engine.hub.set_inverse_max_power(max_inverter_input);
    engine.hub.set_pv_brand(1);
    if engine.hub.control_bypass {
        engine.hub.set_bypass(false);
        engine.hub.set_autorecover(false);
    }

    // timers: hub refresh, decision safety net, discovery cadence
    let refresh_timer = RepeatingTimer::spawn(HUB_REFRESH_INTERVAL, events.clone(), || {
        EngineEvent::HubRefreshTick
    });
    let safety_timer = RepeatingTimer::spawn(SAFETY_TICK_INTERVAL, events.clone(), || {
        EngineEvent::SafetyTick
    });
    let discovery_timer = RepeatingTimer::spawn(DISCOVERY_INTERVAL, events.clone(), || {
        EngineEvent::DiscoveryTick
    });

    let poller_task = if runtime.meter.kind == MeterKind::Powerfox {
        Some(spawn_powerfox_poller(&runtime, events.clone())?)
    } else {
        None
    };

    let forwarder = tokio::spawn(gridflow_mqtt::run_event_loop(eventloop, events.clone()));

    let shutdown_events = events.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("👋 Shutting down...");
            shutdown_events.send(EngineEvent::Shutdown);
        }
    });

    engine.run(event_channel).await;

    refresh_timer.stop();
    safety_timer.stop();
    discovery_timer.stop();
    if let Some(task) = poller_task {
        task.abort();
    }
    forwarder.abort();
    signal_task.abort();
    Ok(())
}

async fn resolve_location(runtime: &RuntimeConfig) -> (f64, f64) {
    match (runtime.location.latitude, runtime.location.longitude) {
        (Some(latitude), Some(longitude)) => {
            info!("🌍 Geocoordinates: ({}, {})", latitude, longitude);
            (latitude, longitude)
        }
        _ => match geoip::lookup().await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                warn!(
                    "⚠️ Can't determine location from my IP ({}); no accurate sunrise/sunset detection possible",
                    e
                );
                (0.0, 0.0)
            }
        },
    }
}

/// Publish retained seeds for every control parameter the broker did not
/// already carry, so the next run (and any dashboard) sees them.
fn seed_control_params(
    settings: &gridflow_types::ControlSettings,
    publisher: &gridflow_core::bridge::SharedPublisher,
    retained: &std::collections::HashMap<String, String>,
    device_id: &str,
) {
    let seeds = [
        (
            "dischargeDuringDaytime",
            settings.discharge_during_daytime.to_string(),
        ),
        ("sunriseOffset", settings.sunrise_offset_min.to_string()),
        ("sunsetOffset", settings.sunset_offset_min.to_string()),
        (
            "minChargePower",
            format!("{}", settings.min_charge_power as i64),
        ),
        (
            "maxDischargePower",
            format!("{}", settings.max_discharge_power as i64),
        ),
        ("batteryTargetSoCMin", settings.battery_low.to_string()),
        ("batteryTargetSoCMax", settings.battery_high.to_string()),
        (
            "fullChargeInterval",
            settings.full_charge_interval_hrs.to_string(),
        ),
    ];
    for (parameter, value) in seeds {
        let topic = format!("solarflow-hub/{device_id}/control/{parameter}");
        if !retained.contains_key(&topic) {
            info!("🔧 Seeding control/{} = {}", parameter, value);
            gridflow_core::bridge::publish_or_log(publisher, &topic, value, true);
        }
    }
}

fn spawn_powerfox_poller(
    runtime: &RuntimeConfig,
    events: EngineEventSender,
) -> Result<tokio::task::JoinHandle<()>> {
    let user = runtime.meter.powerfox_user.clone().unwrap_or_default();
    let password = runtime.meter.powerfox_password.clone().unwrap_or_default();
    let interval = Duration::from_secs(runtime.meter.poll_interval_secs);
    let poller = PowerfoxPoller::new(&user, &password)?;
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match poller.poll().await {
                Ok(watts) => events.send(EngineEvent::MeterSample(watts)),
                // a missed sample is fine, the next poll is seconds away
                Err(e) => warn!("⚡ Powerfox poll failed: {}", e),
            }
        }
    }))
}
