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

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{publish_or_log, SharedPublisher, TriggerSender, TriggerSource};
use crate::telemetry::TimeWindow;
use gridflow_types::{MeterKind, MeterSettings};

/// Smoothed-power delta that triggers the decision procedure (W)
const TRIGGER_DIFF: f64 = 10.0;
/// Seconds of history injected after a rapid demand change
const RAPID_CHANGE_BACKFILL_SECS: u64 = 20;

const HOME_USAGE_TOPIC: &str = "solarflow-hub/smartmeter/homeUsage";
const HOME_USAGE_SMOOTH_TOPIC: &str = "solarflow-hub/smartmeter/homeUsageSmoothened";

/// Household smart-meter model.
///
/// Keeps the most recent signed power per phase and a one-minute window of
/// the whole-house sum. A single sample diverging by more than
/// `rapid_change_diff` flushes the smoothing buffer so step loads are
/// answered quickly.
pub struct Smartmeter {
    kind: MeterKind,
    base_topic: String,
    cur_accessor: String,
    power: TimeWindow,
    phase_values: BTreeMap<String, f64>,
    rapid_change_diff: f64,
    pub zero_offset: f64,
    scaling_factor: f64,
    last_trigger_value: f64,
    warned_topics: HashSet<String>,
    trigger: TriggerSender,
    publisher: SharedPublisher,
}

impl Smartmeter {
    pub fn new(settings: &MeterSettings, trigger: TriggerSender, publisher: SharedPublisher) -> Self {
        info!(
            "⚡ Using {}: Base topic: {}, Current power accessor: {}, Rapid change diff: {}W, Zero offset: {}W, Scaling factor: {}",
            settings.kind,
            settings.base_topic,
            settings.cur_accessor,
            settings.rapid_change_diff,
            settings.zero_offset,
            settings.scaling_factor
        );
        Self {
            kind: settings.kind,
            base_topic: settings.base_topic.clone(),
            cur_accessor: settings.cur_accessor.clone(),
            power: TimeWindow::new(1),
            phase_values: BTreeMap::new(),
            rapid_change_diff: settings.rapid_change_diff,
            zero_offset: settings.zero_offset,
            scaling_factor: settings.scaling_factor,
            last_trigger_value: 0.0,
            warned_topics: HashSet::new(),
            trigger,
            publisher,
        }
    }

    /// Topics this meter variant needs; empty for the polled Powerfox
    pub fn subscriptions(&self) -> Vec<String> {
        match self.kind {
            MeterKind::Smartmeter | MeterKind::VzLogger => vec![self.base_topic.clone()],
            MeterKind::Shelly3Em => (0..3)
                .map(|phase| format!("{}/emeter/{phase}/power", self.base_topic))
                .collect(),
            MeterKind::Powerfox => Vec::new(),
        }
    }

    pub fn ready(&self) -> bool {
        !self.phase_values.is_empty()
    }

    /// Smoothed current power (W)
    pub fn get_power(&self) -> f64 {
        self.power.last()
    }

    pub fn previous_power(&self) -> f64 {
        self.power.previous()
    }

    /// Two consecutive samples below the zero offset: we are actively
    /// feeding the grid
    pub fn feed_in_persisting(&self) -> bool {
        self.get_power() - self.zero_offset < 0.0 && self.previous_power() - self.zero_offset < 0.0
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        if self.kind == MeterKind::Powerfox || !topic.starts_with(&self.base_topic) {
            return;
        }
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                self.warn_once(topic, "payload is not valid UTF-8");
                return;
            }
        };
        let value: Value = match serde_json::from_str(text.trim()) {
            Ok(value) => value,
            Err(e) => {
                self.warn_once(topic, &format!("payload is not valid JSON: {e}"));
                return;
            }
        };
        match &value {
            Value::Number(num) => {
                if let Some(watts) = num.as_f64() {
                    self.ingest_sample(topic, watts);
                }
            }
            Value::Object(_) => match deep_get(&value, &self.cur_accessor).and_then(Value::as_f64) {
                Some(watts) => self.ingest_sample(topic, watts),
                None => {
                    let accessor = self.cur_accessor.clone();
                    self.warn_once(topic, &format!("accessor path '{accessor}' not found"));
                }
            },
            _ => self.warn_once(topic, "unsupported payload shape"),
        }
    }

    /// Record one phase reading and recompute the whole-house view.
    /// Out-of-band variants (Powerfox) enter here directly.
    pub fn ingest_sample(&mut self, phase: &str, watts: f64) {
        self.phase_values
            .insert(phase.to_owned(), watts * self.scaling_factor);
        self.upd_power();
    }

    fn upd_power(&mut self) {
        let mut force_trigger = false;
        let phase_sum: f64 = self.phase_values.values().sum();

        let diff = phase_sum - self.get_power();
        if diff > self.rapid_change_diff {
            info!("⚡ Rapid rise in demand detected, clearing buffer!");
            self.power.populate(RAPID_CHANGE_BACKFILL_SECS, phase_sum);
            force_trigger = true;
        }
        if diff < 0.0 && diff.abs() > self.rapid_change_diff {
            info!("⚡ Rapid drop in demand detected, clearing buffer!");
            self.power.populate(RAPID_CHANGE_BACKFILL_SECS, phase_sum);
            force_trigger = true;
        }

        self.power.add(phase_sum);
        publish_or_log(
            &self.publisher,
            HOME_USAGE_TOPIC,
            format!("{}", phase_sum.round() as i64),
            false,
        );
        publish_or_log(
            &self.publisher,
            HOME_USAGE_SMOOTH_TOPIC,
            format!("{}", self.power.last().round() as i64),
            false,
        );

        let previous = self.previous_power();
        if (previous - self.get_power()).abs() >= TRIGGER_DIFF || force_trigger {
            debug!(
                "⚡ SMT triggers limit function: {:.1} -> {:.1}",
                previous,
                self.get_power()
            );
            self.trigger.trigger(TriggerSource::Smartmeter, force_trigger);
            self.last_trigger_value = self.get_power();
        }
    }

    fn warn_once(&mut self, topic: &str, reason: &str) {
        if self.warned_topics.insert(topic.to_owned()) {
            warn!("⚠️ Dropping smart-meter sample on {}: {}", topic, reason);
        }
    }
}

impl fmt::Display for Smartmeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase_sum: f64 = self.phase_values.values().sum();
        write!(
            f,
            "SMT: T:{} P:{:>3.1}W {}",
            self.kind.display_name(),
            phase_sum,
            self.power
        )
    }
}

/// Walk a dotted accessor path (e.g. `Power.Power_curr`) through a JSON value
fn deep_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |node, key| node.get(key))
}

// ============= Powerfox Polling =============

const POWERFOX_API: &str = "https://backend.powerfox.energy/api/2.0/my/main/current";

#[derive(Debug, Error)]
pub enum MeterPollError {
    #[error("powerfox request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("powerfox payload missing field '{0}'")]
    MissingField(&'static str),
}

/// HTTPS poller for the Powerfox/Poweropti cloud readout.
///
/// Runs on its own 5 s timer; results enter the engine queue as ordinary
/// meter samples, so the decision path never blocks on the network. A failed
/// or timed-out poll is skipped and the timer keeps running.
#[derive(Debug, Clone)]
pub struct PowerfoxPoller {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl PowerfoxPoller {
    pub fn new(user: &str, password: &str) -> Result<Self, MeterPollError> {
        Self::with_url(POWERFOX_API, user, password)
    }

    pub fn with_url(url: &str, user: &str, password: &str) -> Result<Self, MeterPollError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(4))
            .build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }

    /// Fetch the current whole-house reading in watts
    pub async fn poll(&self) -> Result<f64, MeterPollError> {
        let response = self
            .client
            .get(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?
            .error_for_status()?;
        let current: Value = response.json().await?;
        let watts = current
            .get("Watt")
            .and_then(Value::as_f64)
            .ok_or(MeterPollError::MissingField("Watt"))?;
        if current
            .get("Outdated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            debug!("⚡ Powerfox reports an outdated reading");
        }
        Ok(watts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TriggerSender;
    use crate::testutil::RecordingPublisher;
    use gridflow_types::MeterSettings;

    fn settings(kind: MeterKind) -> MeterSettings {
        MeterSettings {
            kind,
            base_topic: "tele/meter".into(),
            cur_accessor: "Power.Power_curr".into(),
            rapid_change_diff: 500.0,
            zero_offset: 0.0,
            scaling_factor: 1.0,
            powerfox_user: None,
            powerfox_password: None,
            poll_interval_secs: 5,
        }
    }

    #[test]
    fn test_shelly_subscriptions() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, _rx) = TriggerSender::new();
        let meter = Smartmeter::new(&settings(MeterKind::Shelly3Em), trigger, publisher);
        assert_eq!(
            meter.subscriptions(),
            vec![
                "tele/meter/emeter/0/power",
                "tele/meter/emeter/1/power",
                "tele/meter/emeter/2/power"
            ]
        );
    }

    #[test]
    fn test_accessor_path_extraction() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, _rx) = TriggerSender::new();
        let mut meter = Smartmeter::new(&settings(MeterKind::Smartmeter), trigger, publisher);
        meter.handle_message("tele/meter", br#"{"Power":{"Power_curr":230.5}}"#);
        assert!(meter.ready());
        assert!((meter.get_power() - 230.5).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_payload_dropped_without_trigger() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, mut rx) = TriggerSender::new();
        let mut meter = Smartmeter::new(&settings(MeterKind::Smartmeter), trigger, publisher);
        meter.handle_message("tele/meter", b"not json at all {");
        meter.handle_message("tele/meter", br#"{"Other":{"Shape":1}}"#);
        assert!(!meter.ready());
        assert!(rx.drain().is_none());
    }

    #[test]
    fn test_rapid_change_resets_smoothed_view() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, mut rx) = TriggerSender::new();
        let mut meter = Smartmeter::new(&settings(MeterKind::VzLogger), trigger, publisher);
        for _ in 0..6 {
            meter.handle_message("tele/meter", b"100");
        }
        rx.drain();

        meter.handle_message("tele/meter", b"900");
        assert!((meter.get_power() - 900.0).abs() < 1e-9);
        let request = rx.drain().expect("rapid change must trigger");
        assert!(request.force);
    }

    #[test]
    fn test_small_changes_do_not_trigger() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, mut rx) = TriggerSender::new();
        let mut meter = Smartmeter::new(&settings(MeterKind::VzLogger), trigger, publisher);
        meter.handle_message("tele/meter", b"5");
        rx.drain();
        meter.handle_message("tele/meter", b"8");
        assert!(rx.drain().is_none());
    }

    #[test]
    fn test_home_usage_published() {
        let (recorder, publisher) = RecordingPublisher::shared();
        let (trigger, _rx) = TriggerSender::new();
        let mut meter = Smartmeter::new(&settings(MeterKind::VzLogger), trigger, publisher);
        meter.handle_message("tele/meter", b"421.7");
        assert_eq!(recorder.payloads_for(HOME_USAGE_TOPIC), vec!["422"]);
        assert_eq!(recorder.payloads_for(HOME_USAGE_SMOOTH_TOPIC), vec!["422"]);
    }

    #[test]
    fn test_feed_in_detection_uses_zero_offset() {
        let (_rec, publisher) = RecordingPublisher::shared();
        let (trigger, _rx) = TriggerSender::new();
        let mut cfg = settings(MeterKind::VzLogger);
        cfg.zero_offset = 20.0;
        let mut meter = Smartmeter::new(&cfg, trigger, publisher);
        meter.handle_message("tele/meter", b"30");
        meter.handle_message("tele/meter", b"12");
        // only one sample below the offset so far
        assert!(!meter.feed_in_persisting());
        meter.handle_message("tele/meter", b"10");
        assert!(meter.feed_in_persisting());
    }

    #[tokio::test]
    async fn test_powerfox_poll_parses_watt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/2.0/my/main/current")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"Watt":342.0,"Outdated":false}"#)
            .create_async()
            .await;

        let url = format!("{}/api/2.0/my/main/current", server.url());
        let poller = PowerfoxPoller::with_url(&url, "user", "secret").expect("poller");
        let watts = poller.poll().await.expect("poll");
        assert!((watts - 342.0).abs() < 1e-9);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_powerfox_poll_missing_field() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/my/main/current")
            .with_status(200)
            .with_body(r#"{"Outdated":true}"#)
            .create_async()
            .await;

        let url = format!("{}/api/2.0/my/main/current", server.url());
        let poller = PowerfoxPoller::with_url(&url, "user", "secret").expect("poller");
        assert!(matches!(
            poller.poll().await,
            Err(MeterPollError::MissingField("Watt"))
        ));
    }
}
