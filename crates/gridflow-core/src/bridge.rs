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

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============= Publisher Seam =============

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus not connected")]
    Disconnected,
    #[error("bus send queue full")]
    QueueFull,
}

/// Outbound side of the message bus as the models see it.
///
/// Implemented by the MQTT adapter in production and by in-memory recorders
/// in tests. Publishing must not block the decision path; a full queue is an
/// error the caller logs and moves past.
pub trait Publish: Send + Sync {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError>;
}

pub type SharedPublisher = Arc<dyn Publish>;

/// Publish and log on failure instead of propagating; used for telemetry
/// re-publication where a dropped message is preferable to a stalled
/// decision path.
pub fn publish_or_log(publisher: &SharedPublisher, topic: &str, payload: String, retain: bool) {
    if let Err(e) = publisher.publish(topic, payload, retain) {
        tracing::warn!("⚠️ Failed to publish on {}: {}", topic, e);
    }
}

// ============= Trigger Channel =============

/// Who asked for a decision-procedure run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Smartmeter,
    Dtu,
    HubSolar,
    FeedInGuard,
}

/// A request to run the decision procedure, subject to the engine's
/// steering-interval rate limit
#[derive(Debug, Clone, Copy)]
pub struct TriggerRequest {
    pub source: TriggerSource,
    pub force: bool,
}

/// Clonable sender injected into the models at construction; the Rust form
/// of the trigger callback the models would otherwise need a back-reference
/// for.
#[derive(Clone)]
pub struct TriggerSender {
    sender: mpsc::UnboundedSender<TriggerRequest>,
}

/// Receiving end owned by the engine, drained after every dispatched event
pub struct TriggerChannel {
    pub receiver: mpsc::UnboundedReceiver<TriggerRequest>,
}

impl std::fmt::Debug for TriggerSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSender").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for TriggerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerChannel").finish_non_exhaustive()
    }
}

impl TriggerSender {
    /// Create a new sender/receiver pair
    pub fn new() -> (Self, TriggerChannel) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, TriggerChannel { receiver })
    }

    pub fn trigger(&self, source: TriggerSource, force: bool) {
        // the receiver only disappears during shutdown; nothing to do then
        let _ = self.sender.send(TriggerRequest { source, force });
    }
}

impl TriggerChannel {
    /// Non-blocking drain; returns the strongest pending request, preferring
    /// forced ones.
    pub fn drain(&mut self) -> Option<TriggerRequest> {
        let mut pending: Option<TriggerRequest> = None;
        while let Ok(request) = self.receiver.try_recv() {
            pending = Some(match pending {
                Some(prev) if prev.force => prev,
                _ => request,
            });
        }
        pending
    }
}

// ============= Engine Event Queue =============

/// Everything that may mutate control state funnels through this queue so
/// the decision path stays serialized in one task.
#[derive(Debug)]
pub enum EngineEvent {
    /// Inbound bus message
    Message { topic: String, payload: Vec<u8> },
    /// Smart-meter sample obtained out-of-band (HTTP polling variants)
    MeterSample(f64),
    /// 60 s tick: request a fresh full property dump from the hub
    HubRefreshTick,
    /// 120 s tick: unconditional decision run plus state re-publication
    SafetyTick,
    /// Discovery cadence tick: re-publish Home Assistant config payloads
    DiscoveryTick,
    /// Terminate the engine loop
    Shutdown,
}

#[derive(Clone)]
pub struct EngineEventSender {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

pub struct EngineEventChannel {
    pub receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

impl std::fmt::Debug for EngineEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEventSender").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for EngineEventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEventChannel").finish_non_exhaustive()
    }
}

impl EngineEventSender {
    pub fn new() -> (Self, EngineEventChannel) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EngineEventChannel { receiver })
    }

    pub fn send(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl EngineEventChannel {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }
}
