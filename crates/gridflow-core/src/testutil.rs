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

use parking_lot::Mutex;
use std::sync::Arc;

use crate::bridge::{Publish, PublishError, SharedPublisher};

/// In-memory publisher recording everything the models emit
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingPublisher {
    pub fn shared() -> (Arc<Self>, SharedPublisher) {
        let recorder = Arc::new(Self::default());
        let publisher: SharedPublisher = recorder.clone();
        (recorder, publisher)
    }

    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Publish for RecordingPublisher {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        self.messages.lock().push((topic.into(), payload, retain));
        Ok(())
    }
}
