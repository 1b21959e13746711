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

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::{EngineEvent, EngineEventSender};

/// Periodic event source feeding the engine queue.
///
/// Each instance owns one tokio task that re-arms itself after every tick;
/// several timers coexist independently (hub refresh, safety tick,
/// discovery cadence, meter polling). `stop` cancels the task; dropping the
/// timer does the same.
#[derive(Debug)]
pub struct RepeatingTimer {
    handle: JoinHandle<()>,
}

impl RepeatingTimer {
    /// Spawn a timer that sends `make_event()` into the engine queue every
    /// `interval`. The first tick fires after one full interval.
    pub fn spawn<F>(interval: Duration, events: EngineEventSender, make_event: F) -> Self
    where
        F: Fn() -> EngineEvent + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; swallow that first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                events.send(make_event());
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EngineEventSender;

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_repeatedly() {
        let (tx, mut rx) = EngineEventSender::new();
        let _timer = RepeatingTimer::spawn(Duration::from_secs(60), tx, || EngineEvent::HubRefreshTick);

        tokio::task::yield_now().await;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(62)).await;
            tokio::task::yield_now().await;
        }
        let mut ticks = 0;
        while let Ok(event) = rx.receiver.try_recv() {
            assert!(matches!(event, EngineEvent::HubRefreshTick));
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stop_cancels() {
        let (tx, mut rx) = EngineEventSender::new();
        let timer = RepeatingTimer::spawn(Duration::from_secs(10), tx, || EngineEvent::SafetyTick);
        timer.stop();
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(rx.receiver.try_recv().is_err());
    }
}
