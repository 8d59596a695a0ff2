//! Motion detection over a noisy digital input.
//!
//! The raw sensor line bounces on both edges and keeps firing while a warm
//! body stays in view, so the detector runs an explicit four-phase machine:
//!
//! ```text
//! Idle ──rising edge──► RisingDebounce ──held ≥ debounce──► Active
//!  ▲                        │ (drops low, or cooldown         │
//!  │                        │  not yet elapsed)               │ falling edge
//!  │                        ▼                                 ▼
//!  └──held low ≥ debounce── FallingDebounce ◄──signal back── (re-Active)
//! ```
//!
//! Outputs are tied to transitions, not states: exactly one
//! [`DetectionEvent`] fires on the RisingDebounce → Active edge, and only if
//! the configured cooldown has elapsed since the previous confirmed
//! detection. A qualifying rise inside the cooldown window is observed and
//! discarded; the detector then re-arms on the next falling edge.

use tracing::{debug, info};

use crate::device::Indicator;

pub const DEBOUNCE_MS: u64 = 500;

/// One confirmed, rate-limited detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionEvent {
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RisingDebounce,
    Active,
    FallingDebounce,
}

pub struct MotionDetector {
    phase: Phase,
    last_signal: bool,
    last_edge_at: u64,
    last_detection_at: Option<u64>,
    debounce_ms: u64,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_signal: false,
            last_edge_at: 0,
            last_detection_at: None,
            debounce_ms: DEBOUNCE_MS,
        }
    }

    /// True while a confirmed detection is in progress.
    pub fn detection_live(&self) -> bool {
        matches!(self.phase, Phase::Active | Phase::FallingDebounce)
    }

    /// Advances the machine one tick with the current sampled signal.
    ///
    /// `cooldown_ms` comes from the live device configuration and may change
    /// between ticks. When detection is disabled the signal is still sampled
    /// (so edges stay accurate) but nothing is confirmed.
    pub fn tick(
        &mut self,
        signal: bool,
        now_ms: u64,
        cooldown_ms: u64,
        enabled: bool,
        indicator: &mut dyn Indicator,
    ) -> Option<DetectionEvent> {
        if !enabled {
            if self.detection_live() {
                indicator.motion(false);
            }
            self.phase = Phase::Idle;
            self.last_signal = signal;
            return None;
        }

        let mut event = None;
        match self.phase {
            Phase::Idle => {
                if signal && !self.last_signal {
                    self.phase = Phase::RisingDebounce;
                    self.last_edge_at = now_ms;
                    debug!("motion signal rising, debouncing");
                }
            }
            Phase::RisingDebounce => {
                if !signal {
                    // Bounce, not motion.
                    self.phase = Phase::Idle;
                } else if now_ms.saturating_sub(self.last_edge_at) >= self.debounce_ms {
                    let cooled_down = self
                        .last_detection_at
                        .map_or(true, |t| now_ms.saturating_sub(t) >= cooldown_ms);
                    if cooled_down {
                        self.phase = Phase::Active;
                        self.last_detection_at = Some(now_ms);
                        indicator.motion(true);
                        info!(at_ms = now_ms, "motion detected");
                        event = Some(DetectionEvent { at_ms: now_ms });
                    } else {
                        // Observed but inside the cooldown window; re-arm on
                        // the next falling edge.
                        debug!(
                            remaining_ms = cooldown_ms
                                .saturating_sub(now_ms - self.last_detection_at.unwrap_or(0)),
                            "detection suppressed by cooldown"
                        );
                        self.phase = Phase::Idle;
                    }
                }
            }
            Phase::Active => {
                if !signal {
                    self.phase = Phase::FallingDebounce;
                    self.last_edge_at = now_ms;
                }
            }
            Phase::FallingDebounce => {
                if signal {
                    self.phase = Phase::Active;
                } else if now_ms.saturating_sub(self.last_edge_at) >= self.debounce_ms {
                    self.phase = Phase::Idle;
                    indicator.motion(false);
                    debug!("motion ended");
                }
            }
        }

        self.last_signal = signal;
        event
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullIndicator {
        motion_on: bool,
    }

    impl Indicator for NullIndicator {
        fn motion(&mut self, active: bool) {
            self.motion_on = active;
        }
        fn ack_enabled(&mut self) {}
        fn ack_disabled(&mut self) {}
    }

    const COOLDOWN: u64 = 5_000;
    const TICK: u64 = 50;

    /// Drives the detector with `signal` from `start` to `end` (exclusive) in
    /// 50 ms ticks, returning the confirmed events.
    fn drive(
        detector: &mut MotionDetector,
        indicator: &mut NullIndicator,
        signal: bool,
        start: u64,
        end: u64,
    ) -> Vec<DetectionEvent> {
        let mut events = Vec::new();
        let mut now = start;
        while now < end {
            if let Some(e) = detector.tick(signal, now, COOLDOWN, true, indicator) {
                events.push(e);
            }
            now += TICK;
        }
        events
    }

    #[test]
    fn held_pulse_after_idle_confirms_exactly_once() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        let idle = drive(&mut detector, &mut led, false, 0, 6_000);
        assert!(idle.is_empty());

        let events = drive(&mut detector, &mut led, true, 6_000, 6_600);
        assert_eq!(events.len(), 1);
        assert!(led.motion_on);
    }

    #[test]
    fn pulse_inside_cooldown_is_suppressed_and_later_pulse_confirms() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        drive(&mut detector, &mut led, false, 0, 6_000);
        let first = drive(&mut detector, &mut led, true, 6_000, 6_600);
        assert_eq!(first.len(), 1);
        drive(&mut detector, &mut led, false, 6_600, 8_600);

        // Second pulse 2 s after the first detection: inside the 5 s cooldown.
        let second = drive(&mut detector, &mut led, true, 8_600, 9_200);
        assert!(second.is_empty());
        drive(&mut detector, &mut led, false, 9_200, 12_500);

        // Same pulse 6 s after the first detection: cooldown elapsed.
        let third = drive(&mut detector, &mut led, true, 12_500, 13_100);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn short_bounce_never_confirms() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        drive(&mut detector, &mut led, false, 0, 1_000);
        // High for only 200 ms, below the 500 ms debounce.
        let events = drive(&mut detector, &mut led, true, 1_000, 1_200);
        assert!(events.is_empty());
        let events = drive(&mut detector, &mut led, false, 1_200, 2_000);
        assert!(events.is_empty());
    }

    #[test]
    fn detections_exactly_cooldown_apart_both_confirm() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        let first = drive(&mut detector, &mut led, true, 0, 600);
        assert_eq!(first.len(), 1);
        let first_at = first[0].at_ms;
        drive(&mut detector, &mut led, false, 600, first_at + COOLDOWN - 500);

        let second = drive(
            &mut detector,
            &mut led,
            true,
            first_at + COOLDOWN - 500,
            first_at + COOLDOWN + 600,
        );
        assert_eq!(second.len(), 1);
        assert!(second[0].at_ms - first_at >= COOLDOWN);
    }

    #[test]
    fn falling_debounce_ends_the_detection_and_clears_the_indicator() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        drive(&mut detector, &mut led, true, 0, 600);
        assert!(detector.detection_live());

        drive(&mut detector, &mut led, false, 600, 1_300);
        assert!(!detector.detection_live());
        assert!(!led.motion_on);
    }

    #[test]
    fn disabled_detector_confirms_nothing() {
        let mut detector = MotionDetector::new();
        let mut led = NullIndicator { motion_on: false };

        let mut now = 0;
        while now < 2_000 {
            assert!(detector.tick(true, now, COOLDOWN, false, &mut led).is_none());
            now += TICK;
        }
    }
}
