//! Desired/reported configuration reconciliation.
//!
//! The broker keeps a twin document per device: a `desired` half written
//! remotely and a `reported` half written by the node. This module owns both
//! flows. Desired documents arrive either as pushed patches or inside the
//! response to an explicit GET; both paths funnel through [`TwinSync::apply_desired`].
//! Reported state goes out on every FullyConnected entry, on every
//! configuration change, and on a fixed 60 s period.
//!
//! GET requests and reported patches are correlated by a request id that only
//! ever increases. There is no retry on the correlation: a lost response
//! simply never resolves, and the next periodic report or reconnect flush
//! papers over it.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::connection::topics;
use crate::device::{ConfigStore, DeviceConfig, DeviceContext, Indicator, PersistedConfig, SystemProbe};

pub const REPORT_PERIOD_MS: u64 = 60_000;

pub struct TwinSync {
    request_id: u64,
    last_report_ms: Option<u64>,
}

impl TwinSync {
    pub fn new() -> Self {
        Self {
            request_id: 0,
            last_report_ms: None,
        }
    }

    fn next_rid(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }

    /// Emits a twin GET request. The response arrives asynchronously on the
    /// `twin/res` subscription.
    pub fn request_desired(&mut self, publish: &mut dyn FnMut(&str, &[u8]) -> bool) {
        let rid = self.next_rid();
        let topic = topics::twin_get(rid);
        if publish(&topic, b"") {
            debug!(rid, "requested desired configuration");
        } else {
            warn!(rid, "twin GET publish failed");
        }
    }

    /// Publishes the current reported-properties document.
    pub fn report_state(
        &mut self,
        now_ms: u64,
        uptime_secs: u64,
        ctx: &DeviceContext,
        probe: &dyn SystemProbe,
        publish: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) {
        let rid = self.next_rid();
        let body = json!({
            "firmware": ctx.config.firmware_version,
            "uptime": uptime_secs,
            "detectionEnabled": ctx.config.detection_enabled,
            "cooldown": ctx.config.cooldown_ms,
            "detectionCount": ctx.metrics.detection_count,
            "bootTime": ctx.metrics.boot_time.to_rfc3339(),
            "system": {
                "rssi": probe.rssi_dbm(),
                "freeHeap": probe.free_heap_bytes(),
                "cpuFreq": probe.cpu_freq_mhz(),
                "bufferedCount": ctx.buffer.len(),
            },
        });
        let topic = topics::twin_reported(rid);
        if publish(&topic, body.to_string().as_bytes()) {
            self.last_report_ms = Some(now_ms);
            debug!(rid, "reported state");
        } else {
            warn!(rid, "state report publish failed");
        }
    }

    /// True when the fixed reporting period has elapsed.
    pub fn report_due(&self, now_ms: u64) -> bool {
        self.last_report_ms
            .map_or(true, |t| now_ms.saturating_sub(t) >= REPORT_PERIOD_MS)
    }

    /// Reconciles a desired document against the live configuration.
    ///
    /// Returns true when anything changed; the change is already persisted
    /// and the caller re-reports state. Out-of-range cooldowns and unknown
    /// keys are ignored without error.
    pub fn apply_desired(
        &mut self,
        document: &Value,
        ctx: &mut DeviceContext,
        store: &mut dyn ConfigStore,
        indicator: &mut dyn Indicator,
    ) -> bool {
        let mut changed = false;

        if let Some(enabled) = document.get("detectionEnabled").and_then(Value::as_bool) {
            if enabled != ctx.config.detection_enabled {
                ctx.config.detection_enabled = enabled;
                changed = true;
                info!(enabled, "detection toggled by desired configuration");
                if enabled {
                    indicator.ack_enabled();
                } else {
                    indicator.ack_disabled();
                }
            }
        }

        if let Some(cooldown) = document.get("cooldown").and_then(Value::as_u64) {
            if cooldown != ctx.config.cooldown_ms {
                if DeviceConfig::cooldown_in_range(cooldown) {
                    ctx.config.cooldown_ms = cooldown;
                    changed = true;
                    info!(cooldown, "cooldown updated by desired configuration");
                } else {
                    debug!(cooldown, "desired cooldown out of range, ignored");
                }
            }
        }

        if changed {
            let persisted = PersistedConfig {
                detection_enabled: ctx.config.detection_enabled,
                cooldown_ms: ctx.config.cooldown_ms,
            };
            if let Err(e) = store.save(&persisted) {
                warn!("failed to persist configuration: {}", e);
            }
        }
        changed
    }

    /// Extracts the desired document from a twin GET response. Only a
    /// success-coded response carrying a `desired` field is applied.
    pub fn desired_from_get_response(status: u16, payload: &[u8]) -> Option<Value> {
        if status != 200 {
            debug!(status, "ignoring non-success twin response");
            return None;
        }
        let body: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("malformed twin response: {}", e);
                return None;
            }
        };
        body.get("desired").cloned()
    }
}

impl Default for TwinSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;
    use crate::device::{DeviceMetrics, StoreError};
    use chrono::Utc;

    #[derive(Default)]
    struct RecordingStore {
        saved: Vec<PersistedConfig>,
    }

    impl ConfigStore for RecordingStore {
        fn load(&mut self) -> Result<Option<PersistedConfig>, StoreError> {
            Ok(None)
        }
        fn save(&mut self, config: &PersistedConfig) -> Result<(), StoreError> {
            self.saved.push(*config);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingIndicator {
        enabled_acks: u32,
        disabled_acks: u32,
    }

    impl Indicator for RecordingIndicator {
        fn motion(&mut self, _: bool) {}
        fn ack_enabled(&mut self) {
            self.enabled_acks += 1;
        }
        fn ack_disabled(&mut self) {
            self.disabled_acks += 1;
        }
    }

    struct StaticProbe;

    impl SystemProbe for StaticProbe {
        fn rssi_dbm(&self) -> i32 {
            -61
        }
        fn free_heap_bytes(&self) -> u64 {
            180_000
        }
        fn cpu_freq_mhz(&self) -> u32 {
            240
        }
    }

    fn context() -> DeviceContext {
        DeviceContext {
            config: DeviceConfig {
                detection_enabled: true,
                cooldown_ms: 5_000,
                firmware_version: "2.1.0".to_string(),
            },
            metrics: DeviceMetrics::at_boot(Utc::now()),
            buffer: MessageBuffer::new(10),
        }
    }

    #[test]
    fn out_of_range_cooldown_is_ignored_without_persisting() {
        let mut twin = TwinSync::new();
        let mut ctx = context();
        let mut store = RecordingStore::default();
        let mut led = RecordingIndicator::default();

        let changed =
            twin.apply_desired(&json!({"cooldown": 500}), &mut ctx, &mut store, &mut led);

        assert!(!changed);
        assert_eq!(ctx.config.cooldown_ms, 5_000);
        assert!(store.saved.is_empty());
    }

    #[test]
    fn same_value_is_idempotent() {
        let mut twin = TwinSync::new();
        let mut ctx = context();
        ctx.config.detection_enabled = false;
        let mut store = RecordingStore::default();
        let mut led = RecordingIndicator::default();

        let changed = twin.apply_desired(
            &json!({"detectionEnabled": false}),
            &mut ctx,
            &mut store,
            &mut led,
        );

        assert!(!changed);
        assert!(store.saved.is_empty());
        assert_eq!(led.disabled_acks, 0);
    }

    #[test]
    fn toggling_detection_persists_and_flashes_the_ack() {
        let mut twin = TwinSync::new();
        let mut ctx = context();
        let mut store = RecordingStore::default();
        let mut led = RecordingIndicator::default();

        let changed = twin.apply_desired(
            &json!({"detectionEnabled": false, "cooldown": 9_000, "unknown": 1}),
            &mut ctx,
            &mut store,
            &mut led,
        );

        assert!(changed);
        assert!(!ctx.config.detection_enabled);
        assert_eq!(ctx.config.cooldown_ms, 9_000);
        assert_eq!(led.disabled_acks, 1);
        assert_eq!(
            store.saved,
            vec![PersistedConfig {
                detection_enabled: false,
                cooldown_ms: 9_000,
            }]
        );
    }

    #[test]
    fn report_serializes_the_full_document() {
        let mut twin = TwinSync::new();
        let mut ctx = context();
        ctx.metrics.detection_count = 7;

        let mut published = Vec::new();
        twin.report_state(1_000, 42, &ctx, &StaticProbe, &mut |topic, payload| {
            published.push((topic.to_string(), payload.to_vec()));
            true
        });

        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].0,
            "$iothub/twin/PATCH/properties/reported/?$rid=1"
        );
        let body: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["firmware"], "2.1.0");
        assert_eq!(body["uptime"], 42);
        assert_eq!(body["detectionEnabled"], true);
        assert_eq!(body["cooldown"], 5_000);
        assert_eq!(body["detectionCount"], 7);
        assert!(body["bootTime"].is_string());
        assert_eq!(body["system"]["rssi"], -61);
        assert_eq!(body["system"]["bufferedCount"], 0);
    }

    #[test]
    fn request_ids_increase_across_flows() {
        let mut twin = TwinSync::new();
        let ctx = context();
        let mut topics_seen = Vec::new();
        let mut publish = |topic: &str, _: &[u8]| {
            topics_seen.push(topic.to_string());
            true
        };

        twin.request_desired(&mut publish);
        twin.report_state(0, 0, &ctx, &StaticProbe, &mut publish);
        twin.request_desired(&mut publish);

        assert_eq!(
            topics_seen,
            vec![
                "$iothub/twin/GET/?$rid=1",
                "$iothub/twin/PATCH/properties/reported/?$rid=2",
                "$iothub/twin/GET/?$rid=3",
            ]
        );
    }

    #[test]
    fn periodic_report_cadence() {
        let mut twin = TwinSync::new();
        let ctx = context();
        assert!(twin.report_due(0));

        twin.report_state(1_000, 1, &ctx, &StaticProbe, &mut |_, _| true);
        assert!(!twin.report_due(30_000));
        assert!(twin.report_due(61_000));
    }

    #[test]
    fn only_success_responses_with_desired_apply() {
        let ok = TwinSync::desired_from_get_response(
            200,
            br#"{"desired": {"cooldown": 2000}, "reported": {}}"#,
        );
        assert_eq!(ok, Some(json!({"cooldown": 2000})));

        assert!(TwinSync::desired_from_get_response(404, b"{}").is_none());
        assert!(TwinSync::desired_from_get_response(200, b"{\"reported\":{}}").is_none());
        assert!(TwinSync::desired_from_get_response(200, b"not json").is_none());
    }
}
