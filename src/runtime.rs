//! Per-tick orchestration.
//!
//! One [`NodeRuntime::tick`] call does everything the node does: advance the
//! connection machine, drain the buffer, service inbound messages, run the
//! periodic twin report, evaluate motion, and check the deferred reboot.
//! That order is load-bearing: draining, reporting and dispatch all require
//! FullyConnected, which only the connection tick can establish; motion
//! detection runs regardless of connectivity and buffers what it cannot send.
//!
//! All device state is owned here and mutated only from the tick call, which
//! the host drives from a single task. Nothing in a tick blocks.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::buffer::MessageBuffer;
use crate::command::{self, DispatchOutcome};
use crate::config::{NodeConfig, FIRMWARE_VERSION};
use crate::connection::{
    topics, ConnEvent, ConnectionManager, InboundMessage, InboundRoute, LinkTransport,
    SessionSettings, SessionTransport,
};
use crate::device::{
    Clock, ConfigStore, DeviceConfig, DeviceContext, DeviceMetrics, Indicator, PersistedConfig,
    Restart, SystemProbe,
};
use crate::hw::MotionSignal;
use crate::motion::MotionDetector;
use crate::twin::TwinSync;

/// Upper bound on inbound messages serviced per tick, so a burst cannot
/// starve the rest of the loop.
const MAX_INBOUND_PER_TICK: usize = 32;

/// Everything the core calls but does not implement.
pub struct Collaborators {
    pub link: Box<dyn LinkTransport + Send>,
    pub session: Box<dyn SessionTransport + Send>,
    pub store: Box<dyn ConfigStore + Send>,
    pub indicator: Box<dyn Indicator + Send>,
    pub signal: Box<dyn MotionSignal + Send>,
    pub probe: Box<dyn SystemProbe + Send>,
    pub clock: Box<dyn Clock + Send>,
    pub restart: Box<dyn Restart + Send>,
}

pub struct NodeRuntime {
    ctx: DeviceContext,
    connection: ConnectionManager,
    twin: TwinSync,
    motion: MotionDetector,
    telemetry_topic: String,
    device_id: String,
    warmup_until_ms: u64,
    reboot_at_ms: Option<u64>,

    link: Box<dyn LinkTransport + Send>,
    session: Box<dyn SessionTransport + Send>,
    store: Box<dyn ConfigStore + Send>,
    indicator: Box<dyn Indicator + Send>,
    signal: Box<dyn MotionSignal + Send>,
    probe: Box<dyn SystemProbe + Send>,
    clock: Box<dyn Clock + Send>,
    restart: Box<dyn Restart + Send>,
}

impl NodeRuntime {
    pub fn new(config: &NodeConfig, mut collaborators: Collaborators) -> Self {
        let persisted = match collaborators.store.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => PersistedConfig::default(),
            Err(e) => {
                warn!("failed to load persisted state, using defaults: {}", e);
                PersistedConfig::default()
            }
        };
        info!(
            detection_enabled = persisted.detection_enabled,
            cooldown_ms = persisted.cooldown_ms,
            "device configuration restored"
        );

        let ctx = DeviceContext {
            config: DeviceConfig {
                detection_enabled: persisted.detection_enabled,
                cooldown_ms: persisted.cooldown_ms,
                firmware_version: FIRMWARE_VERSION.to_string(),
            },
            metrics: DeviceMetrics::at_boot(chrono::Utc::now()),
            buffer: MessageBuffer::new(config.node.buffer_capacity),
        };

        let connection = ConnectionManager::new(SessionSettings {
            host: config.hub.host.clone(),
            port: config.hub.port,
            device_id: config.hub.device_id.clone(),
            device_key_b64: config.hub.device_key_b64.clone(),
            token_ttl_secs: config.hub.token_ttl_secs,
        });

        let warmup_until_ms = collaborators.clock.monotonic_ms() + config.node.warmup_ms;

        Self {
            ctx,
            connection,
            twin: TwinSync::new(),
            motion: MotionDetector::new(),
            telemetry_topic: topics::telemetry(&config.hub.device_id),
            device_id: config.hub.device_id.clone(),
            warmup_until_ms,
            reboot_at_ms: None,
            link: collaborators.link,
            session: collaborators.session,
            store: collaborators.store,
            indicator: collaborators.indicator,
            signal: collaborators.signal,
            probe: collaborators.probe,
            clock: collaborators.clock,
            restart: collaborators.restart,
        }
    }

    pub fn metrics(&self) -> &DeviceMetrics {
        &self.ctx.metrics
    }

    /// One pass of the control loop.
    pub fn tick(&mut self) {
        let now_ms = self.clock.monotonic_ms();

        let event = self.connection.tick(
            now_ms,
            self.clock.epoch_seconds(),
            &mut *self.link,
            &mut *self.session,
            &mut self.ctx.metrics,
        );
        if let Some(ConnEvent::SessionEstablished) = event {
            self.on_entry_flush(now_ms);
        }

        self.drain_buffer(now_ms);
        self.service_inbound(now_ms);

        if self.connection.is_fully_connected() && self.twin.report_due(now_ms) {
            self.report_twin(now_ms);
        }

        self.evaluate_motion(now_ms);
        self.indicator.service(now_ms);

        if let Some(at) = self.reboot_at_ms {
            if now_ms >= at {
                self.restart.restart();
            }
        }
    }

    /// Entry flush, re-run in full on every FullyConnected entry: both the
    /// desired document and the buffered backlog may have gone stale during
    /// the outage.
    fn on_entry_flush(&mut self, now_ms: u64) {
        info!("fully connected, flushing");
        let session = &mut self.session;
        self.twin
            .request_desired(&mut |t, p| session.publish(t, p).is_ok());
        self.report_twin(now_ms);
        let status = self.telemetry_body("status", now_ms);
        let topic = self.telemetry_topic.clone();
        self.publish_or_buffer(now_ms, topic, status);
        self.drain_buffer(now_ms);
    }

    fn drain_buffer(&mut self, now_ms: u64) {
        if !self.connection.is_fully_connected() || self.ctx.buffer.is_empty() {
            return;
        }
        let session = &mut self.session;
        self.ctx
            .buffer
            .drain(now_ms, &mut self.ctx.metrics, |t, p| {
                session.publish(t, p).is_ok()
            });
    }

    fn service_inbound(&mut self, now_ms: u64) {
        if !self.connection.is_fully_connected() {
            return;
        }
        for _ in 0..MAX_INBOUND_PER_TICK {
            let Some(message) = self.session.poll_inbound() else {
                break;
            };
            self.route_inbound(now_ms, message);
        }
    }

    fn route_inbound(&mut self, now_ms: u64, message: InboundMessage) {
        match topics::classify(&self.device_id, &message.topic) {
            InboundRoute::Command => {
                let outcome = command::dispatch(
                    &message.payload,
                    now_ms,
                    &mut self.ctx,
                    &mut *self.store,
                    &mut *self.indicator,
                );
                self.apply_outcome(now_ms, outcome);
            }
            InboundRoute::DesiredPatch => match serde_json::from_slice(&message.payload) {
                Ok(document) => self.apply_desired(now_ms, &document),
                Err(e) => warn!("dropping malformed desired patch: {}", e),
            },
            InboundRoute::TwinGetResponse { status } => {
                if let Some(desired) =
                    TwinSync::desired_from_get_response(status, &message.payload)
                {
                    self.apply_desired(now_ms, &desired);
                }
            }
            InboundRoute::Unrecognized => {
                debug!(topic = %message.topic, "ignoring unrecognized inbound topic");
            }
        }
    }

    fn apply_desired(&mut self, now_ms: u64, document: &serde_json::Value) {
        let changed = self.twin.apply_desired(
            document,
            &mut self.ctx,
            &mut *self.store,
            &mut *self.indicator,
        );
        if changed {
            self.report_twin(now_ms);
        }
    }

    fn apply_outcome(&mut self, now_ms: u64, outcome: DispatchOutcome) {
        if outcome.report_twin {
            self.report_twin(now_ms);
        }
        if outcome.publish_status {
            let status = self.telemetry_body("status", now_ms);
            let topic = self.telemetry_topic.clone();
            self.publish_or_buffer(now_ms, topic, status);
        }
        if outcome.request_twin {
            let session = &mut self.session;
            self.twin
                .request_desired(&mut |t, p| session.publish(t, p).is_ok());
        }
        if outcome.reboot_at_ms.is_some() {
            self.reboot_at_ms = outcome.reboot_at_ms;
        }
    }

    fn report_twin(&mut self, now_ms: u64) {
        let session = &mut self.session;
        self.twin.report_state(
            now_ms,
            now_ms / 1_000,
            &self.ctx,
            &*self.probe,
            &mut |t, p| session.publish(t, p).is_ok(),
        );
    }

    fn evaluate_motion(&mut self, now_ms: u64) {
        if now_ms < self.warmup_until_ms {
            return;
        }
        let signal = self.signal.sample();
        let event = self.motion.tick(
            signal,
            now_ms,
            self.ctx.config.cooldown_ms,
            self.ctx.config.detection_enabled,
            &mut *self.indicator,
        );
        if let Some(event) = event {
            self.ctx.metrics.detection_count += 1;
            let body = self.telemetry_body("motion", event.at_ms);
            let topic = self.telemetry_topic.clone();
            self.publish_or_buffer(now_ms, topic, body);
        }
    }

    /// Publishes immediately while fully connected, otherwise (or on publish
    /// failure) parks the message in the buffer.
    fn publish_or_buffer(&mut self, now_ms: u64, topic: String, payload: Vec<u8>) {
        if self.connection.is_fully_connected() {
            match self.session.publish(&topic, &payload) {
                Ok(()) => return,
                Err(e) => {
                    warn!(topic = %topic, "publish failed, buffering: {}", e);
                    self.ctx.metrics.failed_publish += 1;
                }
            }
        }
        self.ctx
            .buffer
            .enqueue(topic, payload, now_ms, &mut self.ctx.metrics);
    }

    fn telemetry_body(&self, event: &str, ts_ms: u64) -> Vec<u8> {
        json!({
            "event": event,
            "count": self.ctx.metrics.detection_count,
            "ts": ts_ms,
            "config": {
                "detectionEnabled": self.ctx.config.detection_enabled,
                "cooldown": self.ctx.config.cooldown_ms,
                "firmware": self.ctx.config.firmware_version,
            },
            "system": {
                "rssi": self.probe.rssi_dbm(),
                "freeHeap": self.probe.free_heap_bytes(),
                "cpuFreq": self.probe.cpu_freq_mhz(),
                "bufferedCount": self.ctx.buffer.len(),
            },
        })
        .to_string()
        .into_bytes()
    }
}
