//! Cloud-to-device command handling.
//!
//! Commands arrive as small JSON payloads `{"command": "...", "value": ...}`
//! on the devicebound subscription. The dispatcher applies the effect
//! directly (configuration, persistence, LED acknowledgment, buffer) and
//! hands the follow-up publications back to the runtime as a
//! [`DispatchOutcome`]; publishing needs the session, which the dispatcher
//! never touches. Malformed or unrecognized payloads are dropped
//! with a diagnostic and nothing else.

use serde_json::Value;
use tracing::{info, warn};

use crate::device::{ConfigStore, DeviceConfig, DeviceContext, Indicator, PersistedConfig};

pub const REBOOT_DELAY_MS: u64 = 3_000;

/// Follow-up actions the runtime executes after a command took effect.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Publish a status telemetry event.
    pub publish_status: bool,
    /// Re-publish the reported twin document.
    pub report_twin: bool,
    /// Issue a twin GET request.
    pub request_twin: bool,
    /// Restart the device once this monotonic deadline passes.
    pub reboot_at_ms: Option<u64>,
}

fn persist(ctx: &DeviceContext, store: &mut dyn ConfigStore) {
    let persisted = PersistedConfig {
        detection_enabled: ctx.config.detection_enabled,
        cooldown_ms: ctx.config.cooldown_ms,
    };
    if let Err(e) = store.save(&persisted) {
        warn!("failed to persist configuration: {}", e);
    }
}

/// Interprets one inbound command payload.
pub fn dispatch(
    payload: &[u8],
    now_ms: u64,
    ctx: &mut DeviceContext,
    store: &mut dyn ConfigStore,
    indicator: &mut dyn Indicator,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();

    let body: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("dropping unparseable command payload: {}", e);
            return outcome;
        }
    };
    let Some(command) = body.get("command").and_then(Value::as_str) else {
        warn!("dropping command payload without a command field");
        return outcome;
    };

    match command {
        "enable" => {
            ctx.config.detection_enabled = true;
            persist(ctx, store);
            indicator.ack_enabled();
            info!("detection enabled by command");
            outcome.publish_status = true;
            outcome.report_twin = true;
        }
        "disable" => {
            ctx.config.detection_enabled = false;
            persist(ctx, store);
            indicator.ack_disabled();
            info!("detection disabled by command");
            outcome.publish_status = true;
            outcome.report_twin = true;
        }
        "setCooldown" => match body.get("value").and_then(Value::as_u64) {
            Some(value) if DeviceConfig::cooldown_in_range(value) => {
                ctx.config.cooldown_ms = value;
                persist(ctx, store);
                info!(cooldown = value, "cooldown set by command");
                outcome.publish_status = true;
                outcome.report_twin = true;
            }
            other => {
                warn!(value = ?other, "setCooldown ignored: missing or out of range");
            }
        },
        "getStatus" => {
            outcome.publish_status = true;
            outcome.report_twin = true;
        }
        "getTwin" => {
            outcome.request_twin = true;
        }
        "reboot" => {
            info!("reboot commanded, restarting in {} ms", REBOOT_DELAY_MS);
            outcome.reboot_at_ms = Some(now_ms + REBOOT_DELAY_MS);
        }
        "clearBuffer" => {
            let dropped = ctx.buffer.clear();
            info!(dropped, "buffer cleared by command");
            outcome.publish_status = true;
        }
        other => {
            warn!(command = other, "dropping unrecognized command");
        }
    }
    outcome
}
