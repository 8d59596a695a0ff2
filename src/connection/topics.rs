//! Topic construction and inbound routing.
//!
//! Every inbound publish is classified once, up front, into an
//! [`InboundRoute`] before dispatch. The handlers never scan topic strings
//! themselves.

/// Outbound telemetry topic for this device.
pub fn telemetry(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

/// Reported-properties patch topic, correlated by request id.
pub fn twin_reported(request_id: u64) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", request_id)
}

/// Twin GET request topic, correlated by request id.
pub fn twin_get(request_id: u64) -> String {
    format!("$iothub/twin/GET/?$rid={}", request_id)
}

/// The three subscription filters the session opens.
pub fn inbound_filters(device_id: &str) -> [String; 3] {
    [
        format!("devices/{}/messages/devicebound/#", device_id),
        "$iothub/twin/PATCH/properties/desired/#".to_string(),
        "$iothub/twin/res/#".to_string(),
    ]
}

/// Classification of an inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    /// Cloud-to-device command.
    Command,
    /// Desired-properties patch pushed by the broker.
    DesiredPatch,
    /// Response to a twin GET; carries the status code encoded in the topic.
    TwinGetResponse { status: u16 },
    Unrecognized,
}

pub fn classify(device_id: &str, topic: &str) -> InboundRoute {
    if topic.starts_with(&format!("devices/{}/messages/devicebound", device_id)) {
        return InboundRoute::Command;
    }
    if topic.starts_with("$iothub/twin/PATCH/properties/desired") {
        return InboundRoute::DesiredPatch;
    }
    if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
        let code = rest.split(['/', '?']).next().unwrap_or("");
        if let Ok(status) = code.parse::<u16>() {
            return InboundRoute::TwinGetResponse { status };
        }
    }
    InboundRoute::Unrecognized
}
