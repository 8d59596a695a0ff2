//! Connectivity subsystem: the state machine, the transport seams and the
//! topic grammar of the broker protocol.

pub mod manager;
pub mod session;
pub mod topics;

pub use manager::{ConnEvent, ConnectionManager, ConnectionState, SessionSettings};
pub use session::{
    InboundMessage, LinkTransport, MqttSession, SessionAuth, SessionError, SessionTransport,
    TcpProbeLink,
};
pub use topics::InboundRoute;
