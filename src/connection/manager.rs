//! Connection state machine.
//!
//! Sequences link-layer and broker-session establishment as a five-state
//! machine evaluated once per tick. No state is terminal and no transition
//! blocks: connect attempts that overrun their window are abandoned and
//! superseded, never awaited. Signing the session credential requires a
//! synchronized wall clock; until the clock collaborator reports one, every
//! session attempt fails the same way a connect timeout does and is retried
//! on the normal cadence.
//!
//! ```text
//! Disconnected ──5s retry──► ConnectingLink ──link up──► LinkConnected
//!      ▲                          │ 20s timeout               │ sign + open
//!      └──────────────────────────┘                           ▼
//!      ▲────link lost──── FullyConnected ◄──established── ConnectingSession
//!                              │ session lost                 │ 15s timeout
//!                              ▼                              ▼
//!                         LinkConnected ◄─────────────── LinkConnected
//! ```

use tracing::{info, warn};

use crate::auth;
use crate::connection::session::{LinkTransport, SessionAuth, SessionTransport};
use crate::connection::topics;
use crate::device::DeviceMetrics;

pub const RETRY_INTERVAL_MS: u64 = 5_000;
pub const LINK_TIMEOUT_MS: u64 = 20_000;
pub const SESSION_TIMEOUT_MS: u64 = 15_000;

const API_VERSION: &str = "2020-09-30";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectingLink,
    LinkConnected,
    ConnectingSession,
    FullyConnected,
}

/// Transition the runtime must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// Entered FullyConnected; run the on-entry flush (twin GET, report
    /// state, publish status, drain the buffer). Re-issued on every
    /// re-entry, because desired state or buffered messages may be stale.
    SessionEstablished,
}

/// Identity and signing inputs for a session attempt.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub device_key_b64: String,
    pub token_ttl_secs: u64,
}

pub struct ConnectionManager {
    state: ConnectionState,
    state_since_ms: u64,
    last_link_attempt_ms: Option<u64>,
    last_session_attempt_ms: Option<u64>,
    settings: SessionSettings,
}

impl ConnectionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            state_since_ms: 0,
            last_link_attempt_ms: None,
            last_session_attempt_ms: None,
            settings,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_fully_connected(&self) -> bool {
        self.state == ConnectionState::FullyConnected
    }

    fn enter(&mut self, state: ConnectionState, now_ms: u64) {
        info!(from = ?self.state, to = ?state, "connection transition");
        self.state = state;
        self.state_since_ms = now_ms;
    }

    fn retry_due(last: Option<u64>, now_ms: u64) -> bool {
        last.map_or(true, |t| now_ms.saturating_sub(t) >= RETRY_INTERVAL_MS)
    }

    /// Evaluates at most one transition. Never blocks.
    pub fn tick(
        &mut self,
        now_ms: u64,
        epoch_seconds: Option<u64>,
        link: &mut dyn LinkTransport,
        session: &mut dyn SessionTransport,
        metrics: &mut DeviceMetrics,
    ) -> Option<ConnEvent> {
        match self.state {
            ConnectionState::Disconnected => {
                if Self::retry_due(self.last_link_attempt_ms, now_ms) {
                    self.last_link_attempt_ms = Some(now_ms);
                    link.begin_connect();
                    self.enter(ConnectionState::ConnectingLink, now_ms);
                }
                None
            }
            ConnectionState::ConnectingLink => {
                if link.is_up() {
                    self.enter(ConnectionState::LinkConnected, now_ms);
                } else if now_ms.saturating_sub(self.state_since_ms) >= LINK_TIMEOUT_MS {
                    warn!("link connect timed out, retrying");
                    link.abort();
                    metrics.link_reconnects += 1;
                    self.enter(ConnectionState::Disconnected, now_ms);
                }
                None
            }
            ConnectionState::LinkConnected => {
                if !link.is_up() {
                    self.enter(ConnectionState::Disconnected, now_ms);
                    return None;
                }
                if Self::retry_due(self.last_session_attempt_ms, now_ms) {
                    self.last_session_attempt_ms = Some(now_ms);
                    match self.open_session(epoch_seconds, session) {
                        Ok(()) => self.enter(ConnectionState::ConnectingSession, now_ms),
                        Err(reason) => {
                            // Same handling as a session timeout: counted,
                            // retried on the normal cadence.
                            warn!("session attempt failed: {}", reason);
                            session.disconnect();
                            metrics.session_reconnects += 1;
                        }
                    }
                }
                None
            }
            ConnectionState::ConnectingSession => {
                if session.is_established() {
                    self.enter(ConnectionState::FullyConnected, now_ms);
                    return Some(ConnEvent::SessionEstablished);
                }
                if now_ms.saturating_sub(self.state_since_ms) >= SESSION_TIMEOUT_MS {
                    warn!("session connect timed out");
                    session.disconnect();
                    metrics.session_reconnects += 1;
                    self.enter(ConnectionState::LinkConnected, now_ms);
                }
                None
            }
            ConnectionState::FullyConnected => {
                if !link.is_up() {
                    warn!("link lost");
                    session.disconnect();
                    self.enter(ConnectionState::Disconnected, now_ms);
                } else if !session.is_established() {
                    warn!("session lost");
                    session.disconnect();
                    self.enter(ConnectionState::LinkConnected, now_ms);
                }
                None
            }
        }
    }

    /// Signs a fresh credential, opens the session and queues the three
    /// inbound subscriptions. An unsynchronized clock or signing failure
    /// aborts the attempt before anything touches the network.
    fn open_session(
        &self,
        epoch_seconds: Option<u64>,
        session: &mut dyn SessionTransport,
    ) -> Result<(), String> {
        let now_epoch = epoch_seconds.ok_or("wall clock not synchronized")?;
        let token = auth::sign(
            &self.settings.host,
            &self.settings.device_id,
            &self.settings.device_key_b64,
            self.settings.token_ttl_secs,
            now_epoch,
        )
        .map_err(|e| e.to_string())?;

        let auth = SessionAuth {
            host: self.settings.host.clone(),
            port: self.settings.port,
            device_id: self.settings.device_id.clone(),
            username: format!(
                "{}/{}/?api-version={}",
                self.settings.host, self.settings.device_id, API_VERSION
            ),
            password: token,
        };
        session.begin_connect(&auth).map_err(|e| e.to_string())?;
        for filter in topics::inbound_filters(&self.settings.device_id) {
            session.subscribe(&filter).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
