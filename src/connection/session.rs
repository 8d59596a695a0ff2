//! Transport seams for the connection state machine.
//!
//! The manager only ever talks to [`LinkTransport`] and [`SessionTransport`];
//! the concrete host implementations here wrap a background TCP reachability
//! probe for the link layer and a `rumqttc` async client for the broker
//! session. Both are driven from the single tick task; the rumqttc event
//! loop runs on its own tokio task but only feeds a channel and a flag, it
//! never mutates device state.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// DigiCert Global Root G2, the root the broker's TLS chain pins to.
const BROKER_ROOT_CA: &str = "-----BEGIN CERTIFICATE-----
MIIDjjCCAnagAwIBAgIQAzrx5qcRqaC7KGSxHQn65TANBgkqhkiG9w0BAQsFADBh
MQswCQYDVQQGEwJVUzEVMBMGA1UEChMMRGlnaUNlcnQgSW5jMRkwFwYDVQQLExB3
d3cuZGlnaWNlcnQuY29tMSAwHgYDVQQDExdEaWdpQ2VydCBHbG9iYWwgUm9vdCBH
MjAeFw0xMzA4MDExMjAwMDBaFw0zODAxMTUxMjAwMDBaMGExCzAJBgNVBAYTAlVT
MRUwEwYDVQQKEwxEaWdpQ2VydCBJbmMxGTAXBgNVBAsTEHd3dy5kaWdpY2VydC5j
b20xIDAeBgNVBAMTF0RpZ2lDZXJ0IEdsb2JhbCBSb290IEcyMIIBIjANBgkqhkiG
9w0BAQEFAAOCAQ8AMIIBCgKCAQEAuzfNNNx7a8myaJCtSnX/RrohCgiN9RlUyfuI
2/Ou8jqJkTx65qsGGmvPrC3oXgkkRLpimn7Wo6h+4FR1IAWsULecYxpsMNzaHxmx
1x7e/dfgy5SDN67sH0NO3Xss0r0upS/kqbitOtSZpLYl6ZtrAGCSYP9PIUkY92eQ
q2EGnI/yuum06ZIya7XzV+hdG82MHauVBJVJ8zUtluNJbd134/tJS7SsVQepj5Wz
tCO7TG1F8PapspUwtP1MVYwnSlcUfIKdzXOS0xZKBgyMUNGPHgm+F6HmIcr9g+UQ
vIOlCsRnKPZzFBQ9RnbDhxSJITRNrw9FDKZJobq7nMWxM4MphQIDAQABo0IwQDAP
BgNVHRMBAf8EBTADAQH/MA4GA1UdDwEB/wQEAwIBhjAdBgNVHQ4EFgQUTiJUIBiV
5uNu5g/6+rkS7QYXjzkwDQYJKoZIhvcNAQELBQADggEBAGBnKJRvDkhj6zHd6mcY
1Yl9PMWLSn/pvtsrF9+wX3N3KjITOYFnQoQj8kVnNeyIv/iPsGEMNKSuIEyExtv4
NeF22d+mQrvHRAiGfzZ0JFrabA0UWTW98kndth/Jsw1HKj2ZL7tcu7XUIOGZX1NG
Fdtom/DzMNU+MeKNhJ7jitralj41E6Vf8PlwUHBHQRFXGU7Aj64GxJUTFy8bJZ91
8rGOmaFvE7FBcf6IKshPECBV1/MUReXgRPTqh5Uykw7+U0b6LJ3/iyK5S9kJRaTe
pLiaWN0bfVKfjllDiIGknibVb63dDcY3fe0Dkhvld1927jyNxF1WW6LZZm6zNTfl
MrY=
-----END CERTIFICATE-----
";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session is open")]
    NotConnected,
    #[error("mqtt client: {0}")]
    Client(String),
}

/// Credentials for one session attempt. The password is the freshly signed
/// SAS token, never a static secret.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub username: String,
    pub password: String,
}

/// An inbound publish delivered by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Wide-area link layer (Wi-Fi on the device, plain IP reachability here).
pub trait LinkTransport {
    fn begin_connect(&mut self);
    fn is_up(&mut self) -> bool;
    fn abort(&mut self);
}

/// Authenticated publish/subscribe session to the broker.
pub trait SessionTransport {
    fn begin_connect(&mut self, auth: &SessionAuth) -> Result<(), SessionError>;
    fn is_established(&mut self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
    fn subscribe(&mut self, filter: &str) -> Result<(), SessionError>;
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
    fn disconnect(&mut self);
}

/// Flags owned by one probe-thread generation. The stop flag is set once on
/// abort and never cleared; a superseded thread exits on it no matter when it
/// wakes, so reconnect cycles cannot accumulate threads.
struct ProbeHandle {
    up: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

/// Link probe: repeatedly checks TCP reachability of the broker endpoint from
/// a background thread so the tick never blocks on name resolution.
pub struct TcpProbeLink {
    host: String,
    port: u16,
    probe: Option<ProbeHandle>,
}

impl TcpProbeLink {
    const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    const PROBE_INTERVAL: Duration = Duration::from_secs(3);

    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            probe: None,
        }
    }

    fn probe_once(host: &str, port: u16) -> bool {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(%host, "name resolution failed: {}", e);
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, Self::PROBE_TIMEOUT).is_ok() {
                return true;
            }
        }
        false
    }
}

impl LinkTransport for TcpProbeLink {
    fn begin_connect(&mut self) {
        if let Some(probe) = &self.probe {
            // Current generation still running, keep it.
            if !probe.stop.load(Ordering::SeqCst) {
                return;
            }
        }
        let up = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let host = self.host.clone();
        let port = self.port;
        {
            let up = up.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                info!(%host, port, "link probe started");
                while !stop.load(Ordering::SeqCst) {
                    let reachable = Self::probe_once(&host, port);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    up.store(reachable, Ordering::SeqCst);
                    std::thread::sleep(Self::PROBE_INTERVAL);
                }
                debug!(%host, "link probe stopped");
            });
        }
        self.probe = Some(ProbeHandle { up, stop });
    }

    fn is_up(&mut self) -> bool {
        self.probe
            .as_ref()
            .map_or(false, |probe| probe.up.load(Ordering::SeqCst))
    }

    fn abort(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Broker session over rumqttc. One event-loop task per connect attempt; a
/// failed or lost connection drops the establishment flag and the state
/// machine takes it from there.
pub struct MqttSession {
    client: Option<AsyncClient>,
    established: Arc<AtomicBool>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
    event_task: Option<JoinHandle<()>>,
    keep_alive: Duration,
}

impl MqttSession {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            client: None,
            established: Arc::new(AtomicBool::new(false)),
            inbound: None,
            event_task: None,
            keep_alive,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.client = None;
        self.inbound = None;
        self.established.store(false, Ordering::SeqCst);
    }
}

impl SessionTransport for MqttSession {
    fn begin_connect(&mut self, auth: &SessionAuth) -> Result<(), SessionError> {
        self.teardown();

        let mut options = MqttOptions::new(&auth.device_id, &auth.host, auth.port);
        options
            .set_credentials(&auth.username, &auth.password)
            .set_keep_alive(self.keep_alive);
        if auth.port == 8883 {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: BROKER_ROOT_CA.as_bytes().to_vec(),
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(64);
        let established = self.established.clone();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("broker session established");
                            established.store(true, Ordering::SeqCst);
                        } else {
                            warn!(code = ?ack.code, "broker refused the session");
                            established.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.try_send(message).is_err() {
                            warn!(topic = %publish.topic, "inbound queue full, dropping");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("session event loop error: {}", e);
                        established.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        self.client = Some(client);
        self.inbound = Some(rx);
        self.event_task = Some(task);
        Ok(())
    }

    fn is_established(&mut self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| SessionError::Client(e.to_string()))
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| SessionError::Client(e.to_string()))
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.as_mut()?.try_recv().ok()
    }

    fn disconnect(&mut self) {
        if let Some(client) = &self.client {
            let _ = client.try_disconnect();
        }
        self.teardown();
    }
}
