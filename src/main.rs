pub mod auth;
pub mod buffer;
pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod hw;
pub mod motion;
pub mod runtime;
pub mod twin;

use std::time::Duration;

use color_eyre::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::NodeConfig;
use crate::connection::{MqttSession, TcpProbeLink};
use crate::device::TomlConfigStore;
use crate::hw::{motion_signal, GpioIndicator, HostProbe, ProcessRestart, SystemClock};
use crate::runtime::{Collaborators, NodeRuntime};

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = NodeConfig::load()?;
    info!(
        host = %config.hub.host,
        device_id = %config.hub.device_id,
        "starting motion node"
    );

    let collaborators = Collaborators {
        link: Box::new(TcpProbeLink::new(config.hub.host.clone(), config.hub.port)),
        session: Box::new(MqttSession::new(MQTT_KEEP_ALIVE)),
        store: Box::new(TomlConfigStore::new(TomlConfigStore::default_path())),
        indicator: Box::new(GpioIndicator::new(&config.hardware)),
        signal: motion_signal(&config.hardware),
        probe: Box::new(HostProbe),
        clock: Box::new(SystemClock::new()),
        restart: Box::new(ProcessRestart),
    };

    let mut runtime = NodeRuntime::new(&config, collaborators);

    let mut ticker = tokio::time::interval(Duration::from_millis(config.node.tick_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        runtime.tick();
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
