//! Host hardware bindings.
//!
//! The node runs on a Raspberry Pi with a PIR sensor on one GPIO and a status
//! LED on another. Off-Pi (development, CI) GPIO setup fails at runtime and
//! everything degrades to simulated equivalents: the motion signal follows
//! the existence of a trigger file and the LED becomes log lines. The core
//! never knows the difference.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use rppal::gpio::{Gpio, InputPin, OutputPin};
use tracing::{debug, info, warn};

use crate::config::HardwareConfig;
use crate::device::{Clock, Indicator, Restart, SystemProbe};

/// Wall-clock readings below this are an unsynchronized clock, not a real
/// date. Matches the sanity floor the firmware used while waiting for NTP.
const EPOCH_SANITY_FLOOR: u64 = 1_700_000_000;

const SIM_TRIGGER_PATH: &str = "/tmp/motionlink-motion";

/// Raw boolean motion input sampled once per tick.
pub trait MotionSignal {
    fn sample(&mut self) -> bool;
}

pub struct GpioMotionSignal {
    pin: InputPin,
}

impl MotionSignal for GpioMotionSignal {
    fn sample(&mut self) -> bool {
        self.pin.is_high()
    }
}

/// Development stand-in: the signal is high while the trigger file exists.
pub struct SimulatedMotionSignal {
    trigger: PathBuf,
}

impl MotionSignal for SimulatedMotionSignal {
    fn sample(&mut self) -> bool {
        self.trigger.exists()
    }
}

/// Creates the motion input, falling back to simulation off-Pi.
pub fn motion_signal(hardware: &HardwareConfig) -> Box<dyn MotionSignal + Send> {
    match Gpio::new().and_then(|gpio| Ok(gpio.get(hardware.pir_pin)?.into_input_pulldown())) {
        Ok(pin) => {
            info!(pin = hardware.pir_pin, "PIR input on GPIO");
            Box::new(GpioMotionSignal { pin })
        }
        Err(e) => {
            warn!(
                "no GPIO available ({}), simulating motion via {}",
                e, SIM_TRIGGER_PATH
            );
            Box::new(SimulatedMotionSignal {
                trigger: PathBuf::from(SIM_TRIGGER_PATH),
            })
        }
    }
}

/// One step of a flash pattern: LED level and how long to hold it.
type FlashStep = (bool, u64);

/// Status LED with tick-driven flash patterns.
///
/// Acknowledgment patterns are queued as timed steps and advanced from
/// `service`, never by sleeping; the steady motion level is restored once a
/// pattern finishes.
pub struct GpioIndicator {
    pin: Option<OutputPin>,
    base_on: bool,
    pending: VecDeque<FlashStep>,
    current_until_ms: Option<u64>,
}

impl GpioIndicator {
    pub fn new(hardware: &HardwareConfig) -> Self {
        let pin = match Gpio::new().and_then(|gpio| Ok(gpio.get(hardware.led_pin)?.into_output())) {
            Ok(pin) => {
                info!(pin = hardware.led_pin, "status LED on GPIO");
                Some(pin)
            }
            Err(e) => {
                warn!("no GPIO available ({}), LED becomes log output", e);
                None
            }
        };
        Self {
            pin,
            base_on: false,
            pending: VecDeque::new(),
            current_until_ms: None,
        }
    }

    fn drive(&mut self, on: bool) {
        match &mut self.pin {
            Some(pin) if on => pin.set_high(),
            Some(pin) => pin.set_low(),
            None => debug!(led = on, "indicator"),
        }
    }

    fn queue(&mut self, steps: &[FlashStep]) {
        self.pending.clear();
        self.pending.extend(steps.iter().copied());
        self.current_until_ms = None;
    }
}

impl Indicator for GpioIndicator {
    fn motion(&mut self, active: bool) {
        self.base_on = active;
        if self.pending.is_empty() && self.current_until_ms.is_none() {
            self.drive(active);
        }
    }

    fn ack_enabled(&mut self) {
        // One long flash.
        self.queue(&[(true, 800), (false, 100)]);
    }

    fn ack_disabled(&mut self) {
        // Three short flashes.
        self.queue(&[
            (true, 150),
            (false, 150),
            (true, 150),
            (false, 150),
            (true, 150),
            (false, 150),
        ]);
    }

    fn service(&mut self, now_ms: u64) {
        if let Some(until) = self.current_until_ms {
            if now_ms < until {
                return;
            }
            self.current_until_ms = None;
        }
        match self.pending.pop_front() {
            Some((on, hold_ms)) => {
                self.drive(on);
                self.current_until_ms = Some(now_ms + hold_ms);
            }
            None => {
                let base = self.base_on;
                self.drive(base);
            }
        }
    }
}

/// Monotonic time from boot plus sanity-gated wall-clock time.
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn epoch_seconds(&self) -> Option<u64> {
        let now = chrono::Utc::now().timestamp();
        if now > EPOCH_SANITY_FLOOR as i64 {
            Some(now as u64)
        } else {
            None
        }
    }
}

/// Best-effort host vitals for the reported-state document.
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn rssi_dbm(&self) -> i32 {
        // No radio introspection on the host transport.
        0
    }

    fn free_heap_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| {
                meminfo.lines().find_map(|line| {
                    let value = line.strip_prefix("MemAvailable:")?;
                    let kb: u64 = value.trim().trim_end_matches(" kB").trim().parse().ok()?;
                    Some(kb * 1024)
                })
            })
            .unwrap_or(0)
    }

    fn cpu_freq_mhz(&self) -> u32 {
        std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq")
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .map(|khz| khz / 1_000)
            .unwrap_or(0)
    }
}

/// Clean process exit; the service supervisor brings the node back up.
pub struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&mut self) -> ! {
        info!("restarting");
        std::process::exit(0)
    }
}
