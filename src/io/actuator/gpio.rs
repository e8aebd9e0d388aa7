//! Sysfs GPIO actuator
//!
//! Layout under `sysfs_root` (normally /sys/class):
//! - gpio/export, gpio/gpio<N>/{direction,value} for the red and green lamps
//! - pwm/pwmchip<C>/export, pwm/pwmchip<C>/pwm<ch>/{period,duty_cycle,enable} for the servo
//!
//! Servo: 50 Hz, 1.0 ms pulse = closed (0°), 1.5 ms pulse = open (90°).

use super::{Actuator, ActuatorError};
use crate::domain::types::{GatePosition, IndicatorState};
use crate::infra::config::GpioConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const SERVO_PERIOD_NS: u64 = 20_000_000;
const SERVO_CLOSED_DUTY_NS: u64 = 1_000_000;
const SERVO_OPEN_DUTY_NS: u64 = 1_500_000;

/// Log a failed output write (cold path)
#[cold]
fn log_write_failed(path: &Path, e: &std::io::Error) {
    error!(path = %path.display(), error = %e, "gpio_write_failed");
}

fn init_write(what: &'static str, path: &Path, value: &str) -> Result<(), ActuatorError> {
    fs::write(path, value).map_err(|source| ActuatorError::Init {
        what,
        path: path.display().to_string(),
        source,
    })
}

/// Export a sysfs node unless it is already present
fn ensure_exported(
    what: &'static str,
    export: &Path,
    node: &Path,
    index: u32,
) -> Result<(), ActuatorError> {
    if node.is_dir() {
        return Ok(());
    }
    init_write(what, export, &index.to_string())?;
    if !node.is_dir() {
        return Err(ActuatorError::Init {
            what,
            path: node.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "node missing after export"),
        });
    }
    Ok(())
}

struct Lamp {
    value: PathBuf,
}

impl Lamp {
    fn open(root: &Path, pin: u32) -> Result<Self, ActuatorError> {
        let gpio = root.join("gpio");
        let node = gpio.join(format!("gpio{pin}"));
        ensure_exported("gpio export", &gpio.join("export"), &node, pin)?;
        init_write("gpio direction", &node.join("direction"), "out")?;
        Ok(Self { value: node.join("value") })
    }

    fn set(&self, on: bool) {
        if let Err(e) = fs::write(&self.value, if on { "1" } else { "0" }) {
            log_write_failed(&self.value, &e);
        }
    }
}

struct Servo {
    duty_cycle: PathBuf,
}

impl Servo {
    fn open(root: &Path, chip: u32, channel: u32) -> Result<Self, ActuatorError> {
        let chip_dir = root.join("pwm").join(format!("pwmchip{chip}"));
        let node = chip_dir.join(format!("pwm{channel}"));
        ensure_exported("pwm export", &chip_dir.join("export"), &node, channel)?;
        init_write("pwm period", &node.join("period"), &SERVO_PERIOD_NS.to_string())?;
        init_write(
            "pwm duty_cycle",
            &node.join("duty_cycle"),
            &SERVO_CLOSED_DUTY_NS.to_string(),
        )?;
        init_write("pwm enable", &node.join("enable"), "1")?;
        Ok(Self { duty_cycle: node.join("duty_cycle") })
    }

    fn drive(&self, position: GatePosition) {
        let duty = match position {
            GatePosition::Open => SERVO_OPEN_DUTY_NS,
            GatePosition::Closed => SERVO_CLOSED_DUTY_NS,
        };
        if let Err(e) = fs::write(&self.duty_cycle, duty.to_string()) {
            log_write_failed(&self.duty_cycle, &e);
        }
    }
}

struct Outputs {
    position: GatePosition,
    indicators: IndicatorState,
    /// Sequence number of the last command written to the pins
    applied: u64,
}

struct Pins {
    red: Lamp,
    green: Lamp,
    servo: Servo,
    outputs: Mutex<Outputs>,
}

impl Pins {
    /// Write command `seq` unless a later command already reached the pins.
    /// Returns the previous position when written.
    fn apply(&self, target: GatePosition, seq: u64) -> Option<GatePosition> {
        let mut outputs = self.outputs.lock();
        if seq <= outputs.applied {
            return None;
        }
        let previous = outputs.position;
        let indicators = IndicatorState::for_position(target);
        self.write_indicators(indicators);
        self.servo.drive(target);
        *outputs = Outputs { position: target, indicators, applied: seq };
        Some(previous)
    }

    /// Drive both lamps; the lamp going dark is written first
    fn write_indicators(&self, indicators: IndicatorState) {
        if indicators.green() {
            self.red.set(false);
            self.green.set(true);
        } else {
            self.green.set(false);
            self.red.set(true);
        }
    }
}

/// Physical gate on sysfs GPIO/PWM
///
/// Sysfs writes run on the blocking pool. Commands are numbered when issued,
/// so one still in flight when a newer command is issued is discarded.
pub struct GpioActuator {
    pins: Arc<Pins>,
    issued: AtomicU64,
    travel_time: Duration,
}

impl GpioActuator {
    /// Export and configure all outputs, leaving the gate closed with red lit
    pub fn open(config: &GpioConfig, travel_time: Duration) -> Result<Self, ActuatorError> {
        let root = Path::new(&config.sysfs_root);
        let red = Lamp::open(root, config.red_pin)?;
        let green = Lamp::open(root, config.green_pin)?;
        let servo = Servo::open(root, config.servo_pwm_chip, config.servo_pwm_channel)?;

        green.set(false);
        red.set(true);

        info!(
            sysfs_root = %config.sysfs_root,
            red_pin = %config.red_pin,
            green_pin = %config.green_pin,
            pwm_chip = %config.servo_pwm_chip,
            pwm_channel = %config.servo_pwm_channel,
            "gpio_initialized"
        );

        Ok(Self {
            pins: Arc::new(Pins {
                red,
                green,
                servo,
                outputs: Mutex::new(Outputs {
                    position: GatePosition::Closed,
                    indicators: IndicatorState::for_position(GatePosition::Closed),
                    applied: 0,
                }),
            }),
            issued: AtomicU64::new(0),
            travel_time,
        })
    }
}

#[async_trait]
impl Actuator for GpioActuator {
    async fn set_position(&self, target: GatePosition) {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let pins = self.pins.clone();

        let previous = match tokio::task::spawn_blocking(move || pins.apply(target, seq)).await {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                debug!(target = %target.as_str(), seq = %seq, "gpio_command_superseded");
                return;
            }
            Err(e) => {
                error!(target = %target.as_str(), error = %e, "gpio_write_task_failed");
                return;
            }
        };

        info!(target = %target.as_str(), "gpio_gate_command");

        // No position feedback from the servo; completion is the nominal travel time
        if previous != target && !self.travel_time.is_zero() {
            tokio::time::sleep(self.travel_time).await;
        }
    }

    fn indicators(&self) -> IndicatorState {
        self.pins.outputs.lock().indicators
    }

    fn position(&self) -> GatePosition {
        self.pins.outputs.lock().position
    }

    fn name(&self) -> &'static str {
        "gpio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fake sysfs tree with pins and PWM channel already exported
    fn fake_sysfs() -> (TempDir, GpioConfig) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for pin in [23, 24] {
            fs::create_dir_all(root.join(format!("gpio/gpio{pin}"))).unwrap();
        }
        fs::create_dir_all(root.join("pwm/pwmchip0/pwm0")).unwrap();

        let config = GpioConfig {
            sysfs_root: root.display().to_string(),
            ..GpioConfig::default()
        };
        (dir, config)
    }

    fn read(dir: &TempDir, rel: &str) -> String {
        fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    #[tokio::test]
    async fn test_open_initializes_closed() {
        let (dir, config) = fake_sysfs();
        let actuator = GpioActuator::open(&config, Duration::ZERO).unwrap();

        assert_eq!(read(&dir, "gpio/gpio23/direction"), "out");
        assert_eq!(read(&dir, "gpio/gpio23/value"), "1");
        assert_eq!(read(&dir, "gpio/gpio24/value"), "0");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/period"), "20000000");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/duty_cycle"), "1000000");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/enable"), "1");
        assert!(actuator.indicators().red());
    }

    #[tokio::test]
    async fn test_set_position_drives_outputs() {
        let (dir, config) = fake_sysfs();
        let actuator = GpioActuator::open(&config, Duration::ZERO).unwrap();

        actuator.set_position(GatePosition::Open).await;
        assert_eq!(read(&dir, "gpio/gpio23/value"), "0");
        assert_eq!(read(&dir, "gpio/gpio24/value"), "1");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/duty_cycle"), "1500000");
        assert_eq!(actuator.position(), GatePosition::Open);

        actuator.set_position(GatePosition::Closed).await;
        assert_eq!(read(&dir, "gpio/gpio23/value"), "1");
        assert_eq!(read(&dir, "gpio/gpio24/value"), "0");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/duty_cycle"), "1000000");
    }

    #[test]
    fn test_stale_command_is_discarded() {
        let (dir, config) = fake_sysfs();
        let actuator = GpioActuator::open(&config, Duration::ZERO).unwrap();

        // Close issued after open, but its write reaches the pins first
        assert_eq!(actuator.pins.apply(GatePosition::Closed, 2), Some(GatePosition::Closed));
        assert_eq!(actuator.pins.apply(GatePosition::Open, 1), None);

        assert_eq!(read(&dir, "gpio/gpio23/value"), "1");
        assert_eq!(read(&dir, "gpio/gpio24/value"), "0");
        assert_eq!(read(&dir, "pwm/pwmchip0/pwm0/duty_cycle"), "1000000");
        assert_eq!(actuator.position(), GatePosition::Closed);
        assert!(actuator.indicators().red());
    }

    #[test]
    fn test_missing_sysfs_is_init_error() {
        let dir = TempDir::new().unwrap();
        let config = GpioConfig {
            sysfs_root: dir.path().join("nope").display().to_string(),
            ..GpioConfig::default()
        };
        let err = GpioActuator::open(&config, Duration::ZERO).err().unwrap();
        assert!(matches!(err, ActuatorError::Init { what: "gpio export", .. }));
    }

    #[test]
    fn test_export_without_node_is_init_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("gpio")).unwrap();
        fs::write(dir.path().join("gpio/export"), "").unwrap();
        let config = GpioConfig {
            sysfs_root: dir.path().display().to_string(),
            ..GpioConfig::default()
        };
        // Export accepted but the kernel never created gpio23
        let err = GpioActuator::open(&config, Duration::ZERO).err().unwrap();
        let ActuatorError::Init { path, .. } = err;
        assert!(path.ends_with("gpio23"));
    }
}
