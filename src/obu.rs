use thiserror::Error;
use tracing::debug;

// PCA9685-class actuator boards drive 16 channels with 12-bit pulses.
pub const MAX_CHANNEL: u8 = 15;
pub const MAX_PULSE: u16 = 4096;

const DEFAULT_PWM_FREQUENCY_HZ: u32 = 50;

#[derive(Debug, Error)]
pub enum ObuError {
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    #[error("invalid pulse value {0}")]
    InvalidPulse(u16),
    #[error("hardware failure: {0}")]
    Hardware(String),
}

#[derive(Debug, Clone)]
pub struct ObuConfig {
    pub pwm_frequency_hz: u32,
}

impl Default for ObuConfig {
    fn default() -> Self {
        Self {
            pwm_frequency_hz: DEFAULT_PWM_FREQUENCY_HZ,
        }
    }
}

/// Actuation capability consumed by the vehicle state manager.
///
/// Implementations own all actuator-specific calibration (servo ranges,
/// ESC pulse encoding, PWM timing); the core only speaks in degrees and
/// percent. Hardware drivers for real PWM/I2C boards live outside this
/// crate; [`VirtualObu`] is the software-only stand-in.
pub trait OnboardUnit: Send {
    /// Prepare the device. Called once at startup; a failure here is fatal.
    fn init(&mut self) -> Result<(), ObuError>;

    /// Release all resources.
    fn shutdown(&mut self) -> Result<(), ObuError>;

    /// Point the vehicle; `angle_deg` is 0 for straight ahead.
    fn direction(&mut self, angle_deg: i32) -> Result<(), ObuError>;

    /// Apply throttle in the range -100..=100.
    fn throttle(&mut self, value: i32) -> Result<(), ObuError>;

    /// Set the raw on/off pulse for one actuator channel.
    fn set_channel_pulse(&mut self, channel: u8, pulse_on: u16, pulse_off: u16)
        -> Result<(), ObuError>;
}

/// Software-only onboard unit for local runs and tests.
///
/// Validates arguments like the real board driver would, logs every call,
/// and drives nothing.
#[derive(Debug)]
pub struct VirtualObu {
    cfg: ObuConfig,
    initialized: bool,
}

impl VirtualObu {
    pub fn new(cfg: ObuConfig) -> Self {
        Self {
            cfg,
            initialized: false,
        }
    }
}

impl OnboardUnit for VirtualObu {
    fn init(&mut self) -> Result<(), ObuError> {
        debug!(frequency_hz = self.cfg.pwm_frequency_hz, "virtual OBU initialized");
        self.initialized = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ObuError> {
        debug!("virtual OBU shut down");
        self.initialized = false;
        Ok(())
    }

    fn direction(&mut self, angle_deg: i32) -> Result<(), ObuError> {
        debug!(angle_deg, "virtual OBU direction");
        Ok(())
    }

    fn throttle(&mut self, value: i32) -> Result<(), ObuError> {
        debug!(value, "virtual OBU throttle");
        Ok(())
    }

    fn set_channel_pulse(
        &mut self,
        channel: u8,
        pulse_on: u16,
        pulse_off: u16,
    ) -> Result<(), ObuError> {
        if channel > MAX_CHANNEL {
            return Err(ObuError::InvalidChannel(channel));
        }
        if pulse_on > MAX_PULSE {
            return Err(ObuError::InvalidPulse(pulse_on));
        }
        if pulse_off > MAX_PULSE {
            return Err(ObuError::InvalidPulse(pulse_off));
        }
        debug!(channel, pulse_on, pulse_off, "virtual OBU channel pulse");
        Ok(())
    }
}
