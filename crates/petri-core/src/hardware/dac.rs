//! DAC capability: four-channel LED intensity control, 0–100 %.

use std::fs::File;
use std::sync::{Arc, Mutex};

use i2c_linux::I2c;

use crate::error::{Error, Result};

/// The four LED driver channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedChannel {
    A,
    B,
    C,
    D,
}

impl LedChannel {
    pub const ALL: [LedChannel; 4] = [LedChannel::A, LedChannel::B, LedChannel::C, LedChannel::D];

    pub fn index(self) -> u8 {
        match self {
            LedChannel::A => 0,
            LedChannel::B => 1,
            LedChannel::C => 2,
            LedChannel::D => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(LedChannel::A),
            "B" => Some(LedChannel::B),
            "C" => Some(LedChannel::C),
            "D" => Some(LedChannel::D),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedChannel::A => write!(f, "A"),
            LedChannel::B => write!(f, "B"),
            LedChannel::C => write!(f, "C"),
            LedChannel::D => write!(f, "D"),
        }
    }
}

pub trait Dac: Send {
    /// Drive `channel` at `intensity` percent (clamped to 0–100).
    fn set_intensity(&mut self, channel: LedChannel, intensity: f64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// 10-bit register DAC
// ---------------------------------------------------------------------------

/// Ten-bit converter with one data register per channel (registers 8–11),
/// the code MSB-aligned in the 16-bit word.
pub struct RegisterDac {
    bus: I2c<File>,
}

impl RegisterDac {
    const CHANNEL_REGISTERS: [u8; 4] = [8, 9, 10, 11];

    pub fn open(bus_path: &str, address: u16) -> Result<Self> {
        let mut bus = I2c::from_path(bus_path)
            .map_err(|e| Error::Hardware(format!("open {bus_path}: {e}")))?;
        bus.smbus_set_slave_address(address, false)
            .map_err(|e| Error::Hardware(format!("dac address {address:#x}: {e}")))?;
        Ok(Self { bus })
    }
}

impl Dac for RegisterDac {
    fn set_intensity(&mut self, channel: LedChannel, intensity: f64) -> Result<()> {
        let fraction = intensity.clamp(0.0, 100.0) / 100.0;
        let code = ((fraction * 1023.0).round() as u16) << 2;
        let register = Self::CHANNEL_REGISTERS[channel.index() as usize];
        self.bus
            .smbus_write_word_data(register, code.swap_bytes())
            .map_err(|e| Error::Hardware(format!("dac write: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 8-bit I²C DAC
// ---------------------------------------------------------------------------

/// Eight-bit firmware DAC addressed over I²C: `round(intensity · 256 / 100)`,
/// saturated to one byte, written behind a per-channel command.
pub struct EightBitDac {
    bus: I2c<File>,
}

impl EightBitDac {
    const COMMAND_BASE: u8 = 0x02;

    pub fn open(bus_path: &str, address: u16) -> Result<Self> {
        let mut bus = I2c::from_path(bus_path)
            .map_err(|e| Error::Hardware(format!("open {bus_path}: {e}")))?;
        bus.smbus_set_slave_address(address, false)
            .map_err(|e| Error::Hardware(format!("dac address {address:#x}: {e}")))?;
        Ok(Self { bus })
    }
}

impl Dac for EightBitDac {
    fn set_intensity(&mut self, channel: LedChannel, intensity: f64) -> Result<()> {
        let code = eight_bit_code(intensity);
        self.bus
            .smbus_write_byte_data(Self::COMMAND_BASE + channel.index(), code)
            .map_err(|e| Error::Hardware(format!("dac write: {e}")))
    }
}

/// `intensity·256/100`, rounded, saturated to a byte.
pub fn eight_bit_code(intensity: f64) -> u8 {
    let scaled = (intensity.clamp(0.0, 100.0) / 100.0 * 256.0).round();
    scaled.min(255.0) as u8
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Remembers the last intensity per channel.
#[derive(Clone, Default)]
pub struct SimDac {
    pub levels: Arc<Mutex<[f64; 4]>>,
}

impl SimDac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, channel: LedChannel) -> f64 {
        self.levels.lock().unwrap()[channel.index() as usize]
    }
}

impl Dac for SimDac {
    fn set_intensity(&mut self, channel: LedChannel, intensity: f64) -> Result<()> {
        self.levels.lock().unwrap()[channel.index() as usize] = intensity.clamp(0.0, 100.0);
        Ok(())
    }
}
