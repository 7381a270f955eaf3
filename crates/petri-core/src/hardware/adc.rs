//! ADC capability: gain-programmable multi-channel voltage sampling.
//!
//! The Linux implementation drives an ADS1115-class converter over I²C in
//! single-shot mode at its fastest data rate. The simulator evaluates a
//! caller-supplied signal function against a monotonic clock, which is what
//! the sampler tests feed sine waves through.

use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use i2c_linux::I2c;

use crate::error::{Error, Result};

/// Programmable gain. Each setting clamps the measurable voltage range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    TwoThirds,
    One,
    Two,
    Four,
    Eight,
    Sixteen,
}

impl Gain {
    pub const ALL: [Gain; 6] = [
        Gain::TwoThirds,
        Gain::One,
        Gain::Two,
        Gain::Four,
        Gain::Eight,
        Gain::Sixteen,
    ];

    /// Full-scale input range, ±volts.
    pub fn full_scale_volts(self) -> f64 {
        match self {
            Gain::TwoThirds => 6.144,
            Gain::One => 4.096,
            Gain::Two => 2.048,
            Gain::Four => 1.024,
            Gain::Eight => 0.512,
            Gain::Sixteen => 0.256,
        }
    }

    /// The `(lower, upper)` signal band this gain is the right choice for:
    /// everything from the next-narrower full scale up to its own.
    pub fn band(self) -> (f64, f64) {
        match self {
            Gain::TwoThirds => (4.096, 6.144),
            Gain::One => (2.048, 4.096),
            Gain::Two => (1.024, 2.048),
            Gain::Four => (0.512, 1.024),
            Gain::Eight => (0.256, 0.512),
            Gain::Sixteen => (-1.0, 0.256),
        }
    }

    fn pga_bits(self) -> u16 {
        match self {
            Gain::TwoThirds => 0b000,
            Gain::One => 0b001,
            Gain::Two => 0b010,
            Gain::Four => 0b011,
            Gain::Eight => 0b100,
            Gain::Sixteen => 0b101,
        }
    }
}

pub trait Adc: Send {
    fn set_gain(&mut self, gain: Gain);
    fn gain(&self) -> Gain;
    /// One single-ended conversion on `channel` (0–3), in volts.
    fn read_voltage(&mut self, channel: u8) -> Result<f64>;
}

// ---------------------------------------------------------------------------
// ADS1115 over I²C
// ---------------------------------------------------------------------------

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

pub struct Ads1115 {
    bus: I2c<File>,
    gain: Gain,
}

impl Ads1115 {
    pub fn open(bus_path: &str, address: u16, gain: Gain) -> Result<Self> {
        let mut bus = I2c::from_path(bus_path)
            .map_err(|e| Error::Hardware(format!("open {bus_path}: {e}")))?;
        bus.smbus_set_slave_address(address, false)
            .map_err(|e| Error::Hardware(format!("adc address {address:#x}: {e}")))?;
        Ok(Self { bus, gain })
    }

    fn write_register(&mut self, register: u8, value: u16) -> std::io::Result<()> {
        // SMBus words are little-endian on the wire; the converter wants MSB first
        self.bus.smbus_write_word_data(register, value.swap_bytes())
    }

    fn read_register(&mut self, register: u8) -> std::io::Result<u16> {
        Ok(self.bus.smbus_read_word_data(register)?.swap_bytes())
    }
}

impl Adc for Ads1115 {
    fn set_gain(&mut self, gain: Gain) {
        self.gain = gain;
    }

    fn gain(&self) -> Gain {
        self.gain
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64> {
        if channel > 3 {
            return Err(Error::InvalidArgument(format!(
                "adc channel {channel} out of range"
            )));
        }
        let config: u16 = (1 << 15)                       // begin single conversion
            | (u16::from(0b100 | channel) << 12)          // single-ended mux
            | (self.gain.pga_bits() << 9)
            | (1 << 8)                                    // single-shot mode
            | (0b111 << 5)                                // 860 SPS
            | 0b11; // comparator disabled
        self.write_register(REG_CONFIG, config)
            .map_err(|e| Error::Hardware(format!("adc config: {e}")))?;
        // one conversion at 860 SPS plus settling margin
        std::thread::sleep(std::time::Duration::from_micros(1400));
        let raw = self
            .read_register(REG_CONVERSION)
            .map_err(|e| Error::Hardware(format!("adc read: {e}")))? as i16;
        Ok(f64::from(raw) * self.gain.full_scale_volts() / 32768.0)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

type SignalFn = dyn FnMut(u8, f64) -> f64 + Send;

/// Evaluates `signal(channel, elapsed_secs)` per read. Saturates at the
/// configured gain's full scale like the real converter.
pub struct SimAdc {
    gain: Gain,
    started: Instant,
    signal: Arc<Mutex<Box<SignalFn>>>,
}

impl SimAdc {
    pub fn new<F>(gain: Gain, signal: F) -> Self
    where
        F: FnMut(u8, f64) -> f64 + Send + 'static,
    {
        Self {
            gain,
            started: Instant::now(),
            signal: Arc::new(Mutex::new(Box::new(signal))),
        }
    }

    /// Same value on every channel forever.
    pub fn constant(gain: Gain, volts: f64) -> Self {
        Self::new(gain, move |_, _| volts)
    }
}

impl Adc for SimAdc {
    fn set_gain(&mut self, gain: Gain) {
        self.gain = gain;
    }

    fn gain(&self) -> Gain {
        self.gain
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let fs = self.gain.full_scale_volts();
        let value = (self.signal.lock().unwrap())(channel, elapsed);
        Ok(value.clamp(-fs, fs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_table_matches_gain_ladder() {
        let scales: Vec<f64> = Gain::ALL.iter().map(|g| g.full_scale_volts()).collect();
        assert_eq!(scales, vec![6.144, 4.096, 2.048, 1.024, 0.512, 0.256]);
    }

    #[test]
    fn bands_tile_the_range() {
        // each band's upper bound is the gain's own full scale
        for gain in Gain::ALL {
            let (lower, upper) = gain.band();
            assert_eq!(upper, gain.full_scale_volts());
            assert!(lower < upper);
        }
    }

    #[test]
    fn sim_constant_reads_back() {
        let mut adc = SimAdc::constant(Gain::One, 1.5);
        assert!((adc.read_voltage(0).unwrap() - 1.5).abs() < 1e-12);
        assert!((adc.read_voltage(3).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn sim_saturates_at_full_scale() {
        let mut adc = SimAdc::constant(Gain::Sixteen, 2.0);
        assert_eq!(adc.read_voltage(0).unwrap(), 0.256);
        adc.set_gain(Gain::One);
        assert_eq!(adc.read_voltage(0).unwrap(), 2.0);
    }

    #[test]
    fn sim_signal_sees_channel() {
        let mut adc = SimAdc::new(Gain::One, |ch, _| f64::from(ch));
        assert_eq!(adc.read_voltage(2).unwrap(), 2.0);
        assert_eq!(adc.read_voltage(3).unwrap(), 3.0);
    }
}
