//! ADS1115 16-bit ADC driver over I2C: AIN0 reads the capacitive soil
//! probe, AIN1 a thermistor voltage-divider for the co-located
//! temperature channel. Single-ended, PGA +-4.096V, 128 SPS, single-shot.

use super::{RawReading, SensorBackend};
use crate::error::{AgriScanError, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (+-4.096V), MODE=1 (single-shot), DR=100 (128 SPS),
/// COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const SOIL_CHANNEL: usize = 0;
const TEMP_CHANNEL: usize = 1;

const CONVERSION_WAIT: Duration = Duration::from_millis(9);
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

pub struct AdcBackend {
    i2c: I2c,
}

/// Default ADS1115 address with ADDR tied to GND.
const DEFAULT_I2C_ADDR: u16 = 0x48;

impl Default for AdcBackend {
    fn default() -> Self {
        Self::new(DEFAULT_I2C_ADDR).expect("ads1115 initialisation failed")
    }
}

impl AdcBackend {
    pub fn new(addr: u16) -> Result<Self> {
        let mut i2c = I2c::new()
            .map_err(|e| AgriScanError::Fatal(format!("i2c bus open failed: {e}")))?;
        i2c.set_slave_address(addr)
            .map_err(|e| AgriScanError::Fatal(format!("i2c set address failed: {e}")))?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self { i2c })
    }

    fn read_channel(&mut self, channel: usize) -> Result<i16> {
        let config = config_for_channel(channel);
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .map_err(|e| AgriScanError::Fatal(format!("adc config write failed: {e}")))?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c
                .block_read(REG_CONFIG, &mut buf)
                .map_err(|e| AgriScanError::Fatal(format!("adc status read failed: {e}")))?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .map_err(|e| AgriScanError::Fatal(format!("adc conversion read failed: {e}")))?;
        Ok(i16::from_be_bytes(buf))
    }

    /// Thermistor divider to Celsius — simplified linear approximation over
    /// the 0-1650 raw band (NTC 10k, 3.3V divider); good enough for QC
    /// bounds checking, not lab-grade accuracy.
    fn temp_from_raw(raw: i16) -> f64 {
        let frac = (raw as f64 / 1650.0).clamp(0.0, 1.0);
        -10.0 + frac * 70.0
    }
}

impl SensorBackend for AdcBackend {
    fn read(&mut self) -> Result<RawReading> {
        let soil_raw = self.read_channel(SOIL_CHANNEL)?;
        let temp_raw = self.read_channel(TEMP_CHANNEL)?;
        Ok(RawReading {
            raw: (soil_raw as i32).clamp(0, 32767) as i64,
            temp_c: Self::temp_from_raw(temp_raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_soil_channel() {
        assert_eq!(config_for_channel(SOIL_CHANNEL), 0xC383);
    }

    #[test]
    fn config_register_temp_channel() {
        assert_eq!(config_for_channel(TEMP_CHANNEL), 0xD383);
    }

    #[test]
    fn config_base_is_single_shot_128sps() {
        assert_eq!((CONFIG_BASE >> 8) & 1, 1);
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100);
    }

    #[test]
    fn temp_from_raw_midpoint() {
        let t = AdcBackend::temp_from_raw(825);
        assert!((t - 25.0).abs() < 1.0);
    }

    #[test]
    fn temp_from_raw_clamped_bounds() {
        assert!((AdcBackend::temp_from_raw(0) - (-10.0)).abs() < 1e-9);
        assert!((AdcBackend::temp_from_raw(3000) - 60.0).abs() < 1e-9);
    }
}
