use anyhow::{anyhow, Result};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::config::{VOLTAGE_SCALING, VOLTAGE_SETTLE_MS};

/// Calibrated ADC channel.
pub trait MillivoltRead: Send {
    fn read_millivolts(&mut self) -> Result<u16>;
}

/// Supply voltage measured through a switched divider. The divider only
/// draws current while the enable line is high.
pub struct BatteryProbe<E, A, D> {
    enable: E,
    adc: A,
    delay: D,
}

impl<E, A, D> BatteryProbe<E, A, D>
where
    E: OutputPin,
    A: MillivoltRead,
    D: DelayMs<u32>,
{
    pub fn new(enable: E, adc: A, delay: D) -> Self {
        Self { enable, adc, delay }
    }

    pub fn read_voltage(&mut self) -> Result<f32> {
        self.enable
            .set_high()
            .map_err(|_| anyhow!("cannot raise measurement enable"))?;
        self.delay.delay_ms(VOLTAGE_SETTLE_MS);

        let mv = self.adc.read_millivolts();
        self.enable.set_low().ok();

        let voltage = mv? as f32 / 1000.0 * VOLTAGE_SCALING;
        Ok(voltage)
    }
}
