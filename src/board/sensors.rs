use std::ptr;

use anyhow::{Context, Result};
use esp_idf_hal::adc::{self, AdcChannelDriver, AdcDriver, Atten6dB, ADC1};
use esp_idf_hal::gpio::Gpio3;
use esp_idf_sys::{
    esp, soc_periph_temperature_sensor_clk_src_t_TEMPERATURE_SENSOR_CLK_SRC_DEFAULT,
    temperature_sensor_config_t, temperature_sensor_disable, temperature_sensor_enable,
    temperature_sensor_get_celsius, temperature_sensor_handle_t, temperature_sensor_install,
    temperature_sensor_uninstall,
};

use crate::battery::MillivoltRead;
use crate::sampling::Thermometer;

/// The chip's internal temperature sensor. Installed for each read.
pub struct DieThermometer;

impl Thermometer for DieThermometer {
    fn read_celsius(&mut self) -> Result<f32> {
        let config = temperature_sensor_config_t {
            range_min: -10,
            range_max: 80,
            clk_src: soc_periph_temperature_sensor_clk_src_t_TEMPERATURE_SENSOR_CLK_SRC_DEFAULT,
            ..Default::default()
        };
        let mut handle: temperature_sensor_handle_t = ptr::null_mut();

        esp!(unsafe { temperature_sensor_install(&config, &mut handle) })
            .context("temperature sensor install")?;

        let mut celsius = f32::NAN;
        let read = esp!(unsafe { temperature_sensor_enable(handle) }).and_then(|_| {
            let read = esp!(unsafe { temperature_sensor_get_celsius(handle, &mut celsius) });
            unsafe { temperature_sensor_disable(handle) };
            read
        });
        unsafe { temperature_sensor_uninstall(handle) };

        read.context("temperature sensor read")?;
        Ok(celsius)
    }
}

/// Supply divider tap on GPIO3, calibrated to millivolts.
pub struct BatteryAdc {
    driver: AdcDriver<'static, ADC1>,
    channel: AdcChannelDriver<'static, Gpio3, Atten6dB<ADC1>>,
}

impl BatteryAdc {
    pub fn new(adc1: ADC1, pin: Gpio3) -> Result<Self> {
        let channel: AdcChannelDriver<_, Atten6dB<ADC1>> = AdcChannelDriver::new(pin)?;
        let driver = AdcDriver::new(
            adc1,
            &adc::config::Config::new()
                .calibration(true)
                .resolution(adc::config::Resolution::Resolution12Bit),
        )?;

        Ok(Self { driver, channel })
    }
}

impl MillivoltRead for BatteryAdc {
    fn read_millivolts(&mut self) -> Result<u16> {
        Ok(self.driver.read(&mut self.channel)?)
    }
}
