use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use embedded_hal::digital::v2::OutputPin;
use log::{error, info, warn};

use crate::battery::{BatteryProbe, MillivoltRead};
use crate::clock::WallClock;
use crate::pt928::Pt928;
use crate::record::MeasurementRecord;
use crate::storage::RecordVolume;

/// Deep sleep length, chosen from supply voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepTier {
    Fast,
    Normal,
    Slow,
}

impl SleepTier {
    pub fn minutes(self) -> u32 {
        match self {
            SleepTier::Fast => 2,
            SleepTier::Normal => 5,
            SleepTier::Slow => 10,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.minutes() as u64 * 60)
    }
}

/// The healthier the supply, the more often the node reports. Anything that
/// is not a voltage reading sleeps longest.
pub fn sleep_tier(voltage: f32) -> SleepTier {
    if voltage >= 12.3 {
        SleepTier::Fast
    } else if voltage >= 11.8 {
        SleepTier::Normal
    } else {
        SleepTier::Slow
    }
}

/// The measurement chain of the board.
pub trait Sensors: Send {
    /// Die temperature in degrees Celsius.
    fn temperature(&mut self) -> Result<f32>;
    /// Raw 24-bit pressure reading.
    fn pressure(&mut self) -> Result<u32>;
    /// Supply voltage in volts.
    fn voltage(&mut self) -> Result<f32>;
}

pub type SharedSensors = Arc<Mutex<dyn Sensors>>;

pub trait Thermometer: Send {
    fn read_celsius(&mut self) -> Result<f32>;
}

/// The node's sensor set: a thermometer, the PT928 and the battery probe.
pub struct SensorChain<T, P, B> {
    thermometer: T,
    pressure: P,
    battery: B,
}

impl<T, P, B> SensorChain<T, P, B> {
    pub fn new(thermometer: T, pressure: P, battery: B) -> Self {
        Self {
            thermometer,
            pressure,
            battery,
        }
    }
}

impl<T, I, IE, D, E, A, W> Sensors for SensorChain<T, Pt928<I, D>, BatteryProbe<E, A, W>>
where
    T: Thermometer,
    I: Write<Error = IE> + WriteRead<Error = IE> + Send,
    IE: Debug,
    D: DelayMs<u32> + Send,
    E: OutputPin + Send,
    A: MillivoltRead,
    W: DelayMs<u32> + Send,
{
    fn temperature(&mut self) -> Result<f32> {
        self.thermometer.read_celsius()
    }

    fn pressure(&mut self) -> Result<u32> {
        self.pressure.read_pressure()
    }

    fn voltage(&mut self) -> Result<f32> {
        self.battery.read_voltage()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub record: MeasurementRecord,
    pub tier: SleepTier,
    pub logged: bool,
}

pub struct SamplingPipeline<'a> {
    sensors: &'a SharedSensors,
    clock: &'a WallClock,
}

impl<'a> SamplingPipeline<'a> {
    pub fn new(sensors: &'a SharedSensors, clock: &'a WallClock) -> Self {
        Self { sensors, clock }
    }

    /// Reads temperature, pressure and voltage, in that order. A failed read
    /// counts as an invalid value.
    pub fn capture(&self) -> MeasurementRecord {
        let Ok(mut sensors) = self.sensors.lock() else {
            error!("sensor lock poisoned");
            return MeasurementRecord {
                timestamp: self.clock.now(),
                pressure: 0,
                temperature: f32::NAN,
                voltage: f32::NAN,
            };
        };

        let temperature = sensors.temperature().unwrap_or_else(|e| {
            warn!("temperature read failed: {e:?}");
            f32::NAN
        });
        let pressure = sensors.pressure().unwrap_or_else(|e| {
            warn!("pressure read failed: {e:?}");
            0
        });
        let voltage = sensors.voltage().unwrap_or_else(|e| {
            warn!("voltage read failed: {e:?}");
            f32::NAN
        });

        MeasurementRecord {
            timestamp: self.clock.now(),
            pressure,
            temperature,
            voltage,
        }
    }

    /// Captures one sample and appends it to `file` if it is complete.
    pub fn run(&self, volume: &RecordVolume, file: &str) -> Sample {
        let record = self.capture();
        let tier = sleep_tier(record.voltage);
        info!(
            "Temperature: {:.2} C, Pressure: {}, Voltage: {:.2} V, sleep {} min",
            record.temperature,
            record.pressure,
            record.voltage,
            tier.minutes()
        );

        let logged = if record.is_valid() {
            match volume.append(file, &record.to_row()) {
                Ok(()) => true,
                Err(e) => {
                    error!("cannot append record: {e:?}");
                    false
                }
            }
        } else {
            warn!("invalid sample dropped");
            false
        };

        Sample { record, tier, logged }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimSensors, TempDir};
    use chrono_tz::Tz;

    #[test]
    fn tier_boundaries() {
        assert_eq!(sleep_tier(12.3).minutes(), 2);
        assert_eq!(sleep_tier(12.0).minutes(), 5);
        assert_eq!(sleep_tier(11.8).minutes(), 5);
        assert_eq!(sleep_tier(11.0).minutes(), 10);
        assert_eq!(sleep_tier(-1.0).minutes(), 10);
        assert_eq!(sleep_tier(f32::NAN).minutes(), 10);
    }

    #[test]
    fn tier_monotonic() {
        let mut last = u32::MAX;
        for step in 0..=300 {
            let v = 10.0 + step as f32 * 0.01;
            let minutes = sleep_tier(v).minutes();
            assert!(minutes <= last, "{v} V -> {minutes} min");
            last = minutes;
        }
    }

    fn pipeline_run(sensors: SimSensors) -> (Sample, String) {
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        let sensors: SharedSensors = Arc::new(Mutex::new(sensors));
        let clock = WallClock::new(Tz::UTC);

        let sample = SamplingPipeline::new(&sensors, &clock).run(&volume, "payload.txt");
        let contents = volume.read_to_string("payload.txt").unwrap_or_default();
        (sample, contents)
    }

    #[test]
    fn valid_sample_appended() {
        let (sample, contents) = pipeline_run(SimSensors::new(21.5, 123456, 12.5));
        assert!(sample.logged);
        assert_eq!(sample.tier, SleepTier::Fast);
        assert!(contents.ends_with(",'123456','21.50','12.50'\n"));
    }

    #[test]
    fn zero_pressure_dropped() {
        let (sample, contents) = pipeline_run(SimSensors::new(21.5, 0, 12.0));
        assert!(!sample.logged);
        assert_eq!(sample.tier, SleepTier::Normal);
        assert!(contents.is_empty());
    }

    #[test]
    fn failed_temperature_dropped() {
        let (sample, contents) = pipeline_run(SimSensors::new(21.5, 99, 11.0).failing_temperature());
        assert!(!sample.logged);
        assert!(sample.record.temperature.is_nan());
        assert!(contents.is_empty());
    }

    #[test]
    fn sensor_chain_reads_board_parts() {
        use crate::sim::{RecordingDelay, SimAdc, SimI2c, SimPin, SimThermometer};

        let mut chain = SensorChain::new(
            SimThermometer(18.5),
            Pt928::new(SimI2c::new(0x010203), RecordingDelay::default()),
            BatteryProbe::new(SimPin, SimAdc(1000), RecordingDelay::default()),
        );
        assert_eq!(chain.temperature().unwrap(), 18.5);
        assert_eq!(chain.pressure().unwrap(), 0x010203);
        assert!((chain.voltage().unwrap() - 11.0).abs() < 1e-4);
    }

    #[test]
    fn failed_voltage_still_logs_but_sleeps_long() {
        let (sample, _) = pipeline_run(SimSensors::new(21.5, 99, 12.5).failing_voltage());
        assert!(sample.logged);
        assert_eq!(sample.tier, SleepTier::Slow);
    }
}
