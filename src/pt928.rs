use std::fmt::Debug;

use anyhow::{anyhow, Result};
use arbitrary_int::*;
use bitbybit::bitfield;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use log::debug;

pub const DEVICE_ADDR: u8 = 0x6D;
const CONVERSION_MS: u32 = 25;

#[allow(unused)]
mod register {
    pub const STATUS: u8 = 0x02;
    pub const DATA_MSB: u8 = 0x06; // 0x06...0x08, big endian
    pub const CMD: u8 = 0x30; // |sleep_time<7:4>|sco|measurement_ctrl<2:0>|
}

#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MeasurementCtrl {
    SingleShot = 0b001,
    Combined = 0b010,
    Sleep = 0b011,
}

#[bitfield(u8)]
struct Cmd {
    #[bits(4..=7, rw)]
    sleep_time: u4,

    #[bit(3, r)]
    sco: bool,

    #[bits(0..=2, rw)]
    measurement_ctrl: u3,
}

/// PT928 pressure sensor, single-shot mode.
pub struct Pt928<I, D> {
    interface: I,
    delay: D,
}

impl<I, D, E> Pt928<I, D>
where
    I: Write<Error = E> + WriteRead<Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(interface: I, delay: D) -> Self {
        Self { interface, delay }
    }

    /// Triggers one conversion and returns the raw 24-bit reading.
    pub fn read_pressure(&mut self) -> Result<u32> {
        let cmd = Cmd::new_with_raw_value(0)
            .with_measurement_ctrl(u3::new(MeasurementCtrl::SingleShot as u8));
        self.write_reg(register::CMD, cmd.raw_value())?;

        self.delay.delay_ms(CONVERSION_MS);

        let mut buffer = [0_u8; 3];
        self.interface
            .write_read(DEVICE_ADDR, &[register::DATA_MSB], &mut buffer)
            .map_err(|e| anyhow!("pt928 read failed: {e:?}"))?;

        let raw = (buffer[0] as u32) << 16 | (buffer[1] as u32) << 8 | buffer[2] as u32;
        debug!("pt928 raw {raw}");
        Ok(raw)
    }

    fn write_reg(&mut self, reg: u8, data: u8) -> Result<()> {
        self.interface
            .write(DEVICE_ADDR, &[reg, data])
            .map_err(|e| anyhow!("pt928 write failed: {e:?}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::RecordingDelay;

    #[derive(Default)]
    struct Bus {
        writes: Vec<(u8, Vec<u8>)>,
        data: [u8; 3],
        fail: bool,
    }

    impl Write for Bus {
        type Error = ();

        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), ()> {
            if self.fail {
                return Err(());
            }
            self.writes.push((address, bytes.to_vec()));
            Ok(())
        }
    }

    impl WriteRead for Bus {
        type Error = ();

        fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), ()> {
            assert_eq!(address, DEVICE_ADDR);
            assert_eq!(bytes, &[register::DATA_MSB]);
            buffer.copy_from_slice(&self.data);
            Ok(())
        }
    }

    #[test]
    fn single_shot_big_endian() {
        let bus = Bus {
            data: [0x12, 0x34, 0x56],
            ..Default::default()
        };
        let mut sensor = Pt928::new(bus, RecordingDelay::default());

        assert_eq!(sensor.read_pressure().unwrap(), 0x123456);
        assert_eq!(sensor.interface.writes, vec![(DEVICE_ADDR, vec![0x30, 0x01])]);
        assert_eq!(sensor.delay.elapsed_ms(), CONVERSION_MS as u64);
    }

    #[test]
    fn bus_error_propagates() {
        let bus = Bus {
            fail: true,
            ..Default::default()
        };
        let mut sensor = Pt928::new(bus, RecordingDelay::default());
        assert!(sensor.read_pressure().is_err());
    }
}
