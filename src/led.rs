// RGB status LED on IO21 (R) IO19 (G) IO17 (B)

use std::sync::{Arc, Mutex};

use embedded_hal::blocking::delay::DelayMs;

const BLINK_MS: u32 = 200;

#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
    White,
    Black,
}

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            Color::Red => (0xFF, 0, 0),
            Color::Green => (0, 0xFF, 0),
            Color::Blue => (0, 0, 0xFF),
            Color::Yellow => (0xFF, 0xFF, 0),
            Color::White => (0xFF, 0xFF, 0xFF),
            Color::Black => (0, 0, 0),
        }
    }
}

/// Something that can show a diagnostic colour.
pub trait Indicator: Send {
    fn show(&mut self, color: Color);
    fn blink(&mut self, color: Color, times: u32);
}

pub type SharedIndicator = Arc<Mutex<dyn Indicator>>;

pub fn show(indicator: &SharedIndicator, color: Color) {
    if let Ok(mut led) = indicator.lock() {
        led.show(color);
    }
}

pub fn blink(indicator: &SharedIndicator, color: Color, times: u32) {
    if let Ok(mut led) = indicator.lock() {
        led.blink(color, times);
    }
}

pub struct RGBLedPwm<R, G, B, D>
where
    R: embedded_hal::PwmPin,
    G: embedded_hal::PwmPin,
    B: embedded_hal::PwmPin,
{
    pub r: R,
    pub g: G,
    pub b: B,
    pub delay: D,

    pub rgb: (u8, u8, u8),
}

impl<R, G, B, D> RGBLedPwm<R, G, B, D>
where
    R: embedded_hal::PwmPin<Duty = u32>,
    G: embedded_hal::PwmPin<Duty = u32>,
    B: embedded_hal::PwmPin<Duty = u32>,
{
    pub fn set_rgb(&mut self, r: u8, g: u8, b: u8) {
        let r_max = self.r.get_max_duty();
        let g_max = self.g.get_max_duty();
        let b_max = self.b.get_max_duty();

        self.r.set_duty(r_max * r as u32 / 0xFF);
        self.g.set_duty(g_max * g as u32 / 0xFF);
        self.b.set_duty(b_max * b as u32 / 0xFF);

        self.rgb = (r, g, b);
    }
}

impl<R, G, B, D> Indicator for RGBLedPwm<R, G, B, D>
where
    R: embedded_hal::PwmPin<Duty = u32> + Send,
    G: embedded_hal::PwmPin<Duty = u32> + Send,
    B: embedded_hal::PwmPin<Duty = u32> + Send,
    D: DelayMs<u32> + Send,
{
    fn show(&mut self, color: Color) {
        let (r, g, b) = color.rgb();
        self.set_rgb(r, g, b);
    }

    fn blink(&mut self, color: Color, times: u32) {
        for _ in 0..times {
            self.show(color);
            self.delay.delay_ms(BLINK_MS);
            self.show(Color::Black);
            self.delay.delay_ms(BLINK_MS);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::RecordingDelay;

    #[derive(Default)]
    struct Channel {
        duty: u32,
    }

    impl embedded_hal::PwmPin for Channel {
        type Duty = u32;

        fn disable(&mut self) {}
        fn enable(&mut self) {}
        fn get_duty(&self) -> u32 {
            self.duty
        }
        fn get_max_duty(&self) -> u32 {
            8191
        }
        fn set_duty(&mut self, duty: u32) {
            self.duty = duty;
        }
    }

    fn led() -> RGBLedPwm<Channel, Channel, Channel, RecordingDelay> {
        RGBLedPwm {
            r: Channel::default(),
            g: Channel::default(),
            b: Channel::default(),
            delay: RecordingDelay::default(),
            rgb: (0, 0, 0),
        }
    }

    #[test]
    fn full_channel_is_max_duty() {
        let mut led = led();
        led.show(Color::Green);
        assert_eq!(led.r.duty, 0);
        assert_eq!(led.g.duty, 8191);
        assert_eq!(led.b.duty, 0);
    }

    #[test]
    fn blink_ends_dark() {
        let mut led = led();
        led.blink(Color::Red, 3);
        assert_eq!(led.rgb, (0, 0, 0));
        assert_eq!(led.delay.calls(), 6);
    }
}
