use std::time::Duration;

use esp_idf_sys::{
    esp, esp_deep_sleep_start, esp_reset_reason, esp_reset_reason_t_ESP_RST_DEEPSLEEP,
    esp_reset_reason_t_ESP_RST_POWERON, esp_restart, esp_sleep_enable_timer_wakeup,
};
use log::error;

use crate::sleep::PowerControl;
use crate::supervisor::WakeCause;

pub fn wake_cause() -> WakeCause {
    match unsafe { esp_reset_reason() } {
        esp_reset_reason_t_ESP_RST_DEEPSLEEP => WakeCause::WakeFromSleep,
        esp_reset_reason_t_ESP_RST_POWERON => WakeCause::ColdBoot,
        _ => WakeCause::Other,
    }
}

pub struct EspPower;

impl PowerControl for EspPower {
    fn deep_sleep(&mut self, duration: Duration) -> ! {
        unsafe {
            if let Err(e) = esp!(esp_sleep_enable_timer_wakeup(duration.as_micros() as u64)) {
                error!("timer wakeup: {e:?}");
                esp_restart()
            }
            esp_deep_sleep_start()
        }
    }

    fn restart(&mut self) -> ! {
        unsafe { esp_restart() }
    }
}
