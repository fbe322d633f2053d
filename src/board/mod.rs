mod http;
mod nvs;
mod power;
mod sdcard;
mod sensors;
mod time;
mod wifi;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{PinDriver, Pull};
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::info;

use crate::battery::BatteryProbe;
use crate::clock::WallClock;
use crate::config::{NodeConfig, MOUNT_POINT, PAYLOAD_FILE};
use crate::connectivity::{connection_signal, ConnectivityManager};
use crate::led::{self, Color, RGBLedPwm, SharedIndicator};
use crate::pt928::Pt928;
use crate::sampling::{SensorChain, SharedSensors};
use crate::sleep::SleepScheduler;
use crate::storage::{RecordVolume, Storage};
use crate::store::KvStore;
use crate::supervisor::{CycleVerdict, Node, PowerCycleSupervisor};
use crate::upload::Transport;

/// One power cycle on the board. Ends in deep sleep or a restart.
pub fn run() -> Result<()> {
    let peripherals = Peripherals::take()?;
    let wake = power::wake_cause();

    // RGB led
    let indicator: SharedIndicator = {
        let ledc = peripherals.ledc;
        let config = TimerConfig::default()
            .frequency(5.kHz().into())
            .resolution(Resolution::Bits13);

        let timer_r = LedcTimerDriver::new(ledc.timer0, &config)?;
        let timer_g = LedcTimerDriver::new(ledc.timer1, &config)?;
        let timer_b = LedcTimerDriver::new(ledc.timer2, &config)?;

        let ch_r = LedcDriver::new(ledc.channel0, timer_r, peripherals.pins.gpio21)?;
        let ch_g = LedcDriver::new(ledc.channel1, timer_g, peripherals.pins.gpio19)?;
        let ch_b = LedcDriver::new(ledc.channel2, timer_b, peripherals.pins.gpio17)?;

        Arc::new(Mutex::new(RGBLedPwm {
            r: ch_r,
            g: ch_g,
            b: ch_b,
            delay: FreeRtos,
            rgb: (0, 0, 0),
        }))
    };
    led::show(&indicator, Color::Black);

    let config = NodeConfig::load()?;
    info!("upload endpoint: {}", config.upload_url);

    // wifi
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store: Arc<dyn KvStore> = Arc::new(nvs::NvsStore::new(nvs_partition.clone()));
    let (writer, reader) = connection_signal();
    let radio = wifi::EspRadio::new(peripherals.modem, sys_loop, nvs_partition, writer)?;
    let connectivity = ConnectivityManager::new(Box::new(radio), store.clone(), reader.clone(), indicator.clone());

    // sensors
    let sensors: SharedSensors = {
        let i2c = I2cDriver::new(
            peripherals.i2c0,
            peripherals.pins.gpio5,
            peripherals.pins.gpio4,
            &I2cConfig::new().baudrate(100.kHz().into()),
        )?;
        let enable = PinDriver::output(peripherals.pins.gpio2)?;
        let adc = sensors::BatteryAdc::new(peripherals.adc1, peripherals.pins.gpio3)?;

        Arc::new(Mutex::new(SensorChain::new(
            sensors::DieThermometer,
            Pt928::new(i2c, FreeRtos),
            BatteryProbe::new(enable, adc, FreeRtos),
        )))
    };

    let mut trigger = PinDriver::input(peripherals.pins.gpio45)?;
    trigger.set_pull(Pull::Up)?;

    let transport: Arc<dyn Transport> = Arc::new(http::HttpsTransport);
    let node = Node {
        clock: Arc::new(WallClock::new(config.time_zone)),
        config,
        connectivity: Arc::new(Mutex::new(connectivity)),
        signal: reader,
        store,
        sensors,
        transport,
        indicator,
        delay: FreeRtos,
    };

    let mount = || {
        let card = sdcard::mount()?;
        Storage::new(RecordVolume::new(MOUNT_POINT), Box::new(card), PAYLOAD_FILE)
    };

    let mut portal_host = http::EspPortalHost::default();
    let mut time_sync = time::Sntp::default();
    let mut supervisor = PowerCycleSupervisor::new(node);
    let verdict = supervisor.run(wake, mount, &mut trigger, &mut portal_host, &mut time_sync);

    let scheduler = SleepScheduler::new(power::EspPower);
    match verdict {
        CycleVerdict::Sleep { storage, report } => {
            info!(
                "cycle done: path {:?}, connected {}, logged {}",
                report.path, report.connected, report.sample.logged
            );
            scheduler.sleep(storage, report.sample.tier)
        }
        CycleVerdict::Restart => scheduler.restart(),
    }
}
