use std::sync::{Arc, Mutex};

use anyhow::Result;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;
use log::{error, info, warn};

use crate::clock::{synchronize, TimeSync, WallClock};
use crate::config::{
    NodeConfig, CONFIG_WINDOW_POLL, CONNECTED_SHOW_MS, NORMAL_CONNECT_POLL, PAYLOAD_FILE,
    RECONNECT_POLL, TRIGGER_POLL,
};
use crate::connectivity::{ConnectRequest, ConnectivityManager, SignalReader};
use crate::led::{show, Color, SharedIndicator};
use crate::portal::{Portal, PortalHost};
use crate::registration::{DeviceIdentity, RegistrationGate};
use crate::sampling::{Sample, SamplingPipeline, SharedSensors};
use crate::storage::{RecordVolume, Storage};
use crate::store::KvStore;
use crate::upload::{Transport, UploadAgent, UploadOutcome, UploadReport};
use crate::wait::{wait_until, PollPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    ColdBoot,
    WakeFromSleep,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPath {
    ConfigMode,
    NormalConnect,
    Reconnect,
}

/// Timer wakes go straight back to work. Any other start listens for the
/// reed switch to decide whether the user wants the portal.
pub fn select_path<T, D>(wake: WakeCause, trigger: &mut T, delay: &mut D) -> BootPath
where
    T: InputPin,
    D: DelayMs<u32>,
{
    match wake {
        WakeCause::WakeFromSleep => BootPath::Reconnect,
        WakeCause::ColdBoot | WakeCause::Other => {
            info!("waiting for reed switch...");
            let triggered = wait_until("reed switch", delay, TRIGGER_POLL, || {
                trigger.is_high().unwrap_or(false)
            });
            if triggered {
                BootPath::ConfigMode
            } else {
                BootPath::NormalConnect
            }
        }
    }
}

/// Long-lived collaborators of a power cycle.
pub struct Node<D> {
    pub config: NodeConfig,
    pub connectivity: Arc<Mutex<ConnectivityManager>>,
    pub signal: SignalReader,
    pub store: Arc<dyn KvStore>,
    pub sensors: SharedSensors,
    pub clock: Arc<WallClock>,
    pub transport: Arc<dyn Transport>,
    pub indicator: SharedIndicator,
    pub delay: D,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub path: BootPath,
    pub connected: bool,
    pub identity: DeviceIdentity,
    pub sample: Sample,
    pub upload: Option<UploadReport>,
}

pub enum CycleVerdict {
    Sleep { storage: Storage, report: CycleReport },
    Restart,
}

pub struct PowerCycleSupervisor<D> {
    node: Node<D>,
}

impl<D> PowerCycleSupervisor<D>
where
    D: DelayMs<u32> + Clone + Send + Sync + 'static,
{
    pub fn new(node: Node<D>) -> Self {
        Self { node }
    }

    /// One power cycle, up to the point of sleeping. The caller carries out
    /// the verdict.
    pub fn run<T, M>(
        &mut self,
        wake: WakeCause,
        mount: M,
        trigger: &mut T,
        portal_host: &mut dyn PortalHost<D>,
        time_sync: &mut dyn TimeSync,
    ) -> CycleVerdict
    where
        T: InputPin,
        M: FnOnce() -> Result<Storage>,
    {
        info!("wake cause: {wake:?}");

        let storage = match mount() {
            Ok(storage) => storage,
            Err(e) => {
                error!("storage unavailable: {e:?}");
                show(&self.node.indicator, Color::Red);
                return CycleVerdict::Restart;
            }
        };

        let path = select_path(wake, trigger, &mut self.node.delay);
        info!("boot path: {path:?}");

        let connected = match path {
            BootPath::Reconnect => self.connect_stored("reconnect", RECONNECT_POLL),
            BootPath::NormalConnect => self.connect_stored("connect", NORMAL_CONNECT_POLL),
            BootPath::ConfigMode => self.config_window(storage.volume(), portal_host),
        };

        let report = self.cycle(path, connected, storage.volume(), portal_host, time_sync);
        CycleVerdict::Sleep { storage, report }
    }

    fn connect_stored(&mut self, label: &str, policy: PollPolicy) -> bool {
        let request = match self.node.connectivity.lock() {
            Ok(mut c) => c.connect_stored(),
            Err(_) => ConnectRequest::Rejected,
        };

        let connected = request == ConnectRequest::Requested && {
            let signal = &self.node.signal;
            wait_until(label, &mut self.node.delay, policy, || signal.is_connected())
        };

        if connected {
            info!("{label}: connected");
            show(&self.node.indicator, Color::Green);
        } else {
            warn!("{label}: no connection, continuing offline");
            show(&self.node.indicator, Color::Red);
        }
        connected
    }

    fn config_window(&mut self, volume: &RecordVolume, portal_host: &mut dyn PortalHost<D>) -> bool {
        info!("entering config mode");
        show(&self.node.indicator, Color::Blue);

        if let Ok(mut c) = self.node.connectivity.lock() {
            if let Err(e) = c.start_access_point(&self.node.config.ap_ssid, &self.node.config.ap_password) {
                error!("{e:?}");
            }
            if let Err(e) = c.scan() {
                warn!("{e:?}");
            }
            c.connect_stored();
        }

        let portal = Arc::new(Portal {
            connectivity: self.node.connectivity.clone(),
            signal: self.node.signal.clone(),
            store: self.node.store.clone(),
            volume: volume.clone(),
            sensors: self.node.sensors.clone(),
            clock: self.node.clock.clone(),
            transport: self.node.transport.clone(),
            indicator: self.node.indicator.clone(),
            register_url: self.node.config.register_url.clone(),
            delay: self.node.delay.clone(),
        });
        if let Err(e) = portal_host.start(portal) {
            error!("cannot start portal: {e:?}");
        }

        let signal = &self.node.signal;
        let connected = wait_until("config window", &mut self.node.delay, CONFIG_WINDOW_POLL, || {
            signal.is_connected()
        });

        if connected {
            info!("config window: connected");
            show(&self.node.indicator, Color::Green);
            self.node.delay.delay_ms(CONNECTED_SHOW_MS);
            show(&self.node.indicator, Color::Black);
        } else {
            warn!("config window closed without a connection");
        }
        connected
    }

    fn cycle(
        &mut self,
        path: BootPath,
        connected: bool,
        volume: &RecordVolume,
        portal_host: &mut dyn PortalHost<D>,
        time_sync: &mut dyn TimeSync,
    ) -> CycleReport {
        if self.node.signal.is_connected() {
            synchronize(
                time_sync,
                self.node.transport.as_ref(),
                &self.node.config.time_url,
                &self.node.clock,
                &mut self.node.delay,
            );
        } else {
            warn!("offline, skipping time sync");
        }

        let gate = RegistrationGate::new(self.node.store.clone());
        let identity = gate.wait_until_registered(&mut self.node.delay, volume);

        // no portal writes once sampling starts
        if let Err(e) = portal_host.stop() {
            warn!("cannot stop portal: {e:?}");
        }

        let sample = SamplingPipeline::new(&self.node.sensors, &self.node.clock).run(volume, PAYLOAD_FILE);

        let upload = if self.node.signal.is_connected() {
            let mut agent = UploadAgent::new(self.node.transport.as_ref(), self.node.delay.clone());
            let report = agent.upload(volume, PAYLOAD_FILE, &self.node.config.upload_url);
            // delivered rows are dropped, undelivered ones ride along next cycle
            if report.outcome == UploadOutcome::Success {
                if let Err(e) = volume.rewrite(PAYLOAD_FILE, &identity.header()) {
                    error!("cannot clear delivered rows: {e:?}");
                }
            }
            Some(report)
        } else {
            warn!("wifi not connected, upload skipped");
            None
        };

        CycleReport {
            path,
            connected,
            identity,
            sample,
            upload,
        }
    }
}
