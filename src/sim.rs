//! Simulated board for host runs and tests.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use embedded_hal::digital::v2::{InputPin, OutputPin};
use embedded_svc::http::Method;
use embedded_svc::wifi::AuthMethod;
use log::info;

use crate::battery::{BatteryProbe, MillivoltRead};
use crate::clock::{TimeSync, WallClock};
use crate::config::{NodeConfig, MOUNT_POINT, PAYLOAD_FILE};
use crate::connectivity::{connection_signal, AccessPoint, ConnectivityManager, NetEvent, Radio, SignalWriter, WifiCredentials};
use crate::led::{Color, Indicator, SharedIndicator};
use crate::portal::{Portal, PortalHost, PortalReply};
use crate::pt928::{Pt928, DEVICE_ADDR};
use crate::registration::DeviceIdentity;
use crate::sampling::{SensorChain, Sensors, SharedSensors, Thermometer};
use crate::sleep::{PowerControl, SleepScheduler};
use crate::storage::{ensure_dir, RecordVolume, Storage, Unmount};
use crate::store::{bounded, KvStore};
use crate::supervisor::{CycleVerdict, Node, PowerCycleSupervisor, WakeCause};
use crate::upload::{HttpResponse, Transport};

#[derive(Default)]
pub struct MemStore {
    values: Mutex<HashMap<(String, String), String>>,
    fail_writes: AtomicBool,
    fail_key: Mutex<Option<String>>,
}

impl MemStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes writes to `key` fail, in any namespace.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut fail_key) = self.fail_key.lock() {
            *fail_key = Some(key.to_owned());
        }
    }
}

impl KvStore for MemStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| anyhow!("store poisoned"))?;
        Ok(values.get(&(namespace.to_owned(), key.to_owned())).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let key_fails = self
            .fail_key
            .lock()
            .map(|k| k.as_deref() == Some(key))
            .unwrap_or(false);
        if key_fails || self.fail_writes.load(Ordering::SeqCst) {
            bail!("flash write failed");
        }
        let mut values = self.values.lock().map_err(|_| anyhow!("store poisoned"))?;
        values.insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }
}

/// Delay that only counts. Clones share the counters.
#[derive(Clone, Default)]
pub struct RecordingDelay {
    elapsed_ms: Arc<AtomicU64>,
    calls: Arc<AtomicU32>,
}

impl RecordingDelay {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DelayMs<u32> for RecordingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms.fetch_add(ms as u64, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Configure(String, AuthMethod),
    Connect,
    Disconnect,
    StartAccessPoint(String),
    Scan,
}

/// Radio that answers association requests at once through the event
/// writer, as the driver's event loop would.
#[derive(Default)]
pub struct SimRadio {
    calls: Arc<Mutex<Vec<RadioCall>>>,
    reachable: HashMap<String, String>,
    networks: Vec<(String, i8)>,
    reject_connect: bool,
    station: Option<(String, String)>,
    writer: Option<SignalWriter>,
}

impl SimRadio {
    pub fn calls(&self) -> Arc<Mutex<Vec<RadioCall>>> {
        self.calls.clone()
    }

    pub fn with_reachable(mut self, ssid: &str, password: &str) -> Self {
        self.reachable.insert(ssid.to_owned(), password.to_owned());
        self
    }

    pub fn with_networks(mut self, networks: Vec<(String, i8)>) -> Self {
        self.networks = networks;
        self
    }

    pub fn reject_connect(mut self) -> Self {
        self.reject_connect = true;
        self
    }

    pub fn with_signal(mut self, writer: SignalWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    fn record(&self, call: RadioCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn emit(&self, event: NetEvent) {
        if let Some(writer) = &self.writer {
            writer.apply(event);
        }
    }
}

impl Radio for SimRadio {
    fn configure_station(&mut self, ssid: &str, password: &str, auth: AuthMethod) -> Result<()> {
        self.record(RadioCall::Configure(ssid.to_owned(), auth));
        self.station = Some((ssid.to_owned(), password.to_owned()));
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.record(RadioCall::Connect);
        if self.reject_connect {
            bail!("ESP_ERR_WIFI_CONN");
        }

        let Some((ssid, password)) = &self.station else {
            bail!("station not configured");
        };
        match self.reachable.get(ssid) {
            Some(expected) if expected == password => {
                self.emit(NetEvent::StationConnected);
                self.emit(NetEvent::IpAcquired(Ipv4Addr::new(192, 168, 1, 50)));
            }
            Some(_) => self.emit(NetEvent::StationDisconnected(202)),
            None => self.emit(NetEvent::StationDisconnected(201)),
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.record(RadioCall::Disconnect);
        self.emit(NetEvent::StationDisconnected(8));
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, _password: &str) -> Result<()> {
        self.record(RadioCall::StartAccessPoint(ssid.to_owned()));
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPoint>> {
        self.record(RadioCall::Scan);
        Ok(self
            .networks
            .iter()
            .filter_map(|(ssid, rssi)| {
                Some(AccessPoint {
                    ssid: bounded(ssid)?,
                    rssi: *rssi,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Transport answering from a script, one entry per request.
#[derive(Default)]
pub struct SimTransport {
    script: Mutex<VecDeque<Option<HttpResponse>>>,
    requests: Mutex<Vec<SentRequest>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, status: u16, body: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Some(HttpResponse {
                status,
                body: body.to_owned(),
            }));
        }
        self
    }

    pub fn fail(self) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(None);
        }
        self
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl SimTransport {
    fn answer(&self, request: SentRequest) -> Result<HttpResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Some(response)) => Ok(response),
            Some(None) => bail!("connection reset"),
            None => bail!("host unreachable"),
        }
    }
}

impl Transport for SimTransport {
    fn post(&self, url: &str, content_type: &str, body: &[u8]) -> Result<HttpResponse> {
        self.answer(SentRequest {
            method: Method::Post,
            url: url.to_owned(),
            content_type: content_type.to_owned(),
            body: body.to_vec(),
        })
    }

    fn get(&self, url: &str) -> Result<HttpResponse> {
        self.answer(SentRequest {
            method: Method::Get,
            url: url.to_owned(),
            content_type: String::new(),
            body: Vec::new(),
        })
    }
}

pub struct SimSensors {
    temperature: Option<f32>,
    pressure: Option<u32>,
    voltage: Option<f32>,
}

impl SimSensors {
    pub fn new(temperature: f32, pressure: u32, voltage: f32) -> Self {
        Self {
            temperature: Some(temperature),
            pressure: Some(pressure),
            voltage: Some(voltage),
        }
    }

    pub fn failing_temperature(mut self) -> Self {
        self.temperature = None;
        self
    }

    pub fn failing_voltage(mut self) -> Self {
        self.voltage = None;
        self
    }
}

impl Sensors for SimSensors {
    fn temperature(&mut self) -> Result<f32> {
        self.temperature.ok_or_else(|| anyhow!("temperature sensor timeout"))
    }

    fn pressure(&mut self) -> Result<u32> {
        self.pressure.ok_or_else(|| anyhow!("i2c nack"))
    }

    fn voltage(&mut self) -> Result<f32> {
        self.voltage.ok_or_else(|| anyhow!("adc timeout"))
    }
}

/// Indicator that records every colour shown.
#[derive(Default)]
pub struct SimIndicator {
    colors: Arc<Mutex<Vec<Color>>>,
}

impl SimIndicator {
    pub fn shared() -> SharedIndicator {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn shared_with_log() -> (SharedIndicator, Arc<Mutex<Vec<Color>>>) {
        let indicator = Self::default();
        let colors = indicator.colors.clone();
        (Arc::new(Mutex::new(indicator)), colors)
    }
}

impl Indicator for SimIndicator {
    fn show(&mut self, color: Color) {
        info!("LED {color:?}");
        if let Ok(mut colors) = self.colors.lock() {
            colors.push(color);
        }
    }

    fn blink(&mut self, color: Color, times: u32) {
        info!("LED blink {color:?} x{times}");
    }
}

#[derive(Default)]
pub struct SimMount {
    released: Arc<AtomicBool>,
}

impl SimMount {
    pub fn released(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl Unmount for SimMount {
    fn unmount(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub struct SimTrigger(pub bool);

impl InputPin for SimTrigger {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        Ok(self.0)
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        Ok(!self.0)
    }
}

pub struct SimTimeSync {
    pub reachable: bool,
}

impl Default for SimTimeSync {
    fn default() -> Self {
        Self { reachable: true }
    }
}

impl TimeSync for SimTimeSync {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.reachable
    }
}

/// Records the portal instead of serving it.
pub struct SimPortalHost<D> {
    portal: Option<Arc<Portal<D>>>,
    running: bool,
}

impl<D> Default for SimPortalHost<D> {
    fn default() -> Self {
        Self {
            portal: None,
            running: false,
        }
    }
}

impl<D> SimPortalHost<D> {
    pub fn started(&self) -> bool {
        self.portal.is_some()
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn portal(&self) -> Option<&Arc<Portal<D>>> {
        self.portal.as_ref()
    }
}

impl<D> PortalHost<D> for SimPortalHost<D> {
    fn start(&mut self, portal: Arc<Portal<D>>) -> Result<()> {
        info!("portal ready");
        self.portal = Some(portal);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            info!("portal stopped");
        }
        self.running = false;
        Ok(())
    }
}

/// Die sensor stand-in.
pub struct SimThermometer(pub f32);

impl Thermometer for SimThermometer {
    fn read_celsius(&mut self) -> Result<f32> {
        Ok(self.0)
    }
}

/// PT928 register model on a simulated I2C bus.
pub struct SimI2c {
    pub pressure: u32,
    armed: bool,
}

impl SimI2c {
    pub fn new(pressure: u32) -> Self {
        Self { pressure, armed: false }
    }
}

impl Write for SimI2c {
    type Error = &'static str;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        if address != DEVICE_ADDR {
            return Err("nack");
        }
        self.armed = bytes == [0x30, 0x01];
        Ok(())
    }
}

impl WriteRead for SimI2c {
    type Error = &'static str;

    fn write_read(&mut self, address: u8, _bytes: &[u8], buffer: &mut [u8]) -> Result<(), Self::Error> {
        if address != DEVICE_ADDR || !self.armed {
            return Err("nack");
        }
        let raw = self.pressure.to_be_bytes();
        buffer.copy_from_slice(&raw[1..]);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimPin;

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// ADC behind the 1:11 divider.
pub struct SimAdc(pub u16);

impl MillivoltRead for SimAdc {
    fn read_millivolts(&mut self) -> Result<u16> {
        Ok(self.0)
    }
}

/// Host stand-in for the real power states: the process just ends.
pub struct HostPower;

impl PowerControl for HostPower {
    fn deep_sleep(&mut self, duration: Duration) -> ! {
        info!("(simulated) deep sleep for {}s", duration.as_secs());
        std::process::exit(0)
    }

    fn restart(&mut self) -> ! {
        info!("(simulated) restart");
        std::process::exit(1)
    }
}

/// Temporary directory removed on drop.
#[cfg(test)]
pub struct TempDir(std::path::PathBuf);

#[cfg(test)]
impl TempDir {
    pub fn new() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "monitoring-node-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self(path)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

#[cfg(test)]
impl Drop for TempDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.0).ok();
    }
}

/// Runs one simulated cold boot with the reed switch held: the user
/// provisions wifi and registers through the portal during the config
/// window, then the cycle samples, uploads and goes to sleep.
pub fn run() -> Result<()> {
    let config = NodeConfig::load()?;
    info!("upload endpoint: {}", config.upload_url);

    let root = std::env::temp_dir().join(MOUNT_POINT.trim_start_matches('/'));
    ensure_dir(&root)?;

    let store = Arc::new(MemStore::default());
    let (writer, reader) = connection_signal();
    let indicator = SimIndicator::shared();
    let radio = SimRadio::default()
        .with_networks(vec![("FieldStation".into(), -48), ("Barn".into(), -81)])
        .with_reachable("FieldStation", "hunter2hunter2")
        .with_signal(writer);
    let connectivity = ConnectivityManager::new(Box::new(radio), store.clone(), reader.clone(), indicator.clone());

    let sensors: SharedSensors = Arc::new(Mutex::new(SensorChain::new(
        SimThermometer(18.75),
        Pt928::new(SimI2c::new(0x7A_1200), RecordingDelay::default()),
        BatteryProbe::new(SimPin, SimAdc(1105), RecordingDelay::default()),
    )));

    let transport = Arc::new(
        SimTransport::new()
            .respond(200, "OK\r\nkey:'4F2A'\r\nsensorID:'WL-017'\r\ngeoutm:'12U 456789 5678901'\r\n")
            .respond(503, "Service Unavailable")
            .respond(200, "OK"),
    );

    let delay = RecordingDelay::default();
    let node = Node {
        clock: Arc::new(WallClock::new(config.time_zone)),
        config,
        connectivity: Arc::new(Mutex::new(connectivity)),
        signal: reader,
        store: store.clone(),
        sensors,
        transport,
        indicator,
        delay: delay.clone(),
    };

    let mut host = SimPortalHost::default();
    let mut supervisor = PowerCycleSupervisor::new(node);
    let mount = || Storage::new(RecordVolume::new(&root), Box::new(SimMount::default()), PAYLOAD_FILE);
    let mut trigger = SimTrigger(true);

    // the user fills in the portal while the config window is open
    let verdict = {
        let mut host_with_user = UserDrivenHost {
            inner: &mut host,
            user: ScriptedUser,
        };
        let mut time_sync = SimTimeSync::default();
        supervisor.run(WakeCause::ColdBoot, mount, &mut trigger, &mut host_with_user, &mut time_sync)
    };

    let credentials = WifiCredentials::load(store.as_ref())?;
    info!("stored network: {:?}", credentials.map(|c| c.ssid));
    info!("stored identity: {:?}", DeviceIdentity::load(store.as_ref())?);
    info!("simulated time spent waiting: {} ms", delay.elapsed_ms());

    let scheduler = SleepScheduler::new(HostPower);
    match verdict {
        CycleVerdict::Sleep { storage, report } => {
            info!("cycle report: {report:?}");
            scheduler.sleep(storage, report.sample.tier)
        }
        CycleVerdict::Restart => scheduler.restart(),
    }
}

/// Portal requests a user would make on the setup page.
struct ScriptedUser;

impl ScriptedUser {
    fn visit(&self, portal: &Portal<RecordingDelay>) {
        let steps: [(Method, &str, &str); 4] = [
            (Method::Get, "/scan", ""),
            (Method::Post, "/connect", "ssid=FieldStation&password=hunter2hunter2"),
            (Method::Post, "/register", "key=4F2A&sensorID=WL-017&geoutm=12U+456789+5678901"),
            (Method::Get, "/?success=Device%20Registered", ""),
        ];
        for (method, uri, body) in steps {
            match portal.dispatch(method, uri, body.as_bytes()) {
                PortalReply::Page(html) => info!("{method:?} {uri} -> page ({} bytes)", html.len()),
                PortalReply::Redirect(location) => info!("{method:?} {uri} -> 303 {location}"),
                PortalReply::Error { status, message } => info!("{method:?} {uri} -> {status} {message}"),
            }
        }
    }
}

struct UserDrivenHost<'a> {
    inner: &'a mut SimPortalHost<RecordingDelay>,
    user: ScriptedUser,
}

impl PortalHost<RecordingDelay> for UserDrivenHost<'_> {
    fn start(&mut self, portal: Arc<Portal<RecordingDelay>>) -> Result<()> {
        self.inner.start(portal)?;
        if let Some(portal) = self.inner.portal() {
            self.user.visit(portal);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }
}
