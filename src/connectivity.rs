use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use embedded_hal::blocking::delay::DelayMs;
use embedded_svc::wifi::AuthMethod;
use heapless::String;
use log::{error, info, warn};
use num_enum::TryFromPrimitive;

use crate::config::{MAX_ACCESS_POINTS, PASSWORD_MAX, RETRY_SETTLE_MS, SSID_MAX};
use crate::led::{blink, Color, SharedIndicator};
use crate::store::{bounded, load_bounded, KvStore, WIFI_NAMESPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Radio events, delivered from the network event context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    StationConnected,
    StationDisconnected(u8),
    IpAcquired(Ipv4Addr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum ReasonCode {
    AuthExpire = 2,
    FourWayHandshakeTimeout = 15,
    NoApFound = 201,
    AuthFail = 202,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthFailure,
    AccessPointNotFound,
    Other(u8),
}

impl DisconnectReason {
    pub fn classify(code: u8) -> Self {
        match ReasonCode::try_from(code) {
            Ok(ReasonCode::AuthExpire | ReasonCode::FourWayHandshakeTimeout | ReasonCode::AuthFail) => {
                Self::AuthFailure
            }
            Ok(ReasonCode::NoApFound) => Self::AccessPointNotFound,
            Err(_) => Self::Other(code),
        }
    }
}

struct SignalCell {
    state: AtomicU8,
    acquisitions: AtomicU32,
}

/// Creates the connection signal. The writer goes to the network event
/// handler, readers go everywhere else.
pub fn connection_signal() -> (SignalWriter, SignalReader) {
    let cell = Arc::new(SignalCell {
        state: AtomicU8::new(ConnectionState::Disconnected as u8),
        acquisitions: AtomicU32::new(0),
    });
    (SignalWriter { cell: cell.clone() }, SignalReader { cell })
}

/// Sole write half of the connection signal.
pub struct SignalWriter {
    cell: Arc<SignalCell>,
}

impl SignalWriter {
    pub fn apply(&self, event: NetEvent) {
        match event {
            NetEvent::StationConnected => {
                info!("station associated, waiting for IP");
                self.set(ConnectionState::Connecting);
            }
            NetEvent::StationDisconnected(code) => {
                match DisconnectReason::classify(code) {
                    DisconnectReason::AuthFailure => warn!("disconnected: authentication failed"),
                    DisconnectReason::AccessPointNotFound => warn!("disconnected: AP not found"),
                    DisconnectReason::Other(code) => warn!("disconnected: reason {code}"),
                }
                self.set(ConnectionState::Disconnected);
            }
            NetEvent::IpAcquired(ip) => {
                info!("got IP {ip}");
                self.cell.acquisitions.fetch_add(1, Ordering::AcqRel);
                self.set(ConnectionState::Connected);
            }
        }
    }

    fn set(&self, state: ConnectionState) {
        self.cell.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SignalReader {
    cell: Arc<SignalCell>,
}

impl SignalReader {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.cell.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of IP acquisitions so far, to tell a fresh connection from an
    /// earlier one.
    pub fn acquisitions(&self) -> u32 {
        self.cell.acquisitions.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String<SSID_MAX>,
    pub rssi: i8,
}

/// The radio driver. Association is asynchronous, results arrive as
/// [`NetEvent`]s.
pub trait Radio: Send {
    fn configure_station(&mut self, ssid: &str, password: &str, auth: AuthMethod) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<()>;
    fn scan(&mut self) -> Result<Vec<AccessPoint>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String<SSID_MAX>,
    pub password: String<PASSWORD_MAX>,
}

impl WifiCredentials {
    /// `None` if either field exceeds its bound.
    pub fn new(ssid: &str, password: &str) -> Option<Self> {
        Some(Self {
            ssid: bounded(ssid)?,
            password: bounded(password)?,
        })
    }

    /// Stored credentials, `None` if no ssid was ever saved.
    pub fn load(store: &dyn KvStore) -> Result<Option<Self>> {
        let ssid: String<SSID_MAX> = load_bounded(store, WIFI_NAMESPACE, "ssid")?;
        if ssid.is_empty() {
            return Ok(None);
        }
        let password = load_bounded(store, WIFI_NAMESPACE, "password")?;
        Ok(Some(Self { ssid, password }))
    }

    pub fn save(&self, store: &dyn KvStore) -> Result<()> {
        store.set_all(
            WIFI_NAMESPACE,
            &[("ssid", self.ssid.as_str()), ("password", self.password.as_str())],
        )
    }

    fn auth_method(&self) -> AuthMethod {
        if self.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRequest {
    NoCredentials,
    Requested,
    Rejected,
}

pub struct ConnectivityManager {
    radio: Box<dyn Radio>,
    store: Arc<dyn KvStore>,
    signal: SignalReader,
    indicator: SharedIndicator,
    access_points: Vec<AccessPoint>,
}

impl ConnectivityManager {
    pub fn new(
        radio: Box<dyn Radio>,
        store: Arc<dyn KvStore>,
        signal: SignalReader,
        indicator: SharedIndicator,
    ) -> Self {
        Self {
            radio,
            store,
            signal,
            indicator,
            access_points: Vec::new(),
        }
    }

    pub fn signal(&self) -> &SignalReader {
        &self.signal
    }

    /// Requests association with the stored credentials and returns
    /// without waiting for the outcome.
    pub fn connect_stored(&mut self) -> ConnectRequest {
        match WifiCredentials::load(self.store.as_ref()) {
            Ok(Some(credentials)) => self.connect_with(&credentials),
            Ok(None) => {
                info!("no stored wifi credentials");
                ConnectRequest::NoCredentials
            }
            Err(e) => {
                error!("failed to load wifi credentials: {e:?}");
                ConnectRequest::NoCredentials
            }
        }
    }

    pub fn connect_with(&mut self, credentials: &WifiCredentials) -> ConnectRequest {
        info!("connecting with '{}'...", credentials.ssid);
        let result = self
            .radio
            .configure_station(&credentials.ssid, &credentials.password, credentials.auth_method())
            .and_then(|_| self.radio.connect());

        match result {
            Ok(()) => ConnectRequest::Requested,
            Err(e) => {
                error!("association request failed: {e:?}");
                blink(&self.indicator, Color::Red, 3);
                ConnectRequest::Rejected
            }
        }
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.radio.disconnect().context("disconnect")
    }

    /// Drops the current association and retries with stored credentials.
    pub fn reconnect<D: DelayMs<u32>>(&mut self, delay: &mut D) -> ConnectRequest {
        if let Err(e) = self.disconnect() {
            warn!("{e:?}");
        }
        delay.delay_ms(RETRY_SETTLE_MS);
        self.connect_stored()
    }

    pub fn scan(&mut self) -> Result<&[AccessPoint]> {
        let mut found = self.radio.scan().context("wifi scan")?;
        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        found.truncate(MAX_ACCESS_POINTS);
        info!("scan found {} networks", found.len());
        self.access_points = found;
        Ok(&self.access_points)
    }

    pub fn access_points(&self) -> &[AccessPoint] {
        &self.access_points
    }

    pub fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<()> {
        info!("starting access point '{ssid}'");
        self.radio
            .start_access_point(ssid, password)
            .context("start access point")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{MemStore, RadioCall, RecordingDelay, SimIndicator, SimRadio};

    fn manager(radio: SimRadio, store: Arc<MemStore>) -> (ConnectivityManager, SignalWriter) {
        let (writer, reader) = connection_signal();
        let indicator = SimIndicator::shared();
        (
            ConnectivityManager::new(Box::new(radio), store, reader, indicator),
            writer,
        )
    }

    #[test]
    fn signal_follows_events() {
        let (writer, reader) = connection_signal();
        assert_eq!(reader.state(), ConnectionState::Disconnected);

        writer.apply(NetEvent::StationConnected);
        assert_eq!(reader.state(), ConnectionState::Connecting);

        writer.apply(NetEvent::IpAcquired(Ipv4Addr::new(192, 168, 1, 7)));
        assert!(reader.is_connected());
        assert_eq!(reader.acquisitions(), 1);

        writer.apply(NetEvent::StationDisconnected(201));
        assert_eq!(reader.state(), ConnectionState::Disconnected);
        assert_eq!(reader.acquisitions(), 1);
    }

    #[test]
    fn station_and_ip_halves_share_one_writer() {
        let (writer, reader) = connection_signal();
        let station = Arc::new(writer);
        let ip = station.clone();

        station.apply(NetEvent::StationConnected);
        std::thread::spawn(move || ip.apply(NetEvent::IpAcquired(Ipv4Addr::new(192, 168, 4, 2))))
            .join()
            .unwrap();

        assert!(reader.is_connected());
        assert_eq!(reader.acquisitions(), 1);
    }

    #[test]
    fn reason_classification() {
        assert_eq!(DisconnectReason::classify(202), DisconnectReason::AuthFailure);
        assert_eq!(DisconnectReason::classify(15), DisconnectReason::AuthFailure);
        assert_eq!(DisconnectReason::classify(201), DisconnectReason::AccessPointNotFound);
        assert_eq!(DisconnectReason::classify(8), DisconnectReason::Other(8));
    }

    #[test]
    fn connect_stored_without_credentials_is_noop() {
        let radio = SimRadio::default();
        let calls = radio.calls();
        let (mut manager, _writer) = manager(radio, Arc::new(MemStore::default()));

        assert_eq!(manager.connect_stored(), ConnectRequest::NoCredentials);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn connect_stored_uses_saved_credentials() {
        let store = Arc::new(MemStore::default());
        WifiCredentials::new("Home", "").unwrap().save(store.as_ref()).unwrap();

        let radio = SimRadio::default();
        let calls = radio.calls();
        let (mut manager, _writer) = manager(radio, store);

        assert_eq!(manager.connect_stored(), ConnectRequest::Requested);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                RadioCall::Configure("Home".into(), AuthMethod::None),
                RadioCall::Connect
            ]
        );
    }

    #[test]
    fn rejected_request_leaves_signal_alone() {
        let store = Arc::new(MemStore::default());
        WifiCredentials::new("Home", "secret123").unwrap().save(store.as_ref()).unwrap();

        let radio = SimRadio::default().reject_connect();
        let (mut manager, _writer) = manager(radio, store);

        assert_eq!(manager.connect_stored(), ConnectRequest::Rejected);
        assert_eq!(manager.signal().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_disconnects_first() {
        let store = Arc::new(MemStore::default());
        WifiCredentials::new("Home", "secret123").unwrap().save(store.as_ref()).unwrap();

        let radio = SimRadio::default();
        let calls = radio.calls();
        let (mut manager, _writer) = manager(radio, store);
        let mut delay = RecordingDelay::default();

        assert_eq!(manager.reconnect(&mut delay), ConnectRequest::Requested);
        assert_eq!(calls.lock().unwrap()[0], RadioCall::Disconnect);
        assert_eq!(delay.elapsed_ms(), RETRY_SETTLE_MS as u64);
    }

    #[test]
    fn scan_sorts_and_truncates() {
        let networks = (0..25).map(|i| (format!("net{i}"), -90 + i as i8)).collect();
        let radio = SimRadio::default().with_networks(networks);
        let (mut manager, _writer) = manager(radio, Arc::new(MemStore::default()));

        let found = manager.scan().unwrap();
        assert_eq!(found.len(), MAX_ACCESS_POINTS);
        assert_eq!(found[0].ssid.as_str(), "net24");
        assert!(found.windows(2).all(|w| w[0].rssi >= w[1].rssi));
    }

    #[test]
    fn credentials_bounds() {
        assert!(WifiCredentials::new(&"s".repeat(32), &"p".repeat(64)).is_some());
        assert!(WifiCredentials::new(&"s".repeat(40), "").is_none());
        assert!(WifiCredentials::new("ok", &"p".repeat(65)).is_none());
    }
}
