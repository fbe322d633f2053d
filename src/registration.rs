use std::sync::Arc;

use anyhow::Result;
use embedded_hal::blocking::delay::DelayMs;
use heapless::String;
use log::{error, info, warn};

use crate::clock::WallClock;
use crate::config::{
    FORM_GEOUTM_MAX, FORM_KEY_MAX, FORM_SENSOR_ID_MAX, PAYLOAD_FILE, REGISTER_FILE,
    REGISTRATION_BACKOFF_MS,
};
use crate::sampling::{SamplingPipeline, SharedSensors};
use crate::storage::RecordVolume;
use crate::store::{bounded, load_bounded, KvStore, REGISTRATION_NAMESPACE};
use crate::upload::{Transport, UploadAgent, UploadOutcome};
use crate::urlcode;

pub const KEY_MAX: usize = 64;
pub const SENSOR_ID_MAX: usize = 32;
pub const GEOUTM_MAX: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub key: String<KEY_MAX>,
    pub sensor_id: String<SENSOR_ID_MAX>,
    pub geoutm: String<GEOUTM_MAX>,
}

impl DeviceIdentity {
    pub fn load(store: &dyn KvStore) -> Result<Self> {
        Ok(Self {
            key: load_bounded(store, REGISTRATION_NAMESPACE, "key")?,
            sensor_id: load_bounded(store, REGISTRATION_NAMESPACE, "sensorID")?,
            geoutm: load_bounded(store, REGISTRATION_NAMESPACE, "geoutm")?,
        })
    }

    /// All three fields or none.
    pub fn save(&self, store: &dyn KvStore) -> Result<()> {
        store.set_all(
            REGISTRATION_NAMESPACE,
            &[
                ("key", self.key.as_str()),
                ("sensorID", self.sensor_id.as_str()),
                ("geoutm", self.geoutm.as_str()),
            ],
        )
    }

    pub fn is_complete(&self) -> bool {
        !self.key.is_empty() && !self.sensor_id.is_empty() && !self.geoutm.is_empty()
    }

    /// Identity lines that open every uploaded document.
    pub fn header(&self) -> std::string::String {
        header(&self.key, &self.sensor_id, &self.geoutm)
    }

    /// Parses a server confirmation. All three fields must be present and
    /// non-empty.
    pub fn parse_confirmation(text: &str) -> Option<Self> {
        let mut key = None;
        let mut sensor_id = None;
        let mut geoutm = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(v) = quoted_value(line, "key:'") {
                key = bounded(v);
            } else if let Some(v) = quoted_value(line, "sensorID:'") {
                sensor_id = bounded(v);
            } else if let Some(v) = quoted_value(line, "geoutm:'") {
                geoutm = bounded(v);
            }
        }

        let identity = Self {
            key: key?,
            sensor_id: sensor_id?,
            geoutm: geoutm?,
        };
        identity.is_complete().then_some(identity)
    }
}

fn header(key: &str, sensor_id: &str, geoutm: &str) -> std::string::String {
    format!("key:'{key}'\nsensorID:'{sensor_id}'\ngeoutm:'{geoutm}'\n")
}

/// Puts `header` at the top of `file`. Rows already in the file are kept,
/// an older identity header is replaced.
pub fn stamp_header(volume: &RecordVolume, file: &str, header: &str) -> Result<()> {
    let existing = if volume.path(file).exists() {
        volume.read_to_string(file)?
    } else {
        std::string::String::new()
    };
    if existing.starts_with(header) {
        return Ok(());
    }

    let mut contents = header.to_owned();
    for line in existing.lines().filter(|l| !l.is_empty() && !is_header_line(l)) {
        contents.push_str(line);
        contents.push('\n');
    }
    volume.rewrite(file, &contents)
}

fn is_header_line(line: &str) -> bool {
    ["key:'", "sensorID:'", "geoutm:'"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

fn quoted_value<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(prefix)?;
    Some(rest.split('\'').next().unwrap_or(rest))
}

/// Blocks sampling until the device holds a complete identity.
pub struct RegistrationGate {
    store: Arc<dyn KvStore>,
}

impl RegistrationGate {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn check(&self) -> bool {
        self.identity().is_some()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        match DeviceIdentity::load(self.store.as_ref()) {
            Ok(identity) if identity.is_complete() => Some(identity),
            Ok(_) => None,
            Err(e) => {
                error!("cannot load identity: {e:?}");
                None
            }
        }
    }

    /// Waits until registered, with no upper bound, then makes sure the
    /// payload document opens with the identity header.
    pub fn wait_until_registered<D: DelayMs<u32>>(
        &self,
        delay: &mut D,
        volume: &RecordVolume,
    ) -> DeviceIdentity {
        let identity = loop {
            if let Some(identity) = self.identity() {
                break identity;
            }
            warn!("device not registered, waiting...");
            delay.delay_ms(REGISTRATION_BACKOFF_MS);
        };

        info!("registered as sensor '{}'", identity.sensor_id);
        if let Err(e) = stamp_header(volume, PAYLOAD_FILE, &identity.header()) {
            error!("cannot write payload header: {e:?}");
        }
        identity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormError {
    Missing,
    TooLong,
}

/// Identity fields as entered on the portal, before server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationForm {
    pub key: String<FORM_KEY_MAX>,
    pub sensor_id: String<FORM_SENSOR_ID_MAX>,
    pub geoutm: String<FORM_GEOUTM_MAX>,
}

impl RegistrationForm {
    pub fn parse(body: &str) -> Result<Self, FormError> {
        fn required<const N: usize>(body: &str, name: &str) -> Result<String<N>, FormError> {
            let value = urlcode::field(body, name)
                .filter(|v| !v.is_empty())
                .ok_or(FormError::Missing)?;
            bounded(&value).ok_or(FormError::TooLong)
        }

        Ok(Self {
            key: required(body, "key")?,
            sensor_id: required(body, "sensorID")?,
            geoutm: required(body, "geoutm")?,
        })
    }

    fn header(&self) -> std::string::String {
        header(&self.key, &self.sensor_id, &self.geoutm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered(DeviceIdentity),
    ProvisionalWriteFailed,
    UploadFailed,
    Unconfirmed,
    PersistFailed,
}

/// Everything a registration round-trip touches.
pub struct Registrar<'a> {
    pub store: &'a dyn KvStore,
    pub volume: &'a RecordVolume,
    pub sensors: &'a SharedSensors,
    pub clock: &'a WallClock,
    pub transport: &'a dyn Transport,
    pub url: &'a str,
}

impl Registrar<'_> {
    /// Writes a provisional record, has the server confirm it and only then
    /// persists the confirmed identity.
    pub fn register<D: DelayMs<u32>>(&self, form: &RegistrationForm, delay: D) -> RegistrationOutcome {
        info!("registering sensor '{}'", form.sensor_id);

        if let Err(e) = self.write_provisional(form) {
            error!("cannot write provisional record: {e:?}");
            return RegistrationOutcome::ProvisionalWriteFailed;
        }

        let report = UploadAgent::new(self.transport, delay).upload(self.volume, REGISTER_FILE, self.url);
        if report.outcome != UploadOutcome::Success || report.response.is_empty() {
            return RegistrationOutcome::UploadFailed;
        }

        let Some(identity) = DeviceIdentity::parse_confirmation(&report.response) else {
            warn!("unparsable confirmation: {}", report.response);
            return RegistrationOutcome::Unconfirmed;
        };

        if let Err(e) = identity.save(self.store) {
            error!("cannot persist identity: {e:?}");
            return RegistrationOutcome::PersistFailed;
        }
        if let Err(e) = stamp_header(self.volume, PAYLOAD_FILE, &identity.header()) {
            error!("cannot write payload header: {e:?}");
        }

        info!("registered: key '{}', sensor '{}'", identity.key, identity.sensor_id);
        RegistrationOutcome::Registered(identity)
    }

    fn write_provisional(&self, form: &RegistrationForm) -> Result<()> {
        self.volume.rewrite(REGISTER_FILE, &form.header())?;
        let sample = SamplingPipeline::new(self.sensors, self.clock).run(self.volume, REGISTER_FILE);
        if !sample.logged {
            warn!("registration record carries no sample");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{MemStore, RecordingDelay, SimSensors, SimTransport, TempDir};
    use chrono_tz::Tz;
    use std::sync::Mutex;

    fn identity(key: &str, sensor_id: &str, geoutm: &str) -> DeviceIdentity {
        DeviceIdentity {
            key: bounded(key).unwrap(),
            sensor_id: bounded(sensor_id).unwrap(),
            geoutm: bounded(geoutm).unwrap(),
        }
    }

    #[test]
    fn gate_needs_all_fields() {
        let store = Arc::new(MemStore::default());
        let gate = RegistrationGate::new(store.clone());
        assert!(!gate.check());

        store.set(REGISTRATION_NAMESPACE, "geoutm", "12N 345 678").unwrap();
        store.set(REGISTRATION_NAMESPACE, "key", "abc").unwrap();
        assert!(!gate.check());

        store.set(REGISTRATION_NAMESPACE, "sensorID", "").unwrap();
        assert!(!gate.check());

        store.set(REGISTRATION_NAMESPACE, "sensorID", "S1").unwrap();
        assert!(gate.check());
        assert!(gate.check());
    }

    #[test]
    fn wait_keeps_rows_under_header() {
        let store = Arc::new(MemStore::default());
        identity("k1", "S1", "geo").save(store.as_ref()).unwrap();
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        volume.rewrite(PAYLOAD_FILE, "old rows\n").unwrap();

        let mut delay = RecordingDelay::default();
        let got = RegistrationGate::new(store).wait_until_registered(&mut delay, &volume);
        assert_eq!(got, identity("k1", "S1", "geo"));
        assert_eq!(delay.calls(), 0);
        assert_eq!(
            volume.read_to_string(PAYLOAD_FILE).unwrap(),
            "key:'k1'\nsensorID:'S1'\ngeoutm:'geo'\nold rows\n"
        );
    }

    #[test]
    fn header_stamping() {
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        let header = identity("k1", "S1", "geo").header();

        stamp_header(&volume, PAYLOAD_FILE, &header).unwrap();
        assert_eq!(volume.read_to_string(PAYLOAD_FILE).unwrap(), header);

        volume.append(PAYLOAD_FILE, "'row 1'\n").unwrap();
        stamp_header(&volume, PAYLOAD_FILE, &header).unwrap();
        assert_eq!(volume.read_to_string(PAYLOAD_FILE).unwrap(), format!("{header}'row 1'\n"));

        let renamed = identity("k2", "S2", "geo2").header();
        stamp_header(&volume, PAYLOAD_FILE, &renamed).unwrap();
        assert_eq!(volume.read_to_string(PAYLOAD_FILE).unwrap(), format!("{renamed}'row 1'\n"));
    }

    /// Stores the identity once the gate has backed off `after` times.
    struct RegisterAfter {
        inner: RecordingDelay,
        store: Arc<MemStore>,
        after: u32,
    }

    impl DelayMs<u32> for RegisterAfter {
        fn delay_ms(&mut self, ms: u32) {
            self.inner.delay_ms(ms);
            if self.inner.calls() == self.after {
                identity("k1", "S1", "geo").save(self.store.as_ref()).unwrap();
            }
        }
    }

    #[test]
    fn wait_backs_off_until_registered() {
        let store = Arc::new(MemStore::default());
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        let mut delay = RegisterAfter {
            inner: RecordingDelay::default(),
            store: store.clone(),
            after: 4,
        };

        let got = RegistrationGate::new(store).wait_until_registered(&mut delay, &volume);
        assert_eq!(got, identity("k1", "S1", "geo"));
        assert_eq!(delay.inner.calls(), 4);
        assert_eq!(delay.inner.elapsed_ms(), 4 * REGISTRATION_BACKOFF_MS as u64);
    }

    #[test]
    fn confirmation_parsing() {
        let text = "status ok\r\nkey:'a1b2'\r\nsensorID:'S-7'\r\ngeoutm:'12N 500 600'\r\n";
        assert_eq!(
            DeviceIdentity::parse_confirmation(text),
            Some(identity("a1b2", "S-7", "12N 500 600"))
        );

        assert_eq!(DeviceIdentity::parse_confirmation("key:'a'\ngeoutm:'g'\n"), None);
        assert_eq!(DeviceIdentity::parse_confirmation("key:'a'\nsensorID:''\ngeoutm:'g'\n"), None);
        assert_eq!(DeviceIdentity::parse_confirmation(""), None);
    }

    #[test]
    fn form_validation() {
        let form = RegistrationForm::parse("key=k&sensorID=S1&geoutm=12N+1+2").unwrap();
        assert_eq!(form.geoutm.as_str(), "12N 1 2");

        assert_eq!(RegistrationForm::parse("key=k&geoutm=g"), Err(FormError::Missing));
        assert_eq!(
            RegistrationForm::parse("key=k&sensorID=123456789&geoutm=g"),
            Err(FormError::TooLong)
        );
        assert_eq!(
            RegistrationForm::parse(&format!("key={}&sensorID=1&geoutm=g", "k".repeat(17))),
            Err(FormError::TooLong)
        );
    }

    struct Fixture {
        _dir: TempDir,
        store: MemStore,
        volume: RecordVolume,
        sensors: SharedSensors,
        clock: WallClock,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        Fixture {
            _dir: dir,
            store: MemStore::default(),
            volume,
            sensors: Arc::new(Mutex::new(SimSensors::new(20.0, 4242, 12.4))),
            clock: WallClock::new(Tz::UTC),
        }
    }

    fn register(f: &Fixture, transport: &SimTransport) -> RegistrationOutcome {
        let form = RegistrationForm::parse("key=k&sensorID=S1&geoutm=g").unwrap();
        Registrar {
            store: &f.store,
            volume: &f.volume,
            sensors: &f.sensors,
            clock: &f.clock,
            transport,
            url: "https://example.com/register",
        }
        .register(&form, RecordingDelay::default())
    }

    #[test]
    fn confirmed_registration_persists() {
        let f = fixture();
        let transport = SimTransport::new().respond(200, "key:'K9'\nsensorID:'S1'\ngeoutm:'g'\n");

        let outcome = register(&f, &transport);
        assert_eq!(outcome, RegistrationOutcome::Registered(identity("K9", "S1", "g")));
        assert_eq!(DeviceIdentity::load(&f.store).unwrap(), identity("K9", "S1", "g"));

        let request = &transport.requests()[0];
        let body = std::string::String::from_utf8_lossy(&request.body).into_owned();
        assert!(body.contains("key:'k'\nsensorID:'S1'\ngeoutm:'g'\n'"));
        assert!(body.contains("','4242','20.00','12.40'\n"));
        assert!(f
            .volume
            .read_to_string(PAYLOAD_FILE)
            .unwrap()
            .starts_with("key:'K9'"));
    }

    #[test]
    fn missing_sensor_id_keeps_prior_identity() {
        let f = fixture();
        identity("old", "S0", "geo0").save(&f.store).unwrap();
        let transport = SimTransport::new().respond(200, "key:'K9'\ngeoutm:'g'\n");

        assert_eq!(register(&f, &transport), RegistrationOutcome::Unconfirmed);
        assert_eq!(DeviceIdentity::load(&f.store).unwrap(), identity("old", "S0", "geo0"));
    }

    #[test]
    fn upload_failure_keeps_prior_identity() {
        let f = fixture();
        let transport = SimTransport::new().fail().respond(500, "").respond(502, "");

        assert_eq!(register(&f, &transport), RegistrationOutcome::UploadFailed);
        assert!(!DeviceIdentity::load(&f.store).unwrap().is_complete());
    }

    #[test]
    fn partial_persist_keeps_prior_identity() {
        let f = fixture();
        identity("old", "S0", "geo0").save(&f.store).unwrap();
        f.store.fail_key("sensorID");
        let transport = SimTransport::new().respond(200, "key:'NEW'\nsensorID:'S9'\ngeoutm:'geoNEW'\n");

        assert_eq!(register(&f, &transport), RegistrationOutcome::PersistFailed);
        assert_eq!(DeviceIdentity::load(&f.store).unwrap(), identity("old", "S0", "geo0"));
    }

    #[test]
    fn persist_failure_reported() {
        let f = fixture();
        f.store.fail_writes(true);
        let transport = SimTransport::new().respond(200, "key:'K'\nsensorID:'S'\ngeoutm:'G'\n");
        assert_eq!(register(&f, &transport), RegistrationOutcome::PersistFailed);
    }
}
