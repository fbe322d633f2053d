use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use embedded_hal::blocking::delay::DelayMs;
use log::{info, warn};
use serde::Deserialize;

use crate::config::TIME_SYNC_POLL;
use crate::upload::Transport;
use crate::wait::wait_until;

/// Anything before this year means the RTC was never set.
const MIN_VALID_YEAR: i32 = 2024;

/// Network time source.
pub trait TimeSync {
    fn start(&mut self) -> Result<()>;
    fn is_synced(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Sntp,
    Http,
    Fallback,
}

/// Starts the time source and waits a bounded time for the first sync.
pub fn sync_time<D: DelayMs<u32>>(sync: &mut dyn TimeSync, delay: &mut D) -> bool {
    if let Err(e) = sync.start() {
        warn!("cannot start time sync: {e:?}");
        return false;
    }

    let synced = wait_until("sntp", delay, TIME_SYNC_POLL, || sync.is_synced());
    if synced {
        info!("time synchronized");
    } else {
        warn!("sntp timed out");
    }
    synced
}

#[derive(Deserialize)]
struct WorldTime {
    datetime: String,
}

/// Fetches the current time from a worldtimeapi style endpoint.
pub fn http_time(transport: &dyn Transport, url: &str) -> Result<DateTime<Utc>> {
    let response = transport.get(url)?;
    if response.status != 200 {
        bail!("time server answered {}", response.status);
    }

    let time: WorldTime = serde_json::from_str(&response.body).context("time response")?;
    let at = DateTime::parse_from_rfc3339(&time.datetime)
        .with_context(|| format!("time field '{}'", time.datetime))?;
    Ok(at.with_timezone(&Utc))
}

/// SNTP first, then the HTTP source. Whatever answers anchors `clock`.
pub fn synchronize<D: DelayMs<u32>>(
    sync: &mut dyn TimeSync,
    transport: &dyn Transport,
    url: &str,
    clock: &WallClock,
    delay: &mut D,
) -> TimeSource {
    if sync_time(sync, delay) {
        return TimeSource::Sntp;
    }

    info!("asking {url} for the time");
    match http_time(transport, url) {
        Ok(utc) => {
            info!("time from http: {utc}");
            clock.set_reference(utc);
            TimeSource::Http
        }
        Err(e) => {
            warn!("http time failed: {e:?}, timestamps use fallback clock");
            TimeSource::Fallback
        }
    }
}

/// Local timestamps for log rows.
pub struct WallClock {
    zone: Tz,
    boot: Instant,
    reference: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl WallClock {
    pub fn new(zone: Tz) -> Self {
        Self {
            zone,
            boot: Instant::now(),
            reference: Mutex::new(None),
        }
    }

    /// Pins the clock to `utc` as of now, for when the RTC could not be set.
    pub fn set_reference(&self, utc: DateTime<Utc>) {
        if let Ok(mut reference) = self.reference.lock() {
            *reference = Some((Instant::now(), utc));
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.at(SystemTime::now())
    }

    /// Local time for `system`. An unset clock uses the HTTP reference if
    /// there is one, else a fixed date plus uptime so rows stay ordered and
    /// recognizable.
    pub fn at(&self, system: SystemTime) -> NaiveDateTime {
        let utc = DateTime::<Utc>::from(system);
        if utc.year() >= MIN_VALID_YEAR {
            return self.local(utc);
        }

        let reference = self.reference.lock().ok().and_then(|r| *r);
        if let Some((taken, utc)) = reference {
            return self.local(utc + elapsed(taken));
        }

        fallback_base() + elapsed(self.boot)
    }

    fn local(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        utc.with_timezone(&self.zone).naive_local()
    }
}

fn elapsed(since: Instant) -> Duration {
    Duration::from_std(since.elapsed()).unwrap_or_else(|_| Duration::zero())
}

fn fallback_base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 21)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}
