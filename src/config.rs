use std::collections::HashMap;
use std::env;

use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use heapless::String;

use crate::store::bounded;
use crate::wait::PollPolicy;

pub const ENV_STR: &str = include_str!("../.env");

// -----------------
// pin definitions (ESP32-S3)
// -----------------
// IO2:  V_MEAS_EN
// IO3:  V_MEAS (ADC1 CH2)
// IO4:  SCL
// IO5:  SDA
// IO17: LED_B
// IO19: LED_G
// IO21: LED_R
// IO33: SD_CS
// IO34: SD_MOSI
// IO35: SD_MISO
// IO36: SD_CLK
// IO45: REED (pull-up, active high)

pub const MOUNT_POINT: &str = "/sdcard";
pub const PAYLOAD_FILE: &str = "payload.txt";
pub const REGISTER_FILE: &str = "register.txt";

pub const SSID_MAX: usize = 32;
pub const PASSWORD_MAX: usize = 64;
pub const FORM_KEY_MAX: usize = 16;
pub const FORM_SENSOR_ID_MAX: usize = 8;
pub const FORM_GEOUTM_MAX: usize = 64;
pub const MAX_FORM_BODY: usize = 1024;
pub const MAX_ACCESS_POINTS: usize = 20;
pub const AP_MAX_CLIENTS: u16 = 4;

// waits
pub const RECONNECT_POLL: PollPolicy = PollPolicy::new(2000, 20);
pub const TRIGGER_POLL: PollPolicy = PollPolicy::new(100, 600);
pub const CONFIG_WINDOW_POLL: PollPolicy = PollPolicy::new(5000, 12);
pub const NORMAL_CONNECT_POLL: PollPolicy = PollPolicy::new(1000, 10);
pub const PORTAL_CONNECT_POLL: PollPolicy = PollPolicy::new(250, 60);
pub const TIME_SYNC_POLL: PollPolicy = PollPolicy::new(2000, 15);

pub const REGISTRATION_BACKOFF_MS: u32 = 5000;
pub const PORTAL_CONNECT_SETTLE_MS: u32 = 1000;
pub const RETRY_SETTLE_MS: u32 = 500;
pub const CONNECTED_SHOW_MS: u32 = 3000;
pub const VOLTAGE_SETTLE_MS: u32 = 20;

pub const UPLOAD_ATTEMPTS: u32 = 3;
pub const UPLOAD_BACKOFF_MS: u32 = 2000;
pub const UPLOAD_TIMEOUT_SECS: u64 = 35;
pub const TIME_TIMEOUT_SECS: u64 = 5;
pub const RESPONSE_LIMIT: usize = 1024;

/// Input divider on the battery measurement line.
pub const VOLTAGE_SCALING: f32 = 11.0;

const DEFAULT_UPLOAD_URL: &str =
    "https://h2overwatch.ca/DesktopModules/ShiftUP_VolsenseMap/waterFile.ashx";
const DEFAULT_REGISTER_URL: &str =
    "https://h2overwatch.ca/DesktopModules/ShiftUP_VolsenseMap/registerDevice.ashx";
const DEFAULT_AP_SSID: &str = "PCBees_AP1";
const DEFAULT_AP_PASSWORD: &str = "password123";
// MST7MDT
const DEFAULT_TIME_ZONE: Tz = Tz::America__Denver;
const DEFAULT_TIME_URL: &str = "http://worldtimeapi.org/api/timezone/America/Denver";

/// Deployable settings, read from the embedded `.env`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub upload_url: std::string::String,
    pub register_url: std::string::String,
    pub ap_ssid: String<SSID_MAX>,
    pub ap_password: String<PASSWORD_MAX>,
    /// Zone for log timestamps, daylight saving included.
    pub time_zone: Tz,
    /// HTTP time source used when SNTP does not answer.
    pub time_url: std::string::String,
}

impl NodeConfig {
    /// Embedded `.env`, with process environment taking precedence.
    pub fn load() -> Result<Self> {
        dotenvy::from_read(ENV_STR.as_bytes()).ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut vars = HashMap::new();
        for item in dotenvy::from_read_iter(text.as_bytes()) {
            let (name, value) = item.context("malformed .env line")?;
            vars.insert(name, value);
        }
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<std::string::String>) -> Result<Self> {
        let get = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        let ap_ssid = get("AP_SSID", DEFAULT_AP_SSID);
        let ap_password = lookup("AP_PASSWORD").unwrap_or_else(|| DEFAULT_AP_PASSWORD.to_owned());
        if !ap_password.is_empty() && ap_password.len() < 8 {
            bail!("AP_PASSWORD must be empty or at least 8 characters");
        }

        let time_zone = match lookup("TIME_ZONE").filter(|v| !v.is_empty()) {
            Some(v) => v
                .trim()
                .parse::<Tz>()
                .map_err(|e| anyhow!("invalid TIME_ZONE '{v}': {e}"))?,
            None => DEFAULT_TIME_ZONE,
        };

        Ok(Self {
            upload_url: get("UPLOAD_URL", DEFAULT_UPLOAD_URL),
            register_url: get("REGISTER_URL", DEFAULT_REGISTER_URL),
            ap_ssid: bounded(&ap_ssid).context("AP_SSID too long")?,
            ap_password: bounded(&ap_password).context("AP_PASSWORD too long")?,
            time_zone,
            time_url: get("TIME_URL", DEFAULT_TIME_URL),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_env_parses() {
        let config = NodeConfig::parse(ENV_STR).unwrap();
        assert!(config.upload_url.ends_with("waterFile.ashx"));
        assert!(config.register_url.ends_with("registerDevice.ashx"));
        assert_eq!(config.ap_ssid.as_str(), "PCBees_AP1");
        assert_eq!(config.time_zone, Tz::America__Denver);
    }

    #[test]
    fn time_zone_by_name() {
        let config = NodeConfig::parse("TIME_ZONE=Europe/Berlin\n").unwrap();
        assert_eq!(config.time_zone, Tz::Europe__Berlin);
    }

    #[test]
    fn defaults_fill_gaps() {
        let config = NodeConfig::parse("UPLOAD_URL=http://localhost/up\n").unwrap();
        assert_eq!(config.upload_url, "http://localhost/up");
        assert_eq!(config.register_url, DEFAULT_REGISTER_URL);
        assert_eq!(config.time_zone, Tz::America__Denver);
        assert!(config.time_url.contains("worldtimeapi"));
    }

    #[test]
    fn open_access_point_allowed() {
        let config = NodeConfig::parse("AP_PASSWORD=\n").unwrap();
        assert!(config.ap_password.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(NodeConfig::parse("AP_PASSWORD=short\n").is_err());
        assert!(NodeConfig::parse("TIME_ZONE=Mars/Olympus\n").is_err());
        assert!(NodeConfig::parse(&format!("AP_SSID={}\n", "x".repeat(33))).is_err());
    }

    #[test]
    fn wait_budgets() {
        assert_eq!(RECONNECT_POLL.budget().as_secs(), 40);
        assert_eq!(TRIGGER_POLL.budget().as_secs(), 60);
        assert_eq!(CONFIG_WINDOW_POLL.budget().as_secs(), 60);
        assert_eq!(NORMAL_CONNECT_POLL.budget().as_secs(), 10);
        assert_eq!(PORTAL_CONNECT_POLL.budget().as_secs(), 15);
    }
}
