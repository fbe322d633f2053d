use std::sync::{Arc, Mutex};

use anyhow::Result;
use embedded_hal::blocking::delay::DelayMs;
use embedded_svc::http::Method;
use log::{error, info, warn};

use crate::clock::WallClock;
use crate::config::{MAX_FORM_BODY, PORTAL_CONNECT_POLL, PORTAL_CONNECT_SETTLE_MS};
use crate::connectivity::{AccessPoint, ConnectRequest, ConnectivityManager, SignalReader, WifiCredentials};
use crate::led::{blink, show, Color, SharedIndicator};
use crate::registration::{FormError, Registrar, RegistrationForm, RegistrationOutcome};
use crate::sampling::SharedSensors;
use crate::storage::RecordVolume;
use crate::store::KvStore;
use crate::upload::Transport;
use crate::urlcode;
use crate::wait::wait_until;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalReply {
    Page(String),
    /// 303 See Other.
    Redirect(String),
    Error { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Status,
    Scan,
    Connect,
    Retry,
    Register,
}

pub const ROUTES: [(&str, Method, Route); 5] = [
    ("/", Method::Get, Route::Status),
    ("/scan", Method::Get, Route::Scan),
    ("/connect", Method::Post, Route::Connect),
    ("/retry", Method::Post, Route::Retry),
    ("/register", Method::Post, Route::Register),
];

/// Binds the portal to an HTTP server that stays up until the node sleeps.
pub trait PortalHost<D> {
    fn start(&mut self, portal: Arc<Portal<D>>) -> Result<()>;
    /// Stops serving. A host that never started does nothing.
    fn stop(&mut self) -> Result<()>;
}

/// Provisioning web portal served on the soft-AP.
pub struct Portal<D> {
    pub connectivity: Arc<Mutex<ConnectivityManager>>,
    pub signal: SignalReader,
    pub store: Arc<dyn KvStore>,
    pub volume: RecordVolume,
    pub sensors: SharedSensors,
    pub clock: Arc<WallClock>,
    pub transport: Arc<dyn Transport>,
    pub indicator: SharedIndicator,
    pub register_url: String,
    pub delay: D,
}

impl<D: DelayMs<u32> + Clone> Portal<D> {
    /// Dispatches a request. Every path produces exactly one reply.
    pub fn dispatch(&self, method: Method, uri: &str, body: &[u8]) -> PortalReply {
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        let route = ROUTES
            .iter()
            .find(|(p, m, _)| *p == path && *m == method)
            .map(|(_, _, r)| *r);

        match route {
            Some(route) => self.handle(route, query, body),
            None => PortalReply::Error {
                status: 404,
                message: "Not Found".into(),
            },
        }
    }

    pub fn handle(&self, route: Route, query: &str, body: &[u8]) -> PortalReply {
        if body.len() > MAX_FORM_BODY {
            warn!("request body of {} bytes rejected", body.len());
            return redirect_error("Request Too Large");
        }
        let body = String::from_utf8_lossy(body);

        match route {
            Route::Status => self.status_page(query),
            Route::Scan => self.scan(),
            Route::Connect => self.connect(&body),
            Route::Retry => self.retry(),
            Route::Register => self.register(&body),
        }
    }

    fn status_page(&self, query: &str) -> PortalReply {
        let access_points = match self.connectivity.lock() {
            Ok(c) => c.access_points().to_vec(),
            Err(_) => Vec::new(),
        };

        let message = if let Some(msg) = urlcode::field(query, "error") {
            Some(("red", msg))
        } else if let Some(msg) = urlcode::field(query, "success") {
            Some(("green", msg))
        } else {
            urlcode::field(query, "message").map(|msg| ("black", msg))
        };

        PortalReply::Page(render_page(&access_points, message))
    }

    fn scan(&self) -> PortalReply {
        match self.connectivity.lock() {
            Ok(mut c) => {
                if let Err(e) = c.scan() {
                    error!("{e:?}");
                    return redirect_error("Scan Failed");
                }
            }
            Err(_) => return internal_error(),
        }
        PortalReply::Redirect("/".into())
    }

    fn connect(&self, body: &str) -> PortalReply {
        let ssid = urlcode::field(body, "ssid").unwrap_or_default();
        let password = urlcode::field(body, "password").unwrap_or_default();

        let Some(credentials) = WifiCredentials::new(&ssid, &password) else {
            return redirect_error("SSID or Password Too Long");
        };
        if credentials.ssid.is_empty() {
            return redirect_error("SSID Required");
        }

        let baseline = self.signal.acquisitions();
        let request = match self.connectivity.lock() {
            Ok(mut c) => {
                if let Err(e) = c.disconnect() {
                    warn!("{e:?}");
                }
                c.connect_with(&credentials)
            }
            Err(_) => return internal_error(),
        };
        if request != ConnectRequest::Requested {
            return redirect_error("Connection Failed");
        }

        let mut delay = self.delay.clone();
        delay.delay_ms(PORTAL_CONNECT_SETTLE_MS);
        let signal = &self.signal;
        let connected = wait_until("portal connect", &mut delay, PORTAL_CONNECT_POLL, || {
            signal.is_connected() && signal.acquisitions() > baseline
        });

        if !connected {
            warn!("connection to '{}' timed out", credentials.ssid);
            blink(&self.indicator, Color::Red, 1);
            show(&self.indicator, Color::Blue);
            return redirect_error("Connection Timeout");
        }

        match credentials.save(self.store.as_ref()) {
            Ok(()) => info!("credentials for '{}' saved", credentials.ssid),
            Err(e) => error!("cannot save credentials: {e:?}"),
        }
        show(&self.indicator, Color::Green);
        redirect_success(&format!("Connected to {}", credentials.ssid))
    }

    fn retry(&self) -> PortalReply {
        let mut delay = self.delay.clone();
        match self.connectivity.lock() {
            Ok(mut c) => {
                c.reconnect(&mut delay);
            }
            Err(_) => return internal_error(),
        }
        PortalReply::Redirect("/".into())
    }

    fn register(&self, body: &str) -> PortalReply {
        let form = match RegistrationForm::parse(body) {
            Ok(form) => form,
            Err(FormError::Missing) => return redirect_error("All Registration Fields Required"),
            Err(FormError::TooLong) => return redirect_error("Registration Field Too Long"),
        };

        let registrar = Registrar {
            store: self.store.as_ref(),
            volume: &self.volume,
            sensors: &self.sensors,
            clock: &self.clock,
            transport: self.transport.as_ref(),
            url: &self.register_url,
        };

        match registrar.register(&form, self.delay.clone()) {
            RegistrationOutcome::Registered(_) => redirect_success("Device Registered"),
            RegistrationOutcome::ProvisionalWriteFailed => PortalReply::Error {
                status: 500,
                message: "Failed to write registration file".into(),
            },
            RegistrationOutcome::UploadFailed => redirect_error("Registration Upload Failed"),
            RegistrationOutcome::Unconfirmed => redirect_error("Failed to parse server response"),
            RegistrationOutcome::PersistFailed => redirect_error("Failed to save registration"),
        }
    }
}

fn redirect_error(message: &str) -> PortalReply {
    PortalReply::Redirect(format!("/?error={}", urlcode::encode(message)))
}

fn redirect_success(message: &str) -> PortalReply {
    PortalReply::Redirect(format!("/?success={}", urlcode::encode(message)))
}

fn internal_error() -> PortalReply {
    PortalReply::Error {
        status: 500,
        message: "Internal Server Error".into(),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1">
<title>Sensor Setup</title>
<style>body{font-family:sans-serif;max-width:28em;margin:1em auto;padding:0 1em}
input,select,button{width:100%;margin:.3em 0;padding:.4em;box-sizing:border-box}
fieldset{margin-bottom:1em}</style></head><body>
<h2>Sensor Setup</h2>
"#;

fn render_page(access_points: &[AccessPoint], message: Option<(&str, String)>) -> String {
    let mut page = String::from(PAGE_HEAD);

    if let Some((color, text)) = message {
        page.push_str(&format!(
            "<p style=\"color:{color}\"><b>{}</b></p>\n",
            escape(&text)
        ));
    }

    let options = if access_points.is_empty() {
        "<option value=\"\">No networks found. Please scan.</option>".to_string()
    } else {
        access_points
            .iter()
            .map(|ap| {
                let ssid = escape(&ap.ssid);
                format!("<option value=\"{ssid}\">{ssid} ({} dBm)</option>", ap.rssi)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    page.push_str(&format!(
        r#"<fieldset><legend>Wi-Fi</legend>
<form action="/scan" method="get"><button type="submit">Scan</button></form>
<form action="/connect" method="post">
<select name="ssid">
{options}
</select>
<input type="password" name="password" maxlength="64" placeholder="Password">
<button type="submit">Connect</button>
</form>
<form action="/retry" method="post"><button type="submit">Retry saved network</button></form>
</fieldset>
<fieldset><legend>Registration</legend>
<form action="/register" method="post">
<input name="key" maxlength="16" placeholder="Key">
<input name="sensorID" maxlength="8" placeholder="Sensor ID">
<input name="geoutm" maxlength="64" placeholder="UTM location">
<button type="submit">Register</button>
</form>
</fieldset>
</body></html>
"#
    ));
    page
}
