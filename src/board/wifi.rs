use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, Wifi};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::EspWifi;
use esp_idf_sys::{
    esp, esp_event_base_t, esp_event_handler_instance_register, esp_event_handler_instance_t,
    esp_event_handler_instance_unregister, wifi_event_sta_disconnected_t,
    wifi_event_t_WIFI_EVENT_STA_CONNECTED, wifi_event_t_WIFI_EVENT_STA_DISCONNECTED,
    ESP_EVENT_ANY_ID, WIFI_EVENT,
};
use log::info;

use crate::config::AP_MAX_CLIENTS;
use crate::connectivity::{AccessPoint, NetEvent, Radio, SignalWriter};
use crate::store::bounded;

/// Feeds driver events into the connection signal. The writer lives as long
/// as both registrations.
struct EventSubscription {
    _writer: Arc<SignalWriter>,
    wifi: esp_event_handler_instance_t,
    _ip: EspSubscription<'static, System>,
}

unsafe impl Send for EventSubscription {}

impl EventSubscription {
    fn register(sys_loop: &EspSystemEventLoop, writer: SignalWriter) -> Result<Self> {
        let writer = Arc::new(writer);

        // WifiEvent::StaDisconnected carries no reason code in esp-idf-svc
        // 0.47, so station events come straight from the IDF handler.
        let arg = Arc::as_ptr(&writer) as *mut c_void;
        let mut wifi: esp_event_handler_instance_t = ptr::null_mut();
        unsafe {
            esp!(esp_event_handler_instance_register(
                WIFI_EVENT,
                ESP_EVENT_ANY_ID,
                Some(on_wifi_event),
                arg,
                &mut wifi,
            ))?;
        }

        let ip_writer = writer.clone();
        let ip = sys_loop.subscribe(move |event: &IpEvent| {
            if let IpEvent::DhcpIpAssigned(assignment) = event {
                let ip = Ipv4Addr::from(assignment.ip_settings.ip.octets());
                ip_writer.apply(NetEvent::IpAcquired(ip));
            }
        })?;

        Ok(Self {
            _writer: writer,
            wifi,
            _ip: ip,
        })
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        unsafe {
            esp_event_handler_instance_unregister(WIFI_EVENT, ESP_EVENT_ANY_ID, self.wifi);
        }
    }
}

unsafe extern "C" fn on_wifi_event(
    arg: *mut c_void,
    _base: esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let writer = &*(arg as *const SignalWriter);

    let event = if id == wifi_event_t_WIFI_EVENT_STA_CONNECTED as i32 {
        Some(NetEvent::StationConnected)
    } else if id == wifi_event_t_WIFI_EVENT_STA_DISCONNECTED as i32 && !data.is_null() {
        let info = &*(data as *const wifi_event_sta_disconnected_t);
        Some(NetEvent::StationDisconnected(info.reason))
    } else {
        None
    };

    if let Some(event) = event {
        writer.apply(event);
    }
}

pub struct EspRadio {
    wifi: Box<EspWifi<'static>>,
    client: ClientConfiguration,
    access_point: Option<AccessPointConfiguration>,
    _events: EventSubscription,
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        writer: SignalWriter,
    ) -> Result<Self> {
        let events = EventSubscription::register(&sys_loop, writer)?;
        let wifi = Box::new(EspWifi::new(modem, sys_loop, Some(nvs))?);

        Ok(Self {
            wifi,
            client: ClientConfiguration::default(),
            access_point: None,
            _events: events,
        })
    }

    fn apply(&mut self) -> Result<()> {
        let configuration = match &self.access_point {
            Some(ap) => Configuration::Mixed(self.client.clone(), ap.clone()),
            None => Configuration::Client(self.client.clone()),
        };
        self.wifi.set_configuration(&configuration)?;

        if !self.wifi.is_started()? {
            info!("Starting Wifi...");
            self.wifi.start()?;
        }
        Ok(())
    }
}

impl Radio for EspRadio {
    fn configure_station(&mut self, ssid: &str, password: &str, auth: AuthMethod) -> Result<()> {
        self.client = ClientConfiguration {
            ssid: bounded(ssid).ok_or_else(|| anyhow!("ssid too long"))?,
            password: bounded(password).ok_or_else(|| anyhow!("password too long"))?,
            auth_method: auth,
            ..Default::default()
        };
        self.apply()
    }

    fn connect(&mut self) -> Result<()> {
        self.wifi.connect()?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.wifi.disconnect()?;
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.access_point = Some(AccessPointConfiguration {
            ssid: bounded(ssid).ok_or_else(|| anyhow!("AP ssid too long"))?,
            password: bounded(password).ok_or_else(|| anyhow!("AP password too long"))?,
            auth_method,
            max_connections: AP_MAX_CLIENTS,
            channel: 1,
            ..Default::default()
        });
        self.apply()
    }

    fn scan(&mut self) -> Result<Vec<AccessPoint>> {
        info!("Scanning...");
        let found = self.wifi.scan()?;
        Ok(found
            .into_iter()
            .map(|ap| AccessPoint {
                ssid: ap.ssid,
                rssi: ap.signal_strength,
            })
            .collect())
    }
}
