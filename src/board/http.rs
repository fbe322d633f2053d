use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use embedded_hal::blocking::delay::DelayMs;
use embedded_svc::http::client::Client;
use embedded_svc::http::server::Request;
use embedded_svc::http::{Headers, Method, Status};
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration as HttpClientConfiguration, EspHttpConnection};
use esp_idf_svc::http::server::{Configuration as HttpServerConfiguration, EspHttpServer};
use log::info;

use crate::config::{MAX_FORM_BODY, RESPONSE_LIMIT, TIME_TIMEOUT_SECS, UPLOAD_TIMEOUT_SECS};
use crate::portal::{Portal, PortalHost, PortalReply, ROUTES};
use crate::upload::{HttpResponse, Transport};

/// HTTP(S) over the IDF client, verified against the certificate bundle.
pub struct HttpsTransport;

impl Transport for HttpsTransport {
    fn post(&self, url: &str, content_type: &str, body: &[u8]) -> Result<HttpResponse> {
        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", content_type),
            ("Content-Length", content_length.as_str()),
            ("Connection", "close"),
        ];
        exchange(Method::Post, url, &headers, body, UPLOAD_TIMEOUT_SECS)
    }

    fn get(&self, url: &str) -> Result<HttpResponse> {
        exchange(Method::Get, url, &[("Connection", "close")], &[], TIME_TIMEOUT_SECS)
    }
}

fn exchange(
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    timeout_secs: u64,
) -> Result<HttpResponse> {
    let conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(timeout_secs)),
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = Client::wrap(EspHttpConnection::new(&conf)?);

    let mut request = client
        .request(method, url, headers)
        .map_err(|e| anyhow!("request: {e:?}"))?;
    if !body.is_empty() {
        request.write_all(body).map_err(|e| anyhow!("write: {e:?}"))?;
    }
    request.flush().map_err(|e| anyhow!("flush: {e:?}"))?;

    let mut response = request.submit().map_err(|e| anyhow!("submit: {e:?}"))?;
    let status = response.status();

    let mut received = Vec::new();
    let mut chunk = [0u8; 256];
    while received.len() < RESPONSE_LIMIT {
        let n = response.read(&mut chunk).map_err(|e| anyhow!("read: {e:?}"))?;
        if n == 0 {
            break;
        }
        let take = n.min(RESPONSE_LIMIT - received.len());
        received.extend_from_slice(&chunk[..take]);
    }

    Ok(HttpResponse {
        status,
        body: String::from_utf8_lossy(&received).into_owned(),
    })
}

/// Serves the portal on the IDF HTTP server.
#[derive(Default)]
pub struct EspPortalHost {
    server: Option<EspHttpServer>,
}

impl<D> PortalHost<D> for EspPortalHost
where
    D: DelayMs<u32> + Clone + Send + Sync + 'static,
{
    fn start(&mut self, portal: Arc<Portal<D>>) -> Result<()> {
        let mut server = EspHttpServer::new(&HttpServerConfiguration {
            stack_size: 8 * 1024,
            max_uri_handlers: 16,
            ..Default::default()
        })?;

        for (path, method, _) in ROUTES {
            let portal = portal.clone();
            server.fn_handler(path, method, move |mut req| {
                let body = read_body(&mut req)?;
                let reply = portal.dispatch(method, req.uri(), &body);
                send_reply(req, reply)?;
                Ok(())
            })?;
        }

        info!("portal listening");
        self.server = Some(server);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.server.take().is_some() {
            info!("portal stopped");
        }
        Ok(())
    }
}

fn read_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> Result<Vec<u8>> {
    let declared = req.content_len().unwrap_or(0) as usize;
    // one byte past the form limit is enough for the portal to reject it
    let mut body = vec![0u8; declared.min(MAX_FORM_BODY + 1)];

    let mut filled = 0;
    while filled < body.len() {
        let n = req.read(&mut body[filled..]).map_err(|e| anyhow!("{e:?}"))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    body.truncate(filled);
    Ok(body)
}

fn send_reply(req: Request<&mut EspHttpConnection<'_>>, reply: PortalReply) -> Result<()> {
    match reply {
        PortalReply::Page(html) => {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(html.as_bytes())?;
        }
        PortalReply::Redirect(location) => {
            req.into_response(303, Some("See Other"), &[("Location", location.as_str())])?;
        }
        PortalReply::Error { status, message } => {
            req.into_response(status, Some(message.as_str()), &[("Content-Type", "text/plain")])?
                .write_all(message.as_bytes())?;
        }
    }
    Ok(())
}
