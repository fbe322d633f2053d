use anyhow::Result;
use embedded_hal::blocking::delay::DelayMs;
use log::{error, info, warn};

use crate::config::{RESPONSE_LIMIT, UPLOAD_ATTEMPTS, UPLOAD_BACKOFF_MS};
use crate::storage::RecordVolume;

pub const BOUNDARY: &str = "----WebKitFormBoundary7MA4YWxkTrZuOgW";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP(S) client. Each call is a fresh connection.
pub trait Transport: Send + Sync {
    fn post(&self, url: &str, content_type: &str, body: &[u8]) -> Result<HttpResponse>;
    fn get(&self, url: &str) -> Result<HttpResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Retryable,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub outcome: UploadOutcome,
    pub attempts: u32,
    /// Body of the last response, truncated.
    pub response: String,
}

pub fn content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

/// Wraps `contents` as the single `file` part of a multipart form.
pub fn multipart_body(contents: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"payload.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n"
    );
    let tail = format!("\r\n--{BOUNDARY}--\r\n");

    let mut body = Vec::with_capacity(head.len() + contents.len() + tail.len());
    body.extend_from_slice(head.as_bytes());
    body.extend_from_slice(contents);
    body.extend_from_slice(tail.as_bytes());
    body
}

pub struct UploadAgent<'a, D> {
    transport: &'a dyn Transport,
    delay: D,
}

impl<'a, D: DelayMs<u32>> UploadAgent<'a, D> {
    pub fn new(transport: &'a dyn Transport, delay: D) -> Self {
        Self { transport, delay }
    }

    /// One read-and-post attempt; only status 200 counts.
    pub fn attempt(&self, volume: &RecordVolume, file: &str, url: &str) -> (UploadOutcome, String) {
        let contents = match volume.read(file) {
            Ok(c) => c,
            Err(e) => {
                error!("{e:?}");
                return (UploadOutcome::Retryable, String::new());
            }
        };

        match self
            .transport
            .post(url, &content_type(), &multipart_body(&contents))
        {
            Ok(response) => {
                let mut body = response.body;
                truncate(&mut body, RESPONSE_LIMIT);
                if response.status == 200 {
                    info!("{file} uploaded");
                    (UploadOutcome::Success, body)
                } else {
                    warn!("upload rejected with status {}", response.status);
                    (UploadOutcome::Retryable, body)
                }
            }
            Err(e) => {
                warn!("upload failed: {e:?}");
                (UploadOutcome::Retryable, String::new())
            }
        }
    }

    /// Retries with a fixed backoff. Never fails the caller, the file stays
    /// in place either way.
    pub fn upload(&mut self, volume: &RecordVolume, file: &str, url: &str) -> UploadReport {
        let mut response = String::new();
        for attempt in 1..=UPLOAD_ATTEMPTS {
            info!("uploading {file} (attempt {attempt}/{UPLOAD_ATTEMPTS})");
            let (outcome, body) = self.attempt(volume, file, url);
            response = body;

            if outcome == UploadOutcome::Success {
                return UploadReport {
                    outcome,
                    attempts: attempt,
                    response,
                };
            }
            if attempt < UPLOAD_ATTEMPTS {
                self.delay.delay_ms(UPLOAD_BACKOFF_MS);
            }
        }

        error!("upload of {file} failed after {UPLOAD_ATTEMPTS} attempts");
        UploadReport {
            outcome: UploadOutcome::Exhausted,
            attempts: UPLOAD_ATTEMPTS,
            response,
        }
    }
}

fn truncate(s: &mut String, limit: usize) {
    if s.len() > limit {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{RecordingDelay, SimTransport, TempDir};

    fn volume_with(contents: &str) -> (TempDir, RecordVolume) {
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        volume.rewrite("payload.txt", contents).unwrap();
        (dir, volume)
    }

    #[test]
    fn succeeds_on_third_attempt() {
        let (_dir, volume) = volume_with("key:'k'\n");
        let transport = SimTransport::new()
            .respond(500, "busy")
            .respond(404, "")
            .respond(200, "ok");
        let delay = RecordingDelay::default();
        let mut agent = UploadAgent::new(&transport, delay.clone());

        let report = agent.upload(&volume, "payload.txt", "https://example.com/up");
        assert_eq!(report.outcome, UploadOutcome::Success);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.response, "ok");
        assert_eq!(delay.elapsed_ms(), 2 * UPLOAD_BACKOFF_MS as u64);

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(
                request.content_type,
                "multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZuOgW"
            );
            assert_eq!(request.url, "https://example.com/up");
        }
    }

    #[test]
    fn exhausts_and_keeps_file() {
        let (_dir, volume) = volume_with("row\n");
        let transport = SimTransport::new().fail().fail().respond(503, "down");
        let mut agent = UploadAgent::new(&transport, RecordingDelay::default());

        let report = agent.upload(&volume, "payload.txt", "https://example.com/up");
        assert_eq!(report.outcome, UploadOutcome::Exhausted);
        assert_eq!(report.attempts, UPLOAD_ATTEMPTS);
        assert_eq!(report.response, "down");
        assert_eq!(volume.read_to_string("payload.txt").unwrap(), "row\n");
    }

    #[test]
    fn missing_file_is_retryable() {
        let dir = TempDir::new();
        let volume = RecordVolume::new(dir.path());
        let transport = SimTransport::new();
        let agent = UploadAgent::new(&transport, RecordingDelay::default());

        let (outcome, _) = agent.attempt(&volume, "payload.txt", "https://example.com/up");
        assert_eq!(outcome, UploadOutcome::Retryable);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn multipart_layout() {
        let body = String::from_utf8(multipart_body(b"row\n")).unwrap();
        assert!(body.starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(body.contains("name=\"file\"; filename=\"payload.txt\""));
        assert!(body.contains("Content-Type: text/plain\r\n\r\nrow\n\r\n"));
        assert!(body.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn response_truncated() {
        let (_dir, volume) = volume_with("row\n");
        let transport = SimTransport::new().respond(200, &"x".repeat(4000));
        let mut agent = UploadAgent::new(&transport, RecordingDelay::default());
        let report = agent.upload(&volume, "payload.txt", "u");
        assert_eq!(report.response.len(), RESPONSE_LIMIT);
    }
}
