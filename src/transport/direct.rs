use std::collections::VecDeque;
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use tracing::{debug, info};

use crate::config::TransportSettings;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::TransportKind;

/// WiFi/cellular link to the backend over HTTP.
///
/// Each packet is POSTed to the device's message endpoint; the response body
/// carries whatever the backend has for the device (acknowledgments, commands),
/// which is queued for [`Transport::receive`].
pub struct DirectTransport {
    http: Option<Client>,
    backend_url: String,
    device_id: String,
    handshake_timeout: Duration,
    request_timeout: Duration,
    inbox: VecDeque<Vec<u8>>,
}

impl DirectTransport {
    pub fn new(settings: &TransportSettings, device_id: &str) -> Result<Self> {
        let TransportSettings::Direct {
            backend_url,
            handshake_timeout_secs,
            request_timeout_secs,
        } = settings
        else {
            return Err(Error::Validation("direct transport needs direct settings".into()));
        };
        if backend_url.is_empty() {
            return Err(Error::Validation("backend url must not be empty".into()));
        }

        Ok(DirectTransport {
            http: None,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            handshake_timeout: Duration::from_secs(*handshake_timeout_secs),
            request_timeout: Duration::from_secs(*request_timeout_secs),
            inbox: VecDeque::new(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/api/devices/{}/messages", self.backend_url, self.device_id)
    }

    fn client(&self) -> Result<&Client> {
        self.http.as_ref().ok_or(Error::NotConnected)
    }

    /// Queues every packet in a JSON array response body.
    fn enqueue_response(&mut self, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Ok(0);
        }
        let packets: Vec<serde_json::Value> = serde_json::from_str(text)?;
        let count = packets.len();
        for packet in packets {
            self.inbox.push_back(serde_json::to_vec(&packet)?);
        }
        Ok(count)
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectNetwork
    }

    fn is_connected(&self) -> bool {
        self.http.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.http.is_some() {
            return Ok(());
        }

        let client = Client::builder().timeout(self.request_timeout).build()?;
        let url = format!("{}/api/health", self.backend_url);
        let response = client
            .get(&url)
            .timeout(self.handshake_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Backend {
                stage: "handshake",
                status: response.status().as_u16(),
            });
        }

        info!(backend = %self.backend_url, "Backend handshake complete.");
        self.http = Some(client);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let url = self.messages_url();
        let response = self
            .client()?
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Backend {
                stage: "send",
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let queued = self.enqueue_response(&text)?;
        debug!(bytes = payload.len(), inbound = queued, "Packet posted.");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(packet) = self.inbox.pop_front() {
            return Ok(Some(packet));
        }
        if self.http.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(None)
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(packet) = self.inbox.pop_front() {
            return Ok(Some(packet));
        }

        // Long-poll: the backend holds the request until something is pending or the wait ends.
        let url = format!("{}?wait_ms={}", self.messages_url(), timeout.as_millis());
        let response = self
            .client()?
            .get(&url)
            .timeout(timeout + self.request_timeout)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Backend {
                stage: "receive",
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await?;
        self.enqueue_response(&text)?;
        Ok(self.inbox.pop_front())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.http.take().is_some() {
            debug!(backend = %self.backend_url, "Direct transport closed.");
        }
        self.inbox.clear();
        Ok(())
    }
}
