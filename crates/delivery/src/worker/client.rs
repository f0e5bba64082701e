//! Outbound webhook HTTP client

use std::time::Duration;

use courier_core::{Event, HEADER_WEBHOOK_ID, HEADER_WEBHOOK_TYPE};
use reqwest::Client;
use tracing::{debug, warn};

/// Response bodies longer than this are cut before they are stored
pub const MAX_RESPONSE_BODY_BYTES: usize = 4096;

/// Cut `body` to at most [`MAX_RESPONSE_BODY_BYTES`], on a char boundary
pub fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_BODY_BYTES {
        let mut end = MAX_RESPONSE_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Response captured from a webhook target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POSTs event envelopes to registration targets
#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    timeout: Duration,
}

impl WebhookClient {
    /// Build a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send the envelope for `event` to `url`
    ///
    /// Any HTTP response is returned, whatever its status; only failures to
    /// get a status (connect, timeout) are errors. A body that cannot be read
    /// is replaced by the read error.
    pub async fn send(&self, url: &str, event: &Event) -> Result<WebhookResponse, reqwest::Error> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header(HEADER_WEBHOOK_ID, event.id.to_string())
            .header(HEADER_WEBHOOK_TYPE, &event.event_type)
            .json(&event.envelope())
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(url, status, error = %e, "failed to read webhook response body");
                format!("failed to read response body: {e}")
            }
        };
        debug!(url, status, "webhook target responded");

        Ok(WebhookResponse {
            status,
            body: truncate_body(body),
        })
    }
}
