use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::defaults;
use crate::error::Error;
use crate::model::{LastError, Message};

pub const USER_AGENT_VALUE: &str = "Done Light";

/// Executes the outbound HTTP POST for a message in `DELIVER` and classifies
/// the response. HTTP 200/201 are success; any other status, network error,
/// timeout, or DNS failure is a failure.
#[derive(Clone)]
pub struct DeliveryWorker {
    http: reqwest::Client,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed(DeliveryFailure),
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

impl DeliveryFailure {
    pub fn into_last_error(self) -> LastError {
        LastError {
            url: self.url,
            status: self.status,
            message: self.message,
            created_at: Utc::now(),
        }
    }
}

/// Forwarded entries with lowercased names. Entries that do not form valid
/// header names or values are skipped rather than failing the delivery.
fn forward_headers(message: &Message) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &message.payload.headers.forward {
        let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            tracing::warn!(message_id = %message.id, header = %name, "skipping invalid forward header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(message_id = %message.id, header = %name, "skipping invalid forward header value");
            continue;
        };
        headers.insert(name, value);
    }
    headers
}

/// Outbound callback headers: forwarded entries first, then the system
/// headers overlaid so clients can never override them.
pub(crate) fn delivery_headers(message: &Message) -> HeaderMap {
    let mut headers = forward_headers(message);

    let id = HeaderValue::from_str(&message.id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    headers.insert(HeaderName::from_static("done-message-id"), id);
    headers.insert(
        HeaderName::from_static("done-status"),
        HeaderValue::from_static("DELIVER"),
    );
    headers.insert(
        HeaderName::from_static("done-retried"),
        HeaderValue::from(message.retried),
    );
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(USER_AGENT_VALUE),
    );

    headers
}

impl DeliveryWorker {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::DELIVERY_TIMEOUT_SECS))
            // DNS + connect share the shorter budget
            .connect_timeout(Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self { http })
    }

    pub async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let url = message.payload.url.clone();

        let mut request = self.http.post(&url).headers(delivery_headers(message));
        if let Some(data) = &message.payload.data {
            request = request.json(data);
        }

        match request.send().await {
            Ok(response) => match response.status().as_u16() {
                status @ (200 | 201) => DeliveryOutcome::Delivered { status },
                status => DeliveryOutcome::Failed(DeliveryFailure {
                    url,
                    status: Some(status),
                    message: "invalid response status".to_owned(),
                }),
            },
            Err(e) => DeliveryOutcome::Failed(DeliveryFailure {
                url,
                status: None,
                message: e.to_string(),
            }),
        }
    }

    /// Single POST to the dead-letter callback with the original body and
    /// forward headers. Failures are the caller's to log; state never changes.
    pub async fn failure_callback(&self, message: &Message, url: &str) -> Result<(), Error> {
        let mut headers = forward_headers(message);
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT_VALUE),
        );

        let mut request = self.http.post(url).headers(headers);
        if let Some(data) = &message.payload.data {
            request = request.json(data);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::internal(eyre::eyre!(
                "failure callback returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
