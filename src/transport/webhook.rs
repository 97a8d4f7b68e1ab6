//! Webhook sink
//!
//! Posts the serialized message to the endpoint's URL with the endpoint's
//! timeout as the deadline. Only a 2xx status counts as delivered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::utils::error::{BrokerError, Result, TransportError};

#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: String,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    /// `default_timeout` bounds calls that do not set their own deadline.
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| BrokerError::Transport(TransportError::Http(e.to_string())))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(
        &self,
        url: &str,
        body: String,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}
