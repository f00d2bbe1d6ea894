//! HTTP transport to the DGII authority.
//!
//! The transport moves bytes and reports status codes. Deciding what a status
//! means for the authentication cycle is left to [`crate::auth`].
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use std::time::Duration;
use thiserror::Error;

use crate::config::{BASE_URL_ENV, Config, Endpoint, ValidationBodyFormat};
use crate::integrity::SubmissionPayload;

/// File name the signed seed is uploaded under in multipart mode.
pub const SIGNED_SEED_FILE_NAME: &str = "semilla_firmada.xml";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Status and body of an authority response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The authority operations the authentication cycle and invoice submission
/// need. [`HttpTransport`] is the production implementation; tests substitute
/// scripted ones.
pub trait AuthorityTransport: Send + Sync {
    fn fetch_seed(&self) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;

    fn validate_seed(
        &self,
        signed_xml: &[u8],
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;

    fn submit_invoice(
        &self,
        bearer_token: &str,
        payload: &SubmissionPayload,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// reqwest-backed authority client.
///
/// # Examples
/// ```rust,no_run
/// use ecf_core::config::Config;
/// use ecf_core::transport::HttpTransport;
///
/// let transport = HttpTransport::new(&Config::default())?;
/// # let _ = transport;
/// # Ok::<(), ecf_core::transport::TransportError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
    validation_body: ValidationBodyFormat,
}

impl HttpTransport {
    /// Uses the environment URL from `config` unless `ECF_DGII_BASE_URL` is set.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let base_url = std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| config.env().endpoint_url().to_string());
        Self::with_base_url(config, base_url)
    }

    pub fn with_base_url(
        config: &Config,
        base_url: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        let base_url = base_url.into();
        let base_url = if base_url.ends_with('/') {
            base_url
        } else {
            format!("{base_url}/")
        };
        Ok(Self {
            client,
            base_url,
            timeout: config.timeout(),
            validation_body: config.validation_body(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_endpoint(&self, endpoint: Endpoint) -> String {
        endpoint.url(&self.base_url)
    }

    async fn send(
        &self,
        endpoint: Endpoint,
        request: reqwest::RequestBuilder,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.build_endpoint(endpoint);
        let response = request.send().await.map_err(|e| self.map_send_error(&url, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;
        tracing::debug!(endpoint = %url, status, "authority responded");
        Ok(TransportResponse { status, body })
    }

    fn map_send_error(&self, endpoint: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.timeout,
            }
        } else {
            TransportError::Network {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl AuthorityTransport for HttpTransport {
    async fn fetch_seed(&self) -> Result<TransportResponse, TransportError> {
        let request = self
            .client
            .get(self.build_endpoint(Endpoint::Seed))
            .header("Accept", "application/xml, text/xml");
        self.send(Endpoint::Seed, request).await
    }

    async fn validate_seed(&self, signed_xml: &[u8]) -> Result<TransportResponse, TransportError> {
        let request = self
            .client
            .post(self.build_endpoint(Endpoint::ValidateSeed))
            .header("Accept", "application/json");
        let request = match self.validation_body {
            ValidationBodyFormat::Multipart => {
                let part = Part::bytes(signed_xml.to_vec())
                    .file_name(SIGNED_SEED_FILE_NAME)
                    .mime_str("text/xml")?;
                request.multipart(Form::new().part("xml", part))
            }
            ValidationBodyFormat::RawXml => request
                .header("Content-Type", "application/xml")
                .body(signed_xml.to_vec()),
        };
        self.send(Endpoint::ValidateSeed, request).await
    }

    async fn submit_invoice(
        &self,
        bearer_token: &str,
        payload: &SubmissionPayload,
    ) -> Result<TransportResponse, TransportError> {
        let request = self
            .client
            .post(self.build_endpoint(Endpoint::Reception))
            .header("Accept", "application/json")
            .bearer_auth(bearer_token)
            .json(payload);
        self.send(Endpoint::Reception, request).await
    }
}
