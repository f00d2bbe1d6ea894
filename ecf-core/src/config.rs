//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

use crate::algorithm::SignatureProfile;
use crate::retry::RetryPolicy;

/// Environment variable that overrides the authority base URL (tests, proxies).
pub const BASE_URL_ENV: &str = "ECF_DGII_BASE_URL";

/// DGII environment selection for authority endpoints.
/// - Test: the pre-certification sandbox (`testecf`).
/// - Certification: the certification track every emitter has to pass (`certecf`).
/// - Production: the live reception service (`ecf`).
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use ecf_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("certecf")?;
/// assert_eq!(env, EnvironmentType::Certification);
/// # Ok::<(), ecf_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    Test,
    Certification,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "test" | "testecf" => Ok(EnvironmentType::Test),
            "certification" | "certecf" => Ok(EnvironmentType::Certification),
            "production" | "ecf" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    /// Path segment the authority uses for this environment.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "testecf",
            EnvironmentType::Certification => "certecf",
            EnvironmentType::Production => "ecf",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://ecf.dgii.gov.do/testecf/",
            EnvironmentType::Certification => "https://ecf.dgii.gov.do/certecf/",
            EnvironmentType::Production => "https://ecf.dgii.gov.do/ecf/",
        }
    }
}

/// Base of the seed authentication service below an environment root such as
/// [`EnvironmentType::endpoint_url`]. `root` must end in `/`.
pub fn auth_base_url(root: &str) -> String {
    format!("{root}autenticacion/api/autenticacion/")
}

pub fn reception_base_url(root: &str) -> String {
    format!("{root}recepcion/api/")
}

/// Authority endpoints addressed by this crate, relative to an environment URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Seed,
    ValidateSeed,
    Reception,
}

impl Endpoint {
    /// Resource name below the service base.
    pub fn resource(&self) -> &'static str {
        match self {
            Endpoint::Seed => "semilla",
            Endpoint::ValidateSeed => "validarsemilla",
            Endpoint::Reception => "facturaselectronicas",
        }
    }

    /// Full URL of this endpoint below an environment root ending in `/`.
    pub fn url(&self, root: &str) -> String {
        let base = match self {
            Endpoint::Seed | Endpoint::ValidateSeed => auth_base_url(root),
            Endpoint::Reception => reception_base_url(root),
        };
        format!("{base}{}", self.resource())
    }

    /// Algorithms the authority accepts for documents sent to this endpoint.
    /// Seed validation and reception both require RSA-SHA256 with SHA-256
    /// references.
    pub fn signature_profile(&self) -> SignatureProfile {
        match self {
            Endpoint::Seed | Endpoint::ValidateSeed | Endpoint::Reception => {
                SignatureProfile::rsa_sha256()
            }
        }
    }
}

/// How the signed seed is carried in the `validarsemilla` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationBodyFormat {
    /// `multipart/form-data` with the document in a `xml` file field.
    Multipart,
    /// The document itself with `Content-Type: application/xml`.
    RawXml,
}

/// Configuration for the authority transport and the authentication cycle.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use ecf_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test).with_timeout(Duration::from_secs(5));
/// assert_eq!(config.timeout(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    timeout: Duration,
    token_fallback_lifetime: chrono::Duration,
    retry: RetryPolicy,
    validation_body: ValidationBodyFormat,
    signature_profile: SignatureProfile,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lifetime assumed for tokens whose response carries no usable expiry.
    pub fn with_token_fallback_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.token_fallback_lifetime = lifetime;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_validation_body(mut self, format: ValidationBodyFormat) -> Self {
        self.validation_body = format;
        self
    }

    pub fn with_signature_profile(mut self, profile: SignatureProfile) -> Self {
        self.signature_profile = profile;
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn token_fallback_lifetime(&self) -> chrono::Duration {
        self.token_fallback_lifetime
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn validation_body(&self) -> ValidationBodyFormat {
        self.validation_body
    }

    pub fn signature_profile(&self) -> SignatureProfile {
        self.signature_profile
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: EnvironmentType::Test,
            timeout: Duration::from_secs(10),
            token_fallback_lifetime: chrono::Duration::minutes(30),
            retry: RetryPolicy::default(),
            validation_body: ValidationBodyFormat::Multipart,
            signature_profile: Endpoint::ValidateSeed.signature_profile(),
        }
    }
}
