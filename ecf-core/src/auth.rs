//! Seed/token authentication against the authority.
//!
//! One cycle is: fetch a seed document, sign it with the emitter's
//! credential, trade the signed seed for a bearer token. [`Authenticator`]
//! enforces the order of those steps and binds every challenge and signed
//! seed to the cycle that produced it, so an abandoned cycle can never be
//! completed later.
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use libxml::{tree::Document, xpath};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;

use crate::algorithm::SignatureProfile;
use crate::config::Config;
use crate::keys::KeyMaterial;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::transport::{AuthorityTransport, TransportError};
use crate::xmldsig::canonical::parse_document;
use crate::xmldsig::{CanonicalizationError, SignedChallenge, SigningError, XmlSigner, normalize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolState {
    #[default]
    Idle,
    SeedRequested,
    SeedSigned,
    TokenActive,
    TokenExpired,
}

impl ProtocolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolState::Idle => "idle",
            ProtocolState::SeedRequested => "seed_requested",
            ProtocolState::SeedSigned => "seed_signed",
            ProtocolState::TokenActive => "token_active",
            ProtocolState::TokenExpired => "token_expired",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("seed unavailable: {}", describe_failure(.status, .body))]
    SeedUnavailable { status: Option<u16>, body: String },
    #[error("malformed seed challenge: {0}")]
    MalformedChallenge(String),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("token exchange rejected with status {status}: {body}")]
    TokenExchangeRejected { status: u16, body: String },
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(#[source] TransportError),
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
    #[error("token expired at {expired_at}")]
    TokenExpired { expired_at: DateTime<Utc> },
    #[error("no token has been obtained yet")]
    NotAuthenticated,
    #[error("{operation} not allowed in state {state}: {reason}")]
    InvalidState {
        operation: &'static str,
        state: ProtocolState,
        reason: String,
    },
}

impl AuthError {
    /// Only seed fetch failures caused by the network, a timeout, throttling
    /// or a server-side error are worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::SeedUnavailable { status: None, .. } => true,
            AuthError::SeedUnavailable {
                status: Some(status),
                ..
            } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

fn describe_failure(status: &Option<u16>, body: &str) -> String {
    match status {
        Some(status) => format!("status {status}: {body}"),
        None => body.to_string(),
    }
}

/// A seed document as received, plus the cycle it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    raw_value: String,
    issued_at: DateTime<Utc>,
    xml: String,
    cycle: u64,
}

impl Challenge {
    /// Parses a `SemillaModel` document. `fecha` becomes the issue time when
    /// it is readable, otherwise `received_at` is used.
    pub fn parse(xml: &str, received_at: DateTime<Utc>) -> Result<Self, AuthError> {
        let doc = parse_document(xml).map_err(|e| AuthError::MalformedChallenge(e.to_string()))?;
        let ctx = xpath::Context::new(&doc).map_err(|e| {
            AuthError::MalformedChallenge(format!("XPath context error: {e:?}"))
        })?;
        let raw_value = child_text(&ctx, "valor")?
            .ok_or_else(|| AuthError::MalformedChallenge("seed carries no valor".into()))?;
        let issued_at = child_text(&ctx, "fecha")?
            .and_then(|fecha| parse_authority_timestamp(&fecha))
            .unwrap_or(received_at);
        Ok(Self {
            raw_value,
            issued_at,
            xml: xml.to_string(),
            cycle: 0,
        })
    }

    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn document(&self) -> Result<Document, CanonicalizationError> {
        parse_document(&self.xml)
    }
}

fn child_text(ctx: &xpath::Context, name: &str) -> Result<Option<String>, AuthError> {
    let path = format!("/*/*[local-name()='{name}']");
    let nodes = ctx
        .evaluate(&path)
        .map_err(|e| AuthError::MalformedChallenge(format!("XPath error for {path}: {e:?}")))?
        .get_nodes_as_vec();
    Ok(nodes
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty()))
}

/// Timestamps without an offset are Dominican Republic local time (UTC-4,
/// no daylight saving).
fn parse_authority_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let local = FixedOffset::west_opt(4 * 3600)?;
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .and_then(|naive| local.from_local_datetime(&naive).single())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Bearer token issued by the authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    value: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    expiry_from_authority: bool,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            issued_at,
            expires_at,
            expiry_from_authority: true,
        }
    }

    /// Token whose expiry is unknown; it is assumed valid for `lifetime`.
    pub fn with_fallback_lifetime(
        value: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime: chrono::Duration,
    ) -> Self {
        Self {
            value: value.into(),
            issued_at,
            expires_at: issued_at + lifetime,
            expiry_from_authority: false,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn expiry_from_authority(&self) -> bool {
        self.expiry_from_authority
    }

    /// Stale from `expires_at` onwards.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &format_args!("<{} bytes>", self.value.len()))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("expiry_from_authority", &self.expiry_from_authority)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponseBody {
    #[serde(alias = "Token", alias = "access_token")]
    token: Option<String>,
    #[serde(alias = "Expira", alias = "expires_at")]
    expira: Option<String>,
    #[serde(alias = "Expedido", alias = "issued_at")]
    expedido: Option<String>,
}

/// Reads a `validarsemilla` response: a JSON object with `token`, `expira`
/// and `expedido`, a JSON string, or the bare token text.
pub(crate) fn parse_token_response(
    body: &str,
    now: DateTime<Utc>,
    fallback_lifetime: chrono::Duration,
) -> Result<AuthToken, AuthError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(AuthError::InvalidTokenResponse("empty response body".into()));
    }

    let (value, expira, expedido) = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(_)) => {
            let parsed: TokenResponseBody = serde_json::from_str(trimmed)
                .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;
            let token = parsed
                .token
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| AuthError::InvalidTokenResponse("response has no token".into()))?;
            (token, parsed.expira, parsed.expedido)
        }
        Ok(serde_json::Value::String(token)) if !token.trim().is_empty() => (token, None, None),
        Ok(_) => {
            return Err(AuthError::InvalidTokenResponse(
                "unexpected JSON response shape".into(),
            ));
        }
        Err(_) if trimmed.starts_with('<') || trimmed.contains(char::is_whitespace) => {
            return Err(AuthError::InvalidTokenResponse(
                "response is neither JSON nor a bare token".into(),
            ));
        }
        Err(_) => (trimmed.to_string(), None, None),
    };

    let issued_at = expedido
        .as_deref()
        .and_then(parse_authority_timestamp)
        .unwrap_or(now);
    match expira.as_deref().and_then(parse_authority_timestamp) {
        Some(expires_at) => Ok(AuthToken::new(value, issued_at, expires_at)),
        None => {
            tracing::warn!(
                fallback_minutes = fallback_lifetime.num_minutes(),
                "token response has no usable expiry, assuming fallback lifetime"
            );
            Ok(AuthToken::with_fallback_lifetime(value, now, fallback_lifetime))
        }
    }
}

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default)]
struct Session {
    state: ProtocolState,
    cycle: u64,
    submitted_cycle: Option<u64>,
    token: Option<AuthToken>,
}

fn transition(session: &mut Session, next: ProtocolState) {
    if session.state != next {
        tracing::info!(
            cycle = session.cycle,
            from = %session.state,
            to = %next,
            "authentication state transition"
        );
        session.state = next;
    }
}

/// Drives the seed/token protocol for one credential.
///
/// # Examples
/// ```rust,no_run
/// use std::sync::Arc;
/// use ecf_core::auth::Authenticator;
/// use ecf_core::config::Config;
/// use ecf_core::keys::{CredentialSource, KeyMaterial};
/// use ecf_core::transport::HttpTransport;
///
/// # async fn run() -> Result<(), ecf_core::Error> {
/// let config = Config::default();
/// let keys = Arc::new(KeyMaterial::from_source(&CredentialSource::from_env()?)?);
/// let auth = Authenticator::new(HttpTransport::new(&config)?, keys, &config);
/// let token = auth.authenticate().await?;
/// println!("token valid until {}", token.expires_at());
/// # Ok(())
/// # }
/// ```
pub struct Authenticator<T, C = SystemClock> {
    transport: T,
    keys: Arc<KeyMaterial>,
    profile: SignatureProfile,
    retry: RetryPolicy,
    fallback_lifetime: chrono::Duration,
    clock: C,
    cycle_lock: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

impl<T: AuthorityTransport> Authenticator<T> {
    pub fn new(transport: T, keys: Arc<KeyMaterial>, config: &Config) -> Self {
        Self::with_clock(transport, keys, config, SystemClock)
    }
}

impl<T: AuthorityTransport, C: Clock> Authenticator<T, C> {
    pub fn with_clock(transport: T, keys: Arc<KeyMaterial>, config: &Config, clock: C) -> Self {
        Self {
            transport,
            keys,
            profile: config.signature_profile(),
            retry: config.retry_policy().clone(),
            fallback_lifetime: config.token_fallback_lifetime(),
            clock,
            cycle_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.session.lock().state
    }

    pub fn keys(&self) -> &Arc<KeyMaterial> {
        &self.keys
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Starts a new cycle and fetches its seed. Any cycle still in flight is
    /// abandoned; its challenge and signed seed stop being accepted.
    pub async fn request_seed(&self) -> Result<Challenge, AuthError> {
        let cycle = {
            let mut session = self.session.lock();
            session.cycle += 1;
            session.submitted_cycle = None;
            transition(&mut session, ProtocolState::SeedRequested);
            session.cycle
        };

        let outcome = self.fetch_challenge(cycle).await;
        let now = self.clock.now();
        let mut session = self.session.lock();
        if session.cycle != cycle {
            return Err(AuthError::InvalidState {
                operation: "request_seed",
                state: session.state,
                reason: "cycle was superseded while the seed was in flight".into(),
            });
        }
        if let Err(err) = &outcome {
            tracing::warn!(cycle, error = %err, "seed request failed");
            settle_failed_cycle(&mut session, now);
        }
        outcome
    }

    async fn fetch_challenge(&self, cycle: u64) -> Result<Challenge, AuthError> {
        let response = self
            .transport
            .fetch_seed()
            .await
            .map_err(|e| AuthError::SeedUnavailable {
                status: None,
                body: e.to_string(),
            })?;
        if !response.is_success() {
            return Err(AuthError::SeedUnavailable {
                status: Some(response.status),
                body: response.body,
            });
        }
        let mut challenge = Challenge::parse(&response.body, self.clock.now())?;
        challenge.cycle = cycle;
        tracing::debug!(cycle, issued_at = %challenge.issued_at, "received seed challenge");
        Ok(challenge)
    }

    /// Signs the challenge of the current cycle. Failures end the cycle and
    /// are not retried.
    pub fn sign_seed(&self, challenge: &Challenge) -> Result<SignedChallenge, AuthError> {
        self.ensure_current("sign_seed", ProtocolState::SeedRequested, challenge.cycle)?;

        let outcome = self.sign_challenge(challenge);
        let now = self.clock.now();
        let mut session = self.session.lock();
        if session.cycle != challenge.cycle {
            return Err(AuthError::InvalidState {
                operation: "sign_seed",
                state: session.state,
                reason: "cycle was superseded while signing".into(),
            });
        }
        match outcome {
            Ok(signed) => {
                transition(&mut session, ProtocolState::SeedSigned);
                Ok(signed)
            }
            Err(err) => {
                tracing::warn!(cycle = challenge.cycle, error = %err, "seed signing failed");
                settle_failed_cycle(&mut session, now);
                Err(err)
            }
        }
    }

    fn sign_challenge(&self, challenge: &Challenge) -> Result<SignedChallenge, AuthError> {
        let doc = challenge
            .document()
            .map_err(|e| AuthError::MalformedChallenge(e.to_string()))?;
        let signed = XmlSigner::new(&self.keys, self.profile).sign(&doc)?;
        let mut signed = normalize(signed).map_err(SigningError::from)?;
        signed.cycle = Some(challenge.cycle);
        Ok(signed)
    }

    /// Trades the signed seed of the current cycle for a token. A signed seed
    /// is submitted at most once.
    pub async fn exchange_token(&self, signed: &SignedChallenge) -> Result<AuthToken, AuthError> {
        let cycle = {
            let mut session = self.session.lock();
            let Some(cycle) = signed.cycle else {
                return Err(AuthError::InvalidState {
                    operation: "exchange_token",
                    state: session.state,
                    reason: "document was not produced by sign_seed".into(),
                });
            };
            check_current(&session, "exchange_token", ProtocolState::SeedSigned, cycle)?;
            if session.submitted_cycle == Some(cycle) {
                return Err(AuthError::InvalidState {
                    operation: "exchange_token",
                    state: session.state,
                    reason: "signed seed was already submitted".into(),
                });
            }
            session.submitted_cycle = Some(cycle);
            cycle
        };

        let outcome = self.validate(signed).await;
        let now = self.clock.now();
        let mut session = self.session.lock();
        if session.cycle != cycle {
            match &outcome {
                Ok(_) => tracing::warn!(cycle, "discarding token from a superseded cycle"),
                Err(err) => tracing::warn!(cycle, error = %err, "token exchange failed"),
            }
            return Err(AuthError::InvalidState {
                operation: "exchange_token",
                state: session.state,
                reason: "cycle was superseded while the token exchange was in flight".into(),
            });
        }
        match outcome {
            Ok(token) => {
                session.token = Some(token.clone());
                transition(&mut session, ProtocolState::TokenActive);
                tracing::info!(
                    cycle,
                    expires_at = %token.expires_at(),
                    expiry_from_authority = token.expiry_from_authority(),
                    "obtained bearer token"
                );
                Ok(token)
            }
            Err(err) => {
                tracing::warn!(cycle, error = %err, "token exchange failed");
                settle_failed_cycle(&mut session, now);
                Err(err)
            }
        }
    }

    async fn validate(&self, signed: &SignedChallenge) -> Result<AuthToken, AuthError> {
        let response = self
            .transport
            .validate_seed(signed.as_bytes())
            .await
            .map_err(AuthError::TokenExchangeFailed)?;
        if !response.is_success() {
            return Err(AuthError::TokenExchangeRejected {
                status: response.status,
                body: response.body,
            });
        }
        parse_token_response(&response.body, self.clock.now(), self.fallback_lifetime)
    }

    /// The held token while `now < expires_at`.
    pub fn current_token(&self) -> Result<AuthToken, AuthError> {
        let now = self.clock.now();
        let mut session = self.session.lock();
        let Some(token) = session.token.clone() else {
            return Err(AuthError::NotAuthenticated);
        };
        if token.is_valid_at(now) {
            return Ok(token);
        }
        if session.state == ProtocolState::TokenActive {
            transition(&mut session, ProtocolState::TokenExpired);
        }
        Err(AuthError::TokenExpired {
            expired_at: token.expires_at(),
        })
    }

    /// Returns a valid token, running a full cycle when none is held.
    /// Concurrent callers share a single cycle.
    pub async fn authenticate(&self) -> Result<AuthToken, AuthError> {
        if let Ok(token) = self.current_token() {
            return Ok(token);
        }
        let _cycle = self.cycle_lock.lock().await;
        if let Ok(token) = self.current_token() {
            return Ok(token);
        }

        let challenge =
            retry_with_backoff(&self.retry, || self.request_seed(), AuthError::is_retryable)
                .await?;
        let signed = self.sign_seed(&challenge)?;
        self.exchange_token(&signed).await
    }

    /// Installs a token obtained out of band. Any cycle in flight is
    /// abandoned.
    pub fn import_token(&self, token: AuthToken) {
        let now = self.clock.now();
        let mut session = self.session.lock();
        session.cycle += 1;
        session.submitted_cycle = None;
        let next = if token.is_valid_at(now) {
            ProtocolState::TokenActive
        } else {
            ProtocolState::TokenExpired
        };
        session.token = Some(token);
        transition(&mut session, next);
    }

    fn ensure_current(
        &self,
        operation: &'static str,
        expected: ProtocolState,
        cycle: u64,
    ) -> Result<(), AuthError> {
        check_current(&self.session.lock(), operation, expected, cycle)
    }
}

/// A failed cycle falls back to the token still held, if it is valid.
fn settle_failed_cycle(session: &mut Session, now: DateTime<Utc>) {
    let next = match &session.token {
        Some(token) if token.is_valid_at(now) => ProtocolState::TokenActive,
        _ => ProtocolState::Idle,
    };
    transition(session, next);
}

fn check_current(
    session: &Session,
    operation: &'static str,
    expected: ProtocolState,
    cycle: u64,
) -> Result<(), AuthError> {
    if session.state != expected {
        return Err(AuthError::InvalidState {
            operation,
            state: session.state,
            reason: format!("expected {expected}"),
        });
    }
    if session.cycle != cycle {
        return Err(AuthError::InvalidState {
            operation,
            state: session.state,
            reason: "input belongs to an abandoned cycle".into(),
        });
    }
    Ok(())
}
