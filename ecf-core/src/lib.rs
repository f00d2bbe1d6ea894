//! Rust toolkit for DGII e-CF: seed authentication, enveloped XML-DSig
//! signing, bearer token lifecycle and payload integrity.
//!
//! # Examples
//! ```rust
//! use ecf_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Certification);
//! # let _ = config;
//! ```
pub mod algorithm;
pub mod auth;
pub mod config;
pub mod integrity;
pub mod keys;
pub mod retry;
pub mod submission;
pub mod transport;
pub mod xmldsig;

use thiserror::Error;

pub use auth::Authenticator;
pub use integrity::compute_digest;
pub use xmldsig::sign_document;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Environment(#[from] config::EnvironmentParseError),
    #[error(transparent)]
    Key(#[from] keys::KeyError),
    #[error(transparent)]
    Signing(#[from] xmldsig::SigningError),
    #[error(transparent)]
    Normalization(#[from] xmldsig::NormalizationError),
    #[error(transparent)]
    Verify(#[from] xmldsig::VerifyError),
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
    #[error(transparent)]
    Integrity(#[from] integrity::IntegrityError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Submission(#[from] submission::SubmissionError),
}

/// Coarse classification of an [`Error`] for callers that only need to decide
/// how to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Cryptographic,
    State,
}

impl ErrorKind {
    pub fn client_message(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "signing credentials or settings are missing or invalid",
            ErrorKind::Transport => "the tax authority could not be reached",
            ErrorKind::Protocol => "the tax authority rejected the request",
            ErrorKind::Cryptographic => "the document could not be signed or verified",
            ErrorKind::State => "the authentication session is not ready for this operation",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Environment(_) => ErrorKind::Configuration,
            Error::Key(err) => key_kind(err),
            Error::Signing(_) | Error::Normalization(_) | Error::Verify(_) => {
                ErrorKind::Cryptographic
            }
            Error::Auth(err) => auth_kind(err),
            Error::Integrity(_) => ErrorKind::Protocol,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Submission(err) => match err {
                submission::SubmissionError::Auth(err) => auth_kind(err),
                submission::SubmissionError::Integrity(_)
                | submission::SubmissionError::Rejected { .. } => ErrorKind::Protocol,
                submission::SubmissionError::Transport(_) => ErrorKind::Transport,
            },
        }
    }

    /// True only for seed fetch failures worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Auth(err) | Error::Submission(submission::SubmissionError::Auth(err)) => {
                err.is_retryable()
            }
            _ => false,
        }
    }
}

fn key_kind(err: &keys::KeyError) -> ErrorKind {
    match err {
        keys::KeyError::KeyCertMismatch => ErrorKind::Cryptographic,
        _ => ErrorKind::Configuration,
    }
}

fn auth_kind(err: &auth::AuthError) -> ErrorKind {
    use auth::AuthError;
    match err {
        AuthError::SeedUnavailable { status: None, .. } | AuthError::TokenExchangeFailed(_) => {
            ErrorKind::Transport
        }
        AuthError::SeedUnavailable { .. }
        | AuthError::MalformedChallenge(_)
        | AuthError::TokenExchangeRejected { .. }
        | AuthError::InvalidTokenResponse(_) => ErrorKind::Protocol,
        AuthError::Signing(_) => ErrorKind::Cryptographic,
        AuthError::TokenExpired { .. }
        | AuthError::NotAuthenticated
        | AuthError::InvalidState { .. } => ErrorKind::State,
    }
}
