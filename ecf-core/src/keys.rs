//! Signing credentials.
//!
//! A [`KeyMaterial`] pairs an RSA private key with the X.509 certificate that
//! vouches for it. The key itself never leaves this module: callers get an
//! opaque [`SigningHandle`] that can produce signatures and nothing else.
use base64ct::{Base64, Encoding};
use openssl::{error::ErrorStack, pkcs12::Pkcs12, provider::Provider};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
};
use serde::Serialize;
use std::{fmt, path::PathBuf, sync::OnceLock};
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem, Encode, EncodePem, pem::LineEnding},
};
use zeroize::Zeroizing;

pub const CERT_B64_ENV: &str = "ECF_CERT_B64";
pub const CERT_PATH_ENV: &str = "ECF_CERT_PATH";
pub const CERT_PASS_ENV: &str = "ECF_CERT_PASS";
pub const KEY_PEM_PATH_ENV: &str = "ECF_KEY_PEM_PATH";
pub const CERT_PEM_PATH_ENV: &str = "ECF_CERT_PEM_PATH";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("signing credential not configured: {0}")]
    MissingSecret(String),
    #[error("invalid certificate bundle: {0}")]
    InvalidBundle(String),
    #[error("wrong passphrase for certificate bundle")]
    WrongPassphrase,
    #[error("private key does not match the certificate public key")]
    KeyCertMismatch,
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("failed to read credential file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque handle over the private key. It signs prehashed data and exposes
/// nothing else.
pub struct SigningHandle {
    key: RsaPrivateKey,
}

impl SigningHandle {
    pub(crate) fn sign_prehashed(
        &self,
        padding: Pkcs1v15Sign,
        hashed: &[u8],
    ) -> Result<Vec<u8>, rsa::Error> {
        self.key.sign(padding, hashed)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.key)
    }
}

impl fmt::Debug for SigningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningHandle").finish_non_exhaustive()
    }
}

/// Private key plus matching certificate.
///
/// # Examples
/// ```rust,no_run
/// use ecf_core::keys::KeyMaterial;
///
/// let bundle = std::fs::read("emisor.p12")?;
/// let keys = KeyMaterial::from_pkcs12(&bundle, "passphrase")?;
/// println!("signing as {}", keys.subject());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct KeyMaterial {
    signer: SigningHandle,
    certificate: Certificate,
    certificate_der: Vec<u8>,
}

impl KeyMaterial {
    /// Loads a PKCS#12 bundle. A passphrase that fails the bundle MAC yields
    /// [`KeyError::WrongPassphrase`]; anything else unreadable is
    /// [`KeyError::InvalidBundle`].
    pub fn from_pkcs12(bundle: &[u8], passphrase: &str) -> Result<Self, KeyError> {
        ensure_legacy_provider();
        let pkcs12 = Pkcs12::from_der(bundle)
            .map_err(|e| KeyError::InvalidBundle(openssl_reason(&e)))?;
        let parsed = pkcs12.parse2(passphrase).map_err(classify_pkcs12_error)?;
        let pkey = parsed
            .pkey
            .ok_or_else(|| KeyError::InvalidBundle("bundle carries no private key".into()))?;
        let cert = parsed
            .cert
            .ok_or_else(|| KeyError::InvalidBundle("bundle carries no certificate".into()))?;

        let key_der = Zeroizing::new(
            pkey.private_key_to_pkcs8()
                .map_err(|e| KeyError::InvalidKey(openssl_reason(&e)))?,
        );
        let cert_der = cert
            .to_der()
            .map_err(|e| KeyError::InvalidCertificate(openssl_reason(&e)))?;
        Self::from_der(&key_der, &cert_der)
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`)
    /// keys. Encrypted PEM keys are rejected.
    pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self, KeyError> {
        let key = if key_pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
            return Err(KeyError::InvalidKey(
                "encrypted PEM keys are not supported, use a PKCS#12 bundle".into(),
            ));
        } else if key_pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(key_pem)
                .map_err(|e| KeyError::InvalidKey(format!("PKCS#1 parse error: {e}")))?
        } else {
            RsaPrivateKey::from_pkcs8_pem(key_pem)
                .map_err(|e| KeyError::InvalidKey(format!("PKCS#8 parse error: {e}")))?
        };
        let certificate = Certificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| KeyError::InvalidCertificate(format!("PEM parse error: {e}")))?;
        Self::assemble(key, certificate)
    }

    pub fn from_der(key_der: &[u8], cert_der: &[u8]) -> Result<Self, KeyError> {
        let key = match RsaPrivateKey::from_pkcs8_der(key_der) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs1_der(key_der)
                .map_err(|e| KeyError::InvalidKey(format!("DER parse error: {e}")))?,
        };
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| KeyError::InvalidCertificate(format!("DER parse error: {e}")))?;
        Self::assemble(key, certificate)
    }

    pub fn from_source(source: &CredentialSource) -> Result<Self, KeyError> {
        match source {
            CredentialSource::Pkcs12Base64 {
                bundle_b64,
                passphrase,
            } => {
                let compact: String = bundle_b64.split_whitespace().collect();
                let bundle = Zeroizing::new(
                    Base64::decode_vec(&compact)
                        .map_err(|_| KeyError::InvalidBundle("bundle is not valid base64".into()))?,
                );
                Self::from_pkcs12(&bundle, passphrase)
            }
            CredentialSource::Pkcs12File { path, passphrase } => {
                let bundle = Zeroizing::new(read_file(path)?);
                Self::from_pkcs12(&bundle, passphrase)
            }
            CredentialSource::PemFiles {
                key_path,
                cert_path,
            } => {
                let key_pem = Zeroizing::new(read_text_file(key_path)?);
                let cert_pem = read_text_file(cert_path)?;
                Self::from_pem(&key_pem, &cert_pem)
            }
        }
    }

    fn assemble(key: RsaPrivateKey, certificate: Certificate) -> Result<Self, KeyError> {
        let certificate_der = certificate
            .to_der()
            .map_err(|e| KeyError::InvalidCertificate(format!("DER encoding error: {e}")))?;
        let cert_public = public_key_from_certificate(&certificate)?;
        if RsaPublicKey::from(&key) != cert_public {
            return Err(KeyError::KeyCertMismatch);
        }
        tracing::debug!(
            subject = %certificate.tbs_certificate.subject,
            "loaded signing credential"
        );
        Ok(Self {
            signer: SigningHandle { key },
            certificate,
            certificate_der,
        })
    }

    pub(crate) fn signer(&self) -> &SigningHandle {
        &self.signer
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.signer.public_key()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// DER certificate, base64 encoded, as embedded in `X509Certificate`.
    pub fn certificate_base64(&self) -> String {
        Base64::encode_string(&self.certificate_der)
    }

    pub fn certificate_pem(&self) -> Result<String, KeyError> {
        self.certificate
            .to_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidCertificate(format!("PEM encoding error: {e}")))
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.certificate.tbs_certificate.issuer.to_string()
    }

    /// Certificate serial number in decimal.
    pub fn serial_number(&self) -> String {
        serial_bytes_to_decimal_string(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    pub fn not_after(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::<chrono::Utc>::from(
            self.certificate
                .tbs_certificate
                .validity
                .not_after
                .to_system_time(),
        )
    }
}

pub(crate) fn public_key_from_certificate(cert: &Certificate) -> Result<RsaPublicKey, KeyError> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| KeyError::InvalidCertificate(format!("public key encoding error: {e}")))?;
    RsaPublicKey::from_public_key_der(&spki).map_err(|e| {
        KeyError::InvalidCertificate(format!("certificate does not carry an RSA key: {e}"))
    })
}

pub(crate) fn public_key_from_certificate_der(der: &[u8]) -> Result<RsaPublicKey, KeyError> {
    let cert = Certificate::from_der(der)
        .map_err(|e| KeyError::InvalidCertificate(format!("DER parse error: {e}")))?;
    public_key_from_certificate(&cert)
}

/// Bundles exported by older tooling use RC2 or 3DES, which OpenSSL 3 only
/// decrypts with the legacy provider loaded. The provider stays loaded for
/// the life of the process.
fn ensure_legacy_provider() {
    static LEGACY: OnceLock<Option<Provider>> = OnceLock::new();
    LEGACY.get_or_init(|| match Provider::try_load(None, "legacy", true) {
        Ok(provider) => Some(provider),
        Err(err) => {
            tracing::warn!(
                reason = %openssl_reason(&err),
                "OpenSSL legacy provider unavailable"
            );
            None
        }
    });
}

fn classify_pkcs12_error(err: ErrorStack) -> KeyError {
    let has_reason = |needle: &str| {
        err.errors()
            .iter()
            .any(|e| e.reason().is_some_and(|reason| reason.contains(needle)))
    };
    if has_reason("mac verify failure") {
        KeyError::WrongPassphrase
    } else if has_reason("unsupported") {
        KeyError::InvalidBundle(
            "bundle is encrypted with a legacy cipher (RC2/3DES) and the OpenSSL legacy provider could not be loaded"
                .into(),
        )
    } else {
        KeyError::InvalidBundle(openssl_reason(&err))
    }
}

fn openssl_reason(err: &ErrorStack) -> String {
    let reasons: Vec<&str> = err.errors().iter().filter_map(|e| e.reason()).collect();
    if reasons.is_empty() {
        "unreadable input".to_string()
    } else {
        reasons.join("; ")
    }
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, KeyError> {
    std::fs::read(path).map_err(|source| KeyError::Io {
        path: path.clone(),
        source,
    })
}

fn read_text_file(path: &PathBuf) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.clone(),
        source,
    })
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            let value = u32::from(*digit) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

/// Where the signing credential comes from. Secrets are wiped on drop and
/// never printed by `Debug`.
pub enum CredentialSource {
    /// Base64 PKCS#12 bundle, typically from `ECF_CERT_B64`.
    Pkcs12Base64 {
        bundle_b64: Zeroizing<String>,
        passphrase: Zeroizing<String>,
    },
    Pkcs12File {
        path: PathBuf,
        passphrase: Zeroizing<String>,
    },
    PemFiles {
        key_path: PathBuf,
        cert_path: PathBuf,
    },
}

impl CredentialSource {
    /// Resolves the credential from the process environment. Precedence:
    /// `ECF_CERT_B64`, then `ECF_CERT_PATH`, then the PEM pair.
    pub fn from_env() -> Result<Self, KeyError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, KeyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let passphrase = || {
            get(CERT_PASS_ENV)
                .map(Zeroizing::new)
                .ok_or_else(|| KeyError::MissingSecret(format!("{CERT_PASS_ENV} is not set")))
        };

        if let Some(bundle_b64) = get(CERT_B64_ENV) {
            return Ok(CredentialSource::Pkcs12Base64 {
                bundle_b64: Zeroizing::new(bundle_b64),
                passphrase: passphrase()?,
            });
        }
        if let Some(path) = get(CERT_PATH_ENV) {
            return Ok(CredentialSource::Pkcs12File {
                path: PathBuf::from(path),
                passphrase: passphrase()?,
            });
        }
        match (get(KEY_PEM_PATH_ENV), get(CERT_PEM_PATH_ENV)) {
            (Some(key_path), Some(cert_path)) => Ok(CredentialSource::PemFiles {
                key_path: PathBuf::from(key_path),
                cert_path: PathBuf::from(cert_path),
            }),
            (Some(_), None) => Err(KeyError::MissingSecret(format!(
                "{KEY_PEM_PATH_ENV} is set but {CERT_PEM_PATH_ENV} is not"
            ))),
            (None, Some(_)) => Err(KeyError::MissingSecret(format!(
                "{CERT_PEM_PATH_ENV} is set but {KEY_PEM_PATH_ENV} is not"
            ))),
            (None, None) => Err(KeyError::MissingSecret(format!(
                "set {CERT_B64_ENV} or {CERT_PATH_ENV} (with {CERT_PASS_ENV}), \
                 or {KEY_PEM_PATH_ENV} and {CERT_PEM_PATH_ENV}"
            ))),
        }
    }

    /// Reports which credential variables are set in the process environment,
    /// without reading their values into the report.
    pub fn describe() -> CredentialStatus {
        CredentialStatus::from_env()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Pkcs12Base64 { .. } => "pkcs12-base64",
            CredentialSource::Pkcs12File { .. } => "pkcs12-file",
            CredentialSource::PemFiles { .. } => "pem-files",
        }
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Pkcs12Base64 { .. } => f
                .debug_struct("Pkcs12Base64")
                .field("bundle_b64", &"<redacted>")
                .field("passphrase", &"<redacted>")
                .finish(),
            CredentialSource::Pkcs12File { path, .. } => f
                .debug_struct("Pkcs12File")
                .field("path", path)
                .field("passphrase", &"<redacted>")
                .finish(),
            CredentialSource::PemFiles {
                key_path,
                cert_path,
            } => f
                .debug_struct("PemFiles")
                .field("key_path", key_path)
                .field("cert_path", cert_path)
                .finish(),
        }
    }
}

/// Which credential inputs are present, without their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub cert_b64: bool,
    pub cert_path: bool,
    pub cert_pass: bool,
    pub key_pem_path: bool,
    pub cert_pem_path: bool,
}

impl CredentialStatus {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).is_some_and(|value| !value.trim().is_empty());
        Self {
            cert_b64: present(CERT_B64_ENV),
            cert_path: present(CERT_PATH_ENV),
            cert_pass: present(CERT_PASS_ENV),
            key_pem_path: present(KEY_PEM_PATH_ENV),
            cert_pem_path: present(CERT_PEM_PATH_ENV),
        }
    }

    pub fn is_usable(&self) -> bool {
        ((self.cert_b64 || self.cert_path) && self.cert_pass)
            || (self.key_pem_path && self.cert_pem_path)
    }
}
