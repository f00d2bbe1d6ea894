//! Digest and signature algorithm identifiers shared by the signer, the
//! verifier and the payload integrity layer.
use rsa::Pkcs1v15Sign;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digest algorithms accepted for references and payload integrity.
///
/// SHA-1 is deliberately absent: the authority rejects it for `validarsemilla`
/// and for invoice reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri.trim())
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// RSA PKCS#1 v1.5 signature algorithms over the SHA-2 family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::RsaSha384,
            SignatureAlgorithm::RsaSha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri.trim())
    }

    pub fn hash_algorithm(&self) -> DigestAlgorithm {
        match self {
            SignatureAlgorithm::RsaSha256 => DigestAlgorithm::Sha256,
            SignatureAlgorithm::RsaSha384 => DigestAlgorithm::Sha384,
            SignatureAlgorithm::RsaSha512 => DigestAlgorithm::Sha512,
        }
    }

    pub(crate) fn padding(&self) -> Pkcs1v15Sign {
        match self {
            SignatureAlgorithm::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
            SignatureAlgorithm::RsaSha384 => Pkcs1v15Sign::new::<Sha384>(),
            SignatureAlgorithm::RsaSha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Algorithm pair used for one enveloped signature.
///
/// # Examples
/// ```rust
/// use ecf_core::algorithm::{DigestAlgorithm, SignatureProfile};
///
/// let profile = SignatureProfile::default();
/// assert_eq!(profile.digest, DigestAlgorithm::Sha256);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureProfile {
    pub digest: DigestAlgorithm,
    pub signature: SignatureAlgorithm,
}

impl SignatureProfile {
    pub const fn new(digest: DigestAlgorithm, signature: SignatureAlgorithm) -> Self {
        Self { digest, signature }
    }

    /// RSA-SHA256 over a SHA-256 reference digest.
    pub const fn rsa_sha256() -> Self {
        Self::new(DigestAlgorithm::Sha256, SignatureAlgorithm::RsaSha256)
    }
}

impl Default for SignatureProfile {
    fn default() -> Self {
        Self::rsa_sha256()
    }
}
