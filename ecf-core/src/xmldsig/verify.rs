use base64ct::{Base64, Encoding};
use libxml::{tree::Document, xpath};
use thiserror::Error;

use super::canonical::{
    CanonicalizationError, canonicalize_signed_info, canonicalize_without_signature, first_node,
    parse_document, signature_context,
};
use super::constants::{
    C14N_ALGORITHM, DIGEST_VALUE_XPATH, SIGNATURE_VALUE_XPATH, SIGNATURE_XPATH,
    X509_CERTIFICATE_XPATH,
};
use crate::algorithm::{DigestAlgorithm, SignatureAlgorithm, SignatureProfile};
use crate::keys::{KeyError, public_key_from_certificate_der};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
    #[error("document carries no enveloped Signature")]
    MissingSignature,
    #[error("signature is missing {0}")]
    MissingElement(&'static str),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("reference must point at the whole document, found URI '{0}'")]
    UnsupportedReference(String),
    #[error("{0} is not valid base64")]
    InvalidEncoding(&'static str),
    #[error("reference digest mismatch: document says {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("embedded certificate is unusable: {0}")]
    Certificate(#[from] KeyError),
    #[error("signature value does not verify against the embedded certificate")]
    BadSignature,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    profile: SignatureProfile,
    digest_value: String,
    certificate_der: Vec<u8>,
}

impl VerifiedSignature {
    pub fn profile(&self) -> SignatureProfile {
        self.profile
    }

    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }
}

/// Checks the enveloped signature of `xml` against the certificate embedded in
/// its `KeyInfo`: reference digest first, then the RSA signature over the
/// canonical `SignedInfo`.
pub fn verify(xml: &str) -> Result<VerifiedSignature, VerifyError> {
    let doc = parse_document(xml)?;
    verify_document(&doc)
}

pub fn verify_document(doc: &Document) -> Result<VerifiedSignature, VerifyError> {
    let ctx = signature_context(doc)?;
    if first_node(&ctx, SIGNATURE_XPATH)?.is_none() {
        return Err(VerifyError::MissingSignature);
    }

    let c14n_method = attribute(
        &ctx,
        "/*/ds:Signature/ds:SignedInfo/ds:CanonicalizationMethod",
        "Algorithm",
        "CanonicalizationMethod",
    )?;
    if c14n_method.trim() != C14N_ALGORITHM {
        return Err(VerifyError::UnsupportedAlgorithm(c14n_method));
    }
    let signature_uri = attribute(
        &ctx,
        "/*/ds:Signature/ds:SignedInfo/ds:SignatureMethod",
        "Algorithm",
        "SignatureMethod",
    )?;
    let signature = SignatureAlgorithm::from_uri(&signature_uri)
        .ok_or(VerifyError::UnsupportedAlgorithm(signature_uri))?;
    let digest_uri = attribute(
        &ctx,
        "/*/ds:Signature/ds:SignedInfo/ds:Reference/ds:DigestMethod",
        "Algorithm",
        "DigestMethod",
    )?;
    let digest = DigestAlgorithm::from_uri(&digest_uri)
        .ok_or(VerifyError::UnsupportedAlgorithm(digest_uri))?;
    let reference_uri = attribute(
        &ctx,
        "/*/ds:Signature/ds:SignedInfo/ds:Reference",
        "URI",
        "Reference",
    )?;
    if !reference_uri.is_empty() {
        return Err(VerifyError::UnsupportedReference(reference_uri));
    }

    let expected = text(&ctx, DIGEST_VALUE_XPATH, "DigestValue")?;
    let computed = Base64::encode_string(
        &digest.digest(canonicalize_without_signature(doc)?.as_bytes()),
    );
    if expected != computed {
        return Err(VerifyError::DigestMismatch { expected, computed });
    }

    let certificate_der = decode(
        &text(&ctx, X509_CERTIFICATE_XPATH, "X509Certificate")?,
        "X509Certificate",
    )?;
    let public_key = public_key_from_certificate_der(&certificate_der)?;
    let signature_bytes = decode(
        &text(&ctx, SIGNATURE_VALUE_XPATH, "SignatureValue")?,
        "SignatureValue",
    )?;
    let hashed = signature
        .hash_algorithm()
        .digest(canonicalize_signed_info(doc)?.as_bytes());
    public_key
        .verify(signature.padding(), &hashed, &signature_bytes)
        .map_err(|_| VerifyError::BadSignature)?;

    Ok(VerifiedSignature {
        profile: SignatureProfile::new(digest, signature),
        digest_value: computed,
        certificate_der,
    })
}

fn attribute(
    ctx: &xpath::Context,
    path: &str,
    name: &str,
    label: &'static str,
) -> Result<String, VerifyError> {
    first_node(ctx, path)?
        .and_then(|node| node.get_attribute(name))
        .ok_or(VerifyError::MissingElement(label))
}

fn text(ctx: &xpath::Context, path: &str, label: &'static str) -> Result<String, VerifyError> {
    let value = first_node(ctx, path)?
        .map(|node| node.get_content())
        .ok_or(VerifyError::MissingElement(label))?;
    let compact: String = value.split_whitespace().collect();
    if compact.is_empty() {
        return Err(VerifyError::MissingElement(label));
    }
    Ok(compact)
}

fn decode(value: &str, label: &'static str) -> Result<Vec<u8>, VerifyError> {
    Base64::decode_vec(value).map_err(|_| VerifyError::InvalidEncoding(label))
}
