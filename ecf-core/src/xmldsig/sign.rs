use base64ct::{Base64, Encoding};
use libxml::tree::Document;
use thiserror::Error;

use super::canonical::{
    CanonicalizationError, canonicalize_signed_info, canonicalize_without_signature,
    find_nodes, import_fragment, parse_document, signature_context,
};
use super::constants::{
    DIGEST_VALUE_XPATH, SIGNATURE_VALUE_XPATH, SIGNATURE_XPATH, X509_CERTIFICATE_XPATH,
    signature_template,
};
use super::normalize::{NormalizationError, normalize_document};
use crate::algorithm::SignatureProfile;
use crate::keys::KeyMaterial;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error("signature computation failed: {0}")]
    Signing(String),
}

/// A document carrying a completed enveloped signature.
///
/// Holds the serialized form rather than a parsed tree so it can be moved
/// across tasks; [`SignedChallenge::document`] reparses on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedChallenge {
    xml: String,
    digest_value: String,
    signature_value: String,
    pub(crate) cycle: Option<u64>,
}

impl SignedChallenge {
    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.xml.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.xml.into_bytes()
    }

    /// Base64 reference digest over the canonical document.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    pub fn document(&self) -> Result<Document, CanonicalizationError> {
        parse_document(&self.xml)
    }

    /// Canonical `SignedInfo` octets, i.e. exactly what the signature value
    /// covers.
    pub fn signed_info_canonical(&self) -> Result<String, CanonicalizationError> {
        canonicalize_signed_info(&self.document()?)
    }

    pub(crate) fn with_xml(self, xml: String) -> Self {
        Self { xml, ..self }
    }
}

/// Produces enveloped XML-DSig signatures with a fixed algorithm profile.
///
/// # Examples
/// ```rust,no_run
/// use ecf_core::algorithm::SignatureProfile;
/// use ecf_core::keys::KeyMaterial;
/// use ecf_core::xmldsig::XmlSigner;
///
/// let keys = KeyMaterial::from_pem(
///     &std::fs::read_to_string("key.pem")?,
///     &std::fs::read_to_string("cert.pem")?,
/// )?;
/// let signer = XmlSigner::new(&keys, SignatureProfile::rsa_sha256());
/// let signed = signer.sign_xml("<SemillaModel><valor>abc</valor></SemillaModel>")?;
/// println!("{}", signed.as_str());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct XmlSigner<'a> {
    keys: &'a KeyMaterial,
    profile: SignatureProfile,
}

impl<'a> XmlSigner<'a> {
    pub fn new(keys: &'a KeyMaterial, profile: SignatureProfile) -> Self {
        Self { keys, profile }
    }

    pub fn profile(&self) -> SignatureProfile {
        self.profile
    }

    pub fn sign_xml(&self, xml: &str) -> Result<SignedChallenge, SigningError> {
        let doc = parse_document(xml)?;
        self.sign(&doc)
    }

    /// Signs a copy of `document`. A signature already enveloped in the input
    /// is replaced, so signing a signed document reproduces the same
    /// reference digest.
    pub fn sign(&self, document: &Document) -> Result<SignedChallenge, SigningError> {
        let mut doc = document
            .dup()
            .map_err(|e| CanonicalizationError(format!("Failed to duplicate xml: {e:?}")))?;
        insert_signature_template(&mut doc, self.profile)?;
        normalize_document(&mut doc)?;

        let digest_input = canonicalize_without_signature(&doc)?;
        let digest_value = Base64::encode_string(&self.profile.digest.digest(digest_input.as_bytes()));
        set_signature_text(&doc, DIGEST_VALUE_XPATH, &digest_value)?;

        let signed_info = canonicalize_signed_info(&doc)?;
        let hashed = self
            .profile
            .signature
            .hash_algorithm()
            .digest(signed_info.as_bytes());
        let raw_signature = self
            .keys
            .signer()
            .sign_prehashed(self.profile.signature.padding(), &hashed)
            .map_err(|e| SigningError::Signing(e.to_string()))?;
        let signature_value = Base64::encode_string(&raw_signature);
        set_signature_text(&doc, SIGNATURE_VALUE_XPATH, &signature_value)?;
        set_signature_text(&doc, X509_CERTIFICATE_XPATH, &self.keys.certificate_base64())?;

        tracing::debug!(
            digest_algorithm = self.profile.digest.uri(),
            signature_algorithm = self.profile.signature.uri(),
            digest = %digest_value,
            "signed document"
        );

        Ok(SignedChallenge {
            xml: doc.to_string(),
            digest_value,
            signature_value,
            cycle: None,
        })
    }
}

/// Signs `xml` with the default RSA-SHA256 profile and returns the serialized
/// signed document.
pub fn sign_document(xml: &[u8], keys: &KeyMaterial) -> Result<Vec<u8>, SigningError> {
    let xml = std::str::from_utf8(xml)
        .map_err(|e| CanonicalizationError(format!("input is not UTF-8: {e}")))?;
    XmlSigner::new(keys, SignatureProfile::default())
        .sign_xml(xml)
        .map(SignedChallenge::into_bytes)
}

fn insert_signature_template(
    doc: &mut Document,
    profile: SignatureProfile,
) -> Result<(), SigningError> {
    {
        let ctx = signature_context(doc)?;
        for mut existing in find_nodes(&ctx, SIGNATURE_XPATH)? {
            existing.unlink();
        }
    }
    let mut root = doc
        .get_root_element()
        .ok_or_else(|| CanonicalizationError("document has no root element".into()))?;
    let mut signature = import_fragment(doc, &signature_template(profile))?;
    root.add_child(&mut signature)
        .map_err(|e| SigningError::Signing(format!("failed to attach Signature: {e}")))?;
    Ok(())
}

fn set_signature_text(doc: &Document, path: &str, value: &str) -> Result<(), SigningError> {
    let ctx = signature_context(doc)?;
    let nodes = find_nodes(&ctx, path)?;
    if nodes.is_empty() {
        return Err(SigningError::Signing(format!("XPath target not found: {path}")));
    }
    for mut node in nodes {
        node.set_content(value)
            .map_err(|e| SigningError::Signing(e.to_string()))?;
    }
    Ok(())
}
