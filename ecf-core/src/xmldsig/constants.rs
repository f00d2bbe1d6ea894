use crate::algorithm::SignatureProfile;

pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub(crate) const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub(crate) const SIGNATURE_XPATH: &str = "/*/ds:Signature";
pub(crate) const SIGNED_INFO_XPATH: &str = "/*/ds:Signature/ds:SignedInfo";
pub(crate) const DIGEST_VALUE_XPATH: &str =
    "/*/ds:Signature/ds:SignedInfo/ds:Reference/ds:DigestValue";
pub(crate) const SIGNATURE_VALUE_XPATH: &str = "/*/ds:Signature/ds:SignatureValue";
pub(crate) const X509_CERTIFICATE_XPATH: &str =
    "/*/ds:Signature/ds:KeyInfo/ds:X509Data/ds:X509Certificate";

/// Empty enveloped signature in the default XML-DSig namespace, serialized
/// without whitespace between elements.
pub(crate) fn signature_template(profile: SignatureProfile) -> String {
    format!(
        concat!(
            r#"<Signature xmlns="{ns}">"#,
            r#"<SignedInfo>"#,
            r#"<CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<SignatureMethod Algorithm="{signature}"/>"#,
            r#"<Reference URI="">"#,
            r#"<Transforms><Transform Algorithm="{enveloped}"/></Transforms>"#,
            r#"<DigestMethod Algorithm="{digest}"/>"#,
            r#"<DigestValue></DigestValue>"#,
            r#"</Reference>"#,
            r#"</SignedInfo>"#,
            r#"<SignatureValue></SignatureValue>"#,
            r#"<KeyInfo><X509Data><X509Certificate></X509Certificate></X509Data></KeyInfo>"#,
            r#"</Signature>"#,
        ),
        ns = DS_NS,
        c14n = C14N_ALGORITHM,
        signature = profile.signature.uri(),
        enveloped = ENVELOPED_SIGNATURE_TRANSFORM,
        digest = profile.digest.uri(),
    )
}
