mod common;

use ecf_core::algorithm::{DigestAlgorithm, SignatureAlgorithm, SignatureProfile};
use ecf_core::xmldsig::{VerifyError, XmlSigner, normalize_xml, sign_document, verify};
use libxml::parser::Parser;
use libxml::xpath;

const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

const SEED_SIGNED_INFO: &str = concat!(
    r#"<SignedInfo xmlns="http://www.w3.org/2000/09/xmldsig#">"#,
    r#"<CanonicalizationMethod Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"></CanonicalizationMethod>"#,
    r#"<SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"></SignatureMethod>"#,
    r#"<Reference URI=""><Transforms>"#,
    r#"<Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"></Transform>"#,
    r#"</Transforms><DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"></DigestMethod>"#,
    r#"<DigestValue>dGjI4fKjzYhlzIxZE3s6IrEZy5GoTFr8C1sPCoJNht4=</DigestValue></Reference></SignedInfo>"#,
);

#[test]
fn seed_digest_matches_known_vector() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::rsa_sha256())
        .sign_xml(common::SEED_XML)
        .expect("sign seed");
    assert_eq!(signed.digest_value(), common::SEED_DIGEST);
    assert_eq!(
        signed.signed_info_canonical().expect("signed info"),
        SEED_SIGNED_INFO
    );
}

// Inclusive C14N carries the namespaces SignedInfo inherits from the seed root.
const SEMILLA_SIGNED_INFO: &str = concat!(
    r#"<SignedInfo xmlns="http://www.w3.org/2000/09/xmldsig#" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    r#"<CanonicalizationMethod Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"></CanonicalizationMethod>"#,
    r#"<SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"></SignatureMethod>"#,
    r#"<Reference URI=""><Transforms>"#,
    r#"<Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"></Transform>"#,
    r#"</Transforms><DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"></DigestMethod>"#,
    r#"<DigestValue>VqQneZon0DmHoWiIOyt+V2DfiLTK1tRzjIej3p7c7xs=</DigestValue></Reference></SignedInfo>"#,
);

#[test]
fn authority_seed_signed_info_renders_inherited_namespaces() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(&common::fixture_string("seed-semilla.xml"))
        .expect("sign fixture");
    assert_eq!(
        signed.signed_info_canonical().expect("signed info"),
        SEMILLA_SIGNED_INFO
    );
}

#[test]
fn authority_seed_fixture_digest_ignores_declaration() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(&common::fixture_string("seed-semilla.xml"))
        .expect("sign fixture");
    assert_eq!(
        signed.digest_value(),
        "VqQneZon0DmHoWiIOyt+V2DfiLTK1tRzjIej3p7c7xs="
    );
    verify(signed.as_str()).expect("verify fixture signature");
}

#[test]
fn signing_is_deterministic() {
    let keys = common::test_keys();
    let signer = XmlSigner::new(&keys, SignatureProfile::default());
    let first = signer.sign_xml(common::SEED_XML).expect("first");
    let second = signer.sign_xml(common::SEED_XML).expect("second");
    assert_eq!(first.digest_value(), second.digest_value());
    // PKCS#1 v1.5 has no randomness, so the whole document repeats.
    assert_eq!(first.as_str(), second.as_str());
}

#[test]
fn signed_document_verifies_with_embedded_certificate() {
    let keys = common::test_keys();
    let signed = sign_document(common::SEED_XML.as_bytes(), &keys).expect("sign");
    let xml = String::from_utf8(signed).expect("utf-8");
    let verified = verify(&xml).expect("verify");
    assert_eq!(verified.digest_value(), common::SEED_DIGEST);
    assert_eq!(verified.profile(), SignatureProfile::rsa_sha256());
    assert_eq!(verified.certificate_der(), keys.certificate_der());
}

#[test]
fn stronger_profiles_round_trip() {
    let keys = common::test_keys();
    for profile in [
        SignatureProfile::new(DigestAlgorithm::Sha384, SignatureAlgorithm::RsaSha384),
        SignatureProfile::new(DigestAlgorithm::Sha512, SignatureAlgorithm::RsaSha512),
    ] {
        let signed = XmlSigner::new(&keys, profile)
            .sign_xml(common::SEED_XML)
            .expect("sign");
        let verified = verify(signed.as_str()).expect("verify");
        assert_eq!(verified.profile(), profile);
    }
}

#[test]
fn tampered_content_fails_digest_check() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(common::SEED_XML)
        .expect("sign");
    let tampered = signed.as_str().replace("ABC123", "ABC124");
    let err = verify(&tampered).expect_err("tampered");
    assert!(matches!(err, VerifyError::DigestMismatch { .. }));
}

#[test]
fn tampered_signed_info_fails_signature_check() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(common::SEED_XML)
        .expect("sign");
    let tampered = signed
        .as_str()
        .replace(r#"<Reference URI="">"#, r#"<Reference URI="" Id="r1">"#);
    let err = verify(&tampered).expect_err("tampered");
    assert!(matches!(err, VerifyError::BadSignature));
}

#[test]
fn signature_uses_default_namespace_only() {
    let keys = common::test_keys();
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(common::SEED_XML)
        .expect("sign");
    let xml = signed.as_str();
    assert!(!xml.contains("ds:"), "prefixed element in {xml}");
    assert!(xml.contains(r#"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#">"#));
    assert_eq!(normalize_xml(xml).expect("normalize"), xml);

    let doc = Parser::default().parse_string(xml).expect("parse signed xml");
    let ctx = xpath::Context::new(&doc).expect("xpath context");
    ctx.register_namespace("ds", DS_NS).expect("ds ns");
    let signatures = ctx
        .evaluate("/*/ds:Signature")
        .expect("signature xpath")
        .get_nodes_as_vec();
    assert_eq!(signatures.len(), 1);
    let root = doc.get_root_element().expect("root");
    let last = root
        .get_child_elements()
        .pop()
        .expect("root has children");
    assert_eq!(last.get_name(), "Signature");
    let certificate = ctx
        .evaluate("/*/ds:Signature/ds:KeyInfo/ds:X509Data/ds:X509Certificate")
        .expect("certificate xpath")
        .get_nodes_as_vec();
    assert_eq!(certificate[0].get_content(), keys.certificate_base64());
}

#[test]
fn resigning_signed_document_keeps_digest() {
    let keys = common::test_keys();
    let signer = XmlSigner::new(&keys, SignatureProfile::default());
    let once = signer.sign_xml(common::SEED_XML).expect("first");
    let twice = signer.sign_xml(once.as_str()).expect("second");
    assert_eq!(once.digest_value(), twice.digest_value());
    assert_eq!(twice.as_str().matches("<Signature ").count(), 1);
    verify(twice.as_str()).expect("verify re-signed");
}

#[test]
fn prefixed_signature_is_rewritten_and_resigned() {
    let keys = common::test_keys();
    let prefixed = concat!(
        r#"<Seed><valor>ABC123</valor><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
        r#"<ds:SignedInfo/><ds:SignatureValue/></ds:Signature></Seed>"#,
    );
    let signed = XmlSigner::new(&keys, SignatureProfile::default())
        .sign_xml(prefixed)
        .expect("sign");
    assert!(!signed.as_str().contains("ds:"));
    assert_eq!(signed.digest_value(), common::SEED_DIGEST);
    verify(signed.as_str()).expect("verify");
}

#[test]
fn malformed_xml_is_a_canonicalization_error() {
    let keys = common::test_keys();
    let err = sign_document(b"<Seed><valor>ABC123</Seed>", &keys).expect_err("malformed");
    assert!(matches!(
        err,
        ecf_core::xmldsig::SigningError::Canonicalization(_)
    ));
}
