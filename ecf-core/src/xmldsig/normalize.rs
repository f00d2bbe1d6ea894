//! Rewrites the enveloped `Signature` subtree into the default XML-DSig
//! namespace form the authority accepts: `xmlns` declared once on
//! `Signature`, no prefixed element below it.
//!
//! Rewriting changes the canonical `SignedInfo`, so it has to happen before
//! the signature value is computed. The signer runs it on every template.
//! Nodes that cannot be carried over unchanged (comments, processing
//! instructions, foreign-namespace attributes) fail the rewrite.
use libxml::tree::{Document, Node, NodeType};
use quick_xml::escape::escape;
use std::{collections::BTreeMap, fmt::Write};
use thiserror::Error;

use super::canonical::{first_node, import_fragment, parse_document, signature_context};
use super::constants::{DS_NS, SIGNATURE_XPATH};
use super::sign::SignedChallenge;

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("no enveloped Signature element found")]
    MissingSignature,
    #[error("element '{name}' in namespace '{namespace}' cannot be moved into the XML-DSig default namespace")]
    ForeignElement { name: String, namespace: String },
    #[error("failed to rewrite signature subtree: {0}")]
    Rewrite(String),
}

/// Normalizes a signed challenge. Already-normalized input comes back
/// unchanged, byte for byte.
pub fn normalize(signed: SignedChallenge) -> Result<SignedChallenge, NormalizationError> {
    let mut doc =
        parse_document(signed.as_str()).map_err(|e| NormalizationError::Rewrite(e.to_string()))?;
    if !normalize_document(&mut doc)? {
        return Ok(signed);
    }
    Ok(signed.with_xml(doc.to_string()))
}

pub fn normalize_xml(xml: &str) -> Result<String, NormalizationError> {
    let mut doc = parse_document(xml).map_err(|e| NormalizationError::Rewrite(e.to_string()))?;
    if !normalize_document(&mut doc)? {
        return Ok(xml.to_string());
    }
    Ok(doc.to_string())
}

/// Returns whether the document was modified.
pub(crate) fn normalize_document(doc: &mut Document) -> Result<bool, NormalizationError> {
    let ctx = signature_context(doc).map_err(|e| NormalizationError::Rewrite(e.to_string()))?;
    let mut signature = first_node(&ctx, SIGNATURE_XPATH)
        .map_err(|e| NormalizationError::Rewrite(e.to_string()))?
        .ok_or(NormalizationError::MissingSignature)?;

    if is_default_form(&signature, true) {
        return Ok(false);
    }

    let mut fragment = String::new();
    write_element(&signature, &mut fragment, true)?;
    let mut replacement =
        import_fragment(doc, &fragment).map_err(|e| NormalizationError::Rewrite(e.to_string()))?;
    signature
        .add_prev_sibling(&mut replacement)
        .map_err(|e| NormalizationError::Rewrite(e.to_string()))?;
    signature.unlink();
    tracing::debug!("rewrote Signature subtree into the default XML-DSig namespace");
    Ok(true)
}

fn is_default_form(node: &Node, is_root: bool) -> bool {
    let Some(namespace) = node.get_namespace() else {
        return false;
    };
    if namespace.get_href() != DS_NS || !namespace.get_prefix().is_empty() {
        return false;
    }
    let declarations = node.get_namespace_declarations();
    let declarations_ok = if is_root {
        declarations.len() == 1
            && declarations[0].get_prefix().is_empty()
            && declarations[0].get_href() == DS_NS
    } else {
        declarations.is_empty()
    };
    if !declarations_ok {
        return false;
    }

    let mut child = node.get_first_child();
    while let Some(current) = child {
        if current.is_element_node() && !is_default_form(&current, false) {
            return false;
        }
        child = current.get_next_sibling();
    }
    true
}

fn write_element(node: &Node, out: &mut String, is_root: bool) -> Result<(), NormalizationError> {
    let name = node.get_name();
    let namespace = node
        .get_namespace()
        .map(|ns| ns.get_href())
        .unwrap_or_default();
    if namespace != DS_NS {
        return Err(NormalizationError::ForeignElement { name, namespace });
    }

    let _ = write!(out, "<{name}");
    if is_root {
        let _ = write!(out, " xmlns=\"{DS_NS}\"");
    }
    let mut attributes = BTreeMap::new();
    for ((key, attr_ns), value) in node.get_properties_ns() {
        let qualified = match attr_ns {
            None => key,
            Some(ns) if ns.get_href() == XML_NS => format!("xml:{key}"),
            Some(ns) => {
                return Err(NormalizationError::Rewrite(format!(
                    "attribute '{key}' on '{name}' is in namespace '{}'",
                    ns.get_href()
                )));
            }
        };
        attributes.insert(qualified, value);
    }
    for (key, value) in &attributes {
        let _ = write!(out, " {key}=\"{}\"", escape(value.as_str()));
    }
    out.push('>');

    let mut child = node.get_first_child();
    while let Some(current) = child {
        match current.get_type() {
            Some(NodeType::ElementNode) => write_element(&current, out, false)?,
            Some(NodeType::TextNode) | Some(NodeType::CDataSectionNode) => {
                out.push_str(&escape(current.get_content().as_str()));
            }
            Some(other) => {
                return Err(NormalizationError::Rewrite(format!(
                    "cannot carry {other:?} inside '{name}'"
                )));
            }
            None => {
                return Err(NormalizationError::Rewrite(format!(
                    "unknown node type inside '{name}'"
                )));
            }
        }
        child = current.get_next_sibling();
    }
    let _ = write!(out, "</{name}>");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIXED: &str = concat!(
        r#"<Seed><valor>ABC123</valor>"#,
        r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
        r#"<ds:SignedInfo><ds:Reference URI=""><ds:DigestValue>abc=</ds:DigestValue></ds:Reference></ds:SignedInfo>"#,
        r#"<ds:SignatureValue>sig</ds:SignatureValue>"#,
        r#"</ds:Signature></Seed>"#,
    );

    #[test]
    fn prefixed_signature_is_rewritten_to_default_namespace() {
        let normalized = normalize_xml(PREFIXED).expect("normalize");
        assert!(!normalized.contains("ds:"));
        assert!(normalized.contains(r#"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#">"#));
        assert!(normalized.contains(r#"<Reference URI="">"#));
        assert!(normalized.contains("<DigestValue>abc=</DigestValue>"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_xml(PREFIXED).expect("first pass");
        let twice = normalize_xml(&once).expect("second pass");
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_signature_is_reported() {
        let err = normalize_xml("<Seed><valor>ABC123</valor></Seed>").expect_err("no signature");
        assert!(matches!(err, NormalizationError::MissingSignature));
    }

    #[test]
    fn foreign_elements_are_rejected() {
        let xml = concat!(
            r#"<Seed><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
            r#"<ds:Object><x:Extra xmlns:x="urn:example"/></ds:Object>"#,
            r#"</ds:Signature></Seed>"#,
        );
        let err = normalize_xml(xml).expect_err("foreign element");
        assert!(matches!(err, NormalizationError::ForeignElement { name, .. } if name == "Extra"));
    }

    #[test]
    fn comments_inside_signature_are_refused() {
        let xml = concat!(
            r#"<Seed><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
            r#"<ds:SignedInfo><!-- generated --></ds:SignedInfo>"#,
            r#"</ds:Signature></Seed>"#,
        );
        let err = normalize_xml(xml).expect_err("comment");
        assert!(matches!(err, NormalizationError::Rewrite(reason) if reason.contains("Comment")));
    }

    #[test]
    fn cdata_is_carried_over_as_text() {
        let xml = concat!(
            r#"<Seed><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
            r#"<ds:SignatureValue><![CDATA[a<b]]></ds:SignatureValue>"#,
            r#"</ds:Signature></Seed>"#,
        );
        let normalized = normalize_xml(xml).expect("normalize");
        assert!(normalized.contains("<SignatureValue>a&lt;b</SignatureValue>"));
    }

    #[test]
    fn attribute_prefixes_survive_or_are_refused() {
        let xml = concat!(
            r#"<Seed><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="sig">"#,
            r#"<ds:KeyInfo xml:lang="es"/>"#,
            r#"</ds:Signature></Seed>"#,
        );
        let normalized = normalize_xml(xml).expect("normalize");
        assert!(normalized.contains(r#"<KeyInfo xml:lang="es"/>"#));
        assert!(normalized.contains(r#" Id="sig""#));

        let xml = concat!(
            r#"<Seed><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" xmlns:x="urn:example">"#,
            r#"<ds:KeyInfo x:hint="1"/>"#,
            r#"</ds:Signature></Seed>"#,
        );
        let err = normalize_xml(xml).expect_err("namespaced attribute");
        assert!(matches!(err, NormalizationError::Rewrite(reason) if reason.contains("urn:example")));
    }
}
