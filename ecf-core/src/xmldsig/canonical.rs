use libxml::{
    parser::{Parser, ParserOptions},
    tree::{Document, Node, c14n},
    xpath,
};
use thiserror::Error;

use super::constants::{DS_NS, SIGNATURE_XPATH, SIGNED_INFO_XPATH};

#[derive(Debug, Error)]
#[error("canonicalization failed: {0}")]
pub struct CanonicalizationError(pub(crate) String);

/// Strict parse; libxml's recovery mode stays off.
pub(crate) fn parse_document(xml: &str) -> Result<Document, CanonicalizationError> {
    let options = ParserOptions {
        recover: false,
        no_net: true,
        ..ParserOptions::default()
    };
    let doc = Parser::default()
        .parse_string_with_options(xml, options)
        .map_err(|e| CanonicalizationError(format!("XML parse error: {e:?}")))?;
    if doc.get_root_element().is_none() {
        return Err(CanonicalizationError("document has no root element".into()));
    }
    Ok(doc)
}

pub(crate) fn signature_context(doc: &Document) -> Result<xpath::Context, CanonicalizationError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| CanonicalizationError(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| CanonicalizationError(format!("XPath context error: {e:?}")))?;
    Ok(ctx)
}

pub(crate) fn find_nodes(
    ctx: &xpath::Context,
    path: &str,
) -> Result<Vec<Node>, CanonicalizationError> {
    Ok(ctx
        .evaluate(path)
        .map_err(|e| CanonicalizationError(format!("XPath error for {path}: {e:?}")))?
        .get_nodes_as_vec())
}

pub(crate) fn first_node(
    ctx: &xpath::Context,
    path: &str,
) -> Result<Option<Node>, CanonicalizationError> {
    Ok(find_nodes(ctx, path)?.into_iter().next())
}

fn c14n_options() -> c14n::CanonicalizationOptions {
    c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::Canonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

/// Inclusive C14N 1.0 of the document with its enveloped signature removed,
/// i.e. the octets the reference digest is computed over.
pub fn canonicalize_without_signature(doc: &Document) -> Result<String, CanonicalizationError> {
    let xml = doc
        .dup()
        .map_err(|e| CanonicalizationError(format!("Failed to duplicate xml: {e:?}")))?;
    let ctx = signature_context(&xml)?;
    for mut node in find_nodes(&ctx, SIGNATURE_XPATH)? {
        node.unlink();
    }
    xml.canonicalize(c14n_options(), None)
        .map_err(|e| CanonicalizationError(format!("Failed to canonicalize xml: {e:?}")))
}

/// Inclusive C14N 1.0 of `SignedInfo` in document context, so namespace
/// declarations in scope from ancestors are rendered on the apex element.
pub fn canonicalize_signed_info(doc: &Document) -> Result<String, CanonicalizationError> {
    let ctx = signature_context(doc)?;
    let mut signed_info = first_node(&ctx, SIGNED_INFO_XPATH)?
        .ok_or_else(|| CanonicalizationError("missing SignedInfo element".into()))?;
    signed_info
        .canonicalize(c14n_options())
        .map_err(|e| CanonicalizationError(format!("Failed to canonicalize SignedInfo: {e:?}")))
}

pub(crate) fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, CanonicalizationError> {
    let fragment = Parser::default()
        .parse_string(xml)
        .map_err(|e| CanonicalizationError(format!("XML parse error: {e:?}")))?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| CanonicalizationError("missing fragment root".into()))?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| CanonicalizationError("failed to import fragment".into()))
}
