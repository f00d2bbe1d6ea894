//! Payload integrity digests for invoice submissions.
//!
//! The digest covers the signed invoice XML bytes, i.e. the base64-decoded
//! `XMLFirmado` content, never the base64 text itself.
use base64ct::{Base64, Encoding};
use chrono::NaiveDate;
use libxml::xpath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::DigestAlgorithm;
use crate::xmldsig::canonical::parse_document;

pub const INTEGRITY_ALGORITHM: DigestAlgorithm = DigestAlgorithm::Sha256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("invoice payload is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("invoice payload is not a readable XML document: {0}")]
    InvalidDocument(String),
    #[error("{field} in record ({record}) does not match the document ({document})")]
    RecordMismatch {
        field: &'static str,
        record: String,
        document: String,
    },
}

/// Digest over a payload, tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl IntegrityDigest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.bytes)
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// SHA-256 over `payload`. Empty payloads are rejected.
///
/// # Examples
/// ```rust
/// let digest = ecf_core::integrity::digest(b"hello e-CF")?;
/// assert_eq!(digest.to_base64(), "4h62yg4B74aoL2oYJ7R5o1iwRsn1JsOTXHRARPhOJss=");
/// # Ok::<(), ecf_core::integrity::IntegrityError>(())
/// ```
pub fn digest(payload: &[u8]) -> Result<IntegrityDigest, IntegrityError> {
    if payload.is_empty() {
        return Err(IntegrityError::EmptyPayload);
    }
    Ok(IntegrityDigest {
        algorithm: INTEGRITY_ALGORITHM,
        bytes: INTEGRITY_ALGORITHM.digest(payload),
    })
}

/// Raw digest bytes over `payload`.
pub fn compute_digest(payload: &[u8]) -> Result<Vec<u8>, IntegrityError> {
    digest(payload).map(|d| d.bytes)
}

/// An invoice ready for submission; the signed XML travels base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub emitter_id: String,
    pub sequence_number: String,
    pub issue_date: NaiveDate,
    pub xml_payload_encoded: String,
}

impl InvoiceRecord {
    pub fn new(
        emitter_id: impl Into<String>,
        sequence_number: impl Into<String>,
        issue_date: NaiveDate,
        signed_xml: &[u8],
    ) -> Self {
        Self {
            emitter_id: emitter_id.into(),
            sequence_number: sequence_number.into(),
            issue_date,
            xml_payload_encoded: Base64::encode_string(signed_xml),
        }
    }

    pub fn decoded_payload(&self) -> Result<Vec<u8>, IntegrityError> {
        let compact: String = self.xml_payload_encoded.split_whitespace().collect();
        Base64::decode_vec(&compact).map_err(|e| IntegrityError::InvalidEncoding(e.to_string()))
    }

    /// Recomputed on every call; a record edited between attempts never
    /// reuses an earlier digest.
    pub fn integrity_digest(&self) -> Result<IntegrityDigest, IntegrityError> {
        digest(&self.decoded_payload()?)
    }

    /// Checks the record's emitter, sequence number and issue date against
    /// `IdDoc/eNCF`, `Emisor/RNCEmisor` and `Emisor/FechaEmision` in the
    /// embedded document. The document carries dates as `dd-mm-yyyy`.
    pub fn check_document_consistency(&self) -> Result<(), IntegrityError> {
        let bytes = self.decoded_payload()?;
        let xml = std::str::from_utf8(&bytes)
            .map_err(|e| IntegrityError::InvalidDocument(e.to_string()))?;
        let doc =
            parse_document(xml).map_err(|e| IntegrityError::InvalidDocument(e.to_string()))?;
        let ctx = xpath::Context::new(&doc)
            .map_err(|e| IntegrityError::InvalidDocument(format!("XPath context error: {e:?}")))?;

        let sequence = document_text(&ctx, "IdDoc", "eNCF")?;
        if sequence != self.sequence_number {
            return Err(IntegrityError::RecordMismatch {
                field: "eNCF",
                record: self.sequence_number.clone(),
                document: sequence,
            });
        }
        let emitter = document_text(&ctx, "Emisor", "RNCEmisor")?;
        if emitter != self.emitter_id {
            return Err(IntegrityError::RecordMismatch {
                field: "RNCEmisor",
                record: self.emitter_id.clone(),
                document: emitter,
            });
        }
        let issued = document_text(&ctx, "Emisor", "FechaEmision")?;
        let issued_date = NaiveDate::parse_from_str(&issued, "%d-%m-%Y").map_err(|e| {
            IntegrityError::InvalidDocument(format!("invalid FechaEmision '{issued}': {e}"))
        })?;
        if issued_date != self.issue_date {
            return Err(IntegrityError::RecordMismatch {
                field: "FechaEmision",
                record: self.issue_date.to_string(),
                document: issued,
            });
        }
        Ok(())
    }
}

fn document_text(
    ctx: &xpath::Context,
    parent: &str,
    name: &str,
) -> Result<String, IntegrityError> {
    let path = format!("//*[local-name()='{parent}']/*[local-name()='{name}']");
    let nodes = ctx
        .evaluate(&path)
        .map_err(|e| IntegrityError::InvalidDocument(format!("XPath error for {path}: {e:?}")))?
        .get_nodes_as_vec();
    nodes
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| IntegrityError::InvalidDocument(format!("missing {parent}/{name}")))
}

/// JSON body posted to the reception service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    #[serde(rename = "RNCEmisor")]
    pub emitter_id: String,
    #[serde(rename = "eNCF")]
    pub sequence_number: String,
    #[serde(rename = "FechaEmision")]
    pub issue_date: NaiveDate,
    #[serde(rename = "XMLFirmado")]
    pub signed_xml: String,
    #[serde(rename = "HashXML")]
    pub xml_hash: String,
}

impl SubmissionPayload {
    /// Builds the payload with a freshly computed digest of the decoded XML.
    pub fn from_record(record: &InvoiceRecord) -> Result<Self, IntegrityError> {
        let digest = record.integrity_digest()?;
        Ok(Self {
            emitter_id: record.emitter_id.clone(),
            sequence_number: record.sequence_number.clone(),
            issue_date: record.issue_date,
            signed_xml: record.xml_payload_encoded.clone(),
            xml_hash: digest.to_base64(),
        })
    }
}
