//! Invoice submission to the reception service.
use thiserror::Error;

use crate::auth::{AuthError, Authenticator, Clock};
use crate::integrity::{IntegrityError, InvoiceRecord, SubmissionPayload};
use crate::transport::{AuthorityTransport, TransportError, TransportResponse};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invoice rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl<T: AuthorityTransport, C: Clock> Authenticator<T, C> {
    /// Posts `record` with a freshly computed `HashXML` and a valid bearer
    /// token, authenticating first when needed. The record is checked against
    /// the document it embeds before anything is sent.
    pub async fn submit_invoice(
        &self,
        record: &InvoiceRecord,
    ) -> Result<TransportResponse, SubmissionError> {
        record.check_document_consistency()?;
        let payload = SubmissionPayload::from_record(record)?;
        let token = self.authenticate().await?;

        tracing::info!(
            emitter = %payload.emitter_id,
            sequence = %payload.sequence_number,
            hash = %payload.xml_hash,
            "submitting invoice"
        );
        let response = self
            .transport()
            .submit_invoice(token.value(), &payload)
            .await?;
        if !response.is_success() {
            tracing::warn!(
                sequence = %payload.sequence_number,
                status = response.status,
                "invoice rejected"
            );
            return Err(SubmissionError::Rejected {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }
}
