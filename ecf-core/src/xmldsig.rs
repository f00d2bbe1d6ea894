//! Enveloped XML-DSig for authority documents.
//!
//! Signatures use inclusive C14N 1.0, an empty-URI reference with the
//! enveloped-signature transform, and carry the signer's certificate in
//! `KeyInfo/X509Data`. The `Signature` element is always emitted in the
//! default XML-DSig namespace.
pub mod canonical;
mod constants;
pub mod normalize;
pub mod sign;
pub mod verify;

pub use canonical::CanonicalizationError;
pub use normalize::{NormalizationError, normalize, normalize_xml};
pub use sign::{SignedChallenge, SigningError, XmlSigner, sign_document};
pub use verify::{VerifiedSignature, VerifyError, verify};
