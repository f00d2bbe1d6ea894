use chrono::{DateTime, TimeZone, Utc};
use ecf_core::auth::Clock;
use ecf_core::integrity::SubmissionPayload;
use ecf_core::keys::KeyMaterial;
use ecf_core::transport::{AuthorityTransport, TransportError, TransportResponse};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[allow(dead_code)]
pub const SEED_XML: &str = "<Seed><valor>ABC123</valor></Seed>";
#[allow(dead_code)]
pub const SEED_DIGEST: &str = "dGjI4fKjzYhlzIxZE3s6IrEZy5GoTFr8C1sPCoJNht4=";
#[allow(dead_code)]
pub const P12_PASSPHRASE: &str = "test-passphrase";

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[allow(dead_code)]
pub fn fixture_string(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("read fixture")
}

#[allow(dead_code)]
pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).expect("read fixture")
}

#[allow(dead_code)]
pub fn test_keys() -> KeyMaterial {
    KeyMaterial::from_pem(
        &fixture_string("test-key.pem"),
        &fixture_string("test-cert.pem"),
    )
    .expect("test key material")
}

#[allow(dead_code)]
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 14, h, m, s)
        .single()
        .expect("valid time")
}

/// Clock the test moves by hand.
#[allow(dead_code)]
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

#[allow(dead_code)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Holds one transport call open until the test releases it.
#[allow(dead_code)]
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    released: Notify,
}

#[allow(dead_code)]
impl Gate {
    /// Resolves once a call is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.released.notified().await;
    }
}

#[allow(dead_code)]
type Scripted = Mutex<VecDeque<Result<TransportResponse, TransportError>>>;

/// Transport answering from scripted queues. Once a queue is drained the
/// default response for that endpoint is returned.
#[allow(dead_code)]
pub struct MockTransport {
    seeds: Scripted,
    validations: Scripted,
    submissions: Scripted,
    default_seed: TransportResponse,
    default_validation: TransportResponse,
    seed_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    validated: Mutex<Vec<Vec<u8>>>,
    submitted: Mutex<Vec<(String, SubmissionPayload)>>,
    seed_gate: Option<Arc<Gate>>,
    validation_gate: Option<Arc<Gate>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(seed_body: &str, token_body: &str) -> Self {
        Self {
            seeds: Mutex::new(VecDeque::new()),
            validations: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(VecDeque::new()),
            default_seed: TransportResponse::new(200, seed_body),
            default_validation: TransportResponse::new(200, token_body),
            seed_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            validated: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            seed_gate: None,
            validation_gate: None,
        }
    }

    pub fn with_seed_gate(mut self, gate: Arc<Gate>) -> Self {
        self.seed_gate = Some(gate);
        self
    }

    pub fn with_validation_gate(mut self, gate: Arc<Gate>) -> Self {
        self.validation_gate = Some(gate);
        self
    }

    pub fn push_seed(&self, response: Result<TransportResponse, TransportError>) {
        self.seeds.lock().expect("script lock").push_back(response);
    }

    pub fn push_validation(&self, response: Result<TransportResponse, TransportError>) {
        self.validations
            .lock()
            .expect("script lock")
            .push_back(response);
    }

    pub fn push_submission(&self, response: Result<TransportResponse, TransportError>) {
        self.submissions
            .lock()
            .expect("script lock")
            .push_back(response);
    }

    pub fn seed_calls(&self) -> usize {
        self.seed_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.seed_calls() + self.validate_calls() + self.submit_calls()
    }

    pub fn validated_documents(&self) -> Vec<Vec<u8>> {
        self.validated.lock().expect("record lock").clone()
    }

    pub fn submitted(&self) -> Vec<(String, SubmissionPayload)> {
        self.submitted.lock().expect("record lock").clone()
    }
}

#[allow(dead_code)]
fn next(
    script: &Scripted,
    default: &TransportResponse,
) -> Result<TransportResponse, TransportError> {
    script
        .lock()
        .expect("script lock")
        .pop_front()
        .unwrap_or_else(|| Ok(default.clone()))
}

impl AuthorityTransport for MockTransport {
    async fn fetch_seed(&self) -> Result<TransportResponse, TransportError> {
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(gate) = &self.seed_gate {
            gate.pass().await;
        }
        next(&self.seeds, &self.default_seed)
    }

    async fn validate_seed(&self, signed_xml: &[u8]) -> Result<TransportResponse, TransportError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.validated
            .lock()
            .expect("record lock")
            .push(signed_xml.to_vec());
        tokio::task::yield_now().await;
        if let Some(gate) = &self.validation_gate {
            gate.pass().await;
        }
        next(&self.validations, &self.default_validation)
    }

    async fn submit_invoice(
        &self,
        bearer_token: &str,
        payload: &SubmissionPayload,
    ) -> Result<TransportResponse, TransportError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted
            .lock()
            .expect("record lock")
            .push((bearer_token.to_string(), payload.clone()));
        next(
            &self.submissions,
            &TransportResponse::new(200, r#"{"trackId":"00000000-0000-0000-0000-000000000000"}"#),
        )
    }
}
