use {
    crate::{metrics::Metrics, sns::RawEnvelope},
    async_trait::async_trait,
    base64::Engine,
    rsa::{
        pkcs1::DecodeRsaPublicKey,
        pkcs1v15::{Signature, VerifyingKey},
        signature::Verifier,
        RsaPublicKey,
    },
    sha1::Sha1,
    std::{collections::HashMap, sync::Arc},
    thiserror::Error,
    tokio::sync::OnceCell,
    tracing::{debug, instrument},
    url::Url,
};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Envelope is missing required field {0}")]
    MalformedEnvelope(&'static str),

    #[error("Signing certificate URL {0} is not on the allowlist")]
    SuspiciousOrigin(String),

    #[error("Signing certificate unavailable: {0}")]
    CertUnavailable(String),

    #[error("Envelope signature does not verify")]
    InvalidSignature,
}

/// The envelope-provenance check the worker runs before classifying
/// anything.
#[async_trait]
pub trait EnvelopeVerifier: Send + Sync {
    async fn verify(&self, envelope: &RawEnvelope) -> Result<(), VerifyError>;

    /// Shared allowlist for every URL the envelope asks us to fetch.
    fn host_allowed(&self, url: &Url) -> bool;
}

/// Verifies envelope signatures against the publisher's rotated signing
/// certificates. Certificates are fetched once per URL and held for the
/// life of the process; rotation always introduces a new URL.
pub struct SignatureVerifier {
    http_client: reqwest::Client,
    allowed_hosts: Vec<String>,
    certificates: std::sync::Mutex<HashMap<String, Arc<OnceCell<Arc<Vec<u8>>>>>>,
    metrics: Option<Metrics>,
}

impl SignatureVerifier {
    pub fn new(
        http_client: reqwest::Client,
        allowed_hosts: Vec<String>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            http_client,
            allowed_hosts,
            certificates: std::sync::Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Suffix match against the allowlist. `sns.us-east-1.amazonaws.com`
    /// matches the entry `amazonaws.com`; `evilamazonaws.com` does not.
    pub fn host_allowed(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        self.allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.trim_start_matches('.');
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }

    #[instrument(skip_all, fields(message_id = %envelope.message_id))]
    pub async fn verify(&self, envelope: &RawEnvelope) -> Result<(), VerifyError> {
        let cert_url = Url::parse(&envelope.signing_cert_url)
            .map_err(|_| VerifyError::SuspiciousOrigin(envelope.signing_cert_url.clone()))?;
        if cert_url.scheme() != "https" || !self.host_allowed(&cert_url) {
            return Err(VerifyError::SuspiciousOrigin(
                envelope.signing_cert_url.clone(),
            ));
        }

        let canonical = envelope.canonical_string()?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&envelope.signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        let pem = self.certificate(cert_url.as_str()).await?;
        let public_key = public_key_from_pem(&pem)?;
        verify_sha1(&public_key, canonical.as_bytes(), &signature)
    }

    /// Resolves the certificate through the process-local cache. The
    /// per-URL cell makes concurrent misses collapse into one fetch; fetch
    /// failures leave the cell empty so a later envelope can try again.
    async fn certificate(&self, url: &str) -> Result<Arc<Vec<u8>>, VerifyError> {
        let cell = {
            let mut certificates = self
                .certificates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            certificates
                .entry(url.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(|| self.fetch_certificate(url))
            .await
            .cloned()
    }

    async fn fetch_certificate(&self, url: &str) -> Result<Arc<Vec<u8>>, VerifyError> {
        debug!("Fetching signing certificate from {url}");
        if let Some(metrics) = &self.metrics {
            metrics.cert_fetches.inc();
        }

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| VerifyError::CertUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| VerifyError::CertUnavailable(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| VerifyError::CertUnavailable(e.to_string()))?;

        Ok(Arc::new(body.to_vec()))
    }
}

#[async_trait]
impl EnvelopeVerifier for SignatureVerifier {
    async fn verify(&self, envelope: &RawEnvelope) -> Result<(), VerifyError> {
        SignatureVerifier::verify(self, envelope).await
    }

    fn host_allowed(&self, url: &Url) -> bool {
        SignatureVerifier::host_allowed(self, url)
    }
}

fn public_key_from_pem(pem: &[u8]) -> Result<RsaPublicKey, VerifyError> {
    let (rest, parsed) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| VerifyError::CertUnavailable(format!("invalid PEM: {e}")))?;
    if parsed.label != "CERTIFICATE" {
        return Err(VerifyError::CertUnavailable(format!(
            "expected a CERTIFICATE block, got {}",
            parsed.label
        )));
    }
    if !rest.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(VerifyError::CertUnavailable(
            "expected exactly one certificate".to_owned(),
        ));
    }

    let certificate = parsed
        .parse_x509()
        .map_err(|e| VerifyError::CertUnavailable(format!("invalid certificate: {e}")))?;
    RsaPublicKey::from_pkcs1_der(certificate.public_key().subject_public_key.data.as_ref())
        .map_err(|e| VerifyError::CertUnavailable(format!("unsupported public key: {e}")))
}

fn verify_sha1(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
    let verifying_key = VerifyingKey::<Sha1>::new(key.clone());
    let signature = Signature::try_from(signature).map_err(|_| VerifyError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| VerifyError::InvalidSignature)
}
