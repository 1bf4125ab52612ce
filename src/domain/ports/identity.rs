//! Device identity seam.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::errors::AgentResult;

/// Claims carried by a posture token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureClaims {
    /// Device identifier (subject).
    pub sub: String,
    /// Expiry, epoch seconds.
    pub exp: i64,
    /// Issued-at, epoch seconds.
    pub iat: i64,
}

/// Key material and certificate operations for the registered device
/// identity.
///
/// CSR, certificate, and JWT mechanics are primitives supplied by the
/// implementation; the core only drives the lifecycle.
pub trait Identity: Send + Sync {
    fn common_name(&self) -> Option<String>;

    /// Generate fresh key material for the given common name, replacing any
    /// existing keys.
    fn generate(&mut self, common_name: &str) -> AgentResult<()>;

    /// PEM-encoded certificate signing request over the current key.
    fn csr_pem(&self) -> AgentResult<String>;

    /// Install the registrar-signed certificate.
    fn install_certificate(&mut self, cert_pem: &str) -> AgentResult<()>;

    fn certificate_pem(&self) -> Option<String>;

    /// Whether a registrar-signed certificate is installed (as opposed to
    /// no certificate or a self-signed placeholder).
    fn is_signed(&self) -> bool;

    /// Sign a posture token valid for the given duration.
    fn sign_posture_token(&self, duration: Duration) -> AgentResult<String>;

    /// Persist key material and certificate to the identity directory.
    fn save(&self) -> AgentResult<()>;

    /// Restore key material and certificate from the identity directory.
    fn load(&mut self) -> AgentResult<()>;
}
