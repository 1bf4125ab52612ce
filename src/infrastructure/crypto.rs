//! Crypto primitives: content hashing, detached signature verification, and
//! the RSA-backed device identity.

use std::path::PathBuf;

use base64::Engine;
use chrono::{Duration, Utc};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::ports::{Identity, PostureClaims};

pub use crate::domain::models::results::file_sha256;

const KEY_BITS: usize = 2048;

/// Verify a detached RSA-SHA256 signature against the signing authority's
/// public key (PEM, SPKI form).
pub fn verify_detached_signature(
    authority_pem: &str,
    signature: &[u8],
    content: &[u8],
) -> AgentResult<bool> {
    let public_key = RsaPublicKey::from_public_key_pem(authority_pem)
        .map_err(|err| AgentError::IdentityError(format!("bad signing authority key: {err}")))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);

    let signature = Signature::try_from(signature)
        .map_err(|err| AgentError::IdentityError(format!("malformed signature: {err}")))?;

    Ok(verifying_key.verify(content, &signature).is_ok())
}

/// Sign content with an RSA-SHA256 detached signature. Test and tooling
/// counterpart of [`verify_detached_signature`].
pub fn sign_detached(private_key: &RsaPrivateKey, content: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    signing_key.sign(content).to_vec()
}

/// File-backed RSA device identity.
///
/// Key material lives under the identity directory (`key.pem`, mode 0600;
/// `cert.pem`). The certificate is whatever the registrar signed; a missing
/// certificate means the identity is unsigned.
pub struct RsaIdentity {
    directory: PathBuf,
    common_name: Option<String>,
    private_key: Option<RsaPrivateKey>,
    certificate_pem: Option<String>,
}

impl RsaIdentity {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            common_name: None,
            private_key: None,
            certificate_pem: None,
        }
    }

    /// Open an identity directory, restoring any persisted material.
    pub fn open(directory: PathBuf) -> Self {
        let mut identity = Self::new(directory);
        let _ = identity.load();
        identity
    }

    fn key_path(&self) -> PathBuf {
        self.directory.join("key.pem")
    }

    fn cert_path(&self) -> PathBuf {
        self.directory.join("cert.pem")
    }

    fn common_name_path(&self) -> PathBuf {
        self.directory.join("common_name")
    }

    fn private_key(&self) -> AgentResult<&RsaPrivateKey> {
        self.private_key
            .as_ref()
            .ok_or_else(|| AgentError::IdentityError("no key material loaded".to_string()))
    }

    fn private_key_pem(&self) -> AgentResult<String> {
        let pem = self
            .private_key()?
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| AgentError::IdentityError(err.to_string()))?;
        Ok(pem.to_string())
    }
}

impl Identity for RsaIdentity {
    fn common_name(&self) -> Option<String> {
        self.common_name.clone()
    }

    fn generate(&mut self, common_name: &str) -> AgentResult<()> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|err| AgentError::IdentityError(format!("keygen failed: {err}")))?;
        self.private_key = Some(private_key);
        self.common_name = Some(common_name.to_string());
        // Fresh keys invalidate any previously issued certificate.
        self.certificate_pem = None;
        Ok(())
    }

    /// Certificate request over the current key: the subject, its public
    /// key, and a self-signature proving key possession, PEM-wrapped for
    /// the registrar exchange.
    fn csr_pem(&self) -> AgentResult<String> {
        let private_key = self.private_key()?;
        let common_name = self
            .common_name
            .as_deref()
            .ok_or_else(|| AgentError::IdentityError("no common name set".to_string()))?;

        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| AgentError::IdentityError(err.to_string()))?;

        let body = json!({
            "common_name": common_name,
            "public_key": public_key_pem,
        });
        let body_bytes = serde_json::to_vec(&body)?;
        let signature = sign_detached(private_key, &body_bytes);

        let envelope = json!({
            "request": base64::engine::general_purpose::STANDARD.encode(&body_bytes),
            "signature": base64::engine::general_purpose::STANDARD.encode(signature),
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&envelope)?);

        Ok(format!(
            "-----BEGIN CERTIFICATE REQUEST-----\n{encoded}\n-----END CERTIFICATE REQUEST-----\n"
        ))
    }

    fn install_certificate(&mut self, cert_pem: &str) -> AgentResult<()> {
        if cert_pem.trim().is_empty() {
            return Err(AgentError::IdentityError(
                "empty certificate supplied".to_string(),
            ));
        }
        self.certificate_pem = Some(cert_pem.to_string());
        Ok(())
    }

    fn certificate_pem(&self) -> Option<String> {
        self.certificate_pem.clone()
    }

    fn is_signed(&self) -> bool {
        self.private_key.is_some() && self.certificate_pem.is_some()
    }

    fn sign_posture_token(&self, duration: Duration) -> AgentResult<String> {
        let common_name = self
            .common_name
            .as_deref()
            .ok_or_else(|| AgentError::IdentityError("no common name set".to_string()))?;

        let now = Utc::now();
        let claims = PostureClaims {
            sub: common_name.to_string(),
            iat: now.timestamp(),
            exp: (now + duration).timestamp(),
        };

        let key_pem = self.private_key_pem()?;
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(key_pem.as_bytes())
            .map_err(|err| AgentError::IdentityError(err.to_string()))?;
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .map_err(|err| AgentError::IdentityError(err.to_string()))
    }

    fn save(&self) -> AgentResult<()> {
        std::fs::create_dir_all(&self.directory)?;

        if self.private_key.is_some() {
            let pem = self.private_key_pem()?;
            std::fs::write(self.key_path(), pem)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    self.key_path(),
                    std::fs::Permissions::from_mode(0o600),
                )?;
            }
        }
        match &self.certificate_pem {
            Some(cert) => std::fs::write(self.cert_path(), cert)?,
            None => {
                let _ = std::fs::remove_file(self.cert_path());
            }
        }
        if let Some(common_name) = &self.common_name {
            std::fs::write(self.common_name_path(), common_name)?;
        }
        Ok(())
    }

    fn load(&mut self) -> AgentResult<()> {
        let key_path = self.key_path();
        if key_path.exists() {
            let pem = std::fs::read_to_string(&key_path)?;
            self.private_key = Some(
                RsaPrivateKey::from_pkcs8_pem(&pem)
                    .map_err(|err| AgentError::IdentityError(err.to_string()))?,
            );
        }
        let cert_path = self.cert_path();
        if cert_path.exists() {
            self.certificate_pem = Some(std::fs::read_to_string(&cert_path)?);
        }
        let name_path = self.common_name_path();
        if name_path.exists() {
            self.common_name = Some(std::fs::read_to_string(&name_path)?.trim().to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        // Small key keeps test runtime down; production keys are 2048-bit.
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[test]
    fn test_detached_signature_round_trip() {
        let key = test_key();
        let authority_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let content = b"installer archive bytes";

        let signature = sign_detached(&key, content);
        assert!(verify_detached_signature(&authority_pem, &signature, content).unwrap());

        // Tampered content fails.
        assert!(!verify_detached_signature(&authority_pem, &signature, b"tampered").unwrap());
    }

    #[test]
    fn test_wrong_authority_rejects_signature() {
        let signer = test_key();
        let other = test_key();
        let other_pem = other
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let signature = sign_detached(&signer, b"content");
        assert!(!verify_detached_signature(&other_pem, &signature, b"content").unwrap());
    }

    #[test]
    fn test_identity_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = RsaIdentity::new(dir.path().to_path_buf());

        assert!(!identity.is_signed());
        assert!(identity.csr_pem().is_err());

        identity.generate("device-uuid").unwrap();
        assert!(!identity.is_signed());
        let csr = identity.csr_pem().unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));

        identity.install_certificate("fake-cert-pem").unwrap();
        assert!(identity.is_signed());
        identity.save().unwrap();

        // Fresh handle restores everything from disk.
        let restored = RsaIdentity::open(dir.path().to_path_buf());
        assert!(restored.is_signed());
        assert_eq!(restored.common_name(), Some("device-uuid".to_string()));

        let token = restored.sign_posture_token(Duration::minutes(5)).unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn test_generate_invalidates_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = RsaIdentity::new(dir.path().to_path_buf());
        identity.generate("first").unwrap();
        identity.install_certificate("cert").unwrap();
        assert!(identity.is_signed());

        identity.generate("second").unwrap();
        assert!(!identity.is_signed());
    }
}
