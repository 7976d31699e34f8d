//! GCP capability: service-account key possession proof and stored-key minting
//!
//! There is no GCP round-trip that confirms arbitrary key material, so
//! verification proves possession instead: the caller's bag must be a full
//! service-account key document whose `client_email` matches the claimed
//! identity, and whose private key corresponds to the public certificate that
//! Google serves for the document's `private_key_id`. Minting returns the
//! long-lived key stored in the secret store, verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::Provider;
use crate::identity::{decode_bag, CredentialBag, Identity};
use crate::vault::VaultClient;
use crate::Result;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A Google service-account key document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcpServiceAccountKey {
    /// Document type, `service_account` for keys we accept
    #[serde(rename = "type", default)]
    pub key_type: String,
    /// Owning project
    #[serde(default)]
    pub project_id: String,
    /// Identifier of the key pair within the account
    #[serde(default)]
    pub private_key_id: String,
    /// PEM-encoded private key
    #[serde(default)]
    pub private_key: String,
    /// Service-account email; must equal the claimed identity id
    #[serde(default)]
    pub client_email: String,
    /// Numeric client id
    #[serde(default)]
    pub client_id: String,
    /// OAuth authorization endpoint
    #[serde(default)]
    pub auth_uri: String,
    /// OAuth token endpoint
    #[serde(default)]
    pub token_uri: String,
    /// Google's provider certificate endpoint
    #[serde(default)]
    pub auth_provider_x509_cert_url: String,
    /// Public certificate endpoint for this account's keys
    #[serde(default)]
    pub client_x509_cert_url: String,
}

/// Why a key/certificate possession proof failed
#[derive(Debug, thiserror::Error)]
pub enum KeyProofError {
    /// The private key PEM did not parse
    #[error("private key: {0}")]
    PrivateKey(String),

    /// The certificate PEM/DER did not parse as X.509
    #[error("certificate: {0}")]
    Certificate(String),

    /// Both parsed, but the certificate belongs to a different key
    #[error("certificate public key does not match private key")]
    Mismatch,
}

/// GCP verify/mint capability
pub struct GcpProvider {
    vault: Arc<VaultClient>,
    http: reqwest::Client,
}

impl GcpProvider {
    /// Create the GCP capability backed by the shared secret store client
    pub fn new(vault: Arc<VaultClient>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client with static configuration");
        Self { vault, http }
    }

    /// Fetch the public certificate PEM Google serves for `private_key_id`
    async fn fetch_client_cert(&self, key: &GcpServiceAccountKey) -> Result<Option<String>> {
        let certs: HashMap<String, String> = self
            .http
            .get(&key.client_x509_cert_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(certs.get(&key.private_key_id).cloned())
    }
}

#[async_trait]
impl Provider for GcpProvider {
    async fn verify(&self, source: &Identity) -> bool {
        let key: GcpServiceAccountKey = match decode_bag(&source.credentials) {
            Ok(key) => key,
            Err(e) => {
                warn!(request_id = %source.request_id, error = %e, "gcp credential bag did not decode");
                return false;
            }
        };

        if key.client_email.is_empty() || key.client_x509_cert_url.is_empty() {
            debug!(request_id = %source.request_id, "gcp key document missing client_email or cert url");
            return false;
        }
        if key.client_email != source.id {
            warn!(
                request_id = %source.request_id,
                claimed = %source.id,
                client_email = %key.client_email,
                "claimed identity does not match key document"
            );
            return false;
        }

        let cert_pem = match self.fetch_client_cert(&key).await {
            Ok(Some(pem)) => pem,
            Ok(None) => {
                warn!(
                    request_id = %source.request_id,
                    private_key_id = %key.private_key_id,
                    "no public certificate published for key id"
                );
                return false;
            }
            Err(e) => {
                warn!(request_id = %source.request_id, error = %e, "fetching public certificate failed");
                return false;
            }
        };

        match prove_key_possession(&cert_pem, &key.private_key) {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id = %source.request_id, error = %e, "key possession proof failed");
                false
            }
        }
    }

    async fn mint(&self, target: &Identity) -> Result<CredentialBag> {
        let stored = self.vault.get_kv(&target.id).await?;
        debug!(request_id = %target.request_id, sa = %target.id, "returning stored service-account key");
        Ok(stored)
    }
}

/// Require that `private_key_pem` is the private half of `cert_pem`
///
/// Equivalent to loading the pair as a TLS certificate/key: the private key
/// must parse, the leaf must parse as X.509, and the certificate's
/// SubjectPublicKeyInfo must equal the key pair's public key.
pub fn prove_key_possession(cert_pem: &str, private_key_pem: &str) -> std::result::Result<(), KeyProofError> {
    let key_pair = rcgen::KeyPair::from_pem(private_key_pem)
        .map_err(|e| KeyProofError::PrivateKey(e.to_string()))?;
    let key_spki = pem::parse(key_pair.public_key_pem().as_bytes())
        .map_err(|e| KeyProofError::PrivateKey(e.to_string()))?;

    let cert_der = pem::parse(cert_pem.as_bytes())
        .map_err(|e| KeyProofError::Certificate(e.to_string()))?;
    let (_, certificate) = X509Certificate::from_der(cert_der.contents())
        .map_err(|e| KeyProofError::Certificate(e.to_string()))?;

    if certificate.public_key().raw != key_spki.contents() {
        return Err(KeyProofError::Mismatch);
    }
    Ok(())
}
