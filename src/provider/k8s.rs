//! Kubernetes capability: TokenReview verification and stored-token minting
//!
//! Clusters are external to the broker, so verification speaks raw HTTPS to
//! each cluster's API server: the per-cluster validation record in the secret
//! store supplies the API host, the cluster CA to pin, and a reviewer token.
//! The caller's ServiceAccount JWT is submitted as a TokenReview; the claimed
//! identity must equal the authenticated username. Minting returns the
//! stored ServiceAccount token document for the target cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Provider;
use crate::error::Error;
use crate::identity::{decode_bag, CredentialBag, Identity};
use crate::vault::VaultClient;
use crate::Result;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1beta1/tokenreviews";

/// Wire shape of a Kubernetes source credential bag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K8sCallerCredentials {
    /// Cluster the ServiceAccount lives in
    #[serde(rename = "clusterName", default)]
    pub cluster_name: String,
    /// ServiceAccount namespace
    #[serde(default)]
    pub namespace: String,
    /// ServiceAccount name
    #[serde(default)]
    pub sa: String,
    /// The caller's ServiceAccount JWT
    #[serde(default)]
    pub jwt: String,
}

/// Per-cluster validation record stored at `<clusterName>/validation`
#[derive(Debug, Clone, Default, Deserialize)]
struct ClusterValidationRecord {
    /// API server base URL
    #[serde(rename = "clusterHost", default)]
    cluster_host: String,
    /// Base64-encoded cluster CA bundle (PEM inside)
    #[serde(rename = "clusterCA", default)]
    cluster_ca: String,
    /// Base64-encoded reviewer ServiceAccount token
    #[serde(rename = "validationToken", default)]
    validation_token: String,
}

#[derive(Debug, Serialize)]
struct TokenReviewRequest {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    spec: TokenReviewSpec,
}

#[derive(Debug, Serialize)]
struct TokenReviewSpec {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenReviewResponse {
    #[serde(default)]
    status: TokenReviewStatus,
}

#[derive(Debug, Default, Deserialize)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: TokenReviewUser,
}

#[derive(Debug, Default, Deserialize)]
struct TokenReviewUser {
    #[serde(default)]
    username: String,
}

/// Kubernetes verify/mint capability
pub struct K8sProvider {
    vault: Arc<VaultClient>,
}

impl K8sProvider {
    /// Create the Kubernetes capability backed by the shared secret store client
    pub fn new(vault: Arc<VaultClient>) -> Self {
        Self { vault }
    }

    /// Submit the caller's JWT for review by its own cluster
    async fn review_token(
        &self,
        creds: &K8sCallerCredentials,
        request_id: &str,
    ) -> Result<TokenReviewStatus> {
        let record_bag = self
            .vault
            .get_kv(&format!("{}/validation", creds.cluster_name))
            .await?;
        let record: ClusterValidationRecord = decode_bag(&record_bag)?;

        let ca_pem = BASE64
            .decode(&record.cluster_ca)
            .map_err(|e| Error::upstream(format!("cluster ca decode: {e}")))?;
        let reviewer_token = BASE64
            .decode(&record.validation_token)
            .map_err(|e| Error::upstream(format!("validation token decode: {e}")))?;
        let reviewer_token = String::from_utf8(reviewer_token)
            .map_err(|e| Error::upstream(format!("validation token is not utf-8: {e}")))?;

        // Trust exactly the cluster's own CA, nothing from the system store.
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .tls_built_in_root_certs(false)
            .add_root_certificate(
                reqwest::Certificate::from_pem(&ca_pem)
                    .map_err(|e| Error::upstream(format!("cluster ca parse: {e}")))?,
            )
            .build()
            .map_err(|e| Error::upstream(format!("https client: {e}")))?;

        let review = TokenReviewRequest {
            api_version: "authentication.k8s.io/v1beta1",
            kind: "TokenReview",
            spec: TokenReviewSpec {
                token: creds.jwt.clone(),
            },
        };

        let url = format!(
            "{}{TOKEN_REVIEW_PATH}",
            record.cluster_host.trim_end_matches('/')
        );
        debug!(request_id = %request_id, cluster = %creds.cluster_name, "submitting token review");

        let response: TokenReviewResponse = client
            .post(&url)
            .bearer_auth(reviewer_token)
            .json(&review)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.status)
    }
}

#[async_trait]
impl Provider for K8sProvider {
    async fn verify(&self, source: &Identity) -> bool {
        let creds: K8sCallerCredentials = match decode_bag(&source.credentials) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(request_id = %source.request_id, error = %e, "k8s credential bag did not decode");
                return false;
            }
        };
        if creds.jwt.is_empty() {
            debug!(request_id = %source.request_id, "k8s credential bag has no jwt");
            return false;
        }

        let status = match self.review_token(&creds, &source.request_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    request_id = %source.request_id,
                    cluster = %creds.cluster_name,
                    error = %e,
                    "token review failed"
                );
                return false;
            }
        };

        if !status.authenticated {
            warn!(
                request_id = %source.request_id,
                cluster = %creds.cluster_name,
                "cluster did not authenticate the token"
            );
            return false;
        }
        if status.user.username != source.id {
            warn!(
                request_id = %source.request_id,
                claimed = %source.id,
                actual = %status.user.username,
                "token belongs to a different service account"
            );
            return false;
        }
        true
    }

    async fn mint(&self, target: &Identity) -> Result<CredentialBag> {
        // The target bag is a locator: only the cluster name matters here.
        let locator: K8sCallerCredentials = decode_bag(&target.credentials)
            .map_err(|e| Error::upstream(format!("stored target locator did not decode: {e}")))?;
        let stored = self
            .vault
            .get_kv(&format!("{}/{}", locator.cluster_name, target.id))
            .await?;
        debug!(
            request_id = %target.request_id,
            cluster = %locator.cluster_name,
            sa = %target.id,
            "returning stored service-account token"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_credentials_decode_from_the_wire_shape() {
        let mut bag = CredentialBag::new();
        bag.insert("clusterName".into(), "prod-east".into());
        bag.insert("namespace".into(), "payments".into());
        bag.insert("sa".into(), "worker".into());
        bag.insert("jwt".into(), "eyJhbGciOi...".into());

        let creds: K8sCallerCredentials = decode_bag(&bag).unwrap();
        assert_eq!(creds.cluster_name, "prod-east");
        assert_eq!(creds.namespace, "payments");
        assert_eq!(creds.sa, "worker");
        assert!(!creds.jwt.is_empty());
    }

    #[test]
    fn validation_record_decodes_from_stored_fields() {
        let mut bag = CredentialBag::new();
        bag.insert("clusterHost".into(), "https://k8s.example.com:6443".into());
        bag.insert("clusterCA".into(), BASE64.encode("pem-bytes").into());
        bag.insert("validationToken".into(), BASE64.encode("reviewer").into());

        let record: ClusterValidationRecord = decode_bag(&bag).unwrap();
        assert_eq!(record.cluster_host, "https://k8s.example.com:6443");
        assert_eq!(BASE64.decode(record.cluster_ca).unwrap(), b"pem-bytes");
    }

    #[test]
    fn token_review_request_serializes_the_v1beta1_shape() {
        let review = TokenReviewRequest {
            api_version: "authentication.k8s.io/v1beta1",
            kind: "TokenReview",
            spec: TokenReviewSpec {
                token: "caller-jwt".to_string(),
            },
        };
        let json = serde_json::to_value(&review).unwrap();
        assert_eq!(json["apiVersion"], "authentication.k8s.io/v1beta1");
        assert_eq!(json["kind"], "TokenReview");
        assert_eq!(json["spec"]["token"], "caller-jwt");
    }

    #[test]
    fn authenticated_review_status_decodes() {
        let response: TokenReviewResponse = serde_json::from_value(serde_json::json!({
            "kind": "TokenReview",
            "status": {
                "authenticated": true,
                "user": {
                    "username": "system:serviceaccount:payments:worker",
                    "groups": ["system:serviceaccounts"]
                }
            }
        }))
        .unwrap();
        assert!(response.status.authenticated);
        assert_eq!(
            response.status.user.username,
            "system:serviceaccount:payments:worker"
        );
    }

    #[test]
    fn unauthenticated_and_empty_statuses_default_to_refusal() {
        let response: TokenReviewResponse = serde_json::from_value(serde_json::json!({
            "status": { "authenticated": false, "error": "token expired" }
        }))
        .unwrap();
        assert!(!response.status.authenticated);

        let response: TokenReviewResponse =
            serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!response.status.authenticated);
        assert!(response.status.user.username.is_empty());
    }

    #[tokio::test]
    async fn empty_jwt_is_a_refusal() {
        let vault = Arc::new(test_vault());
        let provider = K8sProvider::new(vault);

        let mut bag = CredentialBag::new();
        bag.insert("clusterName".into(), "prod-east".into());
        bag.insert("jwt".into(), "".into());

        let source = Identity {
            id: "system:serviceaccount:payments:worker".to_string(),
            credentials: bag,
            ..Default::default()
        };
        assert!(!provider.verify(&source).await);
    }

    fn test_vault() -> VaultClient {
        crate::vault::test_support::unreachable_client()
    }
}
