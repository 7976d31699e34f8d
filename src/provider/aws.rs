//! AWS capability: STS-backed verification and role assumption
//!
//! Verification round-trips the caller's own key material through STS
//! GetCallerIdentity and requires the returned ARN to equal the claimed
//! identity byte-for-byte. Minting assumes the target role with the broker's
//! ambient AWS credentials, naming the session after the request correlation
//! token so the assumption is attributable in CloudTrail.

use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sts::config::timeout::TimeoutConfig;
use aws_sdk_sts::config::{BehaviorVersion, Region};
use aws_smithy_types::error::display::DisplayErrorContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Provider;
use crate::error::Error;
use crate::identity::{decode_bag, encode_bag, CredentialBag, Identity};
use crate::Result;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_PREFIX: &str = "causeway-";

/// Wire shape of an AWS credential bag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsKeyMaterial {
    /// Access key id
    #[serde(rename = "AccessKeyId", default)]
    pub access_key_id: String,
    /// Secret access key
    #[serde(rename = "SecretAccessKey", default)]
    pub secret_access_key: String,
    /// Session token, present for temporary credentials
    #[serde(rename = "SessionToken", default)]
    pub session_token: String,
}

/// AWS verify/mint capability
#[derive(Debug, Clone, Default)]
pub struct AwsProvider;

impl AwsProvider {
    /// Create the AWS capability
    pub fn new() -> Self {
        Self
    }

    fn sts_client_for_caller(keys: &AwsKeyMaterial, region: &str) -> aws_sdk_sts::Client {
        let session_token = (!keys.session_token.is_empty()).then(|| keys.session_token.clone());
        let credentials = Credentials::new(
            keys.access_key_id.clone(),
            keys.secret_access_key.clone(),
            session_token,
            None,
            "caller-supplied",
        );

        let config = aws_sdk_sts::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .timeout_config(timeouts())
            .build();
        aws_sdk_sts::Client::from_conf(config)
    }
}

fn timeouts() -> TimeoutConfig {
    TimeoutConfig::builder()
        .operation_timeout(OPERATION_TIMEOUT)
        .build()
}

#[async_trait]
impl Provider for AwsProvider {
    async fn verify(&self, source: &Identity) -> bool {
        let keys: AwsKeyMaterial = match decode_bag(&source.credentials) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(request_id = %source.request_id, error = %e, "aws credential bag did not decode");
                return false;
            }
        };
        if keys.access_key_id.is_empty() || keys.secret_access_key.is_empty() {
            debug!(request_id = %source.request_id, "aws credential bag missing key material");
            return false;
        }

        let client = Self::sts_client_for_caller(&keys, &source.region);
        let caller = match client.get_caller_identity().send().await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    request_id = %source.request_id,
                    error = %DisplayErrorContext(&e),
                    "sts get-caller-identity failed"
                );
                return false;
            }
        };

        match caller.arn() {
            Some(arn) if arn == source.id => true,
            Some(arn) => {
                warn!(
                    request_id = %source.request_id,
                    claimed = %source.id,
                    actual = %arn,
                    "caller arn does not match claimed identity"
                );
                false
            }
            None => {
                warn!(request_id = %source.request_id, "sts returned no arn");
                false
            }
        }
    }

    async fn mint(&self, target: &Identity) -> Result<CredentialBag> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts());
        if !target.region.is_empty() {
            loader = loader.region(Region::new(target.region.clone()));
        }
        let sdk_config = loader.load().await;
        let client = aws_sdk_sts::Client::new(&sdk_config);

        let assumed = client
            .assume_role()
            .role_arn(&target.id)
            .role_session_name(session_name(&target.request_id))
            .send()
            .await
            .map_err(|e| {
                Error::upstream(format!("sts assume-role: {}", DisplayErrorContext(&e)))
            })?;

        let credentials = assumed
            .credentials()
            .ok_or_else(|| Error::upstream("sts assume-role returned no credentials"))?;

        encode_bag(&AwsKeyMaterial {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
        })
    }
}

/// Role session name carrying the request correlation token
fn session_name(request_id: &str) -> String {
    // STS limits session names to 64 chars of [\w+=,.@-]; a uuid fits, but an
    // arbitrary caller-supplied header may not.
    let mut name = format!("{SESSION_PREFIX}{request_id}");
    name.retain(|c| c.is_ascii_alphanumeric() || "+=,.@-_".contains(c));
    name.truncate(64);
    if name.len() == SESSION_PREFIX.len() {
        name.push_str("request");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CloudProvider;

    fn aws_identity(bag: CredentialBag) -> Identity {
        Identity {
            id: "arn:aws:iam::111:user/alice".to_string(),
            provider: CloudProvider::Aws,
            region: "us-east-1".to_string(),
            credentials: bag,
            request_id: "req-1".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_access_key_is_a_refusal_without_any_call() {
        let mut bag = CredentialBag::new();
        bag.insert("SecretAccessKey".into(), "shh".into());

        let provider = AwsProvider::new();
        assert!(!provider.verify(&aws_identity(bag)).await);
    }

    #[tokio::test]
    async fn missing_secret_key_is_a_refusal_without_any_call() {
        let mut bag = CredentialBag::new();
        bag.insert("AccessKeyId".into(), "AKIA123".into());

        let provider = AwsProvider::new();
        assert!(!provider.verify(&aws_identity(bag)).await);
    }

    #[tokio::test]
    async fn non_string_key_material_is_a_refusal() {
        let mut bag = CredentialBag::new();
        bag.insert("AccessKeyId".into(), serde_json::json!({"nested": true}));
        bag.insert("SecretAccessKey".into(), "shh".into());

        let provider = AwsProvider::new();
        assert!(!provider.verify(&aws_identity(bag)).await);
    }

    #[test]
    fn key_material_decodes_from_the_wire_shape() {
        let mut bag = CredentialBag::new();
        bag.insert("AccessKeyId".into(), "AKIA123".into());
        bag.insert("SecretAccessKey".into(), "shh".into());
        bag.insert("SessionToken".into(), "tok".into());

        let keys: AwsKeyMaterial = decode_bag(&bag).unwrap();
        assert_eq!(keys.access_key_id, "AKIA123");
        assert_eq!(keys.secret_access_key, "shh");
        assert_eq!(keys.session_token, "tok");
    }

    #[test]
    fn minted_bag_uses_the_wire_field_names() {
        let bag = encode_bag(&AwsKeyMaterial {
            access_key_id: "ASIA456".to_string(),
            secret_access_key: "shh".to_string(),
            session_token: "tok".to_string(),
        })
        .unwrap();

        assert_eq!(bag.get("AccessKeyId").unwrap(), "ASIA456");
        assert_eq!(bag.get("SecretAccessKey").unwrap(), "shh");
        assert_eq!(bag.get("SessionToken").unwrap(), "tok");
    }

    #[test]
    fn session_names_carry_the_correlation_token() {
        let name = session_name("9f2c6a1e-0000-4000-8000-aaaaaaaaaaaa");
        assert!(name.starts_with("causeway-9f2c6a1e"));
        assert!(name.len() <= 64);
    }

    #[test]
    fn session_names_strip_forbidden_characters_and_bound_length() {
        let name = session_name("weird id!/with spaces");
        assert!(!name.contains(' '));
        assert!(!name.contains('!'));
        assert!(!name.contains('/'));

        let name = session_name(&"x".repeat(200));
        assert_eq!(name.len(), 64);

        let name = session_name("!!!");
        assert_eq!(name, "causeway-request");
    }
}
