//! Identities, mappings, and credential bags
//!
//! An [`Identity`] names a principal inside one cloud provider; an
//! [`IdentityMapping`] is an administrator-granted assertion that the holder
//! of the source identity may obtain credentials for the target identity.
//! Credentials travel through the pipeline as an opaque JSON object and are
//! decoded into provider-specific types only at the verifier/minter boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Opaque provider-shaped bag of credential material
pub type CredentialBag = serde_json::Map<String, serde_json::Value>;

/// Supported cloud providers
///
/// `Azr` is reserved: it parses on the wire but has no registered capability.
/// Anything else collapses to `Unknown`, which verifies to false and mints to
/// a provider-unsupported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Google Cloud Platform
    Gcp,
    /// Kubernetes cluster service accounts
    K8s,
    /// Microsoft Azure (reserved, not yet operational)
    Azr,
    /// Any unrecognized or absent provider tag
    #[default]
    #[serde(other)]
    Unknown,
}

impl CloudProvider {
    /// The lowercase wire form of this provider tag
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
            CloudProvider::K8s => "k8s",
            CloudProvider::Azr => "azr",
            CloudProvider::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single provider-scoped identity
///
/// `id` is the stable principal name in the provider's own vocabulary: an AWS
/// role/user ARN, a GCP service-account email, or a Kubernetes
/// `system:serviceaccount:<ns>:<sa>` string. `region` only matters for AWS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Provider-scoped principal name
    #[serde(default)]
    pub id: String,
    /// Which cloud this identity lives in
    #[serde(default)]
    pub provider: CloudProvider,
    /// Provider-scoped locality (AWS region; ignored elsewhere)
    #[serde(default)]
    pub region: String,
    /// Opaque credential material, shaped per provider
    #[serde(default)]
    pub credentials: CredentialBag,
    /// Request correlation token; never read from the wire or policy files
    #[serde(skip)]
    pub request_id: String,
}

/// A source -> target identity mapping
///
/// On the wire this is the request body; in policy files it is one record of
/// the administrator-maintained grant set. Stored source credential bags are
/// irrelevant (identities match by provider + id); stored target bags act as
/// a locator the minter understands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// The identity the caller already holds credentials for
    #[serde(default)]
    pub source: Identity,
    /// The identity the caller wishes to obtain credentials for
    #[serde(default)]
    pub target: Identity,
    /// Request correlation token; never read from the wire or policy files
    #[serde(skip)]
    pub request_id: String,
}

impl IdentityMapping {
    /// Stamp the correlation token onto the mapping and both identities
    pub fn correlate(&mut self, request_id: &str) {
        self.request_id = request_id.to_string();
        self.source.request_id = request_id.to_string();
        self.target.request_id = request_id.to_string();
    }

    /// Whether this mapping grants the assumption the request asks for
    ///
    /// All four of source provider/id and target provider/id must match.
    pub fn permits(&self, request: &IdentityMapping) -> bool {
        self.source.provider == request.source.provider
            && self.source.id == request.source.id
            && self.target.provider == request.target.provider
            && self.target.id == request.target.id
    }
}

/// Decode a credential bag into a provider-specific credential type
pub fn decode_bag<T: DeserializeOwned>(bag: &CredentialBag) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(bag.clone()))
        .map_err(|e| Error::malformed(format!("credential bag: {e}")))
}

/// Encode a provider-specific credential type back into an opaque bag
pub fn encode_bag<T: Serialize>(value: &T) -> Result<CredentialBag> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::internal("credentials did not serialize to an object")),
        Err(e) => Err(Error::internal(format!("credential encoding: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(provider: CloudProvider, id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            provider,
            ..Default::default()
        }
    }

    fn mapping(
        source_provider: CloudProvider,
        source: &str,
        target_provider: CloudProvider,
        target: &str,
    ) -> IdentityMapping {
        IdentityMapping {
            source: identity(source_provider, source),
            target: identity(target_provider, target),
            request_id: String::new(),
        }
    }

    #[test]
    fn provider_tags_parse_lowercase() {
        let p: CloudProvider = serde_json::from_str(r#""aws""#).unwrap();
        assert_eq!(p, CloudProvider::Aws);
        let p: CloudProvider = serde_json::from_str(r#""k8s""#).unwrap();
        assert_eq!(p, CloudProvider::K8s);
        let p: CloudProvider = serde_json::from_str(r#""azr""#).unwrap();
        assert_eq!(p, CloudProvider::Azr);
    }

    #[test]
    fn unrecognized_provider_tags_collapse_to_unknown() {
        let p: CloudProvider = serde_json::from_str(r#""digitalocean""#).unwrap();
        assert_eq!(p, CloudProvider::Unknown);
        let p: CloudProvider = serde_json::from_str(r#""""#).unwrap();
        assert_eq!(p, CloudProvider::Unknown);
    }

    #[test]
    fn missing_provider_defaults_to_unknown() {
        let id: Identity = serde_json::from_str(r#"{"id": "someone"}"#).unwrap();
        assert_eq!(id.provider, CloudProvider::Unknown);
    }

    #[test]
    fn request_id_is_never_read_from_the_wire() {
        let m: IdentityMapping = serde_json::from_str(
            r#"{"source": {"id": "a"}, "target": {"id": "b"}, "request_id": "spoofed"}"#,
        )
        .unwrap();
        assert!(m.request_id.is_empty());
        assert!(m.source.request_id.is_empty());
    }

    #[test]
    fn correlate_stamps_all_three_tokens() {
        let mut m = mapping(CloudProvider::Aws, "a", CloudProvider::Gcp, "b");
        m.correlate("req-1");
        assert_eq!(m.request_id, "req-1");
        assert_eq!(m.source.request_id, "req-1");
        assert_eq!(m.target.request_id, "req-1");
    }

    #[test]
    fn permits_requires_all_four_fields() {
        let grant = mapping(
            CloudProvider::Aws,
            "arn:aws:iam::111:user/alice",
            CloudProvider::Aws,
            "arn:aws:iam::222:role/read",
        );

        let mut request = grant.clone();
        assert!(grant.permits(&request));

        request.source.id = "arn:aws:iam::111:user/eve".to_string();
        assert!(!grant.permits(&request));

        let mut request = grant.clone();
        request.target.provider = CloudProvider::Gcp;
        assert!(!grant.permits(&request));

        let mut request = grant.clone();
        request.target.id = "arn:aws:iam::222:role/write".to_string();
        assert!(!grant.permits(&request));
    }

    #[test]
    fn permits_ignores_credential_bags_and_region() {
        let grant = mapping(CloudProvider::Aws, "a", CloudProvider::Aws, "b");
        let mut request = grant.clone();
        request.source.region = "us-east-1".to_string();
        request
            .source
            .credentials
            .insert("AccessKeyId".into(), "AKIA".into());
        assert!(grant.permits(&request));
    }

    #[test]
    fn bag_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Keys {
            #[serde(rename = "AccessKeyId")]
            access_key_id: String,
        }

        let keys = Keys {
            access_key_id: "AKIA123".to_string(),
        };
        let bag = encode_bag(&keys).unwrap();
        assert_eq!(bag.get("AccessKeyId").unwrap(), "AKIA123");

        let decoded: Keys = decode_bag(&bag).unwrap();
        assert_eq!(decoded, keys);
    }
}
