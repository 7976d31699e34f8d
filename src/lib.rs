//! Causeway - cross-cloud identity broker
//!
//! Causeway lets a workload that has already authenticated to one cloud
//! provider trade that proof for short-lived credentials of an identity in a
//! possibly different cloud. The caller presents its own (source) credentials;
//! the broker independently verifies them against the source cloud's
//! authority, checks an administrator-maintained mapping set for an explicit
//! source -> target grant, and only then materializes target credentials by
//! assuming a role or unsealing a stored key from the secret store.
//!
//! # Request flow
//!
//! 1. `POST /` with an identity mapping body (source + desired target)
//! 2. The verifier chosen by `source.provider` proves the caller controls the
//!    claimed identity (STS GetCallerIdentity, GCP key possession, Kubernetes
//!    TokenReview)
//! 3. The current policy snapshot is consulted for a matching mapping
//! 4. The minter chosen by `target.provider` produces the outbound
//!    credentials, consulting the secret store where needed
//!
//! # Modules
//!
//! - [`identity`] - Provider tags, identities, mappings, credential bags
//! - [`provider`] - The per-cloud verify/mint capability and its registry
//! - [`policy`] - Mapping snapshot store, file/git loading, background refresh
//! - [`vault`] - Secret store adapter with single-retry re-authentication
//! - [`server`] - The HTTP broker pipeline
//! - [`error`] - Error taxonomy and HTTP status mapping

#![deny(missing_docs)]

pub mod error;
pub mod identity;
pub mod policy;
pub mod provider;
pub mod server;
pub mod vault;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
