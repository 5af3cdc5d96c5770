//! ACME v2 protocol client (RFC 8555).
//!
//! Issues and renews certificates against any conforming provider.
//!
//! # Components
//!
//! - [`AcmeClient`] - accounts, orders, the authorization/challenge flow
//! - [`AccountKey`] - ECDSA P-256 JWS signing and JWK thumbprints
//! - [`ChallengeMap`] - pending HTTP-01 challenges for the HTTP layer
//! - [`wire`] - the RFC 8555 resource model
//!
//! # Issuance flow
//!
//! 1. [`AcmeClient`] places an order for the certificate's hosts
//! 2. Each authorization is matched to a configured host and its challenge
//!    strategy (HTTP-01 or DNS-01)
//! 3. The challenge side effect is executed: a pending entry in the
//!    [`ChallengeMap`], or a TXT record through a scripted DNS provider
//! 4. Acceptance is submitted and the authorization polled to `valid`
//! 5. A CSR covering exactly the order's identifiers finalizes the order
//! 6. The PEM chain is downloaded and combined with the generated key

pub mod client;
pub mod error;
pub mod http01;
pub mod jws;
pub mod wire;

pub use client::{AcmeClient, ProviderConfig};
pub use error::{AcmeError, AcmeProblem};
pub use http01::{ChallengeMap, ServedChallenge, ACME_CHALLENGE_PREFIX};
pub use jws::AccountKey;
