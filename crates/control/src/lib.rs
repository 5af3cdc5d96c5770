//! Bastion control plane.
//!
//! Manages the lifecycle of the server certificates the proxy presents:
//! manual imports, certificates issued by a private authority, and
//! ACME-renewed certificates, plus the machinery those flows need:
//!
//! - [`acme`] - ACME v2 protocol client (RFC 8555): JWS signing, nonce and
//!   rate-limit handling, the order/authorization/challenge state machine
//! - [`certs`] - decoded-certificate cache, SNI selection, renewal loop
//! - [`dns`] - operator-scripted DNS providers for DNS-01 challenges
//! - [`blob`] - opaque key→bytes storage for key and chain material
//! - [`settings`] - bootstrap configuration for the `bastion` binary
//!
//! The forwarding data plane is a separate concern; this crate only decides
//! *which* certificate serves *which* hostname and keeps that set current.

pub mod acme;
pub mod blob;
pub mod certs;
pub mod dns;
pub mod settings;

pub use acme::{AcmeClient, AcmeError, ChallengeMap};
pub use blob::{BlobStore, FsBlobStore};
pub use certs::CertificateManager;
pub use dns::{DnsProvider, LuaCompiler, ProviderCompiler, ProviderRegistry};
