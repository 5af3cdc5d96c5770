//! Certificate lifecycle management.
//!
//! [`material`] decodes blob-store bytes into usable certificate material;
//! [`store`] owns the concurrent decoded-certificate cache, SNI selection,
//! and the ACME renewal loop.

pub mod material;
pub mod store;

pub use material::{cert_issues, CertIssue, CertificateMaterial, MaterialError};
pub use store::{CertError, CertificateManager, RenewalOutcome};
