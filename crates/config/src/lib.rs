//! Bastion configuration engine.
//!
//! Owns the versioned configuration that determines which certificate serves
//! which hostname, and the deployment-style workflow that promotes an edited
//! candidate revision to the running one:
//!
//! - **Model**: revision rows, SNI bindings, certificate and account records
//! - **HostTrie**: immutable reversed-label trie for wildcard SNI matching
//! - **RunningSnapshot**: the materialized projection serving traffic
//! - **Repositories**: async traits over the persistence collaborator
//! - **RevisionManager**: candidate → commit → confirm/rollback state machine
//!
//! Revisions follow a strict lifecycle. Exactly one committed and unreverted
//! revision is *running* and exactly one uncommitted, unreverted revision is
//! the *candidate* at any observable instant. A commit opens a confirm window;
//! if the administrator never confirms, the commit is automatically rolled
//! back to the previous good revision.

pub mod error;
pub mod host_trie;
pub mod manager;
pub mod model;
pub mod snapshot;
pub mod store;

pub use error::{RevisionError, StoreError};
pub use host_trie::HostTrie;
pub use manager::RevisionManager;
pub use model::{
    AcmeAccount, AcmeHost, AdminSettings, CertKind, CertificateBindings, CertificateRecord,
    ChallengeKind, ClusterConfig, ConfigRevision, RouteConfig, SniBinding, Topology,
};
pub use snapshot::RunningSnapshot;
pub use store::{AccountRepository, CertificateRepository, MemoryStore, RevisionStore};
