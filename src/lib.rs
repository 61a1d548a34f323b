//! Quorum certificates for a Raft-style replicated log.
//!
//! A leader wraps a proposed entry in a [`LeaderCertificate`], followers sign
//! the certificate's (term, index, payload) tuple with their ed25519 key, and
//! the leader records signatures until the quorum threshold holds. The
//! finished certificate is stored next to its [`LogRecord`] so it can be
//! re-verified later against each signer's [`ServerIdentityRecord`].

pub mod common;
pub mod consensus;
pub mod network;

pub use common::{CertError, Result};
pub use consensus::{
    LeaderCertificate, LogRecord, LogValueType, QuorumCertificate, ReplicationRequest,
    ServerIdentityRecord,
};
