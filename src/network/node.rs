use tracing::{debug, warn};

use crate::{
    common::{
        crypto::{signing_digest, SecretKey},
        error::{CertError, Result},
    },
    consensus::{
        message::{ReplicationRequest, SignatureVote},
        peers::ServerIdentityRecord,
        qc::LeaderCertificate,
    },
};

/// A server's own identity, private key included.
pub struct Node {
    pub identity: ServerIdentityRecord,
}

impl Node {
    pub fn new(mut identity: ServerIdentityRecord, secret: SecretKey) -> Self {
        identity.set_public_key(Some(secret.public_key()));
        identity.set_private_key(Some(secret));
        Node { identity }
    }

    pub fn id(&self) -> i32 {
        self.identity.id()
    }

    fn sign_digest(&self, term: u64, index: u64, payload: Option<&[u8]>) -> Result<SignatureVote> {
        let digest = signing_digest(term, index, payload);
        let signature = self.identity.sign(&digest).ok_or_else(|| {
            CertError::InvalidKey(format!("server {} has no private key", self.id()))
        })?;
        Ok(SignatureVote {
            server_id: self.id(),
            term,
            index,
            signature,
        })
    }

    /// Signs the tuple a leader certificate attests to.
    pub fn sign_certificate(&self, cert: &LeaderCertificate) -> Result<SignatureVote> {
        let request = cert.request();
        self.sign_digest(cert.term(), cert.index(), request.as_deref())
    }

    /// Signs the certificate attached to a replication request, using the
    /// carried log entry at the certificate's index as the payload.
    ///
    /// Returns `Ok(None)` when the request has no certificate, or when it
    /// is a message type a leader never sends.
    pub fn endorse_request(&self, req: &ReplicationRequest) -> Result<Option<SignatureVote>> {
        let Some(cert) = req.certificate() else {
            return Ok(None);
        };
        if !req.msg_type().is_leader_only() {
            warn!(
                server_id = self.id(),
                src = req.src(),
                msg_type = ?req.msg_type(),
                "certificate on a non-leader message ignored"
            );
            return Ok(None);
        }
        let (term, index) = (cert.term(), cert.index());

        let payload = match req.entry_at(index) {
            Some(entry) => Some(entry.payload()?.clone()),
            None => {
                warn!(
                    server_id = self.id(),
                    index,
                    first = req.last_log_idx().saturating_add(1),
                    entries = req.log_entries().len(),
                    "certified index not carried by request, signing without payload"
                );
                None
            }
        };

        let vote = self.sign_digest(term, index, payload.as_deref())?;
        debug!(server_id = self.id(), term, index, "endorsed certificate");
        Ok(Some(vote))
    }
}
