use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

use super::{
    message::SignatureVote,
    peers::Peers,
    qc::{LeaderCertificate, QuorumProgress},
};
use crate::common::crypto::Digest;

/*
    Leader-side signature gathering. Votes arrive from the connection
    handlers over a channel; the collector owns the certificate, so every
    insertion happens on one task. Whether a follower should have signed
    at all is decided elsewhere. This only checks that a vote is for this
    certificate and verifies under the voter's registered key.
*/

pub struct SignatureCollector {
    certificate: LeaderCertificate,
    peers: Peers,
    vote_rx: Receiver<SignatureVote>,
}

impl SignatureCollector {
    pub fn new(
        certificate: LeaderCertificate,
        peers: Peers,
        vote_rx: Receiver<SignatureVote>,
    ) -> Self {
        SignatureCollector {
            certificate,
            peers,
            vote_rx,
        }
    }

    /// Runs until the certificate reaches quorum or every sender is gone.
    pub async fn run(mut self) -> Option<LeaderCertificate> {
        let digest = self.certificate.signing_digest();
        info!(
            term = self.certificate.term(),
            index = self.certificate.index(),
            num_servers = self.certificate.certificate().num_servers(),
            "collecting signatures"
        );

        while let Some(vote) = self.vote_rx.recv().await {
            if !self.accept(&vote, &digest) {
                continue;
            }
            match self.certificate.record(vote.server_id, vote.signature) {
                QuorumProgress::Reached => {
                    info!(
                        term = self.certificate.term(),
                        index = self.certificate.index(),
                        signatures = self.certificate.certificate().signature_count(),
                        "certificate reached quorum"
                    );
                    return Some(self.certificate);
                }
                progress => {
                    debug!(server_id = vote.server_id, ?progress, "signature recorded");
                }
            }
        }

        warn!(
            term = self.certificate.term(),
            index = self.certificate.index(),
            signatures = self.certificate.certificate().signature_count(),
            "vote channel closed before quorum"
        );
        None
    }

    fn accept(&self, vote: &SignatureVote, digest: &Digest) -> bool {
        if vote.term != self.certificate.term() || vote.index != self.certificate.index() {
            warn!(
                server_id = vote.server_id,
                vote_term = vote.term,
                vote_index = vote.index,
                "vote for another log position"
            );
            return false;
        }

        let Some(member) = self.peers.get(vote.server_id) else {
            warn!(server_id = vote.server_id, "vote not from peers");
            return false;
        };
        if member.is_learner() {
            warn!(server_id = vote.server_id, "vote from learner ignored");
            return false;
        }

        match member.public_key() {
            Some(key) if key.verify(digest, &vote.signature) => true,
            Some(_) => {
                warn!(server_id = vote.server_id, "vote signature verification failed");
                false
            }
            None => {
                warn!(server_id = vote.server_id, "no public key bound to voter");
                false
            }
        }
    }
}
