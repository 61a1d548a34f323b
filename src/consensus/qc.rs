use std::{collections::HashMap, fmt, ptr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::peers::Peers;
use crate::common::{
    codec::{get_bytes, get_i32, get_len_i32, get_len_i64, get_u64, SZ_I32, SZ_U64},
    crypto::{signing_digest, Digest},
    error::Result,
};

/*
    A quorum certificate collects per-server signatures over one
    (term, index) log position. It is final once more than
    num_servers / quorum_ratio_reciprocal distinct servers have signed,
    or once every server has signed when the reciprocal is 1.

    The reciprocal is not part of the wire format. Deserialized
    certificates assume a strict majority unless told otherwise.
*/

pub const DEFAULT_QUORUM_RATIO_RECIPROCAL: i32 = 2;

const CERT_HEADER_SIZE: usize = SZ_I32 + SZ_U64 + SZ_U64 + SZ_I32;

/// Result of recording one signature.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QuorumProgress {
    Pending,
    /// This signature moved the certificate across the threshold.
    Reached,
    AlreadyReached,
}

impl QuorumProgress {
    pub fn is_reached(self) -> bool {
        !matches!(self, QuorumProgress::Pending)
    }
}

/// Outcome of checking stored signatures against known public keys.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VerifyReport {
    pub verified: Vec<i32>,
    pub unknown_signers: Vec<i32>,
    /// Signers registered only as learners. Never counted toward quorum.
    pub learners: Vec<i32>,
    pub invalid: Vec<i32>,
    pub quorum: bool,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.quorum
            && self.unknown_signers.is_empty()
            && self.learners.is_empty()
            && self.invalid.is_empty()
    }
}

struct CertState {
    term: u64,
    signatures: HashMap<i32, Bytes>,
}

pub struct QuorumCertificate {
    num_servers: i32,
    index: u64,
    quorum_ratio_reciprocal: i32,
    state: Mutex<CertState>,
}

impl QuorumCertificate {
    pub fn new(num_servers: i32, term: u64, index: u64) -> Self {
        QuorumCertificate {
            num_servers,
            index,
            quorum_ratio_reciprocal: DEFAULT_QUORUM_RATIO_RECIPROCAL,
            state: Mutex::new(CertState {
                term,
                signatures: HashMap::new(),
            }),
        }
    }

    pub fn with_quorum_ratio(mut self, quorum_ratio_reciprocal: i32) -> Self {
        self.quorum_ratio_reciprocal = quorum_ratio_reciprocal;
        self
    }

    pub fn num_servers(&self) -> i32 {
        self.num_servers
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn quorum_ratio_reciprocal(&self) -> i32 {
        self.quorum_ratio_reciprocal
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn set_term(&self, term: u64) {
        self.state.lock().term = term;
    }

    /// Stores `signature` for `server_id`, replacing any earlier one, and
    /// reports whether the quorum now holds.
    pub fn insert(&self, server_id: i32, signature: Bytes) -> bool {
        self.record(server_id, signature).is_reached()
    }

    /// Like [`insert`](Self::insert) but tells the caller whether this call
    /// was the one that crossed the threshold.
    pub fn record(&self, server_id: i32, signature: Bytes) -> QuorumProgress {
        let mut state = self.state.lock();
        let before = self.quorum_reached(state.signatures.len());
        state.signatures.insert(server_id, signature);
        let after = self.quorum_reached(state.signatures.len());

        match (before, after) {
            (false, true) => {
                debug!(
                    term = state.term,
                    index = self.index,
                    server_id,
                    signatures = state.signatures.len(),
                    "quorum reached"
                );
                QuorumProgress::Reached
            }
            (true, _) => QuorumProgress::AlreadyReached,
            _ => QuorumProgress::Pending,
        }
    }

    /// Drops every signature. Size, term and index are kept.
    pub fn clear(&self) {
        self.state.lock().signatures.clear();
    }

    pub fn has_quorum(&self) -> bool {
        let state = self.state.lock();
        self.quorum_reached(state.signatures.len())
    }

    pub fn signature_count(&self) -> usize {
        self.state.lock().signatures.len()
    }

    pub fn signature(&self, server_id: i32) -> Option<Bytes> {
        self.state
            .lock()
            .signatures
            .get(&server_id)
            .map(|sig| Bytes::copy_from_slice(sig))
    }

    /// Owned copy of the current signature set.
    pub fn signatures(&self) -> HashMap<i32, Bytes> {
        let state = self.state.lock();
        Self::copy_signatures(&state)
    }

    fn quorum_reached(&self, count: usize) -> bool {
        let count = count as i64;
        let num_servers = self.num_servers as i64;
        if self.quorum_ratio_reciprocal == 1 {
            count == num_servers
        } else {
            self.quorum_ratio_reciprocal as i64 * count > num_servers
        }
    }

    fn copy_signatures(state: &CertState) -> HashMap<i32, Bytes> {
        state
            .signatures
            .iter()
            .map(|(id, sig)| (*id, Bytes::copy_from_slice(sig)))
            .collect()
    }

    fn snapshot(&self) -> CertState {
        let state = self.state.lock();
        CertState {
            term: state.term,
            signatures: Self::copy_signatures(&state),
        }
    }

    pub fn serialize(&self) -> Bytes {
        self.serialize_with_tail(0).freeze()
    }

    /// Encodes the certificate into a buffer with `tail` spare bytes reserved
    /// after it. The returned buffer's write position sits right after the
    /// certificate fields so a wrapper can append its own.
    pub fn serialize_with_tail(&self, tail: usize) -> BytesMut {
        let state = self.state.lock();
        let mut buf = BytesMut::with_capacity(Self::encoded_len_locked(&state) + tail);
        self.write_locked(&state, &mut buf);
        buf
    }

    fn encoded_len_locked(state: &MutexGuard<'_, CertState>) -> usize {
        CERT_HEADER_SIZE
            + state
                .signatures
                .values()
                .map(|sig| SZ_I32 + SZ_U64 + sig.len())
                .sum::<usize>()
    }

    fn write_locked(&self, state: &MutexGuard<'_, CertState>, buf: &mut BytesMut) {
        buf.put_i32_le(self.num_servers);
        buf.put_u64_le(state.term);
        buf.put_u64_le(self.index);
        buf.put_i32_le(state.signatures.len() as i32);

        // Stable order keeps the encoding deterministic.
        let mut ids: Vec<&i32> = state.signatures.keys().collect();
        ids.sort();
        for id in ids {
            let sig = &state.signatures[id];
            buf.put_i32_le(*id);
            buf.put_i64_le(sig.len() as i64);
            buf.put_slice(sig);
        }
    }

    /// Reads the header and exactly `sig_count` signatures. `num_servers` is
    /// taken as written; matching it against the live cluster is up to the
    /// caller.
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let num_servers = get_i32(buf, "certificate num_servers")?;
        let term = get_u64(buf, "certificate term")?;
        let index = get_u64(buf, "certificate index")?;
        let sig_count = get_len_i32(buf, "certificate signature count")?;

        let mut signatures = HashMap::with_capacity(sig_count.min(1024));
        for _ in 0..sig_count {
            let id = get_i32(buf, "signature server id")?;
            let len = get_len_i64(buf, "signature length")?;
            let sig = get_bytes(buf, len, "signature bytes")?;
            signatures.insert(id, sig);
        }

        Ok(QuorumCertificate {
            num_servers,
            index,
            quorum_ratio_reciprocal: DEFAULT_QUORUM_RATIO_RECIPROCAL,
            state: Mutex::new(CertState { term, signatures }),
        })
    }

    /// Checks every stored signature over `message` against the signer's
    /// public key in `peers`.
    pub fn verify(&self, message: &[u8], peers: &Peers) -> VerifyReport {
        let snapshot = self.snapshot();
        let mut ids: Vec<i32> = snapshot.signatures.keys().copied().collect();
        ids.sort_unstable();

        let mut report = VerifyReport::default();
        for id in ids {
            let sig = &snapshot.signatures[&id];
            let Some(member) = peers.get(id) else {
                report.unknown_signers.push(id);
                continue;
            };
            if member.is_learner() {
                report.learners.push(id);
                continue;
            }
            match member.public_key() {
                None => report.unknown_signers.push(id),
                Some(key) if key.verify(message, sig) => report.verified.push(id),
                Some(_) => report.invalid.push(id),
            }
        }
        report.quorum = self.quorum_reached(report.verified.len());
        report
    }
}

impl Clone for QuorumCertificate {
    /// Deep copy. The clone shares no signature buffers with the original.
    fn clone(&self) -> Self {
        QuorumCertificate {
            num_servers: self.num_servers,
            index: self.index,
            quorum_ratio_reciprocal: self.quorum_ratio_reciprocal,
            state: Mutex::new(self.snapshot()),
        }
    }
}

impl PartialEq for QuorumCertificate {
    fn eq(&self, other: &Self) -> bool {
        if ptr::eq(self, other) {
            return true;
        }
        if self.num_servers != other.num_servers
            || self.index != other.index
            || self.quorum_ratio_reciprocal != other.quorum_ratio_reciprocal
        {
            return false;
        }
        // Never hold both locks at once.
        let ours = self.snapshot();
        let theirs = other.snapshot();
        ours.term == theirs.term && ours.signatures == theirs.signatures
    }
}

impl Eq for QuorumCertificate {}

impl fmt::Debug for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.snapshot();
        let mut signers: Vec<i32> = state.signatures.keys().copied().collect();
        signers.sort_unstable();
        f.debug_struct("QuorumCertificate")
            .field("num_servers", &self.num_servers)
            .field("term", &state.term)
            .field("index", &self.index)
            .field("quorum_ratio_reciprocal", &self.quorum_ratio_reciprocal)
            .field("signers", &signers)
            .finish()
    }
}

// An empty request has no wire form distinct from an absent one.
fn owned_request(request: Option<&[u8]>) -> Option<Bytes> {
    request.filter(|r| !r.is_empty()).map(Bytes::copy_from_slice)
}

/// A quorum certificate that also owns the request payload being certified.
#[derive(PartialEq, Eq, Debug)]
pub struct LeaderCertificate {
    cert: QuorumCertificate,
    request: Option<Bytes>,
}

impl LeaderCertificate {
    /// The request is copied; later changes to the caller's buffer do not
    /// reach the certificate.
    pub fn new(num_servers: i32, term: u64, index: u64, request: Option<&[u8]>) -> Self {
        LeaderCertificate {
            cert: QuorumCertificate::new(num_servers, term, index),
            request: owned_request(request),
        }
    }

    pub fn with_quorum_ratio(mut self, quorum_ratio_reciprocal: i32) -> Self {
        self.cert = self.cert.with_quorum_ratio(quorum_ratio_reciprocal);
        self
    }

    pub fn certificate(&self) -> &QuorumCertificate {
        &self.cert
    }

    /// Each call hands back a fresh view starting at the first byte.
    pub fn request(&self) -> Option<Bytes> {
        self.request.clone()
    }

    pub fn set_request(&mut self, request: Option<&[u8]>) {
        self.request = owned_request(request);
    }

    pub fn term(&self) -> u64 {
        self.cert.term()
    }

    pub fn index(&self) -> u64 {
        self.cert.index()
    }

    pub fn insert(&self, server_id: i32, signature: Bytes) -> bool {
        self.cert.insert(server_id, signature)
    }

    pub fn record(&self, server_id: i32, signature: Bytes) -> QuorumProgress {
        self.cert.record(server_id, signature)
    }

    pub fn clear(&self) {
        self.cert.clear();
    }

    /// The digest followers sign for this certificate.
    pub fn signing_digest(&self) -> Digest {
        signing_digest(self.cert.term(), self.cert.index(), self.request.as_deref())
    }

    pub fn serialize(&self) -> Bytes {
        let req_len = self.request.as_ref().map_or(0, |req| req.len());
        let mut buf = self.cert.serialize_with_tail(SZ_U64 + req_len);
        buf.put_i64_le(req_len as i64);
        if let Some(req) = &self.request {
            buf.put_slice(req);
        }
        buf.freeze()
    }

    /// A zero request length decodes as "no request".
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let cert = QuorumCertificate::deserialize(buf)?;
        let req_len = get_len_i64(buf, "leader certificate request length")?;
        let request = if req_len == 0 {
            None
        } else {
            Some(get_bytes(buf, req_len, "leader certificate request")?)
        };
        Ok(LeaderCertificate { cert, request })
    }

    pub fn verify(&self, peers: &Peers) -> VerifyReport {
        self.cert.verify(&self.signing_digest(), peers)
    }
}

impl Clone for LeaderCertificate {
    fn clone(&self) -> Self {
        LeaderCertificate {
            cert: self.cert.clone(),
            request: self.request.as_deref().map(Bytes::copy_from_slice),
        }
    }
}
