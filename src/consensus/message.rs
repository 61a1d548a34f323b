use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{log_record::LogRecord, qc::QuorumCertificate};
use crate::common::{
    codec::{get_i32, get_u64, get_u8, SZ_I32, SZ_U64, SZ_U8},
    error::{CertError, Result},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MsgType {
    RequestVoteRequest = 1,
    RequestVoteResponse = 2,
    AppendEntriesRequest = 3,
    AppendEntriesResponse = 4,
    ClientRequest = 5,
    AddServerRequest = 6,
    AddServerResponse = 7,
    RemoveServerRequest = 8,
    RemoveServerResponse = 9,
    SyncLogRequest = 10,
    SyncLogResponse = 11,
    JoinClusterRequest = 12,
    JoinClusterResponse = 13,
    LeaveClusterRequest = 14,
    LeaveClusterResponse = 15,
    InstallSnapshotRequest = 16,
    InstallSnapshotResponse = 17,
    PingRequest = 18,
    PingResponse = 19,
    PreVoteRequest = 20,
    PreVoteResponse = 21,
    OtherRequest = 22,
    OtherResponse = 23,
    PriorityChangeRequest = 24,
    PriorityChangeResponse = 25,
    ReconnectRequest = 26,
    ReconnectResponse = 27,
    CustomNotificationRequest = 28,
    CustomNotificationResponse = 29,
}

impl MsgType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Message types only a leader sends.
    pub fn is_leader_only(self) -> bool {
        matches!(
            self,
            MsgType::AppendEntriesRequest
                | MsgType::SyncLogRequest
                | MsgType::JoinClusterRequest
                | MsgType::LeaveClusterRequest
                | MsgType::InstallSnapshotRequest
                | MsgType::PriorityChangeRequest
                | MsgType::CustomNotificationRequest
        )
    }
}

impl TryFrom<u8> for MsgType {
    type Error = CertError;

    fn try_from(value: u8) -> Result<Self> {
        use MsgType::*;
        let msg_type = match value {
            1 => RequestVoteRequest,
            2 => RequestVoteResponse,
            3 => AppendEntriesRequest,
            4 => AppendEntriesResponse,
            5 => ClientRequest,
            6 => AddServerRequest,
            7 => AddServerResponse,
            8 => RemoveServerRequest,
            9 => RemoveServerResponse,
            10 => SyncLogRequest,
            11 => SyncLogResponse,
            12 => JoinClusterRequest,
            13 => JoinClusterResponse,
            14 => LeaveClusterRequest,
            15 => LeaveClusterResponse,
            16 => InstallSnapshotRequest,
            17 => InstallSnapshotResponse,
            18 => PingRequest,
            19 => PingResponse,
            20 => PreVoteRequest,
            21 => PreVoteResponse,
            22 => OtherRequest,
            23 => OtherResponse,
            24 => PriorityChangeRequest,
            25 => PriorityChangeResponse,
            26 => ReconnectRequest,
            27 => ReconnectResponse,
            28 => CustomNotificationRequest,
            29 => CustomNotificationResponse,
            other => return Err(CertError::UnknownMsgType(other)),
        };
        Ok(msg_type)
    }
}

pub const REQUEST_HEADER_SIZE: usize = SZ_U64 * 4 + SZ_U8 + SZ_I32;

/// Append/heartbeat request from the replication leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    term: u64,
    msg_type: MsgType,
    src: i32,
    dst: i32,
    last_log_term: u64,
    last_log_idx: u64,
    commit_idx: u64,
    log_entries: Vec<LogRecord>,
    certificate: Option<QuorumCertificate>,
}

impl ReplicationRequest {
    pub fn new(
        term: u64,
        msg_type: MsgType,
        src: i32,
        dst: i32,
        last_log_term: u64,
        last_log_idx: u64,
        commit_idx: u64,
    ) -> Self {
        ReplicationRequest {
            term,
            msg_type,
            src,
            dst,
            last_log_term,
            last_log_idx,
            commit_idx,
            log_entries: Vec::new(),
            certificate: None,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn src(&self) -> i32 {
        self.src
    }

    pub fn dst(&self) -> i32 {
        self.dst
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }

    /// Entries in this request start at `last_log_idx + 1`.
    pub fn last_log_idx(&self) -> u64 {
        self.last_log_idx
    }

    pub fn commit_idx(&self) -> u64 {
        self.commit_idx
    }

    pub fn log_entries(&self) -> &[LogRecord] {
        &self.log_entries
    }

    pub fn push_entry(&mut self, entry: LogRecord) {
        self.log_entries.push(entry);
    }

    /// The entry carried for log index `index`, if this request has it.
    pub fn entry_at(&self, index: u64) -> Option<&LogRecord> {
        let offset = index.checked_sub(self.last_log_idx.checked_add(1)?)?;
        self.log_entries.get(usize::try_from(offset).ok()?)
    }

    pub fn set_certificate(&mut self, certificate: Option<QuorumCertificate>) {
        self.certificate = certificate;
    }

    pub fn certificate(&self) -> Option<&QuorumCertificate> {
        self.certificate.as_ref()
    }

    /// Header-only encoding.
    ///
    /// Log entries and the certificate are not part of this form and the
    /// destination id is not written either. They travel in the RPC frame
    /// (`network::frame`), which is the only encoding that round-trips a
    /// whole request.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
        buf.put_u64_le(self.last_log_term);
        buf.put_u64_le(self.last_log_idx);
        buf.put_u64_le(self.commit_idx);
        buf.put_u64_le(self.term);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_i32_le(self.src);
        buf.freeze()
    }

    /// Inverse of [`serialize`](Self::serialize). `dst` comes back as 0.
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let last_log_term = get_u64(buf, "last log term")?;
        let last_log_idx = get_u64(buf, "last log index")?;
        let commit_idx = get_u64(buf, "commit index")?;
        let term = get_u64(buf, "request term")?;
        let msg_type = MsgType::try_from(get_u8(buf, "message type")?)?;
        let src = get_i32(buf, "source id")?;
        Ok(ReplicationRequest::new(
            term,
            msg_type,
            src,
            0,
            last_log_term,
            last_log_idx,
            commit_idx,
        ))
    }
}

/// A follower's signature over a certificate's (term, index, payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureVote {
    pub server_id: i32,
    pub term: u64,
    pub index: u64,
    pub signature: Bytes,
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::consensus::log_record::LogValueType;

    fn request() -> ReplicationRequest {
        ReplicationRequest::new(5, MsgType::AppendEntriesRequest, 1, 2, 4, 99, 97)
    }

    #[test]
    fn test_header_round_trip() {
        let req = request();
        let bytes = req.serialize();
        assert_eq!(bytes.len(), REQUEST_HEADER_SIZE);

        let decoded = ReplicationRequest::deserialize(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(decoded.term(), 5);
        assert_eq!(decoded.msg_type(), MsgType::AppendEntriesRequest);
        assert_eq!(decoded.src(), 1);
        assert_eq!(decoded.dst(), 0);
        assert_eq!(decoded.last_log_term(), 4);
        assert_eq!(decoded.last_log_idx(), 99);
        assert_eq!(decoded.commit_idx(), 97);
    }

    #[test]
    fn test_header_form_drops_entries_and_certificate() {
        let mut req = request();
        req.push_entry(LogRecord::new(
            5,
            Some(Bytes::from_static(b"x")),
            LogValueType::AppLog,
        ));
        req.set_certificate(Some(QuorumCertificate::new(3, 5, 100)));

        let bytes = req.serialize();
        assert_eq!(bytes, request().serialize());

        let decoded = ReplicationRequest::deserialize(&mut Cursor::new(&bytes[..])).unwrap();
        assert!(decoded.log_entries().is_empty());
        assert!(decoded.certificate().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = request().serialize().to_vec();
        bytes[32] = 200;
        assert!(matches!(
            ReplicationRequest::deserialize(&mut Cursor::new(&bytes[..])),
            Err(CertError::UnknownMsgType(200))
        ));
    }

    #[test]
    fn test_entry_at_maps_log_index() {
        let mut req = request();
        for term in 0..3 {
            req.push_entry(LogRecord::new(
                term,
                Some(Bytes::from(vec![term as u8])),
                LogValueType::AppLog,
            ));
        }
        assert!(req.entry_at(99).is_none());
        assert_eq!(req.entry_at(100).unwrap().term(), 0);
        assert_eq!(req.entry_at(102).unwrap().term(), 2);
        assert!(req.entry_at(103).is_none());
    }

    #[test]
    fn test_msg_type_bytes() {
        for raw in 1u8..=29 {
            assert_eq!(MsgType::try_from(raw).unwrap().as_u8(), raw);
        }
        assert!(MsgType::try_from(0).is_err());
        assert!(MsgType::AppendEntriesRequest.is_leader_only());
        assert!(!MsgType::ClientRequest.is_leader_only());
    }
}
