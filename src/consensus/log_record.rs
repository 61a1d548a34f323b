use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::common::{
    codec::{get_u64, SZ_I32, SZ_U64, SZ_U8},
    error::{CertError, Result},
};

/// Type tag carried by every log record. Only the low byte is written.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogValueType {
    AppLog,
    Conf,
    ClusterServer,
    LogPack,
    SnapshotSyncRequest,
    Custom,
    HashPointer,
    LeaderSignature,
    PublicKey,
    LeaderCertificate,
    CommitCertificate,
    Unknown(u8),
}

const CUSTOM_TAG: u16 = 999;

impl LogValueType {
    pub fn as_u8(self) -> u8 {
        match self {
            LogValueType::AppLog => 1,
            LogValueType::Conf => 2,
            LogValueType::ClusterServer => 3,
            LogValueType::LogPack => 4,
            LogValueType::SnapshotSyncRequest => 5,
            LogValueType::Custom => (CUSTOM_TAG & 0xff) as u8,
            LogValueType::HashPointer => 11,
            LogValueType::LeaderSignature => 12,
            LogValueType::PublicKey => 13,
            LogValueType::LeaderCertificate => 21,
            LogValueType::CommitCertificate => 22,
            LogValueType::Unknown(raw) => raw,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LogValueType::AppLog,
            2 => LogValueType::Conf,
            3 => LogValueType::ClusterServer,
            4 => LogValueType::LogPack,
            5 => LogValueType::SnapshotSyncRequest,
            11 => LogValueType::HashPointer,
            12 => LogValueType::LeaderSignature,
            13 => LogValueType::PublicKey,
            21 => LogValueType::LeaderCertificate,
            22 => LogValueType::CommitCertificate,
            v if v == (CUSTOM_TAG & 0xff) as u8 => LogValueType::Custom,
            other => LogValueType::Unknown(other),
        }
    }
}

/// One replicated log entry.
///
/// Wire form: `u64 term | u8 type | [u64 timestamp_us] | i32 len | payload`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LogRecord {
    term: u64,
    value_type: LogValueType,
    payload: Option<Bytes>,
    timestamp_us: u64,
}

impl LogRecord {
    pub fn new(term: u64, payload: Option<Bytes>, value_type: LogValueType) -> Self {
        LogRecord {
            term,
            value_type,
            payload,
            timestamp_us: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub const fn header_size(include_timestamp: bool) -> usize {
        let base = SZ_U64 + SZ_U8 + SZ_I32;
        if include_timestamp {
            base + SZ_U64
        } else {
            base
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Rewritten when the log is truncated and overwritten.
    pub fn set_term(&mut self, term: u64) {
        self.term = term;
    }

    pub fn value_type(&self) -> LogValueType {
        self.value_type
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp_us
    }

    pub fn set_timestamp(&mut self, timestamp_us: u64) {
        self.timestamp_us = timestamp_us;
    }

    pub fn is_payload_null(&self) -> bool {
        self.payload.is_none()
    }

    /// Reading the payload of a record built without one is a caller bug.
    pub fn payload(&self) -> Result<&Bytes> {
        self.payload.as_ref().ok_or(CertError::NullPayload)
    }

    pub fn serialize(&self, include_timestamp: bool) -> Result<Bytes> {
        let payload = self.payload()?;
        let mut buf = BytesMut::with_capacity(Self::header_size(include_timestamp) + payload.len());
        buf.put_u64_le(self.term);
        buf.put_u8(self.value_type.as_u8());
        if include_timestamp {
            buf.put_u64_le(self.timestamp_us);
        }
        buf.put_i32_le(payload.len() as i32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Reads one record starting at the cursor position.
    ///
    /// `None` means the buffer does not hold a whole record yet. The cursor is
    /// then back where it was, so the caller can append data and retry.
    pub fn deserialize(buf: &mut Cursor<&[u8]>, include_timestamp: bool) -> Option<Self> {
        let start = buf.position();
        if buf.remaining() < Self::header_size(include_timestamp) {
            debug!(
                pos = start,
                remaining = buf.remaining(),
                "log record header incomplete"
            );
            return None;
        }

        let term = buf.get_u64_le();
        let value_type = LogValueType::from_u8(buf.get_u8());
        let timestamp_us = if include_timestamp { buf.get_u64_le() } else { 0 };
        let data_size = buf.get_i32_le();

        let fits = usize::try_from(data_size).map_or(false, |len| buf.remaining() >= len);
        if !fits {
            debug!(
                pos = start,
                expecting = data_size,
                remaining = buf.remaining(),
                "log record payload incomplete, rewinding"
            );
            buf.set_position(start);
            return None;
        }

        let mut data = vec![0u8; data_size as usize];
        buf.copy_to_slice(&mut data);
        Some(LogRecord {
            term,
            value_type,
            payload: Some(Bytes::from(data)),
            timestamp_us,
        })
    }

    /// Stream variant: consumes bytes from `src` only when a whole record
    /// is available.
    pub fn decode(src: &mut BytesMut, include_timestamp: bool) -> Option<Self> {
        let (record, consumed) = {
            let mut cur = Cursor::new(&src[..]);
            let record = Self::deserialize(&mut cur, include_timestamp)?;
            (record, cur.position() as usize)
        };
        src.advance(consumed);
        Some(record)
    }

    /// Peeks at the leading term without consuming anything.
    pub fn term_in_buffer(buf: &[u8]) -> Result<u64> {
        let mut peek = buf;
        get_u64(&mut peek, "log record term")
    }
}

/// Framing for a byte stream of back-to-back log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRecordCodec {
    include_timestamp: bool,
}

impl LogRecordCodec {
    pub fn new(include_timestamp: bool) -> Self {
        LogRecordCodec { include_timestamp }
    }
}

impl Decoder for LogRecordCodec {
    type Item = LogRecord;
    type Error = CertError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogRecord>> {
        Ok(LogRecord::decode(src, self.include_timestamp))
    }
}

impl Encoder<&LogRecord> for LogRecordCodec {
    type Error = CertError;

    fn encode(&mut self, item: &LogRecord, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.serialize(self.include_timestamp)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(term: u64, payload: &'static [u8]) -> LogRecord {
        LogRecord::new(term, Some(Bytes::from_static(payload)), LogValueType::AppLog)
    }

    #[test]
    fn test_round_trip_with_and_without_timestamp() {
        let rec = record(7, b"put k v").with_timestamp(1_700_000_000_000_000);

        let bytes = rec.serialize(true).unwrap();
        assert_eq!(bytes.len(), LogRecord::header_size(true) + 7);
        let decoded = LogRecord::deserialize(&mut Cursor::new(&bytes[..]), true).unwrap();
        assert_eq!(decoded, rec);

        let bytes = rec.serialize(false).unwrap();
        let decoded = LogRecord::deserialize(&mut Cursor::new(&bytes[..]), false).unwrap();
        assert_eq!(decoded.timestamp(), 0);
        assert_eq!(decoded.payload().unwrap(), rec.payload().unwrap());
    }

    #[test]
    fn test_truncated_payload_rewinds() {
        let bytes = record(3, b"abcdef").serialize(false).unwrap();
        let short = &bytes[..bytes.len() - 1];

        let mut cur = Cursor::new(short);
        assert!(LogRecord::deserialize(&mut cur, false).is_none());
        assert_eq!(cur.position(), 0);

        let mut cur = Cursor::new(&bytes[..]);
        let decoded = LogRecord::deserialize(&mut cur, false).unwrap();
        assert_eq!(decoded.payload().unwrap().as_ref(), b"abcdef");
        assert_eq!(cur.position() as usize, bytes.len());
    }

    #[test]
    fn test_truncated_mid_stream_rewinds_to_record_start() {
        let first = record(1, b"one").serialize(false).unwrap();
        let second = record(2, b"two").serialize(false).unwrap();
        let mut joined = first.to_vec();
        joined.extend_from_slice(&second[..second.len() - 2]);

        let mut cur = Cursor::new(&joined[..]);
        assert_eq!(LogRecord::deserialize(&mut cur, false).unwrap().term(), 1);
        let before = cur.position();
        assert!(LogRecord::deserialize(&mut cur, false).is_none());
        assert_eq!(cur.position(), before);
    }

    #[test]
    fn test_short_header_is_absent() {
        let bytes = record(1, b"x").serialize(true).unwrap();
        let mut cur = Cursor::new(&bytes[..LogRecord::header_size(true) - 1]);
        assert!(LogRecord::deserialize(&mut cur, true).is_none());
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn test_stream_decode_consumes_only_whole_records() {
        let bytes = record(9, b"stream").serialize(true).unwrap();
        let mut src = BytesMut::from(&bytes[..bytes.len() - 1]);

        assert!(LogRecord::decode(&mut src, true).is_none());
        assert_eq!(src.len(), bytes.len() - 1);

        src.extend_from_slice(&bytes[bytes.len() - 1..]);
        let decoded = LogRecord::decode(&mut src, true).unwrap();
        assert_eq!(decoded.term(), 9);
        assert!(src.is_empty());
    }

    #[test]
    fn test_codec_handles_split_input() {
        let mut codec = LogRecordCodec::new(false);
        let mut wire = BytesMut::new();
        codec.encode(&record(1, b"a"), &mut wire).unwrap();
        codec.encode(&record(2, b"bb"), &mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            while let Some(rec) = codec.decode(&mut src).unwrap() {
                out.push(rec);
            }
        }
        assert_eq!(out, vec![record(1, b"a"), record(2, b"bb")]);
    }

    #[test]
    fn test_null_payload_is_misuse() {
        let rec = LogRecord::new(1, None, LogValueType::Conf);
        assert!(rec.is_payload_null());
        assert!(matches!(rec.payload(), Err(CertError::NullPayload)));
        assert!(matches!(rec.serialize(false), Err(CertError::NullPayload)));
    }

    #[test]
    fn test_term_in_buffer_peeks() {
        let bytes = record(42, b"zz").serialize(false).unwrap();
        assert_eq!(LogRecord::term_in_buffer(&bytes).unwrap(), 42);
        assert_eq!(LogRecord::term_in_buffer(&bytes).unwrap(), 42);
        assert!(LogRecord::term_in_buffer(&bytes[..4]).is_err());
    }

    #[test]
    fn test_value_type_tags() {
        for tag in [1u8, 2, 3, 4, 5, 11, 12, 13, 21, 22, 231] {
            assert_eq!(LogValueType::from_u8(tag).as_u8(), tag);
        }
        assert_eq!(LogValueType::Custom.as_u8(), 231);
        assert_eq!(LogValueType::from_u8(77), LogValueType::Unknown(77));
    }
}
