//! RPC request framing.
//!
//! The header-only `ReplicationRequest::serialize` form carries no entries and
//! no certificate. This frame is what carries them between servers:
//!
//! ```text
//! u8 marker | u8 type | i32 src | i32 dst | u64 term | u64 last_log_term
//! | u64 last_log_idx | u64 commit_idx | i32 data_size
//! | u64 (flags << 32 | crc32c(header before this field))
//! | [i32 meta_len | meta]          if INCLUDE_META
//! | [i32 cert_len | certificate]   if INCLUDE_CC
//! | log records ...
//! ```

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32c::crc32c;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::{
    common::{
        codec::{ensure, get_bytes, get_i32, get_len_i32, get_u64, get_u8, SZ_I32},
        config::ReplicationOptions,
        error::{CertError, Result},
    },
    consensus::{
        log_record::LogRecord,
        message::{MsgType, ReplicationRequest},
        qc::QuorumCertificate,
    },
};

pub const INCLUDE_META: u32 = 0x1;
pub const INCLUDE_HINT: u32 = 0x2;
pub const INCLUDE_LOG_TIMESTAMP: u32 = 0x4;
pub const INCLUDE_SIG: u32 = 0x8;
pub const INCLUDE_CC: u32 = 0x10;

const FRAME_MARKER: u8 = 0x0;
const CRC_FLAGS_LEN: usize = 8;

pub const RPC_REQ_HEADER_SIZE: usize = 1 + 1 + 4 + 4 + 8 * 4 + 4 + CRC_FLAGS_LEN;
const CRC_COVERED_LEN: usize = RPC_REQ_HEADER_SIZE - CRC_FLAGS_LEN;
const DATA_SIZE_OFFSET: usize = CRC_COVERED_LEN - SZ_I32;

/// Largest frame data section [`RequestFrameCodec`] accepts by default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub request: ReplicationRequest,
    pub meta: Option<Bytes>,
    pub flags: u32,
}

impl RequestFrame {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

pub fn encode_request(
    req: &ReplicationRequest,
    meta: Option<&[u8]>,
    options: &ReplicationOptions,
) -> Result<Bytes> {
    let mut flags = 0u32;
    if options.replicate_log_timestamp {
        flags |= INCLUDE_LOG_TIMESTAMP;
    }

    let entry_bufs = req
        .log_entries()
        .iter()
        .map(|entry| entry.serialize(options.replicate_log_timestamp))
        .collect::<Result<Vec<_>>>()?;
    let log_data_size: usize = entry_bufs.iter().map(|buf| buf.len()).sum();

    let meta = meta.filter(|raw| !raw.is_empty());
    let meta_size = match meta {
        Some(raw) => {
            flags |= INCLUDE_META;
            SZ_I32 + raw.len()
        }
        None => 0,
    };

    let cert = match req.certificate() {
        Some(cert) if options.include_certificate => {
            flags |= INCLUDE_CC;
            Some(cert.serialize())
        }
        _ => None,
    };
    let cert_size = cert.as_ref().map_or(0, |raw| SZ_I32 + raw.len());

    let data_size = meta_size + cert_size + log_data_size;
    let data_size_field = i32::try_from(data_size)
        .map_err(|_| CertError::CorruptedFrame(format!("frame data too large: {}", data_size)))?;

    let mut buf = BytesMut::with_capacity(RPC_REQ_HEADER_SIZE + data_size);
    buf.put_u8(FRAME_MARKER);
    buf.put_u8(req.msg_type().as_u8());
    buf.put_i32_le(req.src());
    buf.put_i32_le(req.dst());
    buf.put_u64_le(req.term());
    buf.put_u64_le(req.last_log_term());
    buf.put_u64_le(req.last_log_idx());
    buf.put_u64_le(req.commit_idx());
    buf.put_i32_le(data_size_field);

    let crc = crc32c(&buf[..CRC_COVERED_LEN]);
    buf.put_u64_le(((flags as u64) << 32) | crc as u64);

    if let Some(raw) = meta {
        buf.put_i32_le(raw.len() as i32);
        buf.put_slice(raw);
    }
    if let Some(raw) = &cert {
        buf.put_i32_le(raw.len() as i32);
        buf.put_slice(raw);
    }
    for entry in &entry_bufs {
        buf.put_slice(entry);
    }

    trace!(
        msg_type = ?req.msg_type(),
        entries = entry_bufs.len(),
        flags,
        size = buf.len(),
        "encoded request frame"
    );
    Ok(buf.freeze())
}

/// Checks the header checksum and returns the flags packed next to it.
fn check_header(header: &[u8]) -> Result<u32> {
    let mut tail = &header[CRC_COVERED_LEN..];
    let flags_and_crc = get_u64(&mut tail, "frame flags")?;
    let expected = flags_and_crc as u32;
    let actual = crc32c(&header[..CRC_COVERED_LEN]);
    if expected != actual {
        return Err(CertError::ChecksumMismatch { expected, actual });
    }
    Ok((flags_and_crc >> 32) as u32)
}

/// Decodes one complete frame. Anything short of a whole frame is an error
/// here; use [`RequestFrameCodec`] on a live stream.
pub fn decode_request(frame: &[u8], options: &ReplicationOptions) -> Result<RequestFrame> {
    let mut hdr = frame;
    ensure(&hdr, RPC_REQ_HEADER_SIZE, "request frame header")?;

    let marker = get_u8(&mut hdr, "frame marker")?;
    if marker != FRAME_MARKER {
        return Err(CertError::CorruptedFrame(format!(
            "unexpected frame marker {:#04x}",
            marker
        )));
    }
    let msg_type = MsgType::try_from(get_u8(&mut hdr, "message type")?)?;
    let src = get_i32(&mut hdr, "source id")?;
    let dst = get_i32(&mut hdr, "destination id")?;
    let term = get_u64(&mut hdr, "term")?;
    let last_log_term = get_u64(&mut hdr, "last log term")?;
    let last_log_idx = get_u64(&mut hdr, "last log index")?;
    let commit_idx = get_u64(&mut hdr, "commit index")?;
    let data_size = get_len_i32(&mut hdr, "frame data size")?;
    hdr.advance(CRC_FLAGS_LEN);
    let flags = check_header(&frame[..RPC_REQ_HEADER_SIZE])?;

    ensure(&hdr, data_size, "request frame data")?;
    let data = &hdr[..data_size];

    let mut req = ReplicationRequest::new(
        term,
        msg_type,
        src,
        dst,
        last_log_term,
        last_log_idx,
        commit_idx,
    );
    let mut cur = Cursor::new(data);

    let mut meta = None;
    if flags & INCLUDE_META != 0 {
        let len = get_len_i32(&mut cur, "frame meta length")?;
        meta = Some(get_bytes(&mut cur, len, "frame meta")?);
    }

    if flags & INCLUDE_CC != 0 {
        let len = get_len_i32(&mut cur, "frame certificate length")?;
        let raw = get_bytes(&mut cur, len, "frame certificate")?;
        let cert = QuorumCertificate::deserialize(&mut &raw[..])?
            .with_quorum_ratio(options.quorum_ratio_reciprocal);
        req.set_certificate(Some(cert));
    }

    let include_timestamp = flags & INCLUDE_LOG_TIMESTAMP != 0;
    while cur.has_remaining() {
        match LogRecord::deserialize(&mut cur, include_timestamp) {
            Some(entry) => req.push_entry(entry),
            None => {
                // The frame is complete, so a short record means corruption.
                warn!(
                    pos = cur.position(),
                    size = data_size,
                    "wrong log data size in request frame"
                );
                return Err(CertError::CorruptedFrame(format!(
                    "log record at offset {} overruns frame data of {} bytes",
                    cur.position(),
                    data_size
                )));
            }
        }
    }

    Ok(RequestFrame {
        request: req,
        meta,
        flags,
    })
}

/// Splits a byte stream into request frames.
///
/// The header checksum and the declared size are checked as soon as a
/// header is buffered, before any room is reserved for the frame body.
#[derive(Clone, Debug)]
pub struct RequestFrameCodec {
    options: ReplicationOptions,
    max_frame_length: usize,
}

impl RequestFrameCodec {
    pub fn new(options: ReplicationOptions) -> Self {
        RequestFrameCodec {
            options,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for RequestFrameCodec {
    fn default() -> Self {
        RequestFrameCodec::new(ReplicationOptions::default())
    }
}

impl Decoder for RequestFrameCodec {
    type Item = RequestFrame;
    type Error = CertError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>> {
        if src.len() < RPC_REQ_HEADER_SIZE {
            return Ok(None);
        }
        check_header(&src[..RPC_REQ_HEADER_SIZE])?;
        let mut size_field = &src[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + SZ_I32];
        let data_size = size_field.get_i32_le();
        let data_size = usize::try_from(data_size).map_err(|_| {
            CertError::CorruptedFrame(format!("negative frame data size {}", data_size))
        })?;
        if data_size > self.max_frame_length {
            warn!(
                size = data_size,
                max = self.max_frame_length,
                "request frame exceeds max length"
            );
            return Err(CertError::CorruptedFrame(format!(
                "frame data of {} bytes exceeds max frame length {}",
                data_size,
                self.max_frame_length
            )));
        }

        let total = RPC_REQ_HEADER_SIZE + data_size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);
        decode_request(&frame, &self.options).map(Some)
    }
}

impl Encoder<&ReplicationRequest> for RequestFrameCodec {
    type Error = CertError;

    fn encode(&mut self, item: &ReplicationRequest, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_request(item, None, &self.options)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::log_record::LogValueType;

    fn sample_request() -> ReplicationRequest {
        let mut req = ReplicationRequest::new(6, MsgType::AppendEntriesRequest, 1, 3, 5, 41, 40);
        req.push_entry(
            LogRecord::new(6, Some(Bytes::from_static(b"first")), LogValueType::AppLog)
                .with_timestamp(11),
        );
        req.push_entry(
            LogRecord::new(6, Some(Bytes::from_static(b"second")), LogValueType::Conf)
                .with_timestamp(12),
        );
        let cert = QuorumCertificate::new(3, 6, 42);
        cert.insert(1, Bytes::from(vec![7u8; 64]));
        cert.insert(2, Bytes::from(vec![8u8; 64]));
        req.set_certificate(Some(cert));
        req
    }

    #[test]
    fn test_frame_round_trip_carries_entries_and_certificate() {
        let options = ReplicationOptions {
            replicate_log_timestamp: true,
            ..ReplicationOptions::default()
        };
        let req = sample_request();
        let bytes = encode_request(&req, Some(b"meta"), &options).unwrap();

        let frame = decode_request(&bytes, &options).unwrap();
        assert!(frame.has_flag(INCLUDE_CC));
        assert!(frame.has_flag(INCLUDE_META));
        assert!(frame.has_flag(INCLUDE_LOG_TIMESTAMP));
        assert_eq!(frame.meta.unwrap(), Bytes::from_static(b"meta"));
        assert_eq!(frame.request, req);
    }

    #[test]
    fn test_frame_without_certificate_or_timestamp() {
        let options = ReplicationOptions {
            include_certificate: false,
            ..ReplicationOptions::default()
        };
        let req = sample_request();
        let bytes = encode_request(&req, None, &options).unwrap();
        let frame = decode_request(&bytes, &options).unwrap();

        assert_eq!(frame.flags, 0);
        assert!(frame.request.certificate().is_none());
        assert_eq!(frame.request.log_entries().len(), 2);
        assert_eq!(frame.request.log_entries()[0].timestamp(), 0);
    }

    #[test]
    fn test_header_corruption_detected() {
        let options = ReplicationOptions::default();
        let mut bytes = encode_request(&sample_request(), None, &options)
            .unwrap()
            .to_vec();
        bytes[10] ^= 0xff;
        assert!(matches!(
            decode_request(&bytes, &options),
            Err(CertError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_record_overrunning_frame_is_corruption() {
        let options = ReplicationOptions {
            include_certificate: false,
            ..ReplicationOptions::default()
        };
        let req = sample_request();
        let bytes = encode_request(&req, None, &options).unwrap();

        // Shrink the declared data size by one byte and fix up the checksum.
        let mut raw = bytes[..bytes.len() - 1].to_vec();
        let data_size = (raw.len() - RPC_REQ_HEADER_SIZE) as i32;
        raw[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 4].copy_from_slice(&data_size.to_le_bytes());
        let crc = crc32c(&raw[..CRC_COVERED_LEN]);
        raw[CRC_COVERED_LEN..CRC_COVERED_LEN + 4].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            decode_request(&raw, &options),
            Err(CertError::CorruptedFrame(_))
        ));
    }

    #[test]
    fn test_codec_waits_for_whole_frame() {
        let options = ReplicationOptions::default();
        let mut codec = RequestFrameCodec::new(options);
        let req = sample_request();

        let mut wire = BytesMut::new();
        codec.encode(&req, &mut wire).unwrap();
        codec.encode(&req, &mut wire).unwrap();
        let split = wire.len() / 2 + 3;

        let mut src = BytesMut::from(&wire[..split]);
        let first = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.request, req);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&wire[split..]);
        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(second.request, req);
        assert!(src.is_empty());
    }

    fn bare_header(data_size: i32) -> Vec<u8> {
        let mut raw = vec![0u8; RPC_REQ_HEADER_SIZE];
        raw[1] = MsgType::AppendEntriesRequest.as_u8();
        raw[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 4].copy_from_slice(&data_size.to_le_bytes());
        raw
    }

    #[test]
    fn test_codec_rejects_bad_header_checksum_before_body() {
        let mut codec = RequestFrameCodec::default();
        let raw = bare_header(i32::MAX);

        let mut src = BytesMut::from(&raw[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(CertError::ChecksumMismatch { .. })
        ));
        assert!(src.capacity() < 1024);
    }

    #[test]
    fn test_codec_enforces_max_frame_length() {
        let mut codec = RequestFrameCodec::default().with_max_frame_length(1024);
        let mut raw = bare_header(4096);
        let crc = crc32c(&raw[..CRC_COVERED_LEN]);
        raw[CRC_COVERED_LEN..CRC_COVERED_LEN + 4].copy_from_slice(&crc.to_le_bytes());

        let mut src = BytesMut::from(&raw[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(CertError::CorruptedFrame(_))
        ));
        assert!(src.capacity() < 1024);

        // A frame inside the limit still decodes.
        let req = sample_request();
        let mut wire = BytesMut::new();
        codec.encode(&req, &mut wire).unwrap();
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().request, req);
    }
}
