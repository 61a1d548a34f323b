//! Bounds-checked little-endian reads over `bytes::Buf`.
//!
//! Every multi-byte integer on the wire is little-endian. Writers use
//! `BytesMut`/`BufMut` directly; readers go through these helpers so a short
//! buffer surfaces as [`CertError::Truncated`] instead of a panic inside
//! `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{CertError, Result};

pub const SZ_U8: usize = 1;
pub const SZ_I32: usize = 4;
pub const SZ_U64: usize = 8;

pub fn ensure<B: Buf>(buf: &B, needed: usize, field: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CertError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8<B: Buf>(buf: &mut B, field: &'static str) -> Result<u8> {
    ensure(buf, SZ_U8, field)?;
    Ok(buf.get_u8())
}

pub fn get_i32<B: Buf>(buf: &mut B, field: &'static str) -> Result<i32> {
    ensure(buf, SZ_I32, field)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64<B: Buf>(buf: &mut B, field: &'static str) -> Result<u64> {
    ensure(buf, SZ_U64, field)?;
    Ok(buf.get_u64_le())
}

pub fn get_i64<B: Buf>(buf: &mut B, field: &'static str) -> Result<i64> {
    ensure(buf, SZ_U64, field)?;
    Ok(buf.get_i64_le())
}

/// Reads an `i32` length prefix. Negative lengths mean a corrupted stream.
pub fn get_len_i32<B: Buf>(buf: &mut B, field: &'static str) -> Result<usize> {
    let len = get_i32(buf, field)?;
    usize::try_from(len)
        .map_err(|_| CertError::CorruptedFrame(format!("negative length {} for {}", len, field)))
}

/// Reads an `i64` length prefix. Negative lengths mean a corrupted stream.
pub fn get_len_i64<B: Buf>(buf: &mut B, field: &'static str) -> Result<usize> {
    let len = get_i64(buf, field)?;
    usize::try_from(len)
        .map_err(|_| CertError::CorruptedFrame(format!("negative length {} for {}", len, field)))
}

/// Copies `len` bytes out of `buf` into a freshly owned buffer.
pub fn get_bytes<B: Buf>(buf: &mut B, len: usize, field: &'static str) -> Result<Bytes> {
    ensure(buf, len, field)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(Bytes::from(out))
}

/// Writes `s` followed by a NUL terminator.
pub fn put_cstr(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(CertError::InvalidString {
            field,
            message: "interior NUL byte".to_string(),
        });
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Reads a NUL-terminated string. The terminator is consumed.
pub fn get_cstr<B: Buf>(buf: &mut B, field: &'static str) -> Result<String> {
    let mut raw = Vec::new();
    loop {
        let byte = get_u8(buf, field)?;
        if byte == 0 {
            break;
        }
        raw.push(byte);
    }
    String::from_utf8(raw).map_err(|e| CertError::InvalidString {
        field,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_cstr_empty_and_non_empty() {
        let mut buf = BytesMut::new();
        put_cstr(&mut buf, "", "a").unwrap();
        put_cstr(&mut buf, "10.0.0.1:20010", "b").unwrap();
        let bytes = buf.freeze();
        assert_eq!(bytes.len(), 1 + 15);

        let mut cur = Cursor::new(&bytes[..]);
        assert_eq!(get_cstr(&mut cur, "a").unwrap(), "");
        assert_eq!(get_cstr(&mut cur, "b").unwrap(), "10.0.0.1:20010");
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_cstr_rejects_interior_nul() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            put_cstr(&mut buf, "a\0b", "endpoint"),
            Err(CertError::InvalidString { field: "endpoint", .. })
        ));
    }

    #[test]
    fn test_short_read_is_truncated() {
        let data = [1u8, 2, 3];
        let mut cur = Cursor::new(&data[..]);
        match get_u64(&mut cur, "term") {
            Err(CertError::Truncated { field, needed, remaining }) => {
                assert_eq!(field, "term");
                assert_eq!(needed, 8);
                assert_eq!(remaining, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn test_negative_length_is_corruption() {
        let mut buf = BytesMut::new();
        buf.put_i64_le(-4);
        let bytes = buf.freeze();
        let mut cur = Cursor::new(&bytes[..]);
        assert!(matches!(
            get_len_i64(&mut cur, "sig"),
            Err(CertError::CorruptedFrame(_))
        ));
    }
}
