//! Binary wire protocol spoken over the client WebSocket.
//!
//! Every message is a single binary WebSocket frame. The first byte is the
//! message tag, integers are big-endian, strings carry a `u16` length prefix
//! and trailing byte blobs run to the end of the frame.

mod c2s;
mod error;
mod s2c;

pub use c2s::ClientMessage;
pub use error::ProtocolError;
pub use s2c::{ServerMessage, ToastKind};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// WebSocket close codes used by the server.
pub mod close_codes {
    /// The session token was rejected; the client must re-authenticate.
    pub const RE_AUTH: u16 = 4000;
    /// The identity is banned.
    pub const BANNED: u16 = 4001;
    /// A newer session for the same identity replaced this one.
    pub const REPLACED: u16 = 4002;
    /// Slow consumer, oversized message or malformed traffic.
    pub const POLICY_VIOLATION: u16 = 4003;
}

pub(crate) fn ensure(buf: &Bytes, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    ensure(buf, field, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    ensure(buf, field, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes, field: &'static str) -> Result<u64, ProtocolError> {
    ensure(buf, field, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_bool(buf: &mut Bytes, field: &'static str) -> Result<bool, ProtocolError> {
    Ok(get_u8(buf, field)? != 0)
}

pub(crate) fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    ensure(buf, field, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, field, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

pub(crate) fn get_array<const N: usize>(
    buf: &mut Bytes,
    field: &'static str,
) -> Result<[u8; N], ProtocolError> {
    ensure(buf, field, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Longest string a frame can carry behind its u16 length prefix.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn finish(buf: &Bytes) -> Result<(), ProtocolError> {
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}
