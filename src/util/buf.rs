use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::network::protocol::WireError;


/// Checks that `buf` holds at least `required` bytes *before* anything is read from it, so that
///  decoding never consumes part of a field and then fails.
pub fn ensure_remaining(buf: &impl Buf, required: usize, what: &'static str) -> Result<(), WireError> {
    let available = buf.remaining();
    if available < required {
        return Err(WireError::Malformed { what, required, available });
    }
    Ok(())
}

/// number of bytes the unsigned varint encoding of `value` takes (7 bits per byte)
pub fn varint_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    (bits as usize).div_ceil(7).max(1)
}

pub fn string_len(s: &str) -> usize {
    varint_len(s.len()) + s.len()
}

pub fn blob_len(blob: &[u8]) -> usize {
    varint_len(blob.len()) + blob.len()
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf, what: &'static str) -> Result<String, WireError> {
    let raw = try_get_blob(buf, what)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| WireError::InvalidUtf8(what))
}

pub fn put_blob(buf: &mut impl BufMut, blob: &[u8]) {
    buf.put_usize_varint(blob.len());
    buf.put_slice(blob);
}

pub fn try_get_blob(buf: &mut impl Buf, what: &'static str) -> Result<Bytes, WireError> {
    ensure_remaining(buf, 1, what)?;
    let len = buf.try_get_usize_varint()
        .map_err(|_| WireError::InvalidLength(what))?;
    ensure_remaining(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_string_list(buf: &mut impl BufMut, list: &[String]) {
    buf.put_usize_varint(list.len());
    for s in list {
        put_string(buf, s);
    }
}

pub fn try_get_string_list(buf: &mut impl Buf, what: &'static str) -> Result<Vec<String>, WireError> {
    ensure_remaining(buf, 1, what)?;
    let len = buf.try_get_usize_varint()
        .map_err(|_| WireError::InvalidLength(what))?;

    // every element takes at least one byte, so a bigger count can not be valid
    ensure_remaining(buf, len, what)?;

    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(try_get_string(buf, what)?);
    }
    Ok(result)
}

pub fn try_get_u8(buf: &mut impl Buf, what: &'static str) -> Result<u8, WireError> {
    ensure_remaining(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn try_get_u16(buf: &mut impl Buf, what: &'static str) -> Result<u16, WireError> {
    ensure_remaining(buf, size_of::<u16>(), what)?;
    Ok(buf.get_u16())
}

pub fn try_get_u32(buf: &mut impl Buf, what: &'static str) -> Result<u32, WireError> {
    ensure_remaining(buf, size_of::<u32>(), what)?;
    Ok(buf.get_u32())
}

pub fn try_get_i32(buf: &mut impl Buf, what: &'static str) -> Result<i32, WireError> {
    ensure_remaining(buf, size_of::<i32>(), what)?;
    Ok(buf.get_i32())
}

pub fn try_get_i64(buf: &mut impl Buf, what: &'static str) -> Result<i64, WireError> {
    ensure_remaining(buf, size_of::<i64>(), what)?;
    Ok(buf.get_i64())
}

pub fn try_get_bool(buf: &mut impl Buf, what: &'static str) -> Result<bool, WireError> {
    match try_get_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        id => Err(WireError::UnknownDiscriminator { what, id }),
    }
}
