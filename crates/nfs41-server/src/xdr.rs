//! RFC 4506 XDR primitives
//!
//! COMPOUND replies are encoded once, when they are committed to a slot,
//! and CB_COMPOUND arguments are encoded for the back channel. Decoding is
//! only needed for callback replies, so the decoder stays small.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NfsError, NfsResult};

/// Big-endian XDR writer
pub struct XdrEncoder {
    buf: BytesMut,
}

impl XdrEncoder {
    /// Empty writer sized for a typical COMPOUND reply
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// uint32
    pub fn encode_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// uint64
    pub fn encode_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// bool, as a uint32 of 0 or 1
    pub fn encode_bool(&mut self, value: bool) {
        self.encode_u32(u32::from(value));
    }

    /// opaque<>: length word, data, padding
    pub fn encode_opaque(&mut self, data: &[u8]) {
        self.encode_u32(data.len() as u32);
        self.encode_opaque_fixed(data);
    }

    /// opaque[n]: data zero-padded to a word boundary
    pub fn encode_opaque_fixed(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, data.len().wrapping_neg() & 3);
    }

    /// utf8str_cs
    pub fn encode_string(&mut self, s: &str) {
        self.encode_opaque(s.as_bytes());
    }

    /// Encode a bitmap4 (length-prefixed array of words)
    pub fn encode_bitmap(&mut self, words: &[u32]) {
        self.encode_u32(words.len() as u32);
        for word in words {
            self.encode_u32(*word);
        }
    }

    /// Freeze the buffer
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Nothing written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for XdrEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over an XDR buffer
pub struct XdrDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    /// Start at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> NfsResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(NfsError::Xdr(format!("not enough data for {what}")));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// uint32
    pub fn decode_u32(&mut self) -> NfsResult<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4, "u32")?);
        Ok(u32::from_be_bytes(word))
    }

    /// uint64
    pub fn decode_u64(&mut self) -> NfsResult<u64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8, "u64")?);
        Ok(u64::from_be_bytes(word))
    }

    /// bool; any nonzero word is true
    pub fn decode_bool(&mut self) -> NfsResult<bool> {
        Ok(self.decode_u32()? != 0)
    }

    /// opaque<>
    pub fn decode_opaque(&mut self) -> NfsResult<Vec<u8>> {
        let declared = self.decode_u32()?;
        self.decode_opaque_fixed(declared as usize)
    }

    /// opaque[len], skipping the padding
    pub fn decode_opaque_fixed(&mut self, len: usize) -> NfsResult<Vec<u8>> {
        let padded = len
            .checked_add(3)
            .ok_or_else(|| NfsError::Xdr("opaque length overflow".into()))?
            & !3;
        let data = self.take(padded, "opaque")?;
        Ok(data[..len].to_vec())
    }

    /// utf8str_cs; invalid UTF-8 is an XDR error
    pub fn decode_string(&mut self) -> NfsResult<String> {
        String::from_utf8(self.decode_opaque()?).map_err(|e| NfsError::Xdr(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_words() {
        let mut enc = XdrEncoder::new();
        enc.encode_u32(0x0a0b_0c0d);
        enc.encode_u64(1);
        enc.encode_bool(true);
        assert_eq!(&enc.finish()[..], &[10, 11, 12, 13, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_opaque_padding() {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque(&[1, 2, 3, 4, 5]);
        enc.encode_u32(7);
        let data = enc.finish();
        assert_eq!(data.len(), 4 + 8 + 4);

        let mut dec = XdrDecoder::new(&data);
        assert_eq!(dec.decode_opaque().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(dec.decode_u32().unwrap(), 7);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_short_input() {
        let mut dec = XdrDecoder::new(&[0, 0, 1]);
        assert!(matches!(dec.decode_u32(), Err(NfsError::Xdr(_))));
    }
}
