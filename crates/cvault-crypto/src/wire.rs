//! Length-prefixed binary fields shared by the manifest and license bodies.
//!
//! Short fields (salt, nonce, tag, signature algorithm) use a 1-byte length;
//! payload fields use a 4-byte big-endian length.

use cvault_core::{VaultError, VaultResult};

#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// `[u8 len][bytes]`. Fields longer than 255 bytes are a caller bug.
    pub fn put_short(&mut self, bytes: &[u8]) -> VaultResult<&mut Self> {
        let len = u8::try_from(bytes.len())
            .map_err(|_| VaultError::Format(format!("short field of {} bytes", bytes.len())))?;
        self.buf.push(len);
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    /// `[u32 BE len][bytes]`
    pub fn put_long(&mut self, bytes: &[u8]) -> VaultResult<&mut Self> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| VaultError::Format(format!("field of {} bytes", bytes.len())))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a body. Running out of bytes is `Truncated`; trailing bytes are
/// `Format`.
#[derive(Debug)]
pub struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> VaultResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(VaultError::Truncated(format!(
                "need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> VaultResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> VaultResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_short(&mut self) -> VaultResult<&'a [u8]> {
        let len = self.get_u8()? as usize;
        self.take(len)
    }

    pub fn get_long(&mut self) -> VaultResult<&'a [u8]> {
        let b = self.take(4)?;
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        self.take(len)
    }

    /// Read a short field that must be exactly `N` bytes.
    pub fn get_fixed<const N: usize>(&mut self, field: &str) -> VaultResult<[u8; N]> {
        let bytes = self.get_short()?;
        <[u8; N]>::try_from(bytes).map_err(|_| {
            VaultError::Format(format!("{field} is {} bytes (expected {N})", bytes.len()))
        })
    }

    pub fn expect_end(&self) -> VaultResult<()> {
        if self.remaining() != 0 {
            return Err(VaultError::Format(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}
