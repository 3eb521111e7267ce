use crate::error::BoxParseError;

/// Forward-only reader over a byte slice. Every read is bounds-checked and
/// failures report the offset at which the read was attempted.
#[derive(Debug, Clone)]
pub struct BoxCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn error(&self, reason: impl Into<String>) -> BoxParseError {
        BoxParseError::new(self.pos as u64, reason)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BoxParseError> {
        if self.remaining() < len {
            return Err(self.error(format!(
                "need {len} bytes, only {} remaining",
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BoxParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), BoxParseError> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, BoxParseError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BoxParseError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// 24-bit big-endian value, as used by FullBox flags.
    pub fn read_u24(&mut self) -> Result<u32, BoxParseError> {
        let [a, b, c] = self.read_array()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub fn read_u32(&mut self) -> Result<u32, BoxParseError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, BoxParseError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_fourcc(&mut self) -> Result<[u8; 4], BoxParseError> {
        self.read_array()
    }
}
