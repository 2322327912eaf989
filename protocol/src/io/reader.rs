use crate::error::ProtocolError;

/// Helper for reading big-endian binary data with automatic cursor advancement.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let value = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::PacketTooShort {
                expected: self.pos + 1,
                got: self.data.len(),
            })?;
        self.pos += 1;
        Ok(value)
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes: [u8; 2] = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or(ProtocolError::PacketTooShort {
                expected: self.pos + 2,
                got: self.data.len(),
            })?
            .try_into()
            .unwrap();
        self.pos += 2;
        Ok(u16::from_be_bytes(bytes))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(ProtocolError::PacketTooShort {
                expected: self.pos + 4,
                got: self.data.len(),
            })?
            .try_into()
            .unwrap();
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Borrows the next `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(ProtocolError::PacketTooShort {
                expected: self.pos + len,
                got: self.data.len(),
            })?;
        self.pos += len;
        Ok(bytes)
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.read_u32().unwrap(), 0x0405_0607);
        assert_eq!(r.position(), 7);
        assert!(r.remaining().is_empty());
    }

    #[test]
    fn underrun_reports_expected_and_got() {
        let data = [0x01];
        let mut r = Reader::new(&data);
        assert_eq!(
            r.read_u32(),
            Err(ProtocolError::PacketTooShort { expected: 4, got: 1 })
        );
    }

    #[test]
    fn read_bytes_borrows_view() {
        let data = [1, 2, 3, 4, 5];
        let mut r = Reader::new(&data);
        r.read_u8().unwrap();
        assert_eq!(r.read_bytes(3).unwrap(), &[2, 3, 4]);
        assert_eq!(r.remaining(), &[5]);
    }
}
