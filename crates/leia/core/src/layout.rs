//! Fixed little-endian layouts shared with the firmware
//!
//! Decoding copies up to the size of a layout and leaves the rest at zero, so a
//! short buffer is never an error at this level.

/// Cursor over a firmware structure that reads zero past the end of the input
#[derive(Debug)]
pub(crate) struct LayoutReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LayoutReader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let value = self.buf.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        value
    }

    pub(crate) fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        for byte in &mut out {
            *byte = self.u8();
        }
        out
    }

    pub(crate) fn u16_le(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub(crate) fn u32_le(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub(crate) fn u32_array<const N: usize>(&mut self) -> [u32; N] {
        let mut out = [0u32; N];
        for value in &mut out {
            *value = self.u32_le();
        }
        out
    }

    /// Take `len` bytes, zero filling whatever the input is missing
    pub(crate) fn bytes(&mut self, len: usize) -> Vec<u8> {
        let start = self.pos.min(self.buf.len());
        let end = (self.pos + len).min(self.buf.len());
        let mut out = self.buf[start..end].to_vec();
        out.resize(len, 0);
        self.pos += len;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_reads_zero() {
        let mut reader = LayoutReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.u16_le(), 0x0201);
        assert_eq!(reader.u32_le(), 0x03);
        assert_eq!(reader.u8(), 0);
        assert_eq!(reader.bytes(2), vec![0, 0]);
    }

    #[test]
    fn test_bytes_partial_fill() {
        let mut reader = LayoutReader::new(&[0xAA, 0xBB, 0xCC]);
        reader.u8();
        assert_eq!(reader.bytes(4), vec![0xBB, 0xCC, 0x00, 0x00]);
    }
}
