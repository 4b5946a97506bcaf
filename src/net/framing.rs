//! Fixed-layout record framing
//!
//! Records carry no length prefix: the type byte alone determines how many
//! bytes follow. `FrameBuilder` writes packed little-endian fields and
//! `FrameReader` consumes them, reporting truncation instead of panicking.

/// Errors that can occur while reading a packed record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("List too long: {0} entries (max {1})")]
    ListTooLong(usize, usize),
}

/// Frame builder for constructing records
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(128),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Write raw bytes to the frame
    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(mut self, value: i32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(mut self, value: i64) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Get the built frame
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    /// Append the frame to an existing buffer
    pub fn build_into(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.buffer);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing records
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        let available = self.data.len() - self.position;
        if n > available {
            return Err(FramingError::Truncated { needed: n, available });
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    /// Read a fixed-size byte array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FramingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FramingError> {
        self.read(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, FramingError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, FramingError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, FramingError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, FramingError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, FramingError> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Check if there are more bytes to read
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Copy a string into a zero-padded fixed-size field, truncating if needed
pub fn to_fixed<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Read a zero-padded fixed-size field back as text
pub fn from_fixed(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_builder() {
        let frame = FrameBuilder::new()
            .write_u8(0x01)
            .write_u16(1234)
            .write_u32(56789)
            .write_u64(7)
            .write(b"test")
            .build();

        assert_eq!(frame.len(), 1 + 2 + 4 + 8 + 4);
    }

    #[test]
    fn test_little_endian_layout() {
        let frame = FrameBuilder::new().write_u32(0x0403_0201).build();
        assert_eq!(frame, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_frame_reader() {
        let data = FrameBuilder::new()
            .write_u8(42)
            .write_u16(1000)
            .write_u32(999999)
            .write_i32(-5)
            .write_i64(-123456789)
            .build();

        let mut reader = FrameReader::new(&data);

        assert_eq!(reader.read_u8(), Ok(42));
        assert_eq!(reader.read_u16(), Ok(1000));
        assert_eq!(reader.read_u32(), Ok(999999));
        assert_eq!(reader.read_i32(), Ok(-5));
        assert_eq!(reader.read_i64(), Ok(-123456789));
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_frame_reader_truncated() {
        let data = vec![1, 2, 3];
        let mut reader = FrameReader::new(&data);

        assert!(reader.read_u16().is_ok());
        assert_eq!(
            reader.read_u16(),
            Err(FramingError::Truncated { needed: 2, available: 1 })
        );
        // A failed read does not advance the cursor
        assert_eq!(reader.position(), 2);
    }

    #[test]
    fn test_fixed_string_fields() {
        let field: [u8; 8] = to_fixed("ABC");
        assert_eq!(&field[..4], b"ABC\0");
        assert_eq!(from_fixed(&field), "ABC");

        let clipped: [u8; 4] = to_fixed("ABCDEFG");
        assert_eq!(from_fixed(&clipped), "ABCD");
    }
}
