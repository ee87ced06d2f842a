use crate::codec::nbt::Tag;
use crate::codec::TAG_END;
use byteorder::{BigEndian, WriteBytesExt};
use std::io;

/// Writes a tagged record into a caller-supplied buffer.
///
/// The buffer is cleared on construction and handed back by [`Encoder::finish`],
/// so hot paths can keep reusing one allocation.
pub struct Encoder {
    buffer: Vec<u8>,
    last_tag: u8,
}

impl Encoder {
    pub fn new(mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        Encoder {
            buffer,
            last_tag: TAG_END,
        }
    }

    /// Starts a field. Tags must be written in strictly increasing order.
    pub fn tag(&mut self, tag: u8) -> io::Result<&mut Self> {
        if tag == TAG_END || tag <= self.last_tag {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tag {} written after tag {}", tag, self.last_tag),
            ));
        }
        self.last_tag = tag;
        self.buffer.write_u8(tag)?;
        Ok(self)
    }

    pub fn u8(&mut self, value: u8) -> io::Result<&mut Self> {
        self.buffer.write_u8(value)?;
        Ok(self)
    }

    pub fn bool(&mut self, value: bool) -> io::Result<&mut Self> {
        self.u8(value as u8)
    }

    pub fn i32(&mut self, value: i32) -> io::Result<&mut Self> {
        self.buffer.write_i32::<BigEndian>(value)?;
        Ok(self)
    }

    /// Element count prefix
    pub fn count(&mut self, count: usize) -> io::Result<&mut Self> {
        let count = i32::try_from(count)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "count exceeds i32"))?;
        self.i32(count)
    }

    pub fn string(&mut self, value: &str) -> io::Result<&mut Self> {
        if value.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "string longer than 65535 bytes",
            ));
        }
        self.buffer.write_u16::<BigEndian>(value.len() as u16)?;
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    /// Length-prefixed byte blob
    pub fn bytes(&mut self, value: &[u8]) -> io::Result<&mut Self> {
        self.count(value.len())?;
        self.buffer.extend_from_slice(value);
        Ok(self)
    }

    /// Unnamed NBT value
    pub fn nbt(&mut self, tag: &Tag) -> io::Result<&mut Self> {
        tag.write(&mut self.buffer, "")?;
        Ok(self)
    }

    /// Writes the end tag and returns the buffer
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        self.buffer.write_u8(TAG_END)?;
        Ok(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_big_endian_and_terminated() {
        let mut encoder = Encoder::new(Vec::new());
        encoder.tag(1).unwrap().i32(0x01020304).unwrap();
        encoder.tag(2).unwrap().string("ab").unwrap();
        let bytes = encoder.finish().unwrap();
        assert_eq!(bytes, vec![1, 1, 2, 3, 4, 2, 0, 2, b'a', b'b', 0]);
    }

    #[test]
    fn test_out_of_order_tag_is_rejected() {
        let mut encoder = Encoder::new(Vec::new());
        encoder.tag(3).unwrap();
        assert!(encoder.tag(2).is_err());
        assert!(encoder.tag(3).is_err());
    }

    #[test]
    fn test_reused_buffer_is_cleared() {
        let encoder = Encoder::new(vec![9, 9, 9]);
        assert_eq!(encoder.finish().unwrap(), vec![0]);
    }
}
