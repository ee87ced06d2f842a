use crate::codec::nbt::Tag;
use crate::codec::TAG_END;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

/// Reads a tagged record written by [`Encoder`](crate::codec::Encoder).
pub struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
    last_tag: u8,
    finished: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Decoder {
            cursor: Cursor::new(data),
            last_tag: TAG_END,
            finished: false,
        }
    }

    /// Returns the next field tag, or `None` once the record is closed.
    ///
    /// A record that simply runs out of bytes at a field boundary is treated
    /// as closed so records written by older versions stay readable.
    pub fn next_tag(&mut self) -> io::Result<Option<u8>> {
        if self.finished || self.remaining() == 0 {
            self.finished = true;
            return Ok(None);
        }
        let tag = self.cursor.read_u8()?;
        if tag == TAG_END {
            self.finished = true;
            return Ok(None);
        }
        if tag <= self.last_tag {
            return Err(invalid(format!(
                "tag {} out of order after {}",
                tag, self.last_tag
            )));
        }
        self.last_tag = tag;
        Ok(Some(tag))
    }

    pub fn u8(&mut self) -> io::Result<u8> {
        self.cursor.read_u8()
    }

    pub fn bool(&mut self) -> io::Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("invalid bool byte {}", other))),
        }
    }

    pub fn i32(&mut self) -> io::Result<i32> {
        self.cursor.read_i32::<BigEndian>()
    }

    /// Element count, bounded by the bytes left in the record
    pub fn count(&mut self) -> io::Result<usize> {
        let count = self.i32()?;
        if count < 0 || count as usize > self.remaining() {
            return Err(invalid(format!("implausible element count {}", count)));
        }
        Ok(count as usize)
    }

    pub fn string(&mut self) -> io::Result<String> {
        let length = self.cursor.read_u16::<BigEndian>()? as usize;
        let mut bytes = vec![0u8; length];
        self.cursor.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let length = self.count()?;
        let mut bytes = vec![0u8; length];
        self.cursor.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn nbt(&mut self) -> io::Result<Tag> {
        let limit = self.remaining();
        let (_, tag) = Tag::read_limited(&mut self.cursor, limit)?;
        Ok(tag)
    }

    /// Fails if anything follows the end tag
    pub fn expect_end(&self) -> io::Result<()> {
        if self.remaining() != 0 {
            return Err(invalid(format!("{} trailing bytes", self.remaining())));
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        let data = self.cursor.get_ref();
        data.len().saturating_sub(self.cursor.position() as usize)
    }
}

pub(crate) fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
