use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Bumped whenever the compressed array format changes
pub const COMPRESSION_VERSION: i32 = 2;

pub fn compress_u16(values: &[u16]) -> io::Result<Vec<u8>> {
    let mut raw = vec![0u8; values.len() * 2];
    BigEndian::write_u16_into(values, &mut raw);
    compress_bytes(&raw)
}

pub fn compress_bytes(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(raw)?;
    encoder.finish()
}

/// Inflates `data` and checks it holds exactly `expected` values
pub fn decompress_u16(data: &[u8], expected: usize) -> io::Result<Vec<u16>> {
    let raw = decompress_bytes(data, expected * 2)?;
    let mut values = vec![0u16; expected];
    BigEndian::read_u16_into(&raw, &mut values);
    Ok(values)
}

pub fn decompress_bytes(data: &[u8], expected: usize) -> io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(expected);
    ZlibDecoder::new(data)
        .take(expected as u64 + 1)
        .read_to_end(&mut raw)?;
    if raw.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} bytes after inflate, got {}", expected, raw.len()),
        ));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_arrays_survive_compression() {
        let values: Vec<u16> = (0..4096u32).map(|i| (i % 97) as u16).collect();
        let packed = compress_u16(&values).unwrap();
        assert!(packed.len() < values.len() * 2);
        assert_eq!(decompress_u16(&packed, values.len()).unwrap(), values);
    }

    #[test]
    fn test_compression_is_deterministic() {
        let values = vec![7u16; 1024];
        assert_eq!(compress_u16(&values).unwrap(), compress_u16(&values).unwrap());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let packed = compress_bytes(&[1, 2, 3]).unwrap();
        assert!(decompress_bytes(&packed, 4).is_err());
        assert!(decompress_bytes(&packed, 2).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decompress_bytes(&[0xde, 0xad, 0xbe, 0xef], 16).is_err());
    }
}
