//! WAL header and frame encoding.
//!
//! On-disk layout:
//!
//! ```text
//! [File header: 24 bytes]
//! [Frame 0: 16-byte header + page_size bytes]
//! [Frame 1: 16-byte header + page_size bytes]
//! ...
//! ```
//!
//! File header: magic (u32), format version (u32), page size (u32),
//! salt (u64), CRC32 of the preceding 20 bytes (u32).
//!
//! Frame header: page number (u32), truncate (u32, database size in
//! pages for commit frames, zero otherwise), flags (u16), reserved
//! (u16), CRC32 over the header fields and the page data (u32).
//!
//! All integers are little-endian.

use std::io::{self, Read, Write};

use super::errors::{WalError, WalResult};

/// Magic number identifying a replidb WAL file ("RPLW").
pub const WAL_MAGIC: u32 = 0x5250_4C57;

/// Current WAL format version.
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Size of the WAL file header in bytes.
pub const WAL_HEADER_SIZE: usize = 24;

/// Size of a frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flag bit: this frame commits the transaction.
pub const FRAME_FLAG_COMMIT: u16 = 0x0001;

/// The fixed header at the start of every WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub version: u32,
    pub page_size: u32,
    pub salt: u64,
}

impl WalHeader {
    pub fn new(page_size: u32, salt: u64) -> Self {
        Self {
            version: WAL_FORMAT_VERSION,
            page_size,
            salt,
        }
    }

    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.salt.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..20]);
        buf[20..24].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> WalResult<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(WalError::corrupt(format!(
                "file too small for header: {} bytes",
                buf.len()
            )));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(WalError::corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != WAL_FORMAT_VERSION {
            return Err(WalError::corrupt(format!("unsupported version {version}")));
        }
        let page_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(WalError::corrupt(format!("invalid page size {page_size}")));
        }
        let salt = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let stored = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let computed = crc32fast::hash(&buf[0..20]);
        if stored != computed {
            return Err(WalError::corrupt(format!(
                "header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(Self {
            version,
            page_size,
            salt,
        })
    }
}

/// Per-frame header preceding each page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Page number this frame carries, 1-based.
    pub page_number: u32,
    /// For commit frames, the database size in pages after the
    /// transaction; zero for non-commit frames.
    pub truncate: u32,
    pub flags: u16,
}

impl FrameHeader {
    pub fn is_commit(&self) -> bool {
        self.flags & FRAME_FLAG_COMMIT != 0
    }
}

/// A single WAL frame: header plus one page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(page_number: u32, truncate: u32, flags: u16, data: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                page_number,
                truncate,
                flags,
            },
            data,
        }
    }

    /// Serialize this frame to a writer. The page data length must
    /// match the WAL's page size; the caller enforces that.
    pub fn encode_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&self.header.page_number.to_le_bytes());
        header[4..8].copy_from_slice(&self.header.truncate.to_le_bytes());
        header[8..10].copy_from_slice(&self.header.flags.to_le_bytes());
        // bytes 10..12 reserved, zero
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[0..12]);
        hasher.update(&self.data);
        let crc = hasher.finalize();
        header[12..16].copy_from_slice(&crc.to_le_bytes());
        w.write_all(&header)?;
        w.write_all(&self.data)?;
        Ok(())
    }

    /// Read one frame of `page_size` data bytes from a reader.
    pub fn decode_from<R: Read>(r: &mut R, page_size: u32) -> WalResult<Self> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        r.read_exact(&mut header)
            .map_err(|e| WalError::corrupt(format!("short frame header: {e}")))?;
        let page_number = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let truncate = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let flags = u16::from_le_bytes(header[8..10].try_into().unwrap());
        let stored = u32::from_le_bytes(header[12..16].try_into().unwrap());

        let mut data = vec![0u8; page_size as usize];
        r.read_exact(&mut data)
            .map_err(|e| WalError::corrupt(format!("short frame data: {e}")))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[0..12]);
        hasher.update(&data);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(WalError::corrupt(format!(
                "frame checksum mismatch on page {page_number}: \
                 stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        if page_number == 0 {
            return Err(WalError::corrupt("frame references page 0"));
        }

        Ok(Self {
            header: FrameHeader {
                page_number,
                truncate,
                flags,
            },
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = WalHeader::new(4096, 0xDEAD_BEEF_CAFE_F00D);
        let buf = header.encode();
        let decoded = WalHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = WalHeader::new(4096, 7).encode();
        buf[0] ^= 0xFF;
        assert!(matches!(
            WalHeader::decode(&buf),
            Err(WalError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_checksum() {
        let mut buf = WalHeader::new(4096, 7).encode();
        buf[21] ^= 0xFF;
        assert!(matches!(
            WalHeader::decode(&buf),
            Err(WalError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_rejects_non_power_of_two_page_size() {
        let mut buf = WalHeader::new(4096, 7).encode();
        buf[8..12].copy_from_slice(&1000u32.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..20]);
        buf[20..24].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            WalHeader::decode(&buf),
            Err(WalError::Corrupt(_))
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(3, 12, FRAME_FLAG_COMMIT, vec![0xAB; 512]);
        let mut buf = Vec::new();
        frame.encode_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 512);
        let decoded = Frame::decode_from(&mut buf.as_slice(), 512).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.header.is_commit());
    }

    #[test]
    fn test_frame_detects_flipped_data_bit() {
        let frame = Frame::new(1, 0, 0, vec![0x11; 256]);
        let mut buf = Vec::new();
        frame.encode_to(&mut buf).unwrap();
        buf[FRAME_HEADER_SIZE + 17] ^= 0x01;
        assert!(matches!(
            Frame::decode_from(&mut buf.as_slice(), 256),
            Err(WalError::Corrupt(_))
        ));
    }

    #[test]
    fn test_frame_rejects_short_read() {
        let frame = Frame::new(1, 0, 0, vec![0x11; 256]);
        let mut buf = Vec::new();
        frame.encode_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 10);
        assert!(matches!(
            Frame::decode_from(&mut buf.as_slice(), 256),
            Err(WalError::Corrupt(_))
        ));
    }
}
