//! WAL file I/O.
//!
//! A [`WalFile`] owns the on-disk `-wal` file for one database. The
//! header is written lazily on the first append, because the page size
//! is only known once the first frame batch arrives. Every append is
//! followed by fsync; truncation (undo, checkpoint reset) likewise.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::errors::{WalError, WalResult};
use super::record::{Frame, WalHeader, FRAME_HEADER_SIZE, WAL_HEADER_SIZE};

/// Handle on a single WAL file.
pub struct WalFile {
    path: PathBuf,
    file: File,
    /// Header, present once the file has been initialized.
    header: Option<WalHeader>,
    /// Number of valid frames currently in the file.
    frame_count: usize,
}

impl WalFile {
    /// Open the WAL file at `path`, creating it if missing.
    ///
    /// An existing file is validated end to end: a bad header, a bad
    /// frame checksum, or a torn trailing frame is reported as
    /// corruption.
    pub fn open(path: &Path) -> WalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| WalError::io(path, e))?;

        let mut wal = Self {
            path: path.to_path_buf(),
            file,
            header: None,
            frame_count: 0,
        };
        wal.load()?;
        Ok(wal)
    }

    /// Page size recorded in the header, if the WAL is initialized.
    pub fn page_size(&self) -> Option<u32> {
        self.header.map(|h| h.page_size)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of frames, initializing the header first if this
    /// is the first write. The batch is a single fsync unit.
    pub fn append(&mut self, page_size: u32, frames: &[Frame]) -> WalResult<()> {
        let header = match self.header {
            Some(h) => {
                if h.page_size != page_size {
                    return Err(WalError::PageSizeMismatch {
                        existing: h.page_size,
                        requested: page_size,
                    });
                }
                h
            }
            None => {
                let header = WalHeader::new(page_size, salt());
                self.file
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| WalError::io(&self.path, e))?;
                self.file
                    .write_all(&header.encode())
                    .map_err(|e| WalError::io(&self.path, e))?;
                self.header = Some(header);
                header
            }
        };

        let offset = Self::frame_offset(header.page_size, self.frame_count);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| WalError::io(&self.path, e))?;

        let mut buf = Vec::with_capacity(
            frames.len() * (FRAME_HEADER_SIZE + header.page_size as usize),
        );
        for frame in frames {
            if frame.data.len() != header.page_size as usize {
                return Err(WalError::corrupt(format!(
                    "frame for page {} has {} data bytes, page size is {}",
                    frame.header.page_number,
                    frame.data.len(),
                    header.page_size
                )));
            }
            frame
                .encode_to(&mut buf)
                .map_err(|e| WalError::io(&self.path, e))?;
        }
        self.file
            .write_all(&buf)
            .map_err(|e| WalError::io(&self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| WalError::io(&self.path, e))?;

        self.frame_count += frames.len();
        Ok(())
    }

    /// Read every frame currently in the WAL.
    pub fn read_frames(&mut self) -> WalResult<Vec<Frame>> {
        let header = match self.header {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.file
            .seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))
            .map_err(|e| WalError::io(&self.path, e))?;

        let mut frames = Vec::with_capacity(self.frame_count);
        for _ in 0..self.frame_count {
            frames.push(Frame::decode_from(&mut self.file, header.page_size)?);
        }
        Ok(frames)
    }

    /// Truncate the WAL back to `frame_count` frames. Used to undo a
    /// write transaction's appends.
    pub fn truncate_to(&mut self, frame_count: usize) -> WalResult<()> {
        if frame_count > self.frame_count {
            return Err(WalError::TruncateBeyondEnd {
                requested: frame_count,
                current: self.frame_count,
            });
        }
        let header = match self.header {
            Some(h) => h,
            None => return Ok(()), // nothing written yet
        };
        let len = Self::frame_offset(header.page_size, frame_count);
        self.file
            .set_len(len)
            .map_err(|e| WalError::io(&self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| WalError::io(&self.path, e))?;
        self.frame_count = frame_count;
        Ok(())
    }

    /// Drop every frame, keeping the header. Used after a checkpoint
    /// has folded the WAL into the database file.
    pub fn reset(&mut self) -> WalResult<()> {
        self.truncate_to(0)
    }

    /// Rebuild in-memory state from the file contents.
    fn load(&mut self) -> WalResult<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| WalError::io(&self.path, e))?
            .len();

        if len == 0 {
            self.header = None;
            self.frame_count = 0;
            return Ok(());
        }

        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| WalError::io(&self.path, e))?;
        self.file
            .read_exact(&mut header_buf)
            .map_err(|e| WalError::corrupt(format!("short header read: {e}")))?;
        let header = WalHeader::decode(&header_buf)?;

        let frame_size = (FRAME_HEADER_SIZE + header.page_size as usize) as u64;
        let body = len - WAL_HEADER_SIZE as u64;
        if body % frame_size != 0 {
            return Err(WalError::corrupt(format!(
                "torn trailing frame: {body} body bytes, frame size {frame_size}"
            )));
        }
        let frame_count = (body / frame_size) as usize;

        // Validate every frame checksum so corruption is caught at
        // open time, not when a checkpoint replays the frame.
        for _ in 0..frame_count {
            Frame::decode_from(&mut self.file, header.page_size)?;
        }

        self.header = Some(header);
        self.frame_count = frame_count;
        Ok(())
    }

    fn frame_offset(page_size: u32, frame_index: usize) -> u64 {
        WAL_HEADER_SIZE as u64
            + frame_index as u64 * (FRAME_HEADER_SIZE + page_size as usize) as u64
    }
}

fn salt() -> u64 {
    // The salt only needs to distinguish WAL generations.
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::FRAME_FLAG_COMMIT;
    use tempfile::TempDir;

    fn frame(page: u32, fill: u8, size: usize) -> Frame {
        Frame::new(page, 0, 0, vec![fill; size])
    }

    fn commit_frame(page: u32, fill: u8, size: usize, truncate: u32) -> Frame {
        Frame::new(page, truncate, FRAME_FLAG_COMMIT, vec![fill; size])
    }

    #[test]
    fn test_open_empty_file_is_uninitialized() {
        let dir = TempDir::new().unwrap();
        let wal = WalFile::open(&dir.path().join("db-wal")).unwrap();
        assert_eq!(wal.frame_count(), 0);
        assert_eq!(wal.page_size(), None);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-wal");
        let mut wal = WalFile::open(&path).unwrap();
        wal.append(512, &[frame(1, 0xAA, 512), commit_frame(2, 0xBB, 512, 2)])
            .unwrap();
        assert_eq!(wal.frame_count(), 2);
        assert_eq!(wal.page_size(), Some(512));

        let frames = wal.read_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.page_number, 1);
        assert!(frames[1].header.is_commit());
        assert_eq!(frames[1].header.truncate, 2);
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-wal");
        {
            let mut wal = WalFile::open(&path).unwrap();
            wal.append(512, &[frame(1, 0x01, 512)]).unwrap();
        }
        let wal = WalFile::open(&path).unwrap();
        assert_eq!(wal.frame_count(), 1);
        assert_eq!(wal.page_size(), Some(512));
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalFile::open(&dir.path().join("db-wal")).unwrap();
        wal.append(512, &[frame(1, 0x01, 512)]).unwrap();
        let err = wal.append(1024, &[frame(2, 0x02, 1024)]).unwrap_err();
        assert!(matches!(err, WalError::PageSizeMismatch { .. }));
    }

    #[test]
    fn test_truncate_undoes_appends() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalFile::open(&dir.path().join("db-wal")).unwrap();
        wal.append(512, &[frame(1, 0x01, 512)]).unwrap();
        wal.append(512, &[frame(2, 0x02, 512), frame(3, 0x03, 512)])
            .unwrap();
        wal.truncate_to(1).unwrap();
        assert_eq!(wal.frame_count(), 1);
        let frames = wal.read_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.page_number, 1);
    }

    #[test]
    fn test_torn_tail_detected_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-wal");
        {
            let mut wal = WalFile::open(&path).unwrap();
            wal.append(512, &[frame(1, 0x01, 512)]).unwrap();
        }
        // Chop mid-frame to simulate a torn write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 100).unwrap();

        assert!(matches!(
            WalFile::open(&path),
            Err(WalError::Corrupt(_))
        ));
    }

    #[test]
    fn test_flipped_bit_detected_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db-wal");
        {
            let mut wal = WalFile::open(&path).unwrap();
            wal.append(512, &[frame(1, 0x01, 512)]).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            WalFile::open(&path),
            Err(WalError::Corrupt(_))
        ));
    }
}
