//! Command envelope encoding.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [format version u8][kind u8][origin nonce u64][payload][CRC32 u32]
//! ```
//!
//! The checksum covers everything before it. The origin nonce tags
//! commands submitted by a local hook so the FSM gate can recognize
//! its own entries; zero means no origin.

use crc32fast::Hasher;

use super::errors::{CommandError, CommandResult};
use super::{Command, COMMAND_FORMAT_VERSION};
use crate::engine::{FrameBatch, WalPage};

const ENVELOPE_OVERHEAD: usize = 1 + 1 + 8 + 4;

// Decode-time sanity bounds. Anything larger is corruption, not data.
const MAX_NAME_LEN: usize = 4096;
const MAX_PAGES: usize = 1 << 20;
const MAX_PAGE_SIZE: u32 = 1 << 16;

const KIND_OPEN: u8 = 1;
const KIND_BEGIN: u8 = 2;
const KIND_FRAMES: u8 = 3;
const KIND_UNDO: u8 = 4;
const KIND_END: u8 = 5;
const KIND_CHECKPOINT: u8 = 6;

/// Serialize `command` into a log entry, tagged with `origin_nonce`.
pub fn encode(command: &Command, origin_nonce: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENVELOPE_OVERHEAD + 64);
    buf.push(COMMAND_FORMAT_VERSION);
    buf.push(kind_byte(command));
    buf.extend_from_slice(&origin_nonce.to_le_bytes());

    match command {
        Command::Open { name } => put_str(&mut buf, name),
        Command::Begin { txn_id, name } => {
            buf.extend_from_slice(&txn_id.to_le_bytes());
            put_str(&mut buf, name);
        }
        Command::Frames {
            txn_id,
            name,
            frames,
        } => {
            buf.extend_from_slice(&txn_id.to_le_bytes());
            put_str(&mut buf, name);
            put_batch(&mut buf, frames);
        }
        Command::Undo { txn_id } | Command::End { txn_id } => {
            buf.extend_from_slice(&txn_id.to_le_bytes());
        }
        Command::Checkpoint { name } => put_str(&mut buf, name),
    }

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Deserialize a log entry back into a command and its origin nonce.
pub fn decode(data: &[u8]) -> CommandResult<(Command, u64)> {
    if data.len() < ENVELOPE_OVERHEAD {
        return Err(CommandError::corrupt(format!(
            "{} bytes, need at least {ENVELOPE_OVERHEAD}",
            data.len()
        )));
    }

    let (body, trailer) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes(trailer.try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(body);
    let actual = hasher.finalize();
    if stored != actual {
        return Err(CommandError::corrupt(format!(
            "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
        )));
    }

    let version = body[0];
    if version != COMMAND_FORMAT_VERSION {
        return Err(CommandError::corrupt(format!(
            "unsupported format version {version}"
        )));
    }
    let kind = body[1];
    let origin = u64::from_le_bytes(body[2..10].try_into().unwrap());

    let mut cursor = Cursor {
        buf: &body[10..],
        pos: 0,
    };
    let command = match kind {
        KIND_OPEN => Command::Open {
            name: cursor.take_str()?,
        },
        KIND_BEGIN => Command::Begin {
            txn_id: cursor.take_u64()?,
            name: cursor.take_str()?,
        },
        KIND_FRAMES => Command::Frames {
            txn_id: cursor.take_u64()?,
            name: cursor.take_str()?,
            frames: cursor.take_batch()?,
        },
        KIND_UNDO => Command::Undo {
            txn_id: cursor.take_u64()?,
        },
        KIND_END => Command::End {
            txn_id: cursor.take_u64()?,
        },
        KIND_CHECKPOINT => Command::Checkpoint {
            name: cursor.take_str()?,
        },
        other => {
            return Err(CommandError::corrupt(format!("unknown kind byte {other}")));
        }
    };

    if cursor.pos != cursor.buf.len() {
        return Err(CommandError::corrupt(format!(
            "{} trailing payload bytes",
            cursor.buf.len() - cursor.pos
        )));
    }
    Ok((command, origin))
}

fn kind_byte(command: &Command) -> u8 {
    match command {
        Command::Open { .. } => KIND_OPEN,
        Command::Begin { .. } => KIND_BEGIN,
        Command::Frames { .. } => KIND_FRAMES,
        Command::Undo { .. } => KIND_UNDO,
        Command::End { .. } => KIND_END,
        Command::Checkpoint { .. } => KIND_CHECKPOINT,
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_batch(buf: &mut Vec<u8>, batch: &FrameBatch) {
    buf.extend_from_slice(&batch.page_size.to_le_bytes());
    buf.extend_from_slice(&batch.truncate.to_le_bytes());
    buf.push(batch.is_commit as u8);
    buf.push(batch.sync_flags);
    buf.extend_from_slice(&(batch.pages.len() as u32).to_le_bytes());
    for page in &batch.pages {
        buf.extend_from_slice(&page.number.to_le_bytes());
        buf.extend_from_slice(&page.flags.to_le_bytes());
        buf.extend_from_slice(&page.data);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> CommandResult<&[u8]> {
        if self.buf.len() - self.pos < n {
            return Err(CommandError::corrupt(format!(
                "truncated payload: need {n} bytes at offset {}",
                self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u16(&mut self) -> CommandResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> CommandResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> CommandResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_str(&mut self) -> CommandResult<String> {
        let len = self.take_u32()? as usize;
        if len > MAX_NAME_LEN {
            return Err(CommandError::corrupt(format!("name length {len}")));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CommandError::corrupt("name is not valid UTF-8"))
    }

    fn take_batch(&mut self) -> CommandResult<FrameBatch> {
        let page_size = self.take_u32()?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(CommandError::corrupt(format!("page size {page_size}")));
        }
        let truncate = self.take_u32()?;
        let is_commit = match self.take(1)?[0] {
            0 => false,
            1 => true,
            other => {
                return Err(CommandError::corrupt(format!("commit marker {other}")));
            }
        };
        let sync_flags = self.take(1)?[0];
        let count = self.take_u32()? as usize;
        if count > MAX_PAGES {
            return Err(CommandError::corrupt(format!("page count {count}")));
        }
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let number = self.take_u32()?;
            if number == 0 {
                return Err(CommandError::corrupt("page number zero"));
            }
            let flags = self.take_u16()?;
            let data = self.take(page_size as usize)?.to_vec();
            pages.push(WalPage {
                number,
                flags,
                data,
            });
        }
        Ok(FrameBatch {
            page_size,
            pages,
            truncate,
            is_commit,
            sync_flags,
        })
    }
}
