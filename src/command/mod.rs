//! Replicated commands.
//!
//! Every mutation of a replicated database travels through the log as
//! one of these commands; the FSM on each node applies them in commit
//! order. The wire layout lives in [`codec`].

mod codec;
mod errors;

pub use codec::{decode, encode};
pub use errors::{CommandError, CommandResult};

use crate::engine::FrameBatch;

/// Current envelope format version.
pub const COMMAND_FORMAT_VERSION: u8 = 1;

/// A single entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ensure the follower connection for `name` is open.
    Open { name: String },
    /// Start write transaction `txn_id` against `name`.
    Begin { txn_id: u64, name: String },
    /// Append a WAL frame batch to transaction `txn_id`.
    Frames {
        txn_id: u64,
        name: String,
        frames: FrameBatch,
    },
    /// Roll transaction `txn_id` back.
    Undo { txn_id: u64 },
    /// Finish transaction `txn_id` and drop it from the registry.
    End { txn_id: u64 },
    /// Fold the WAL of `name` into its database file.
    Checkpoint { name: String },
}

impl Command {
    /// Short command name, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Begin { .. } => "begin",
            Command::Frames { .. } => "frames",
            Command::Undo { .. } => "undo",
            Command::End { .. } => "end",
            Command::Checkpoint { .. } => "checkpoint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WalPage;

    fn sample_batch() -> FrameBatch {
        FrameBatch {
            page_size: 512,
            pages: vec![
                WalPage {
                    number: 3,
                    flags: 0,
                    data: vec![0x11; 512],
                },
                WalPage {
                    number: 1,
                    flags: 0,
                    data: vec![0x22; 512],
                },
            ],
            truncate: 3,
            is_commit: true,
            sync_flags: 2,
        }
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let commands = vec![
            Command::Open {
                name: "app.db".into(),
            },
            Command::Begin {
                txn_id: 9,
                name: "app.db".into(),
            },
            Command::Frames {
                txn_id: 9,
                name: "app.db".into(),
                frames: sample_batch(),
            },
            Command::Undo { txn_id: 9 },
            Command::End { txn_id: 9 },
            Command::Checkpoint {
                name: "app.db".into(),
            },
        ];
        for command in commands {
            let bytes = encode(&command, 0xDEAD_BEEF_CAFE_0001);
            let (decoded, origin) = decode(&bytes).unwrap();
            assert_eq!(decoded, command);
            assert_eq!(origin, 0xDEAD_BEEF_CAFE_0001);
        }
    }

    #[test]
    fn test_zero_nonce_means_no_origin() {
        let bytes = encode(&Command::Undo { txn_id: 1 }, 0);
        let (_, origin) = decode(&bytes).unwrap();
        assert_eq!(origin, 0);
    }

    #[test]
    fn test_flipped_bit_is_corrupt() {
        let mut bytes = encode(
            &Command::Begin {
                txn_id: 4,
                name: "app.db".into(),
            },
            7,
        );
        bytes[12] ^= 0x40;
        assert!(matches!(decode(&bytes), Err(CommandError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let bytes = encode(
            &Command::Frames {
                txn_id: 4,
                name: "app.db".into(),
                frames: sample_batch(),
            },
            7,
        );
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CommandError::Corrupt(_))
        ));
        assert!(matches!(decode(&[]), Err(CommandError::Corrupt(_))));
    }

    #[test]
    fn test_unknown_version_and_kind_are_corrupt() {
        let reject = |mutate: fn(&mut Vec<u8>)| {
            let mut bytes = encode(&Command::Undo { txn_id: 1 }, 0);
            // Strip and recompute the checksum so only the header field
            // under test is wrong.
            bytes.truncate(bytes.len() - 4);
            mutate(&mut bytes);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes);
            let crc = hasher.finalize();
            bytes.extend_from_slice(&crc.to_le_bytes());
            assert!(matches!(decode(&bytes), Err(CommandError::Corrupt(_))));
        };
        reject(|b| b[0] = 99);
        reject(|b| b[1] = 0);
        reject(|b| b[1] = 200);
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let mut bytes = encode(&Command::End { txn_id: 2 }, 0);
        bytes.truncate(bytes.len() - 4);
        bytes.extend_from_slice(&[0, 0, 0]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        let crc = hasher.finalize();
        bytes.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(CommandError::Corrupt(_))));
    }
}
