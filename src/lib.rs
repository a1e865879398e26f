//! # MessageVault: a page-aligned append-only message log.
//!
//! This crate implements a single-writer, many-reader message log on top of a
//! page-addressable blob store, such as a cloud page blob or a local file. A
//! writer appends variable-length messages; readers scan forward from
//! arbitrary offsets or subscribe for a continuous live tail.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for
//! keeping the design simple and understandable:
//! - the data blob only grows, and always by whole pages
//! - writes to the data blob are page-aligned and a whole number of pages
//! - a single unsigned 64-bit checkpoint is the sole source of truth for
//!   which bytes are visible to readers
//! - every byte below the checkpoint decodes as a gapless sequence of
//!   message frames
//! - bytes between the checkpoint and the physical end of the blob are
//!   stale and never observed by readers
//! - at most one writer is active per log; coordination of that is left to
//!   the deployment (blob lease, single owning process)
//!
//! ## On-disk layout
//!
//! A log is two blob-like objects inside one container: `stream.dat` holds
//! the framed messages, `stream.chk` holds the committed logical length.
//!
//! Each message is framed as:
//!
//!   frame:
//!     `version`:      0x01
//!     `id`:           uint8[16]
//!     `contract_len`: unsigned varint (7-bit continuation, low group first)
//!     `contract`:     UTF-8 bytes
//!     `payload_len`:  uint32 (little-endian)
//!     `payload`:      uint8[]
//!
//! All multi-byte integers are little-endian. The id encodes the creation
//! timestamp and the logical offset of the frame, which makes ids
//! deterministic and unique without any out-of-band allocator.
//!
//! ## Writing messages
//!
//! The writer frames messages into a RAM buffer sized to the storage's
//! maximum commit size. When the buffer fills, or at the end of an append
//! batch, the buffered bytes are written out as whole pages starting at the
//! page containing the current tail of the stream. The last, partially
//! filled page is rewritten on every commit until it fills up; once a page
//! is full it is never written again. The checkpoint is published only
//! after all pages of a batch are persisted, so readers observe appends
//! all-or-nothing and never see a partial frame.
//!
//! A crash between the page write and the checkpoint update leaves stale
//! bytes past the committed length. The next writer rebuilds its buffer
//! tail from the page containing the checkpointed length and simply
//! overwrites the stale region. The checkpoint never regresses.
//!
//! ## Reading messages
//!
//! Reads stream forward through a caller-sized prefetch window: the reader
//! slides a single buffer across `[start, max)`, compacting the unread
//! remainder and range-reading the next chunk on demand. Decoding never
//! looks past the committed length. A subscription runs the same read path
//! in a background task, polling the checkpoint for new data and feeding a
//! multi-producer-safe queue with cooperative back-pressure.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate tracing;

pub mod checkpoint;
pub mod config;
pub mod reader;
pub mod record;
pub mod storage;
pub mod subscription;
pub mod writer;

#[cfg(test)]
mod tests;

pub use checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
pub use config::{BuildError, VaultConfig, VaultConfigBuilder};
pub use reader::{PrefetchReader, ReadBatch, Reader, ReaderError};
pub use record::{
    frame_len, Clock, Message, MessageId, StoredMessage, SystemClock, FORMAT_VERSION,
    MAX_CONTRACT_LEN, MAX_FRAME_LEN,
};
pub use storage::{FilePageStorage, MemoryPageStorage, PageStorage};
pub use subscription::Subscription;
pub use writer::{Writer, WriterError};

/// Name of the data blob inside a vault container.
pub const DATA_FILE_NAME: &str = "stream.dat";

/// Name of the checkpoint blob inside a vault container.
pub const CHECKPOINT_FILE_NAME: &str = "stream.chk";

/// Helper type for opening the file-backed writer and reader of a vault.
pub struct Vault;

impl Vault {
    /// Opens the writing side of the vault described by `config`.
    ///
    /// The data and checkpoint files are created if they do not exist yet;
    /// otherwise the writer picks up at the committed length, rebuilding its
    /// buffer tail from the last partially filled page.
    pub async fn open_writer(
        config: &VaultConfig,
    ) -> Result<Writer<FilePageStorage, FileCheckpoint>, WriterError> {
        let storage = FilePageStorage::new(
            config.data_dir.join(DATA_FILE_NAME),
            config.page_size,
            config.max_commit_size,
        );
        let checkpoint = FileCheckpoint::new(config.data_dir.join(CHECKPOINT_FILE_NAME));
        let mut writer = Writer::new(storage, checkpoint);
        writer.init().await?;
        Ok(writer)
    }

    /// Opens the reading side of the vault described by `config`.
    ///
    /// Readers are fully independent of the writer and of each other; each
    /// one owns its own read buffer and file handles.
    pub fn open_reader(
        config: &VaultConfig,
    ) -> Result<Reader<FilePageStorage, FileCheckpoint>, ReaderError> {
        let storage = FilePageStorage::new(
            config.data_dir.join(DATA_FILE_NAME),
            config.page_size,
            config.max_commit_size,
        );
        let checkpoint = FileCheckpoint::new(config.data_dir.join(CHECKPOINT_FILE_NAME));
        Reader::new(storage, checkpoint, config.read_buffer_size)
    }
}
