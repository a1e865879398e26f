use std::io;

use snafu::{ensure, ResultExt, Snafu};

use crate::{
    checkpoint::Checkpoint,
    record::{self, Clock, Message, MessageId, SystemClock, MAX_CONTRACT_LEN, MAX_FRAME_LEN},
    storage::{full_pages, PageStorage},
};

/// Error that occurred during calls to [`Writer`].
#[derive(Debug, Snafu)]
pub enum WriterError {
    /// A page storage or checkpoint operation failed.
    ///
    /// A failed append leaves the committed length unchanged and the commit
    /// buffer intact: the messages framed so far stay buffered and are
    /// committed by the next successful append.
    #[snafu(display("storage I/O error: {}", source))]
    Storage { source: io::Error },

    /// An append batch was empty, or a message exceeded the size limits.
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },

    /// The writer was not in the right state for the operation.
    #[snafu(display("invalid state: {}", reason))]
    InvalidState { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Uninitialized,
    Ready,
    Closed,
}

/// The single writer of a log: buffered, page-aligned appends.
///
/// Messages are framed into a RAM buffer sized to the storage's maximum
/// commit size. Flushes rewrite whole pages starting at the page containing
/// the stream's tail; the last, partially filled page is rewritten on every
/// flush until it fills, and the bytes of that partial page are preserved in
/// the buffer across flushes so no earlier data is destroyed. The checkpoint
/// is published once per append batch, after all pages are persisted, which
/// is what makes appends visible all-or-nothing.
///
/// At most one writer may be active per log; coordinating that is left to
/// the deployment.
pub struct Writer<S, C, T = SystemClock> {
    storage: S,
    checkpoint: C,
    clock: T,
    buffer: Vec<u8>,
    cursor: usize,
    length: u64,
    page_size: u64,
    state: WriterState,
}

impl<S, C> Writer<S, C, SystemClock>
where
    S: PageStorage,
    C: Checkpoint,
{
    pub fn new(storage: S, checkpoint: C) -> Self {
        Self::with_clock(storage, checkpoint, SystemClock)
    }
}

impl<S, C, T> Writer<S, C, T>
where
    S: PageStorage,
    C: Checkpoint,
    T: Clock,
{
    pub fn with_clock(storage: S, checkpoint: C, clock: T) -> Self {
        Self {
            storage,
            checkpoint,
            clock,
            buffer: Vec::new(),
            cursor: 0,
            length: 0,
            page_size: 0,
            state: WriterState::Uninitialized,
        }
    }

    /// Initializes the writer.
    ///
    /// Creates the underlying storage and checkpoint objects if missing,
    /// reads the committed length, and rebuilds the buffer tail: when the
    /// committed length ends inside a page, that page's committed prefix is
    /// copied back into the buffer so the next flush rewrites the page
    /// without destroying it.
    #[instrument(skip(self), level = "debug")]
    pub async fn init(&mut self) -> Result<(), WriterError> {
        ensure!(
            self.state == WriterState::Uninitialized,
            InvalidStateSnafu {
                reason: "writer is already initialized",
            }
        );

        self.storage.init().await.context(StorageSnafu)?;

        let page_size = self.storage.page_size();
        let capacity = self.storage.max_commit_size();
        ensure!(
            page_size > 0 && capacity >= page_size && capacity % page_size == 0,
            InvalidArgumentSnafu {
                reason: format!(
                    "commit size {capacity} is not a positive multiple of the page size {page_size}"
                ),
            }
        );
        self.page_size = page_size;
        self.buffer = vec![0; capacity as usize];

        self.length = self.checkpoint.get_or_init().await.context(StorageSnafu)?;
        let tail = (self.length % page_size) as usize;
        if tail > 0 {
            let tail_base = self.length - tail as u64;
            self.storage
                .read_range(&mut self.buffer[..tail], tail_base)
                .await
                .context(StorageSnafu)?;
        }
        self.cursor = tail;
        self.state = WriterState::Ready;

        debug!(length = self.length, tail, "Writer initialized.");
        Ok(())
    }

    /// The logical offset in the stream of `buffer[0]`.
    fn tail_base(&self) -> u64 {
        self.length - self.length % self.page_size
    }

    /// The logical offset at which the next framed byte will live.
    fn virtual_position(&self) -> u64 {
        self.tail_base() + self.cursor as u64
    }

    /// Appends a batch of messages and publishes the new committed length.
    ///
    /// The batch becomes visible to readers atomically: the checkpoint is
    /// updated only after every page of the batch has been written. Returns
    /// the new committed length.
    #[instrument(skip_all, level = "trace")]
    pub async fn append(&mut self, messages: &[Message]) -> Result<u64, WriterError> {
        match self.state {
            WriterState::Ready => {}
            WriterState::Uninitialized => {
                return InvalidStateSnafu {
                    reason: "writer is not initialized",
                }
                .fail()
            }
            WriterState::Closed => {
                return InvalidStateSnafu {
                    reason: "writer is closed",
                }
                .fail()
            }
        }
        ensure!(
            !messages.is_empty(),
            InvalidArgumentSnafu {
                reason: "append requires at least one message",
            }
        );

        // Validate the whole batch before framing anything, so a bad message
        // cannot leave half a batch buffered.
        let max_usable = self.buffer.len() - (self.page_size as usize - 1);
        for message in messages {
            ensure!(
                message.contract.len() <= MAX_CONTRACT_LEN,
                InvalidArgumentSnafu {
                    reason: format!(
                        "contract of {} bytes exceeds the maximum of {} bytes",
                        message.contract.len(),
                        MAX_CONTRACT_LEN
                    ),
                }
            );
            let size = record::frame_len(&message.contract, message.payload.len());
            ensure!(
                size <= MAX_FRAME_LEN && size <= max_usable,
                InvalidArgumentSnafu {
                    reason: format!(
                        "framed message of {size} bytes exceeds the maximum of {} bytes",
                        MAX_FRAME_LEN.min(max_usable)
                    ),
                }
            );
        }

        for message in messages {
            let size = record::frame_len(&message.contract, message.payload.len());
            if size > self.buffer.len() - self.cursor {
                self.flush().await?;
            }

            let offset = self.virtual_position();
            let id = MessageId::new(offset, self.clock.millis_since_epoch());
            let end = self.cursor + size;
            let mut slot = &mut self.buffer[self.cursor..end];
            record::write_frame(&mut slot, &id, &message.contract, &message.payload);
            self.cursor = end;
            trace!(offset, size, "Framed message into the commit buffer.");
        }

        self.flush().await?;
        self.checkpoint
            .update(self.length)
            .await
            .context(StorageSnafu)?;

        debug!(
            length = self.length,
            count = messages.len(),
            "Committed append batch."
        );
        Ok(self.length)
    }

    /// Persists the buffered bytes as whole pages.
    ///
    /// Rewrites the page containing the current tail, possibly many times
    /// over the lifetime of that page until it fills; a page that has filled
    /// is never written again. After the write, the bytes of the new
    /// partially filled page are moved to the buffer's head so the next
    /// flush can rewrite that page in place.
    #[instrument(skip(self), level = "trace")]
    async fn flush(&mut self) -> Result<(), WriterError> {
        let bytes_in_buffer = self.cursor;
        if bytes_in_buffer == 0 {
            return Ok(());
        }

        let page = self.page_size as usize;
        let tail_base = self.tail_base();
        let new_length = tail_base + bytes_in_buffer as u64;

        self.storage
            .ensure_size(full_pages(new_length, self.page_size))
            .await
            .context(StorageSnafu)?;

        let pages_to_write = full_pages(bytes_in_buffer as u64, self.page_size) as usize;
        self.storage
            .write_pages(&self.buffer[..pages_to_write], tail_base)
            .await
            .context(StorageSnafu)?;

        self.length = new_length;

        let new_tail = bytes_in_buffer % page;
        if bytes_in_buffer >= page {
            if new_tail > 0 {
                let last_page_start = bytes_in_buffer - new_tail;
                self.buffer.copy_within(last_page_start..bytes_in_buffer, 0);
            }
            self.cursor = new_tail;
        }

        trace!(
            length = self.length,
            pages_to_write,
            cursor = self.cursor,
            "Flushed commit buffer."
        );
        Ok(())
    }
}

impl<S, C, T> Writer<S, C, T> {
    /// The committed logical length as of the last successful flush.
    pub fn committed_length(&self) -> u64 {
        self.length
    }

    /// Closes this [`Writer`].
    ///
    /// Idempotent; also runs on drop. A closed writer rejects appends with
    /// `InvalidState`.
    pub fn close(&mut self) {
        if self.state != WriterState::Closed {
            self.state = WriterState::Closed;
            debug!("Writer closed.");
        }
    }
}

impl<S, C, T> Drop for Writer<S, C, T> {
    fn drop(&mut self) {
        self.close();
    }
}
