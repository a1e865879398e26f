use std::{cmp, io, time::Duration};

use snafu::{ensure, ResultExt, Snafu};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::Checkpoint,
    record::{self, StoredMessage},
    storage::PageStorage,
    subscription::Subscription,
};

/// How often `read_async` and the subscription loop poll the checkpoint
/// while waiting for new data.
pub(crate) const CHECKPOINT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Error that occurred during calls to [`Reader`] or [`PrefetchReader`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReaderError {
    /// A page storage or checkpoint operation failed.
    ///
    /// All underlying I/O errors surface as this variant; the read path has
    /// no expected I/O failures of its own.
    #[snafu(display("storage I/O error: {}", source))]
    Storage { source: io::Error },

    /// A caller-supplied offset, count, or size was out of bounds, or a
    /// decoded frame declared an oversize contract or payload.
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },

    /// The requested read position lies beyond the committed length.
    #[snafu(display("invalid state: {}", reason))]
    InvalidState { reason: String },

    /// A frame's version byte did not match the supported format.
    #[snafu(display("unknown message format version: 0x{:02x}", version))]
    UnknownFormat { version: u8 },

    /// The byte window ended in the middle of a frame.
    ///
    /// Readers opened over `[from, committed)` never see this for durably
    /// committed data; it indicates a window bound cutting a frame, or a
    /// corrupted stream.
    #[snafu(display(
        "truncated message frame: needed {} bytes, only {} available",
        needed,
        available
    ))]
    Truncated { needed: usize, available: usize },

    /// A single read request was larger than the prefetch buffer.
    #[snafu(display(
        "read of {} bytes exceeds the prefetch buffer capacity of {}",
        requested,
        capacity
    ))]
    BufferTooSmall { requested: usize, capacity: usize },

    /// The operation was aborted via its cancellation token.
    #[snafu(display("operation cancelled"))]
    Cancelled,
}

/// Forward-only byte stream over the interval `[start, max)` of a page
/// storage target.
///
/// Maintains a sliding window inside a caller-provided buffer: on demand,
/// the unread remainder is compacted to the buffer's head and the next chunk
/// is range-read behind it. Not seekable, not writable.
pub struct PrefetchReader<'a, S: ?Sized> {
    storage: &'a S,
    position: u64,
    max: u64,
    buffer: &'a mut [u8],
    head: usize,
    remaining: usize,
}

impl<'a, S> PrefetchReader<'a, S>
where
    S: PageStorage + ?Sized,
{
    pub fn new(storage: &'a S, start: u64, max: u64, buffer: &'a mut [u8]) -> Self {
        Self {
            storage,
            position: start,
            max,
            buffer,
            head: 0,
            remaining: 0,
        }
    }

    /// The logical position of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads up to `out.len()` bytes, advancing the logical position.
    ///
    /// Returns 0 once the position has reached `max`; returns a short count
    /// only when fewer bytes than requested remain before `max`. Never reads
    /// past `max`.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReaderError> {
        if self.position >= self.max {
            return Ok(0);
        }
        let wanted = out.len();
        if wanted > self.remaining {
            self.prefetch(wanted).await?;
        }

        let take = cmp::min(wanted, self.remaining);
        out[..take].copy_from_slice(&self.buffer[self.head..self.head + take]);
        self.head += take;
        self.remaining -= take;
        self.position += take as u64;
        Ok(take)
    }

    /// Reads exactly `out.len()` bytes, failing with `Truncated` when the
    /// window ends first.
    pub(crate) async fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ReaderError> {
        let got = self.read(out).await?;
        ensure!(
            got == out.len(),
            TruncatedSnafu {
                needed: out.len(),
                available: got,
            }
        );
        Ok(())
    }

    async fn prefetch(&mut self, wanted: usize) -> Result<(), ReaderError> {
        ensure!(
            wanted <= self.buffer.len(),
            BufferTooSmallSnafu {
                requested: wanted,
                capacity: self.buffer.len(),
            }
        );

        // Compact: move the unread remainder to the head of the buffer.
        self.buffer.copy_within(self.head..self.head + self.remaining, 0);
        self.head = 0;

        let download_from = self.position + self.remaining as u64;
        let available = self.max.saturating_sub(download_from);
        let download = cmp::min((self.buffer.len() - self.remaining) as u64, available);
        if download > 0 {
            let start = self.remaining;
            let end = start + download as usize;
            self.storage
                .read_range(&mut self.buffer[start..end], download_from)
                .await
                .context(StorageSnafu)?;
            self.remaining += download as usize;
            trace!(
                download_from,
                download,
                window = self.remaining,
                "Refilled prefetch window."
            );
        }
        Ok(())
    }
}

/// A batch of messages returned by [`Reader::read`].
#[derive(Debug)]
pub struct ReadBatch {
    pub messages: Vec<StoredMessage>,
    /// The logical offset immediately after the last decoded frame, equal to
    /// `from` when the batch is empty. Pass this as the next `from` to
    /// continue the scan.
    pub next_position: u64,
}

/// Reads committed messages from a log.
///
/// Readers are fully independent of the writer and of each other: each one
/// owns its storage and checkpoint handles and a reusable prefetch buffer.
pub struct Reader<S, C> {
    storage: S,
    checkpoint: C,
    buffer: Vec<u8>,
}

impl<S, C> Reader<S, C>
where
    S: PageStorage,
    C: Checkpoint,
{
    /// Creates a reader with a prefetch buffer of `buffer_size` bytes.
    ///
    /// The buffer must be at least one page, and must be at least as large
    /// as the largest frame the reader will decode.
    pub fn new(storage: S, checkpoint: C, buffer_size: usize) -> Result<Self, ReaderError> {
        let page_size = storage.page_size();
        ensure!(
            buffer_size as u64 >= page_size,
            InvalidArgumentSnafu {
                reason: format!(
                    "read buffer of {buffer_size} bytes is smaller than one {page_size} byte page"
                ),
            }
        );
        Ok(Self {
            storage,
            checkpoint,
            buffer: vec![0; buffer_size],
        })
    }

    /// Reads the committed logical length of the log.
    pub async fn position(&self) -> Result<u64, ReaderError> {
        self.checkpoint.read().await.context(StorageSnafu)
    }

    /// Reads up to `max_count` messages from the interval `[from, till)`.
    ///
    /// `till` is clamped to the committed length, so bytes past the
    /// checkpoint are never handed to the decoder. `from` must be a frame
    /// boundary previously handed out by this API (zero, or a
    /// `next_position`).
    #[instrument(skip(self), level = "trace")]
    pub async fn read(
        &mut self,
        from: u64,
        till: u64,
        max_count: usize,
    ) -> Result<ReadBatch, ReaderError> {
        ensure!(
            till >= from,
            InvalidArgumentSnafu {
                reason: format!("till ({till}) must not be before from ({from})"),
            }
        );
        ensure!(
            max_count >= 1,
            InvalidArgumentSnafu {
                reason: "max_count must be at least 1",
            }
        );

        let committed = self.checkpoint.read().await.context(StorageSnafu)?;
        let till = cmp::min(till, committed);

        let mut messages = Vec::new();
        let mut next_position = from;
        let mut window = PrefetchReader::new(&self.storage, from, till, &mut self.buffer);
        while messages.len() < max_count {
            match record::read_message(&mut window).await? {
                Some(message) => {
                    next_position = window.position();
                    messages.push(message);
                }
                None => break,
            }
        }

        trace!(
            count = messages.len(),
            next_position,
            "Read message batch."
        );
        Ok(ReadBatch {
            messages,
            next_position,
        })
    }

    /// Reads up to `max_count` messages starting at `from`, waiting for the
    /// checkpoint to move past `from` if it has not yet.
    ///
    /// Fails with `InvalidState` when `from` lies beyond the committed
    /// length, and with `Cancelled` when the token fires during a poll.
    #[instrument(skip(self, cancel), level = "trace")]
    pub async fn read_async(
        &mut self,
        from: u64,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<ReadBatch, ReaderError> {
        loop {
            ensure!(!cancel.is_cancelled(), CancelledSnafu);

            let committed = self.checkpoint.read().await.context(StorageSnafu)?;
            ensure!(
                committed >= from,
                InvalidStateSnafu {
                    reason: format!(
                        "read position {from} is past the committed length {committed}"
                    ),
                }
            );
            if committed > from {
                return self.read(from, committed, max_count).await;
            }

            tokio::select! {
                () = cancel.cancelled() => return CancelledSnafu.fail(),
                () = sleep(CHECKPOINT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Spawns a background task that streams messages from `start` into a
    /// multi-producer-safe queue until the token is cancelled.
    ///
    /// The task owns clones of this reader's storage and checkpoint handles
    /// and its own prefetch buffer of `buffer_size` bytes. The queue depth
    /// is held at or below `queue_limit` cooperatively: the task pauses in
    /// short sleeps whenever the consumer falls behind.
    pub fn subscribe(
        &self,
        start: u64,
        buffer_size: usize,
        queue_limit: usize,
        cancel: CancellationToken,
    ) -> Result<Subscription, ReaderError>
    where
        S: Clone + 'static,
        C: Clone + 'static,
    {
        let page_size = self.storage.page_size();
        ensure!(
            buffer_size as u64 >= page_size,
            InvalidArgumentSnafu {
                reason: format!(
                    "subscription buffer of {buffer_size} bytes is smaller than one {page_size} byte page"
                ),
            }
        );
        ensure!(
            queue_limit >= 1,
            InvalidArgumentSnafu {
                reason: "queue_limit must be at least 1",
            }
        );

        Ok(Subscription::spawn(
            self.storage.clone(),
            self.checkpoint.clone(),
            start,
            buffer_size,
            queue_limit,
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{PrefetchReader, ReaderError};
    use crate::storage::{MemoryPageStorage, PageStorage};

    async fn pattern_storage(len: usize) -> MemoryPageStorage {
        let storage = MemoryPageStorage::new(512, 4096);
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        storage.ensure_size(len as u64).await.unwrap();
        storage.write_pages(&bytes, 0).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn window_never_reads_past_max() {
        let storage = pattern_storage(1024).await;
        let mut buffer = vec![0_u8; 64];
        let mut window = PrefetchReader::new(&storage, 100, 180, &mut buffer);

        let mut out = vec![0_u8; 50];
        assert_eq!(window.read(&mut out).await.unwrap(), 50);
        assert_eq!(out[0], 100 % 251);
        assert_eq!(window.position(), 150);

        // Only 30 bytes remain before max; the read comes up short.
        assert_eq!(window.read(&mut out).await.unwrap(), 30);
        assert_eq!(window.position(), 180);
        assert_eq!(window.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_request_fails_buffer_too_small() {
        let storage = pattern_storage(1024).await;
        let mut buffer = vec![0_u8; 64];
        let mut window = PrefetchReader::new(&storage, 0, 1024, &mut buffer);

        let mut out = vec![0_u8; 65];
        assert!(matches!(
            window.read(&mut out).await,
            Err(ReaderError::BufferTooSmall {
                requested: 65,
                capacity: 64,
            })
        ));

        // The window is still usable for requests within capacity.
        let mut out = vec![0_u8; 64];
        assert_eq!(window.read(&mut out).await.unwrap(), 64);
    }

    #[tokio::test]
    async fn sliding_window_is_byte_exact_across_refills() {
        let storage = pattern_storage(2048).await;
        let mut buffer = vec![0_u8; 70];
        let mut window = PrefetchReader::new(&storage, 0, 2048, &mut buffer);

        let mut collected = Vec::new();
        let mut out = vec![0_u8; 33];
        loop {
            let got = window.read(&mut out).await.unwrap();
            if got == 0 {
                break;
            }
            collected.extend_from_slice(&out[..got]);
        }

        let expected: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        assert_eq!(collected, expected);
    }
}
