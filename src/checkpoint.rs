use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

/// Interface to the out-of-band object storing the committed logical length
/// of a log.
///
/// The checkpoint is the sole source of truth for which bytes are visible to
/// readers. It is initialized to zero on first use, mutated only by the
/// writer, and monotonically non-decreasing: implementations reject
/// regressions defensively by storing a value only when it exceeds the one
/// already stored.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Reads the committed logical length. A missing checkpoint object reads
    /// as zero.
    async fn read(&self) -> io::Result<u64>;

    /// Reads the committed logical length, creating the checkpoint object
    /// with a value of zero if it does not exist yet. Writer-only.
    async fn get_or_init(&self) -> io::Result<u64>;

    /// Publishes a new committed logical length. Writer-only.
    ///
    /// Values at or below the stored one are ignored, keeping the checkpoint
    /// monotonic even against misbehaving callers.
    async fn update(&self, position: u64) -> io::Result<()>;
}

/// In-memory checkpoint. Handles are cheap clones sharing one value.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpoint {
    position: Arc<AtomicU64>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpoint for MemoryCheckpoint {
    async fn read(&self) -> io::Result<u64> {
        Ok(self.position.load(Ordering::Acquire))
    }

    async fn get_or_init(&self) -> io::Result<u64> {
        Ok(self.position.load(Ordering::Acquire))
    }

    async fn update(&self, position: u64) -> io::Result<()> {
        self.position.fetch_max(position, Ordering::AcqRel);
        Ok(())
    }
}

/// Checkpoint stored as a single 8-byte little-endian integer in a file.
///
/// Every update rewrites and synchronizes the file, so the stored value is
/// durable by the time `update` returns.
#[derive(Clone, Debug)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { path: path.into() }
    }

    async fn write_position(&self, position: u64) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(&position.to_le_bytes()).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl Checkpoint for FileCheckpoint {
    async fn read(&self) -> io::Result<u64> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("checkpoint file holds {} bytes, expected 8", bytes.len()),
            )
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    async fn get_or_init(&self) -> io::Result<u64> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => self.read().await,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Checkpoint missing, initializing to zero.");
                self.write_position(0).await?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, position: u64) -> io::Result<()> {
        let current = self.read().await?;
        if position > current {
            self.write_position(position).await?;
            trace!(from = current, to = position, "Advanced checkpoint.");
        }
        Ok(())
    }
}
