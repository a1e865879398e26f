use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
};

/// Rounds `len` up to a whole number of pages.
pub(crate) fn full_pages(len: u64, page_size: u64) -> u64 {
    ((len + page_size - 1) / page_size) * page_size
}

/// Generalized interface to a growable, page-addressable byte container.
///
/// The container holds an unstructured byte stream; framing is the engine's
/// responsibility. Reads are ranged, writes must be aligned to the page size
/// and a whole number of pages long, and the total length is a multiple of
/// the page size and only ever grows.
#[async_trait]
pub trait PageStorage: Send + Sync {
    /// Gets the fixed page size, in bytes.
    ///
    /// All write offsets and lengths must be multiples of this value. It is
    /// a non-zero multiple of 512; powers of two are recommended.
    fn page_size(&self) -> u64;

    /// Gets the maximum size, in bytes, of a single `write_pages` call.
    ///
    /// A multiple of the page size. The writer sizes its commit buffer to
    /// this value.
    fn max_commit_size(&self) -> u64;

    /// Creates the underlying object if it does not exist yet.
    ///
    /// Idempotent: calling this against an existing object is a no-op.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred while creating or opening the underlying
    /// object, an error variant will be returned describing the underlying
    /// error.
    async fn init(&self) -> io::Result<()>;

    /// Gets the current physical size, in bytes. Always a multiple of the
    /// page size.
    async fn size(&self) -> io::Result<u64>;

    /// Grows the container to at least `size` bytes, rounded up to a whole
    /// number of pages. Never shrinks.
    async fn ensure_size(&self, size: u64) -> io::Result<()>;

    /// Overwrites the range starting at `offset` with `src`.
    ///
    /// `offset` and `src.len()` must both be multiples of the page size, and
    /// the range must lie within the current physical size.
    async fn write_pages(&self, src: &[u8], offset: u64) -> io::Result<()>;

    /// Reads exactly `dst.len()` bytes starting at `offset`.
    ///
    /// Fails if the range extends past the current physical size.
    async fn read_range(&self, dst: &mut [u8], offset: u64) -> io::Result<()>;
}

fn check_page_aligned(page_size: u64, len: usize, offset: u64) -> io::Result<()> {
    if offset % page_size != 0 || len as u64 % page_size != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("write of {len} bytes at offset {offset} is not aligned to {page_size} byte pages"),
        ));
    }
    Ok(())
}

/// In-memory page storage.
///
/// Backs the test suite, and doubles as the reference implementation of the
/// `PageStorage` contract. Handles are cheap clones sharing one container.
/// The number of writes issued against each page is tracked, which lets
/// tests assert that a page is never rewritten once it has filled up.
#[derive(Clone, Debug)]
pub struct MemoryPageStorage {
    inner: Arc<Mutex<MemoryState>>,
    page_size: u64,
    max_commit_size: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    page_writes: HashMap<u64, u64>,
}

impl MemoryPageStorage {
    pub fn new(page_size: u64, max_commit_size: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState::default())),
            page_size,
            max_commit_size,
        }
    }

    /// Gets the number of `write_pages` calls that touched the given page.
    pub fn page_write_count(&self, page_index: u64) -> u64 {
        self.inner
            .lock()
            .page_writes
            .get(&page_index)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageStorage for MemoryPageStorage {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn max_commit_size(&self) -> u64 {
        self.max_commit_size
    }

    async fn init(&self) -> io::Result<()> {
        Ok(())
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.inner.lock().data.len() as u64)
    }

    async fn ensure_size(&self, size: u64) -> io::Result<()> {
        let target = full_pages(size, self.page_size) as usize;
        let mut state = self.inner.lock();
        if state.data.len() < target {
            state.data.resize(target, 0);
        }
        Ok(())
    }

    async fn write_pages(&self, src: &[u8], offset: u64) -> io::Result<()> {
        check_page_aligned(self.page_size, src.len(), offset)?;

        let mut state = self.inner.lock();
        let end = offset as usize + src.len();
        if end > state.data.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "write through {} is past the end of the container ({} bytes)",
                    end,
                    state.data.len()
                ),
            ));
        }

        state.data[offset as usize..end].copy_from_slice(src);
        for page_index in offset / self.page_size..(end as u64) / self.page_size {
            *state.page_writes.entry(page_index).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn read_range(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        let state = self.inner.lock();
        let end = offset as usize + dst.len();
        if end > state.data.len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "read through {} is past the end of the container ({} bytes)",
                    end,
                    state.data.len()
                ),
            ));
        }

        dst.copy_from_slice(&state.data[offset as usize..end]);
        Ok(())
    }
}

/// Page storage backed by a local file, via Tokio's `File`.
///
/// Handles are cheap clones sharing one lazily opened file handle. Page
/// writes are synchronized to disk before returning, so a published
/// checkpoint never refers to bytes the filesystem could still lose.
#[derive(Clone, Debug)]
pub struct FilePageStorage {
    inner: Arc<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    path: PathBuf,
    page_size: u64,
    max_commit_size: u64,
    file: AsyncMutex<Option<File>>,
}

impl FilePageStorage {
    pub fn new<P>(path: P, page_size: u64, max_commit_size: u64) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            inner: Arc::new(FileInner {
                path: path.into(),
                page_size,
                max_commit_size,
                file: AsyncMutex::new(None),
            }),
        }
    }

    async fn open_locked(&self) -> io::Result<tokio::sync::MutexGuard<'_, Option<File>>> {
        let mut guard = self.inner.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.inner.path)
                .await?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait]
impl PageStorage for FilePageStorage {
    fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    fn max_commit_size(&self) -> u64 {
        self.inner.max_commit_size
    }

    async fn init(&self) -> io::Result<()> {
        self.open_locked().await.map(|_| ())
    }

    async fn size(&self) -> io::Result<u64> {
        let mut guard = self.open_locked().await?;
        let file = guard.as_mut().expect("file handle exists after open");
        Ok(file.metadata().await?.len())
    }

    async fn ensure_size(&self, size: u64) -> io::Result<()> {
        let target = full_pages(size, self.inner.page_size);
        let mut guard = self.open_locked().await?;
        let file = guard.as_mut().expect("file handle exists after open");
        if file.metadata().await?.len() < target {
            file.set_len(target).await?;
        }
        Ok(())
    }

    async fn write_pages(&self, src: &[u8], offset: u64) -> io::Result<()> {
        check_page_aligned(self.inner.page_size, src.len(), offset)?;

        let mut guard = self.open_locked().await?;
        let file = guard.as_mut().expect("file handle exists after open");
        let len = file.metadata().await?.len();
        if offset + src.len() as u64 > len {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "write through {} is past the end of the data file ({len} bytes)",
                    offset + src.len() as u64
                ),
            ));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(src).await?;
        file.flush().await?;
        file.sync_all().await
    }

    async fn read_range(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        let mut guard = self.open_locked().await?;
        let file = guard.as_mut().expect("file handle exists after open");
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(dst).await.map(|_| ())
    }
}
