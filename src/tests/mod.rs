use std::{
    future::Future,
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use temp_dir::TempDir;

use crate::{
    checkpoint::{Checkpoint, MemoryCheckpoint},
    reader::Reader,
    record::{Clock, Message},
    storage::{MemoryPageStorage, PageStorage},
    writer::Writer,
};


pub(crate) const TEST_PAGE_SIZE: u64 = 512;
pub(crate) const TEST_COMMIT_SIZE: u64 = 4 * 1024 * 1024;

pub(crate) fn memory_parts() -> (MemoryPageStorage, MemoryCheckpoint) {
    (
        MemoryPageStorage::new(TEST_PAGE_SIZE, TEST_COMMIT_SIZE),
        MemoryCheckpoint::new(),
    )
}

pub(crate) async fn ready_writer<S, C>(storage: S, checkpoint: C) -> Writer<S, C>
where
    S: PageStorage,
    C: Checkpoint,
{
    let mut writer = Writer::new(storage, checkpoint);
    writer.init().await.expect("writer init should not fail");
    writer
}

pub(crate) fn reader_with<S, C>(storage: S, checkpoint: C, buffer_size: usize) -> Reader<S, C>
where
    S: PageStorage,
    C: Checkpoint,
{
    Reader::new(storage, checkpoint, buffer_size).expect("reader creation should not fail")
}

/// A message whose frame is exactly 100 bytes when the contract is one byte
/// long: 1 + 16 + 1 + contract + 4 + payload.
pub(crate) fn hundred_byte_message(contract: &str, byte: u8) -> Message {
    assert_eq!(contract.len(), 1);
    Message::new(contract, vec![byte; 77])
}

pub(crate) async fn with_temp_dir<F, Fut, V>(f: F) -> V
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = V>,
{
    let dir = TempDir::new().expect("creating temp dir should never fail");
    f(dir.path()).await
}

pub(crate) async fn within<F>(secs: u64, fut: F) -> F::Output
where
    F: Future,
{
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("future should not time out")
}

pub(crate) fn install_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&TRACING);
}

/// A clock frozen at a fixed reading, for asserting id determinism.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn millis_since_epoch(&self) -> u64 {
        self.0
    }
}

fn injected_failure() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "injected storage failure")
}

/// Page storage wrapper with switchable read/write failure injection.
#[derive(Clone, Debug)]
pub(crate) struct FlakyStorage {
    inner: MemoryPageStorage,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStorage {
    pub(crate) fn new(inner: MemoryPageStorage) -> Self {
        Self {
            inner,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn fail_reads(&self, enabled: bool) {
        self.fail_reads.store(enabled, Ordering::Release);
    }

    pub(crate) fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::Release);
    }
}

#[async_trait]
impl PageStorage for FlakyStorage {
    fn page_size(&self) -> u64 {
        self.inner.page_size()
    }

    fn max_commit_size(&self) -> u64 {
        self.inner.max_commit_size()
    }

    async fn init(&self) -> io::Result<()> {
        self.inner.init().await
    }

    async fn size(&self) -> io::Result<u64> {
        self.inner.size().await
    }

    async fn ensure_size(&self, size: u64) -> io::Result<()> {
        self.inner.ensure_size(size).await
    }

    async fn write_pages(&self, src: &[u8], offset: u64) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(injected_failure());
        }
        self.inner.write_pages(src, offset).await
    }

    async fn read_range(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(injected_failure());
        }
        self.inner.read_range(dst, offset).await
    }
}

/// Checkpoint wrapper that can be made to fail updates, simulating a crash
/// between the page write and the checkpoint publication.
#[derive(Clone, Debug)]
pub(crate) struct FailingCheckpoint {
    inner: MemoryCheckpoint,
    fail_updates: Arc<AtomicBool>,
}

impl FailingCheckpoint {
    pub(crate) fn new(inner: MemoryCheckpoint) -> Self {
        Self {
            inner,
            fail_updates: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn fail_updates(&self, enabled: bool) {
        self.fail_updates.store(enabled, Ordering::Release);
    }
}

#[async_trait]
impl Checkpoint for FailingCheckpoint {
    async fn read(&self) -> io::Result<u64> {
        self.inner.read().await
    }

    async fn get_or_init(&self) -> io::Result<u64> {
        self.inner.get_or_init().await
    }

    async fn update(&self, position: u64) -> io::Result<()> {
        if self.fail_updates.load(Ordering::Acquire) {
            return Err(injected_failure());
        }
        self.inner.update(position).await
    }
}
