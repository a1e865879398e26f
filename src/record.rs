use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BufMut;

use crate::{
    reader::{PrefetchReader, ReaderError},
    storage::PageStorage,
};

/// Format version byte leading every frame.
pub const FORMAT_VERSION: u8 = 0x01;

/// Length, in bytes, of a message id.
pub const MESSAGE_ID_LEN: usize = 16;

/// Maximum size, in bytes, of one framed message, version byte through
/// payload inclusive.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Maximum length, in bytes, of a message's contract string.
pub const MAX_CONTRACT_LEN: usize = 1024;

/// Source of wall-clock time for message ids.
///
/// Injected into the writer so that id generation stays deterministic under
/// test; there is no process-wide clock state.
pub trait Clock: Send + Sync {
    fn millis_since_epoch(&self) -> u64;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn millis_since_epoch(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A 16-byte message id: the creation timestamp in milliseconds since the
/// Unix epoch, followed by the logical offset at which the frame begins,
/// both little-endian.
///
/// Deterministic given (offset, clock reading), and unique per message
/// because every message occupies a distinct offset.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn new(offset: u64, millis_since_epoch: u64) -> Self {
        let mut bytes = [0_u8; MESSAGE_ID_LEN];
        bytes[..8].copy_from_slice(&millis_since_epoch.to_le_bytes());
        bytes[8..].copy_from_slice(&offset.to_le_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }

    pub fn millis_since_epoch(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("id holds 16 bytes"))
    }

    /// The logical offset at which this message's frame begins.
    pub fn offset(&self) -> u64 {
        u64::from_le_bytes(self.0[8..].try_into().expect("id holds 16 bytes"))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageId")
            .field("millis_since_epoch", &self.millis_since_epoch())
            .field("offset", &self.offset())
            .finish()
    }
}

/// A message handed to the writer: a contract name and an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub contract: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(contract: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            contract: contract.into(),
            payload: payload.into(),
        }
    }
}

/// A message decoded from the log, carrying the id assigned at append time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub contract: String,
    pub payload: Vec<u8>,
}

impl StoredMessage {
    /// The logical offset at which this message's frame begins.
    pub fn offset(&self) -> u64 {
        self.id.offset()
    }
}

/// Exact encoded size of one frame. The writer uses this to decide when the
/// commit buffer is full.
pub fn frame_len(contract: &str, payload_len: usize) -> usize {
    1 + MESSAGE_ID_LEN + uvarint_len(contract.len() as u64) + contract.len() + 4 + payload_len
}

fn uvarint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Encodes one frame into `buf`. Writes exactly `frame_len` bytes.
pub(crate) fn write_frame<B: BufMut>(buf: &mut B, id: &MessageId, contract: &str, payload: &[u8]) {
    buf.put_u8(FORMAT_VERSION);
    buf.put_slice(id.as_bytes());
    put_uvarint(buf, contract.len() as u64);
    buf.put_slice(contract.as_bytes());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

async fn read_uvarint<S>(reader: &mut PrefetchReader<'_, S>) -> Result<u64, ReaderError>
where
    S: PageStorage + ?Sized,
{
    let mut value = 0_u64;
    let mut shift = 0_u32;
    loop {
        let mut byte = [0_u8; 1];
        reader.read_exact(&mut byte).await?;
        let group = u64::from(byte[0] & 0x7f);
        if shift > 63 || (shift == 63 && group > 1) {
            return Err(ReaderError::InvalidArgument {
                reason: "length varint overflows 64 bits".to_string(),
            });
        }
        value |= group << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Decodes the next frame from the reader's window.
///
/// Returns `None` when the window is exhausted before the version byte; a
/// window ending anywhere inside a frame is a truncation error.
pub(crate) async fn read_message<S>(
    reader: &mut PrefetchReader<'_, S>,
) -> Result<Option<StoredMessage>, ReaderError>
where
    S: PageStorage + ?Sized,
{
    let mut version = [0_u8; 1];
    if reader.read(&mut version).await? == 0 {
        return Ok(None);
    }
    if version[0] != FORMAT_VERSION {
        return Err(ReaderError::UnknownFormat {
            version: version[0],
        });
    }

    let mut id_bytes = [0_u8; MESSAGE_ID_LEN];
    reader.read_exact(&mut id_bytes).await?;

    let contract_len = read_uvarint(reader).await?;
    if contract_len > MAX_CONTRACT_LEN as u64 {
        return Err(ReaderError::InvalidArgument {
            reason: format!(
                "contract of {contract_len} bytes exceeds the maximum of {MAX_CONTRACT_LEN} bytes"
            ),
        });
    }
    let mut contract = vec![0_u8; contract_len as usize];
    reader.read_exact(&mut contract).await?;
    let contract = String::from_utf8(contract).map_err(|_| ReaderError::InvalidArgument {
        reason: "contract is not valid UTF-8".to_string(),
    })?;

    let mut len_bytes = [0_u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    let total = frame_len(&contract, payload_len);
    if total > MAX_FRAME_LEN {
        return Err(ReaderError::InvalidArgument {
            reason: format!(
                "framed message of {total} bytes exceeds the maximum of {MAX_FRAME_LEN} bytes"
            ),
        });
    }
    let mut payload = vec![0_u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(StoredMessage {
        id: MessageId::from_bytes(id_bytes),
        contract,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::{frame_len, read_message, uvarint_len, write_frame, MessageId};
    use crate::{
        reader::{PrefetchReader, ReaderError},
        storage::{full_pages, MemoryPageStorage, PageStorage},
    };

    /// Loads `bytes` into in-memory page storage, zero-padded to whole pages.
    async fn storage_with(bytes: &[u8]) -> MemoryPageStorage {
        let storage = MemoryPageStorage::new(512, 4096);
        let mut padded = bytes.to_vec();
        padded.resize(full_pages(bytes.len() as u64, 512) as usize, 0);
        storage.ensure_size(padded.len() as u64).await.unwrap();
        storage.write_pages(&padded, 0).await.unwrap();
        storage
    }

    #[test]
    fn uvarint_len_matches_encoding_boundaries() {
        for (value, expected) in [(0, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3)] {
            assert_eq!(uvarint_len(value), expected, "value {value}");
            let mut buf = Vec::new();
            super::put_uvarint(&mut buf, value);
            assert_eq!(buf.len(), expected, "value {value}");
        }
    }

    #[test]
    fn frame_len_matches_bytes_written() {
        let id = MessageId::new(0, 0);
        for (contract, payload_len) in [("a", 100_usize), ("", 0), ("order-events", 300)] {
            let payload = vec![0xAB_u8; payload_len];
            let mut buf = Vec::new();
            write_frame(&mut buf, &id, contract, &payload);
            assert_eq!(buf.len(), frame_len(contract, payload_len));
        }

        // The literal layout: version + id + varint + contract + length + payload.
        assert_eq!(frame_len("a", 100), 1 + 16 + 1 + 1 + 4 + 100);
    }

    #[test]
    fn id_round_trips_and_is_deterministic() {
        let id = MessageId::new(1220, 1_650_000_000_000);
        assert_eq!(id.offset(), 1220);
        assert_eq!(id.millis_since_epoch(), 1_650_000_000_000);
        assert_eq!(id, MessageId::new(1220, 1_650_000_000_000));
        assert_eq!(MessageId::from_bytes(*id.as_bytes()), id);
        assert_ne!(id, MessageId::new(1221, 1_650_000_000_000));
    }

    #[tokio::test]
    async fn frame_round_trips_through_the_reader() {
        let id = MessageId::new(42, 7);
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &id, "orders", b"hello vault");

        let storage = storage_with(&bytes).await;
        let mut buffer = vec![0_u8; 1024];
        let mut window = PrefetchReader::new(&storage, 0, bytes.len() as u64, &mut buffer);

        let message = read_message(&mut window)
            .await
            .unwrap()
            .expect("one frame present");
        assert_eq!(message.id, id);
        assert_eq!(message.contract, "orders");
        assert_eq!(message.payload, b"hello vault");
        assert_eq!(window.position(), bytes.len() as u64);

        // The window is exhausted afterwards.
        assert!(read_message(&mut window).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let id = MessageId::new(0, 0);
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &id, "a", b"x");
        bytes[0] = 0x02;

        let storage = storage_with(&bytes).await;
        let mut buffer = vec![0_u8; 1024];
        let mut window = PrefetchReader::new(&storage, 0, bytes.len() as u64, &mut buffer);

        assert!(matches!(
            read_message(&mut window).await,
            Err(ReaderError::UnknownFormat { version: 0x02 })
        ));
    }

    #[tokio::test]
    async fn window_ending_mid_frame_is_truncated() {
        let id = MessageId::new(0, 0);
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &id, "a", &[0_u8; 100]);

        let storage = storage_with(&bytes).await;
        let mut buffer = vec![0_u8; 1024];
        // Cut the window ten bytes short of the frame's end.
        let max = bytes.len() as u64 - 10;
        let mut window = PrefetchReader::new(&storage, 0, max, &mut buffer);

        assert!(matches!(
            read_message(&mut window).await,
            Err(ReaderError::Truncated { .. })
        ));
    }
}
