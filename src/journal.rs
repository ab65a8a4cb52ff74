//! Append-only snapblock journal (C2).
//!
//! Each record is a fixed 40-byte little-endian header followed by the raw
//! block payload. The header's `payload_off` lets a future extended-header
//! revision insert optional fields between the header and the payload
//! without breaking the scan in `contains`.

use std::io::SeekFrom;

use byteorder::{ByteOrder, LittleEndian};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Magic value stamped at the start of every header, used to detect a torn
/// or corrupt write rather than trust file length alone.
pub const SNAPBLOCK_MAGIC: u64 = 0x5ade_5aad_5abe_5aef;

/// Size in bytes of a serialized [`SnapblockHeader`].
pub const HEADER_SIZE: usize = 40;

/// Payload kinds a snapblock record can carry. Only raw block data is
/// produced by this engine; the discriminant is kept so a future payload
/// kind can be added without changing the header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PayloadKind {
    Raw = 0,
}

impl PayloadKind {
    fn from_u64(v: u64) -> Result<Self> {
        match v {
            0 => Ok(PayloadKind::Raw),
            other => Err(Error::Integrity(format!("unknown payload kind {other}"))),
        }
    }
}

/// The fixed-size header preceding every snapblock payload.
#[derive(Debug, Clone, Copy)]
pub struct SnapblockHeader {
    pub magic: u64,
    pub blknr: u64,
    pub payload_size: u64,
    pub payload_kind: u64,
    pub payload_off: u64,
}

impl SnapblockHeader {
    pub fn new(blknr: u64, payload_size: u64) -> Self {
        Self {
            magic: SNAPBLOCK_MAGIC,
            blknr,
            payload_size,
            payload_kind: PayloadKind::Raw as u64,
            payload_off: HEADER_SIZE as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.magic);
        LittleEndian::write_u64(&mut buf[8..16], self.blknr);
        LittleEndian::write_u64(&mut buf[16..24], self.payload_size);
        LittleEndian::write_u64(&mut buf[24..32], self.payload_kind);
        LittleEndian::write_u64(&mut buf[32..40], self.payload_off);
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u64(&buf[0..8]);
        if magic != SNAPBLOCK_MAGIC {
            return Err(Error::Integrity(format!(
                "bad snapblock magic {magic:#x}, expected {SNAPBLOCK_MAGIC:#x}"
            )));
        }
        let blknr = LittleEndian::read_u64(&buf[8..16]);
        let payload_size = LittleEndian::read_u64(&buf[16..24]);
        let payload_kind = LittleEndian::read_u64(&buf[24..32]);
        PayloadKind::from_u64(payload_kind)?;
        let payload_off = LittleEndian::read_u64(&buf[32..40]);
        Ok(Self {
            magic,
            blknr,
            payload_size,
            payload_kind,
            payload_off,
        })
    }
}

/// A single record: header plus the raw block bytes it describes.
pub struct SnapblockRecord<'a> {
    pub blknr: u64,
    pub data: &'a [u8],
}

/// Handle onto one device's append-only snapblock file.
pub struct JournalFile {
    file: File,
}

impl JournalFile {
    /// Open (creating if necessary) the journal file at `path` for
    /// append-only writes and random-access reads.
    pub async fn open_append(path: &std::path::Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .create(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    /// Append a header+payload record. Any I/O failure partway through,
    /// including a short or failed flush, leaves the file in an unknown
    /// state and surfaces as [`Error::Integrity`] rather than the generic
    /// [`Error::BackendIo`] other journal I/O uses, since a half-written
    /// record needs operator attention, not a blind retry.
    pub async fn append(&mut self, rec: &SnapblockRecord<'_>) -> Result<()> {
        let header = SnapblockHeader::new(rec.blknr, rec.data.len() as u64);
        let to_integrity = |e: std::io::Error| {
            Error::Integrity(format!("failed writing snapblock record: {e}"))
        };
        self.file
            .write_all(&header.to_bytes())
            .await
            .map_err(to_integrity)?;
        self.file.write_all(rec.data).await.map_err(to_integrity)?;
        self.file.flush().await.map_err(to_integrity)?;
        Ok(())
    }

    /// Linear-scan the journal for a record matching `blknr`.
    ///
    /// Returns `Ok(true)` on the first match, `Ok(false)` on clean EOF, and
    /// `Err` on a corrupt header encountered mid-scan.
    pub async fn contains(&mut self, blknr: u64) -> Result<bool> {
        self.file.seek(SeekFrom::Start(0)).await?;
        loop {
            let mut hdr_buf = [0u8; HEADER_SIZE];
            match self.file.read_exact(&mut hdr_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            let hdr = SnapblockHeader::from_bytes(&hdr_buf)?;
            if hdr.blknr == blknr {
                return Ok(true);
            }
            let skip = hdr
                .payload_off
                .saturating_add(hdr.payload_size)
                .saturating_sub(HEADER_SIZE as u64);
            self.file.seek(SeekFrom::Current(skip as i64)).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_then_contains() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapblocks");
        let mut journal = JournalFile::open_append(&path).await.unwrap();

        let data = vec![0xAAu8; 4096];
        journal
            .append(&SnapblockRecord { blknr: 7, data: &data })
            .await
            .unwrap();

        assert!(journal.contains(7).await.unwrap());
        assert!(!journal.contains(8).await.unwrap());
    }

    #[tokio::test]
    async fn multiple_records_scan_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapblocks");
        let mut journal = JournalFile::open_append(&path).await.unwrap();

        for blknr in [1u64, 2, 3] {
            let data = vec![blknr as u8; 128];
            journal
                .append(&SnapblockRecord { blknr, data: &data })
                .await
                .unwrap();
        }

        assert!(journal.contains(3).await.unwrap());
        assert!(journal.contains(1).await.unwrap());
        assert!(!journal.contains(4).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_header_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapblocks");
        {
            let mut journal = JournalFile::open_append(&path).await.unwrap();
            let data = vec![1u8; 16];
            journal
                .append(&SnapblockRecord { blknr: 1, data: &data })
                .await
                .unwrap();
        }
        // corrupt the magic bytes in place
        let mut raw = tokio::fs::read(&path).await.unwrap();
        raw[0] = 0;
        tokio::fs::write(&path, raw).await.unwrap();

        let mut journal = JournalFile::open_append(&path).await.unwrap();
        let err = journal.contains(1).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn append_failure_is_reported_as_integrity() {
        // /dev/full always fails a write with ENOSPC, giving a reliable way
        // to exercise the append error path without corrupting a real file.
        let path = std::path::Path::new("/dev/full");
        if tokio::fs::metadata(path).await.is_err() {
            return;
        }
        let mut journal = JournalFile::open_append(path).await.unwrap();

        let data = vec![1u8; 16];
        let err = journal
            .append(&SnapblockRecord { blknr: 1, data: &data })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }
}
