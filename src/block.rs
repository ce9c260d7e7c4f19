//! The block-device contract this crate consumes (§6.1).
//!
//! DMG/GPT offset detection and any partition-table awareness live above
//! this seam in the caller; the core only ever sees a flat, zero-based,
//! byte-addressed device.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

/// A byte-addressed random-access device. Implementations must support
/// concurrent `read_at` calls — either natively (e.g. `pread`) or by
/// serializing internally.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` starting at `byte_offset`. A short read is an error.
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> std::io::Result<()>;

    /// The device's logical block size (independent of the APFS container
    /// block size declared in the superblock).
    fn block_size(&self) -> u32;

    /// Total size of the device in bytes.
    fn size(&self) -> u64;
}

/// Adapts any `Read + Seek` into a [`BlockDevice`] by serializing access
/// behind a mutex. Used for file-backed readers, where the underlying type
/// has no native positioned-read primitive.
pub struct FileDevice<F> {
    inner: Mutex<F>,
    block_size: u32,
    size: u64,
}

impl<F: Read + Seek> FileDevice<F> {
    pub fn new(mut inner: F, block_size: u32) -> std::io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(FileDevice {
            inner: Mutex::new(inner),
            block_size,
            size,
        })
    }
}

impl<F: Read + Seek + Send> BlockDevice for FileDevice<F> {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut guard = self.inner.lock();
        guard.seek(SeekFrom::Start(byte_offset))?;
        guard.read_exact(buf)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory device backed by an owned byte buffer. Lock-free: reads are
/// plain slice copies, so concurrent callers never contend.
pub struct SliceDevice {
    data: Vec<u8>,
    block_size: u32,
    reads: AtomicU64,
}

impl SliceDevice {
    pub fn new(data: Vec<u8>, block_size: u32) -> Self {
        SliceDevice {
            data,
            block_size,
            reads: AtomicU64::new(0),
        }
    }

    /// Number of `read_at` calls observed so far. Exposed for
    /// cache-transparency tests (P-Cache-Transparency) that need to tell a
    /// cache hit from a fresh device read.
    pub fn read_count(&self) -> u64 {
        self.reads.load(AtomicOrdering::Relaxed)
    }
}

impl BlockDevice for SliceDevice {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.reads.fetch_add(1, AtomicOrdering::Relaxed);
        let start = byte_offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Read one fixed-size block at `block_number` from `device`.
pub fn read_block<D: BlockDevice + ?Sized>(
    device: &D,
    block_number: u64,
    block_size: u32,
) -> std::io::Result<Vec<u8>> {
    let mut block = vec![0u8; block_size as usize];
    device.read_at(block_number * block_size as u64, &mut block)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_device_reads_block() {
        let mut data = vec![0u8; 4096 * 2];
        data[4096] = 0xAB;
        let dev = SliceDevice::new(data, 4096);
        let block = read_block(&dev, 1, 4096).unwrap();
        assert_eq!(block[0], 0xAB);
        assert_eq!(dev.read_count(), 1);
    }

    #[test]
    fn slice_device_rejects_short_read() {
        let dev = SliceDevice::new(vec![0u8; 100], 4096);
        let mut buf = vec![0u8; 4096];
        assert!(dev.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn file_device_reads_block_from_disk() {
        use std::io::Write;
        let mut file = tempfile::tempfile().unwrap();
        let mut data = vec![0u8; 4096 * 2];
        data[4096] = 0xCD;
        file.write_all(&data).unwrap();

        let dev = FileDevice::new(file, 4096).unwrap();
        let block = read_block(&dev, 1, 4096).unwrap();
        assert_eq!(block[0], 0xCD);
        assert_eq!(dev.size(), 4096 * 2);
    }
}
