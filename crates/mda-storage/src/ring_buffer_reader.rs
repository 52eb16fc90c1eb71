#![allow(unsafe_code)]
//! Read-only attachment to a file-backed [`RingBuffer`](crate::RingBuffer).
//!
//! A process that receives `FrameReady` notifications over a socket opens the
//! producer's backing file with this type and reads frames straight out of
//! the shared mapping using the notification's locator.

use crate::ring_buffer::{check_range, RingBufferHeader, HEADER_SIZE, MAGIC};
use memmap2::{Mmap, MmapOptions};
use mda_core::{EdaError, EdaResult, PixelType};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

pub struct RingBufferReader {
    path: PathBuf,
    mmap: Mmap,
    capacity: u64,
    pixel_type: PixelType,
}

impl std::fmt::Debug for RingBufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferReader")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("pixel_type", &self.pixel_type)
            .finish()
    }
}

impl RingBufferReader {
    /// Map an existing ring buffer file read-only and validate its header.
    pub fn open(path: &Path) -> EdaResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(EdaError::InvalidHeader(format!(
                "{} is {} bytes, smaller than the {} byte header",
                path.display(),
                file_len,
                HEADER_SIZE
            )));
        }

        // SAFETY: the file exists and is at least HEADER_SIZE bytes. The
        // writer never shrinks a live buffer.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let header = mmap.as_ptr() as *const RingBufferHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes and page aligned
        let (magic, capacity, tag) =
            unsafe { ((*header).magic, (*header).capacity_bytes, (*header).pixel_type) };

        if magic != MAGIC {
            return Err(EdaError::InvalidHeader(format!(
                "bad magic {magic:#x} in {}",
                path.display()
            )));
        }
        if HEADER_SIZE as u64 + capacity > mmap.len() as u64 {
            return Err(EdaError::InvalidHeader(format!(
                "header capacity {capacity} does not fit file of {} bytes",
                mmap.len()
            )));
        }
        let pixel_type = PixelType::from_tag(tag)
            .ok_or_else(|| EdaError::InvalidHeader(format!("unknown pixel type tag {tag}")))?;

        tracing::debug!(path = %path.display(), capacity, %pixel_type, "Attached to ring buffer");

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            capacity,
            pixel_type,
        })
    }

    /// Copy `len` bytes starting at `offset` in the data region.
    pub fn read(&self, offset: u64, len: u64) -> EdaResult<Vec<u8>> {
        check_range(offset, len, self.capacity)?;
        let start = HEADER_SIZE + offset as usize;
        Ok(self.mmap[start..start + len as usize].to_vec())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &RingBufferHeader {
        // SAFETY: validated in open(); the mapping lives as long as self
        unsafe { &*(self.mmap.as_ptr() as *const RingBufferHeader) }
    }

    /// Writer's monotonic byte count, as last published.
    pub fn write_head(&self) -> u64 {
        self.header().write_head.load(Ordering::Acquire)
    }

    pub fn wraps(&self) -> u64 {
        self.header().wraps.load(Ordering::Acquire)
    }

    /// Identity of the buffer generation. Changes when the writer re-creates
    /// the file.
    pub fn stream_id(&self) -> u64 {
        self.header().stream_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RingBuffer;

    #[test]
    fn test_reader_sees_writer_data() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("shared.buf");

        let writer = RingBuffer::create(&path, 4096, PixelType::U16).unwrap();
        let reader = RingBufferReader::open(&path).unwrap();
        assert_eq!(reader.capacity(), 4096);
        assert_eq!(reader.pixel_type(), PixelType::U16);
        assert_eq!(reader.stream_id(), writer.stream_id());

        // written after the reader attached
        let offset = writer.put(&[0xAB; 64]).unwrap();
        assert_eq!(reader.read(offset, 64).unwrap(), vec![0xAB; 64]);
        assert_eq!(reader.write_head(), 64);
    }

    #[test]
    fn test_reader_rejects_garbage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("garbage.buf");
        std::fs::write(&path, vec![0u8; 256]).unwrap();
        assert!(matches!(
            RingBufferReader::open(&path).unwrap_err(),
            EdaError::InvalidHeader(_)
        ));

        std::fs::write(&path, b"short").unwrap();
        assert!(RingBufferReader::open(&path).is_err());
    }

    #[test]
    fn test_reader_bounds() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bounds.buf");
        let _writer = RingBuffer::create(&path, 100, PixelType::U8).unwrap();
        let reader = RingBufferReader::open(&path).unwrap();
        assert!(reader.read(90, 20).is_err());
        assert!(reader.read(90, 10).is_ok());
    }
}
