#![allow(unsafe_code)]
//! Memory-mapped ring buffer holding variable-sized frames.
//!
//! The buffer is a fixed-capacity byte region behind a 128-byte header. Frames
//! are appended at the write cursor; a frame that does not fit before the end
//! of the region is written at offset 0 instead (frames are never split), so
//! every frame occupies one contiguous `[offset, offset + len)` range.
//!
//! # Features
//! - Zero-copy backing via `memmap2`, either a named file (shareable with
//!   other processes, e.g. under `/dev/shm`) or anonymous memory
//! - Cross-language compatible `#[repr(C)]` header
//! - Monotonic write head, physical write cursor, and wrap counter
//!
//! # Overwrite Hazard
//!
//! When the cursor wraps, the oldest frames are overwritten without any
//! read/write conflict detection. Capacity is expected to exceed one full
//! acquisition; readers holding stale offsets after a wrap see new data.
//!
//! # Thread Safety
//!
//! - **Writes**: Serialized via internal mutex.
//! - **Reads**: Lock-free; callers only read ranges that a `FrameReady`
//!   notification has published, so reads never race the bytes being written.
//! - **Process model**: One writer process owns the buffer. Other processes
//!   attach through [`RingBufferReader`](crate::RingBufferReader), read-only.

use memmap2::{MmapMut, MmapOptions};
use mda_core::{EdaError, EdaResult, PixelType};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic number for ring buffer header validation
pub(crate) const MAGIC: u64 = 0xDA_DA_DA_DA_00_00_00_03;

/// Size of the ring buffer header in bytes (128 bytes = 2 cache lines on most systems)
pub(crate) const HEADER_SIZE: usize = 128;

/// Ring buffer header with cache-line alignment.
///
/// Layout (128 bytes total):
/// - magic: u64 (8 bytes)
/// - capacity_bytes: u64 (8 bytes)
/// - write_head: AtomicU64 (8 bytes)
/// - write_cursor: AtomicU64 (8 bytes)
/// - wraps: AtomicU64 (8 bytes)
/// - stream_id: AtomicU64 (8 bytes)
/// - pixel_type: u32 (4 bytes)
/// - _reserved: u32 (4 bytes)
/// - _padding: [u8; 72] (72 bytes)
#[repr(C)]
pub(crate) struct RingBufferHeader {
    /// Magic number for validation
    pub(crate) magic: u64,

    /// Total size of the data region in bytes
    pub(crate) capacity_bytes: u64,

    /// Total payload bytes written since creation (monotonic, never wraps)
    pub(crate) write_head: AtomicU64,

    /// Physical offset of the next write within the data region
    pub(crate) write_cursor: AtomicU64,

    /// Number of times the cursor went back to offset 0
    pub(crate) wraps: AtomicU64,

    /// Changes every time the buffer is (re)created, so attached readers can
    /// detect a new buffer behind the same path.
    pub(crate) stream_id: AtomicU64,

    /// `PixelType::tag()` of the samples stored
    pub(crate) pixel_type: u32,

    _reserved: u32,

    _padding: [u8; 72],
}

const _: () = assert!(
    std::mem::size_of::<RingBufferHeader>() == HEADER_SIZE,
    "RingBufferHeader size must equal HEADER_SIZE (128 bytes)"
);

/// Fixed-capacity frame ring buffer.
///
/// # Safety
/// This structure contains raw pointers into its memory map. It is safe to use
/// as long as:
/// - The mapping remains valid for the lifetime of RingBuffer (it is owned)
/// - Writers hold `write_lock`
/// - Readers only read ranges published by a completed `put`
pub struct RingBuffer {
    /// Backing file, None for anonymous memory
    path: Option<PathBuf>,

    /// Memory map backing the ring buffer
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// SAFETY: Points to the start of mmap, valid as long as mmap exists
    header: *mut RingBufferHeader,

    /// SAFETY: Points to HEADER_SIZE bytes into mmap, valid as long as mmap exists
    data_ptr: *mut u8,

    capacity: u64,

    pixel_type: PixelType,

    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("pixel_type", &self.pixel_type)
            .field("write_head", &self.write_head())
            .field("write_cursor", &self.write_cursor())
            .field("wraps", &self.wraps())
            .finish()
    }
}

// SAFETY: RingBuffer owns its mmap and only exposes raw pointers internally. All
// pointer dereferences are bounds checked, so the type can be sent to other threads.
unsafe impl Send for RingBuffer {}

// SAFETY: Writers serialize through `write_lock` and publish with Release
// ordering; readers only copy ranges whose write has completed.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring buffer backed by a named file.
    ///
    /// Any existing file at `path` is truncated and re-initialized. The file
    /// is left in place when the buffer is dropped so that readers in other
    /// processes can keep using it; removing it is the caller's job.
    ///
    /// # Example
    /// ```no_run
    /// use std::path::Path;
    /// use mda_core::PixelType;
    /// use mda_storage::RingBuffer;
    ///
    /// let rb = RingBuffer::create(Path::new("/dev/shm/mda_frames"), 100 << 20, PixelType::U16).unwrap();
    /// ```
    pub fn create(path: &Path, capacity_bytes: u64, pixel_type: PixelType) -> EdaResult<Self> {
        check_capacity(capacity_bytes)?;
        let total_size = HEADER_SIZE as u64 + capacity_bytes;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;

        // SAFETY: We just created the file and set its size, so mapping is safe
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let rb = Self::from_mmap(Some(path.to_path_buf()), mmap, capacity_bytes, pixel_type);
        tracing::info!(
            path = %path.display(),
            capacity_bytes,
            %pixel_type,
            "Created file-backed ring buffer"
        );
        Ok(rb)
    }

    /// Create a ring buffer in anonymous memory (not visible to other processes).
    pub fn anonymous(capacity_bytes: u64, pixel_type: PixelType) -> EdaResult<Self> {
        check_capacity(capacity_bytes)?;
        let total_size = usize::try_from(HEADER_SIZE as u64 + capacity_bytes).map_err(|_| {
            EdaError::SizeOverflow {
                context: "ring buffer size",
            }
        })?;
        let mmap = MmapOptions::new().len(total_size).map_anon()?;

        tracing::debug!(capacity_bytes, %pixel_type, "Created anonymous ring buffer");
        Ok(Self::from_mmap(None, mmap, capacity_bytes, pixel_type))
    }

    fn from_mmap(
        path: Option<PathBuf>,
        mut mmap: MmapMut,
        capacity: u64,
        pixel_type: PixelType,
    ) -> Self {
        debug_assert!(mmap.len() as u64 >= HEADER_SIZE as u64 + capacity);

        let header = mmap.as_mut_ptr() as *mut RingBufferHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes and page aligned
        unsafe {
            (*header).magic = MAGIC;
            (*header).capacity_bytes = capacity;
            (*header).write_head = AtomicU64::new(0);
            (*header).write_cursor = AtomicU64::new(0);
            (*header).wraps = AtomicU64::new(0);
            (*header).pixel_type = pixel_type.tag();
            (*header)._reserved = 0;

            let stream_id = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1);
            (*header).stream_id = AtomicU64::new(stream_id);

            (*header)._padding.fill(0);
        }

        // SAFETY: mmap is HEADER_SIZE + capacity bytes, so offset HEADER_SIZE is in bounds
        let data_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Self {
            path,
            mmap,
            header,
            data_ptr,
            capacity,
            pixel_type,
            write_lock: Mutex::new(()),
        }
    }

    /// Append `data` at the write cursor and return the offset it was written at.
    ///
    /// If the frame does not fit between the cursor and the end of the data
    /// region, it is written at offset 0, overwriting the oldest frames.
    ///
    /// # Errors
    /// `OutOfRange` if `data` is larger than the whole buffer.
    pub fn put(&self, data: &[u8]) -> EdaResult<u64> {
        let _guard = self.write_lock.lock();

        let len = data.len() as u64;
        if len > self.capacity {
            return Err(EdaError::OutOfRange {
                offset: 0,
                len,
                capacity: self.capacity,
            });
        }

        // SAFETY: header is valid for the lifetime of self, and every copy below
        // stays within [data_ptr, data_ptr + capacity)
        unsafe {
            let cursor = (*self.header).write_cursor.load(Ordering::Acquire);
            let offset = if cursor + len > self.capacity {
                (*self.header).wraps.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(cursor, len, capacity = self.capacity, "Ring buffer wrapped");
                0
            } else {
                cursor
            };
            debug_assert!(offset + len <= self.capacity);

            let dest = self.data_ptr.add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());

            (*self.header)
                .write_cursor
                .store(offset + len, Ordering::Release);
            (*self.header).write_head.fetch_add(len, Ordering::Release);

            Ok(offset)
        }
    }

    /// Copy `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// `OutOfRange` if `offset + len` exceeds the capacity.
    pub fn read(&self, offset: u64, len: u64) -> EdaResult<Vec<u8>> {
        check_range(offset, len, self.capacity)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: range checked against capacity above
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data_ptr.add(offset as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        Ok(out)
    }

    /// Capacity of the data region in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Backing file, if any. Readers in other processes open this path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total bytes written since creation. Monotonically increasing.
    pub fn write_head(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self
        unsafe { (*self.header).write_head.load(Ordering::Acquire) }
    }

    /// Offset at which the next write would start if it fits.
    pub fn write_cursor(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self
        unsafe { (*self.header).write_cursor.load(Ordering::Acquire) }
    }

    /// Number of times the cursor has wrapped to 0.
    pub fn wraps(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self
        unsafe { (*self.header).wraps.load(Ordering::Acquire) }
    }

    pub fn stream_id(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self
        unsafe { (*self.header).stream_id.load(Ordering::Acquire) }
    }

    /// Rewind the cursor for a new acquisition. Previously written bytes stay
    /// in place until overwritten.
    pub fn reset(&self) {
        let _guard = self.write_lock.lock();
        // SAFETY: header is valid for the lifetime of self
        unsafe {
            (*self.header).write_cursor.store(0, Ordering::Release);
        }
    }
}

fn check_capacity(capacity_bytes: u64) -> EdaResult<()> {
    if capacity_bytes == 0 {
        return Err(EdaError::Configuration(
            "ring buffer capacity must be positive".into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_range(offset: u64, len: u64, capacity: u64) -> EdaResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(EdaError::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}
