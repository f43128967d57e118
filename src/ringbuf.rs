//! Ring-buffer reader: maps the control and data regions of a
//! `BPF_MAP_TYPE_RINGBUF` map and implements the bounded cooperative
//! consumption loop (§4.7).
//!
//! This is the authoritative ring-buffer consumer for this crate (see
//! DESIGN.md's Open Question decisions) — grounded on a hand-rolled
//! consumer found elsewhere in the eBPF ecosystem, using the same
//! acquire/release atomic discipline and BUSY/DISCARD bit layout.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::options::Options;
use crate::syscall::{BPF_RINGBUF_BUSY_BIT, BPF_RINGBUF_DISCARD_BIT, BPF_RINGBUF_LEN_MASK};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Owns the two memory mappings backing a ring-buffer map: control pages
/// (consumer position, producer position) and the data region. Both
/// mappings are released together, exactly once, in [`Drop`] — the caller
/// must ensure the reader task has already exited before that happens
/// (§9 "Ring-buffer mmap aliasing").
pub struct RingBufferReader {
    control: MmapMut,
    data: Mmap,
    data_size: u32,
    mask: u32,
    closed: Arc<AtomicBool>,
    options: Options,
}

// The control/data mappings are read through atomics or read-only slices;
// sharing a `&RingBufferReader` across the reader thread and a close()
// caller is safe.
unsafe impl Send for RingBufferReader {}
unsafe impl Sync for RingBufferReader {}

impl RingBufferReader {
    /// Maps the control region (2 pages, RW, at file offset 0) and the
    /// data region (`data_size` bytes, RO, at file offset `2 * page_size`)
    /// of the map behind `fd` (§4.7 "Construction").
    pub fn new(fd: RawFd, data_size: u32, options: Options) -> Result<Self> {
        if cfg!(target_endian = "big") {
            return Err(Error::unsupported("big-endian targets are not supported"));
        }
        if !data_size.is_power_of_two() {
            return Err(Error::malformed_elf(format!(
                "ring-buffer data_size {data_size} is not a power of two"
            )));
        }

        let page_size = page_size();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        let control = unsafe {
            MmapOptions::new()
                .offset(0)
                .len(2 * page_size)
                .map_mut(&borrowed)
                .map_err(|e| Error::io(e, "ring-buffer control region".to_string()))?
        };
        let data = unsafe {
            MmapOptions::new()
                .offset((2 * page_size) as u64)
                .len(data_size as usize)
                .map(&borrowed)
                .map_err(|e| Error::io(e, "ring-buffer data region".to_string()))?
        };

        Ok(RingBufferReader {
            control,
            data,
            data_size,
            mask: data_size - 1,
            closed: Arc::new(AtomicBool::new(false)),
            options,
        })
    }

    fn consumer_pos(&self) -> &AtomicU64 {
        unsafe { &*(self.control.as_ptr() as *const AtomicU64) }
    }

    fn producer_pos(&self) -> &AtomicU64 {
        let page = page_size();
        unsafe { &*(self.control.as_ptr().add(page) as *const AtomicU64) }
    }

    fn len_word_at(&self, offset: u32) -> &AtomicU32 {
        unsafe { &*(self.data.as_ptr().add(offset as usize) as *const AtomicU32) }
    }

    /// A handle that can be used to request the reader loop stop, from a
    /// different thread than the one running [`Self::read_next`].
    pub fn closer(&self) -> RingBufferCloser {
        RingBufferCloser {
            closed: self.closed.clone(),
        }
    }

    /// Runs one iteration of the consumption algorithm (§4.7 steps 1-9),
    /// blocking (via brief sleeps) until a non-discarded record is
    /// available, the buffer is closed, or `cancelled` is observed.
    ///
    /// Returns `None` if the reader was closed or cancelled while waiting.
    pub fn read_next(&self, cancelled: &AtomicBool) -> Option<Vec<u8>> {
        loop {
            let cons = self.consumer_pos().load(Ordering::Acquire);
            let prod = self.producer_pos().load(Ordering::Acquire);

            if cons == prod {
                if self.should_stop(cancelled) {
                    return None;
                }
                std::thread::sleep(self.options.poll_interval);
                continue;
            }

            let offset = (cons & self.mask as u64) as u32;
            if offset + 8 > self.data_size {
                self.consumer_pos().store(cons + 8, Ordering::Release);
                continue;
            }

            let len = self.len_word_at(offset).load(Ordering::Acquire);
            if len & BPF_RINGBUF_BUSY_BIT != 0 {
                if self.should_stop(cancelled) {
                    return None;
                }
                std::thread::sleep(self.options.busy_backoff);
                continue;
            }

            let data_len = len & BPF_RINGBUF_LEN_MASK;
            let discard = len & BPF_RINGBUF_DISCARD_BIT != 0;
            let advance = 8 + round_up_8(data_len);
            self.consumer_pos()
                .store(cons + advance as u64, Ordering::Release);

            if discard {
                continue;
            }

            let payload_offset = (offset as u64 + 8) & self.mask as u64;
            return Some(self.copy_payload(payload_offset as u32, data_len));
        }
    }

    fn should_stop(&self, cancelled: &AtomicBool) -> bool {
        self.closed.load(Ordering::Acquire) || cancelled.load(Ordering::Acquire)
    }

    fn copy_payload(&self, offset: u32, data_len: u32) -> Vec<u8> {
        let data_len = data_len as usize;
        let offset = offset as usize;
        let mut out = vec![0u8; data_len];
        let first_chunk = data_len.min(self.data_size as usize - offset);
        out[..first_chunk].copy_from_slice(&self.data[offset..offset + first_chunk]);
        if first_chunk < data_len {
            out[first_chunk..].copy_from_slice(&self.data[..data_len - first_chunk]);
        }
        out
    }

    /// Signals the reader loop to return promptly; idempotent. Does not
    /// unmap anything itself — the reader task must have observed this and
    /// exited before the mappings are dropped (§4.7 "Close").
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn round_up_8(n: u32) -> u32 {
    (n + 7) & !7
}

/// A cheaply clonable handle to signal a [`RingBufferReader`] to stop.
#[derive(Clone)]
pub struct RingBufferCloser {
    closed: Arc<AtomicBool>,
}

impl RingBufferCloser {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
