use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use errno::errno;
use libc::{c_void, munmap, tpacket3_hdr, tpacket_block_desc, TP_STATUS_KERNEL, TP_STATUS_USER};
use thiserror::Error;
use tracing::{trace, warn};

use crate::capture::{Event, Handler};
use crate::decode::{self, Protocol};

/// Geometry of the kernel rx ring.
///
/// A larger block count tolerates longer bursts before the kernel drops
/// frames, at the cost of locked memory.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Space reserved per frame in bytes. Must evenly divide `block_size`.
    pub frame_size: usize,
    /// Bytes per block. Must be a multiple of the system page size.
    pub block_size: usize,
    /// Number of blocks in the ring.
    pub block_count: usize,
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            frame_size: 2048,
            block_size: 128 * 2048,
            block_count: 4,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block count must be at least 1")]
    ZeroBlockCount,
    #[error("frame size {frame_size} must evenly divide block size {block_size}")]
    FrameSize { frame_size: usize, block_size: usize },
    #[error("block size {block_size} must be a multiple of the page size {page_size}")]
    BlockSize { block_size: usize, page_size: usize },
}

impl RingConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.block_count == 0 {
            return Err(ConfigError::ZeroBlockCount);
        }
        if self.frame_size == 0
            || self.frame_size > self.block_size
            || self.block_size % self.frame_size != 0
        {
            return Err(ConfigError::FrameSize {
                frame_size: self.frame_size,
                block_size: self.block_size,
            });
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if self.block_size % page_size != 0 {
            return Err(ConfigError::BlockSize {
                block_size: self.block_size,
                page_size,
            });
        }
        Ok(())
    }

    /// Total length of the mapped ring.
    pub fn map_len(&self) -> usize {
        self.block_size * self.block_count
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.block_count * (self.block_size / self.frame_size)
    }
}

/// A memory region mapped from the capture socket, unmapped on drop.
#[derive(Debug)]
pub(crate) struct MapRegion {
    ptr: *mut c_void,
    len: usize,
}

impl MapRegion {
    /// # Safety
    ///
    /// `ptr` must be a live mmap(2) mapping of exactly `len` bytes that is
    /// not unmapped elsewhere.
    pub(crate) unsafe fn from_raw(ptr: *mut c_void, len: usize) -> MapRegion {
        MapRegion { ptr, len }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }
}

impl Drop for MapRegion {
    fn drop(&mut self) {
        let r = unsafe { munmap(self.ptr, self.len) };
        if r != 0 {
            warn!(errno = errno().0, "munmap of rx ring failed");
        }
    }
}

/// Walks the TPACKET_V3 ring in kernel-fill order and hands each captured
/// frame to the decoder.
///
/// This is the only module that touches the memory shared with the kernel.
/// The block status word is the sole synchronization point: it is read with
/// an acquire load before any frame bytes are inspected and written back
/// with a release store after the last frame of the block was delivered.
/// Raw pointers never leave this type; frames are exposed as slices whose
/// lifetime ends with the handler call.
#[derive(Debug)]
pub(crate) struct RxRing {
    base: *mut u8,
    block_size: usize,
    block_count: usize,
    current: usize,
}

impl RxRing {
    /// # Safety
    ///
    /// `base` must point to `block_size * block_count` bytes of TPACKET_V3
    /// ring memory that outlives the `RxRing`.
    pub(crate) unsafe fn new(base: *mut u8, block_size: usize, block_count: usize) -> RxRing {
        RxRing {
            base,
            block_size,
            block_count,
            current: 0,
        }
    }

    pub(crate) fn current_block(&self) -> usize {
        self.current
    }

    /// Consume every block the kernel has handed to userspace, starting at
    /// the cursor. Level-triggered: must run to exhaustion per readiness
    /// notification or the kernel will not re-notify.
    pub(crate) fn drain(&mut self, link: Protocol, handler: &mut dyn Handler) {
        loop {
            let block = unsafe { self.base.add(self.current * self.block_size) };
            if !self.block_ready(block) {
                break;
            }

            self.walk_block(block, link, handler);
            self.release_block(block);
            self.current = (self.current + 1) % self.block_count;
        }
    }

    fn status(&self, block: *mut u8) -> &AtomicU32 {
        unsafe {
            let desc = block as *const tpacket_block_desc;
            let status = std::ptr::addr_of!((*desc).hdr.bh1.block_status);
            &*(status as *const AtomicU32)
        }
    }

    fn block_ready(&self, block: *mut u8) -> bool {
        self.status(block).load(Ordering::Acquire) & TP_STATUS_USER != 0
    }

    fn release_block(&self, block: *mut u8) {
        self.status(block).store(TP_STATUS_KERNEL, Ordering::Release);
    }

    fn walk_block(&self, block: *mut u8, link: Protocol, handler: &mut dyn Handler) {
        let (num_pkts, first) = unsafe {
            let desc = block as *const tpacket_block_desc;
            (
                (*desc).hdr.bh1.num_pkts as usize,
                (*desc).hdr.bh1.offset_to_first_pkt as usize,
            )
        };

        let mut offset = first;
        for _ in 0..num_pkts {
            if offset + mem::size_of::<tpacket3_hdr>() > self.block_size {
                warn!(offset, "frame header outside block, abandoning block");
                break;
            }

            let (mac, len, snaplen, next) = unsafe {
                let tp = block.add(offset) as *const tpacket3_hdr;
                (
                    (*tp).tp_mac as usize,
                    (*tp).tp_len as usize,
                    (*tp).tp_snaplen as usize,
                    (*tp).tp_next_offset as usize,
                )
            };

            if len != snaplen {
                // Snapshot-limited frame, not decodable
                trace!(len, snaplen, "skipping truncated frame");
            } else if offset + mac + len > self.block_size {
                warn!(offset, len, "frame data outside block, skipping");
            } else {
                let data = unsafe { std::slice::from_raw_parts(block.add(offset + mac), len) };
                match decode::decode(data, link) {
                    Ok(frame) => handler.event(Event::Frame(frame)),
                    Err(err) => {
                        trace!(%err, len, "frame failed to decode");
                        handler.event(Event::InvalidFrame(data));
                    }
                }
            }

            // The last frame of a block has a zero next offset
            if next == 0 {
                break;
            }
            offset += next;
        }
    }
}
