//! Persistence primitive: cache-line flush and fence.
//!
//! Every mutator orders its visible state changes through a [`Persist`]
//! domain. A flush writes back each 64-byte line of a byte range, surrounded
//! by full fences, and optionally busy-waits to simulate the write latency of
//! a persistent-memory device.
//!
//! Shifting entries writes many slots but must only flush each touched line
//! once; [`FlushBatch`] elides repeated flushes of the same line.
//!
//! With recording enabled every flush is appended to an in-memory log of
//! [`FlushEvent`]s so tests can check the publish order of a split.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ordering::RELAXED;

/// Size of a CPU cache line in bytes.
pub const CACHE_LINE: usize = 64;

// ============================================================================
//  Flush Events
// ============================================================================

/// What a flush made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushKind {
    /// Entry slots of a live node.
    Entries,
    /// Node header: count, first index, switch counter, low key.
    Header,
    /// A freshly built sibling or root, flushed whole before publication.
    NewNode,
    /// A node's `right_sibling` pointer.
    SiblingLink,
    /// The tree's root pointer.
    Root,
    /// A node's version word after tombstoning.
    Tombstone,
    /// Bytes inside a stored value (field update).
    Value,
}

/// One flush, as seen by the flush log.
///
/// `node` is the address of the node (or value) that was written back.
/// `target` is the address the written pointer refers to, or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushEvent {
    /// What was flushed.
    pub kind: FlushKind,
    /// Address of the flushed object.
    pub node: usize,
    /// Address of the object the flushed pointer publishes, if any.
    pub target: usize,
    /// Cache lines written back.
    pub lines: usize,
}

// ============================================================================
//  Persist
// ============================================================================

/// A persistence domain: flush and fence primitives plus their accounting.
#[derive(Debug)]
pub struct Persist {
    write_latency: Duration,
    lines: AtomicU64,
    fences: AtomicU64,
    log: Option<Mutex<Vec<FlushEvent>>>,
}

#[inline]
fn line_of(addr: usize) -> usize {
    addr & !(CACHE_LINE - 1)
}

/// Write back the line containing `ptr`.
#[inline]
fn clflush(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: clflush is part of SSE2, which every x86_64 target has. It only
    // writes back the line and is valid for any mapped address; `ptr` points
    // into an allocation the caller holds a reference to.
    unsafe {
        std::arch::x86_64::_mm_clflush(ptr);
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

impl Persist {
    /// Create a domain.
    ///
    /// # Arguments
    /// - `write_latency_ns` - busy-wait per flushed line, zero to disable
    /// - `record` - keep a log of every flush
    #[must_use]
    pub fn new(write_latency_ns: u64, record: bool) -> Self {
        Self {
            write_latency: Duration::from_nanos(write_latency_ns),
            lines: AtomicU64::new(0),
            fences: AtomicU64::new(0),
            log: record.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Full memory fence.
    #[inline]
    pub fn fence(&self) {
        fence(Ordering::SeqCst);
        self.fences.fetch_add(1, RELAXED);
    }

    fn write_back(&self, ptr: *const u8) {
        clflush(ptr);
        self.lines.fetch_add(1, RELAXED);
        if !self.write_latency.is_zero() {
            let start = Instant::now();
            while start.elapsed() < self.write_latency {
                hint::spin_loop();
            }
        }
    }

    fn record(&self, event: FlushEvent) {
        if let Some(log) = &self.log {
            log.lock().push(event);
        }
    }

    /// Flush `len` bytes starting at `ptr`, fenced on both sides.
    ///
    /// Returns the number of cache lines written back.
    pub fn flush_range(
        &self,
        kind: FlushKind,
        ptr: *const u8,
        len: usize,
        target: usize,
    ) -> usize {
        if len == 0 {
            return 0;
        }
        let start: usize = ptr.addr();
        let first: usize = line_of(start);
        let last: usize = line_of(start + len - 1);
        let lines: usize = (last - first) / CACHE_LINE + 1;

        self.fence();
        for i in 0..lines {
            let line_ptr: *const u8 = if i == 0 {
                ptr
            } else {
                ptr.wrapping_add(first + i * CACHE_LINE - start)
            };
            self.write_back(line_ptr);
        }
        self.fence();

        self.record(FlushEvent {
            kind,
            node: start,
            target,
            lines,
        });
        lines
    }

    /// Flush the bytes of `value`.
    #[inline]
    pub fn flush<T>(&self, kind: FlushKind, value: &T, target: usize) -> usize {
        self.flush_range(
            kind,
            std::ptr::from_ref(value).cast::<u8>(),
            size_of::<T>(),
            target,
        )
    }

    /// Start a line-granular flush batch for a node.
    #[inline]
    pub const fn batch(&self, kind: FlushKind, node: usize) -> FlushBatch<'_> {
        FlushBatch {
            persist: self,
            kind,
            node,
            pending: None,
            lines: 0,
        }
    }

    /// Total cache lines written back.
    #[must_use]
    pub fn lines_flushed(&self) -> u64 {
        self.lines.load(RELAXED)
    }

    /// Total fences issued.
    #[must_use]
    pub fn fences(&self) -> u64 {
        self.fences.load(RELAXED)
    }

    /// Whether flushes are being logged.
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.log.is_some()
    }

    /// Drain the flush log. Empty when recording is off.
    pub fn take_log(&self) -> Vec<FlushEvent> {
        self.log
            .as_ref()
            .map(|log| std::mem::take(&mut *log.lock()))
            .unwrap_or_default()
    }
}

impl Default for Persist {
    fn default() -> Self {
        Self::new(0, false)
    }
}

// ============================================================================
//  FlushBatch
// ============================================================================

/// Accumulates writes to one node and flushes each touched line once.
///
/// A line is written back as soon as a write lands on a different line, and
/// the last line when the batch is finished or dropped.
#[derive(Debug)]
#[must_use = "a batch flushes on drop; bind it for the duration of the writes"]
pub struct FlushBatch<'a> {
    persist: &'a Persist,
    kind: FlushKind,
    node: usize,
    pending: Option<*const u8>,
    lines: usize,
}

impl FlushBatch<'_> {
    /// Record a write of `len` bytes at `ptr`.
    pub fn touch(&mut self, ptr: *const u8, len: usize) {
        let start: usize = ptr.addr();
        let end: usize = start + len.max(1) - 1;
        let mut cursor: *const u8 = ptr;
        loop {
            let line: usize = line_of(cursor.addr());
            match self.pending {
                Some(p) if line_of(p.addr()) == line => {}
                Some(p) => {
                    self.write_back_pending(p);
                    self.pending = Some(cursor);
                }
                None => {
                    self.persist.fence();
                    self.pending = Some(cursor);
                }
            }
            let next: usize = line + CACHE_LINE;
            if next > end {
                break;
            }
            cursor = ptr.wrapping_add(next - start);
        }
    }

    /// Record a write of `value`.
    #[inline]
    pub fn touch_value<T>(&mut self, value: &T) {
        self.touch(std::ptr::from_ref(value).cast::<u8>(), size_of::<T>());
    }

    fn write_back_pending(&mut self, ptr: *const u8) {
        self.persist.write_back(ptr);
        self.lines += 1;
    }

    /// Flush the last line and return the number of lines written back.
    pub fn finish(mut self) -> usize {
        self.complete()
    }

    fn complete(&mut self) -> usize {
        if let Some(p) = self.pending.take() {
            self.write_back_pending(p);
            self.persist.fence();
            self.persist.record(FlushEvent {
                kind: self.kind,
                node: self.node,
                target: 0,
                lines: self.lines,
            });
        }
        self.lines
    }
}

impl Drop for FlushBatch<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}
