//! Definition of containers of aligned memory backing the array.

use bytemuck::Zeroable;
use std::{
    alloc::{Layout, LayoutError, alloc_zeroed, dealloc},
    fmt::{Debug, Formatter, Result as FmtResult},
    ops::{Deref, DerefMut, Range},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use thiserror::Error;

/// Alignment of every store and scratch buffer.
pub(crate) const CACHE_LINE: usize = 64;

/// Different types of error that can happen when building or growing a PMA.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at construction time.
    #[error("Segment capacity must be a positive power of two, got {0}")]
    SegmentCapacity(usize),

    /// The requested store cannot be described to the allocator.
    #[error("Invalid allocation layout: {0}")]
    Layout(#[from] LayoutError),

    /// The allocator returned null. The structure is left untouched.
    #[error("Allocation of {0} bytes failed")]
    Alloc(usize),
}

// Safety: Raw pointer is only exposed via Deref and DerefMut.
unsafe impl<T: Send> Send for AlignedVec<T> {}
unsafe impl<T: Sync> Sync for AlignedVec<T> {}

/// Memory allocated on a cache line boundary using the global allocator.
///
/// * Owner is move-only and frees the allocation exactly once on drop.
/// * Allocation failure is reported as an [`Error`], never a process abort,
///   so callers can keep their pre-existing state intact.
pub(crate) struct AlignedVec<T> {
    len: usize,
    ptr: NonNull<T>,
    layout: Layout,
}

impl<T: Zeroable> AlignedVec<T> {
    /// Allocate a zero-initialized array on a cache line boundary.
    ///
    /// The `Zeroable` bound is what makes handing out `&[T]` over the fresh
    /// allocation sound: all-zero bytes are a valid value of `T`.
    ///
    /// # Panic
    ///
    /// * Requested length must be > 0.
    /// * Does not support ZSTs.
    ///
    /// # Arguments
    ///
    /// * `len` - Number of items the allocation must accommodate.
    #[track_caller]
    pub(crate) fn zeroed(len: usize) -> Result<Self, Error> {
        assert!(size_of::<T>() > 0, "Should not be ZST");
        assert!(len > 0, "Zero length memory cannot be allocated");

        // Layout of memory to allocate, widened to the cache line boundary.
        let layout = Layout::array::<T>(len)?.align_to(CACHE_LINE)?;

        // Safety: Layout is valid and has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };

        // A null pointer means the allocation failed. Surface it to the
        // caller instead of aborting, nothing has been mutated yet.
        let ptr = NonNull::new(ptr as *mut T).ok_or(Error::Alloc(layout.size()))?;

        Ok(Self { len, ptr, layout })
    }
}

impl<T> Drop for AlignedVec<T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: Cannot initialize with invalid pointer and layout.
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

impl<T> Deref for AlignedVec<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety
        // * Pointer is guaranteed to be initialized.
        // * Length is guaranteed to be > 0.
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for AlignedVec<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety
        // * Pointer is guaranteed to be initialized.
        // * Length is guaranteed to be > 0.
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("AlignedVec").field("len", &self.len).finish()
    }
}

/// The parallel stores of a packed memory array.
///
/// Slots are grouped into segments of `segment_capacity` slots each. A slot
/// holds a key and value that are only meaningful while its occupancy bit is
/// set. Occupancy is an explicit bit rather than a sentinel key so the full
/// `i64` key domain stays usable.
///
/// Reallocation only ever happens by swapping in a whole new `Storage`
/// during a resize.
#[derive(Debug)]
pub(crate) struct Storage {
    pub(crate) keys: AlignedVec<i64>,
    pub(crate) values: AlignedVec<i64>,
    pub(crate) occupied: AlignedVec<bool>,
    pub(crate) segment_count: AlignedVec<u16>,

    /// Number of slots in one segment. Fixed for the PMA's lifetime.
    pub(crate) segment_capacity: usize,

    /// Total number of slots across all segments.
    pub(crate) capacity: usize,

    /// Height of the calibrator tree over the segments.
    pub(crate) height: usize,

    /// Number of occupied slots.
    pub(crate) num_elements: usize,
}

impl Storage {
    /// Allocate empty storage for the given number of segments.
    ///
    /// Occupancy bits and per-segment counts read as zero, matching an
    /// array with no elements.
    ///
    /// # Arguments
    ///
    /// * `segment_capacity` - Number of slots in one segment.
    /// * `segments` - Number of segments, a power of two.
    pub(crate) fn new(segment_capacity: usize, segments: usize) -> Result<Self, Error> {
        let capacity = segment_capacity * segments;

        Ok(Self {
            keys: AlignedVec::zeroed(capacity)?,
            values: AlignedVec::zeroed(capacity)?,
            occupied: AlignedVec::zeroed(capacity)?,
            segment_count: AlignedVec::zeroed(segments)?,
            segment_capacity,
            capacity,
            height: height_for(segments),
            num_elements: 0,
        })
    }

    /// Number of segments in the array.
    #[inline]
    pub(crate) fn segments(&self) -> usize {
        self.capacity / self.segment_capacity
    }

    /// Number of occupied slots in a segment.
    #[inline]
    pub(crate) fn segment_len(&self, segment: usize) -> usize {
        self.segment_count[segment] as usize
    }

    /// Slot range covered by a segment.
    #[inline]
    pub(crate) fn segment_slots(&self, segment: usize) -> Range<usize> {
        let start = segment * self.segment_capacity;
        start..start + self.segment_capacity
    }
}

/// Height of the calibrator tree over a power-of-two segment count.
#[inline]
fn height_for(segments: usize) -> usize {
    segments.trailing_zeros() as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let keys = AlignedVec::<i64>::zeroed(3).unwrap();
        let counts = AlignedVec::<u16>::zeroed(1).unwrap();

        assert_eq!(keys.as_ptr() as usize % CACHE_LINE, 0);
        assert_eq!(counts.as_ptr() as usize % CACHE_LINE, 0);
    }

    #[test]
    fn zero_initialized() {
        let storage = Storage::new(8, 4).unwrap();

        assert_eq!(storage.capacity, 32);
        assert_eq!(storage.segments(), 4);
        assert_eq!(storage.height, 3);
        assert!(storage.keys.iter().all(|&key| key == 0));
        assert!(storage.occupied.iter().all(|&occupied| !occupied));
        assert!(storage.segment_count.iter().all(|&count| count == 0));
    }

    #[test]
    fn segment_slots() {
        let storage = Storage::new(8, 4).unwrap();

        assert_eq!(storage.segment_slots(0), 0..8);
        assert_eq!(storage.segment_slots(3), 24..32);
    }

    #[test]
    fn tree_height() {
        assert_eq!(height_for(1), 1);
        assert_eq!(height_for(2), 2);
        assert_eq!(height_for(256), 9);
    }
}
