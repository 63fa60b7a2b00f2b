//! Definition of the packed memory array.

use crate::{
    index::SegmentIndex,
    storage::{Error, Storage},
};

/// An in-memory ordered key-value index over `i64` keys.
///
/// Elements are kept sorted in one contiguous array with deliberately
/// interspersed gaps, so most insertions only move a bounded neighborhood
/// of elements: amortized `O(log² n)` per insert, `O(log n)` point and
/// range lookups, and scans that walk plain memory.
///
/// * Keys are unique, inserting a present key is a no-op.
/// * The array is split into fixed-size segments; a sorted array of
///   per-segment minimum keys routes every operation to its segment.
/// * A full segment triggers a density check over the calibrator tree,
///   which either respreads the smallest acceptable window or doubles the
///   capacity.
/// * Single-threaded by design. Any resize invalidates interior offsets.
#[derive(Debug)]
pub struct PackedMemoryArray {
    pub(crate) storage: Storage,
    pub(crate) index: SegmentIndex,
}

/// Aggregate over a key interval, as produced by
/// [`PackedMemoryArray::range_sum`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SumResult {
    /// First qualifying key. Meaningful only when `count > 0`.
    pub first_key: i64,

    /// Last qualifying key. Meaningful only when `count > 0`.
    pub last_key: i64,

    /// Number of elements inside the interval.
    pub count: usize,

    /// Sum of all qualifying keys.
    pub sum_keys: i64,

    /// Sum of the values stored alongside the qualifying keys.
    pub sum_values: i64,
}

impl PackedMemoryArray {
    /// Create an empty array of one segment.
    ///
    /// # Arguments
    ///
    /// * `segment_capacity` - Slots per segment, a positive power of two.
    ///   Fixed for the array's lifetime; capacity grows by doubling the
    ///   number of segments.
    pub fn new(segment_capacity: usize) -> Result<Self, Error> {
        if !segment_capacity.is_power_of_two() {
            return Err(Error::SegmentCapacity(segment_capacity));
        }

        Ok(Self {
            storage: Storage::new(segment_capacity, 1)?,
            index: SegmentIndex::new(),
        })
    }

    /// Insert a key and value.
    ///
    /// Inserting a key that is already present leaves the array unchanged.
    /// The only reportable failure is an allocation failure while growing,
    /// in which case the array is left exactly as it was.
    ///
    /// # Arguments
    ///
    /// * `key` - Key to insert.
    /// * `value` - Value stored alongside the key.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<(), Error> {
        // The first element seeds segment 0 and the whole index.
        if self.storage.num_elements == 0 {
            self.storage.keys[0] = key;
            self.storage.values[0] = value;
            self.storage.occupied[0] = true;
            self.storage.segment_count[0] = 1;
            self.storage.num_elements = 1;
            self.index.reset(key);
            return Ok(());
        }

        let routed = self.index.find_leq(key);
        let nearest = self.nearest_occupied(routed);

        // Duplicate inserts are a silent no-op. The nearest occupied
        // segment is the only one that can hold the key.
        if self.storage.find_in_segment(nearest, key).is_some() {
            return Ok(());
        }

        // An empty target only happens when every segment up to the routed
        // one is drained; the routed segment then takes the key itself,
        // which keeps its index entry exact.
        let segment = if self.storage.segment_len(nearest) == 0 {
            routed
        } else {
            nearest
        };

        // A full segment hands the pair to the rebalancer, which places it
        // as part of the redistribution.
        if self.storage.segment_len(segment) == self.storage.segment_capacity {
            return self.rebalance_insert(segment, key, value);
        }

        if self.storage.insert_in_segment(segment, key, value) {
            self.index.set(segment, key);
        }

        Ok(())
    }

    /// Value stored under a key, None when absent.
    ///
    /// # Arguments
    ///
    /// * `key` - Key to look up.
    pub fn find(&self, key: i64) -> Option<i64> {
        if self.storage.num_elements == 0 {
            return None;
        }

        let segment = self.route(key);
        self.storage
            .find_in_segment(segment, key)
            .map(|slot| self.storage.values[slot])
    }

    /// Remove a key, if present.
    ///
    /// Removing an absent key is a no-op. A delete that leaves its
    /// neighborhood too sparse respreads a window, which can allocate
    /// scratch and therefore report allocation failure; the element is
    /// already removed at that point.
    ///
    /// # Arguments
    ///
    /// * `key` - Key to remove.
    pub fn delete(&mut self, key: i64) -> Result<(), Error> {
        if self.storage.num_elements == 0 {
            return Ok(());
        }

        let segment = self.route(key);
        let Some(slot) = self.storage.find_in_segment(segment, key) else {
            return Ok(());
        };

        self.storage.remove_from_segment(segment, slot);
        if self.storage.num_elements == 0 {
            return Ok(());
        }

        // Keep the index exact while the segment has elements. An emptied
        // segment keeps its stale entry, which still routes correctly.
        if let Some(minimum) = self.storage.segment_minimum(segment) {
            self.index.set(segment, minimum);
        }

        self.rebalance_delete(segment)
    }

    /// Aggregate all elements with keys inside `[low, high]`.
    ///
    /// An inverted interval or one containing no elements produces the
    /// empty aggregate (`count == 0`).
    ///
    /// # Arguments
    ///
    /// * `low` - Inclusive lower bound.
    /// * `high` - Inclusive upper bound.
    pub fn range_sum(&self, low: i64, high: i64) -> SumResult {
        let mut result = SumResult::default();
        if self.storage.num_elements == 0 || low > high {
            return result;
        }

        // Elements below `low` can only live in the routed segment, so the
        // scan starts at its first slot and walks right from there.
        let segment = self.route(low);
        for slot in segment * self.storage.segment_capacity..self.storage.capacity {
            if !self.storage.occupied[slot] {
                continue;
            }

            let key = self.storage.keys[slot];
            if key < low {
                continue;
            }
            if key > high {
                break;
            }

            if result.count == 0 {
                result.first_key = key;
            }
            result.last_key = key;
            result.count += 1;
            result.sum_keys += key;
            result.sum_values += self.storage.values[slot];
        }

        result
    }

    /// An iterator over all live key-value pairs in key order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        (0..self.storage.capacity)
            .filter(|&slot| self.storage.occupied[slot])
            .map(|slot| (self.storage.keys[slot], self.storage.values[slot]))
    }

    /// Number of elements currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.num_elements
    }

    /// true if the array holds no elements, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.num_elements == 0
    }

    /// Total number of slots across all segments.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.capacity
    }

    /// Height of the calibrator tree over the segments.
    #[inline]
    pub fn height(&self) -> usize {
        self.storage.height
    }

    /// Number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.storage.segments()
    }

    /// Number of slots in one segment.
    #[inline]
    pub fn segment_size(&self) -> usize {
        self.storage.segment_capacity
    }

    /// Segment that can hold a key, for lookups.
    ///
    /// Predecessor search over the minimums, then left past any empty
    /// segments: an empty segment's entry echoes a key that lives in the
    /// nearest occupied segment before it, which is therefore the only
    /// segment that can hold the key.
    fn route(&self, key: i64) -> usize {
        self.nearest_occupied(self.index.find_leq(key))
    }

    /// Nearest segment at or before the given one that holds elements.
    ///
    /// Returns segment 0 when everything up to the given segment is empty.
    fn nearest_occupied(&self, mut segment: usize) -> usize {
        while segment > 0 && self.storage.segment_len(segment) == 0 {
            segment -= 1;
        }

        segment
    }

    /// Diagnostic scan verifying that live keys appear in ascending order.
    pub fn is_sorted(&self) -> bool {
        let mut previous = None;
        for (key, _) in self.iter() {
            if previous.is_some_and(|previous| key < previous) {
                return false;
            }
            previous = Some(key);
        }

        true
    }
}
