//! Operations on a single segment of the array.

use crate::storage::Storage;

impl Storage {
    /// Insert a key and value into a segment that has room for it.
    ///
    /// One linear scan finds both the insertion point (first occupied slot
    /// whose key is greater than the new key) and the gap closest to it on
    /// the scanned side. One contiguous shift then moves that gap to the
    /// insertion point:
    ///
    /// ```text
    ///  3  4  8  _  _  9 10 11     insert 5, insertion point 2, gap at 3
    ///  3  4  5  8  _  9 10 11     span [2..3) slides right, place at 2
    ///
    ///  3  4  8  _  _  9 10 11     insert 20, no insertion point
    ///  3  4  8  _  9 10 11 20     suffix slides left, place at the end
    /// ```
    ///
    /// Returns true iff the new key became the smallest key in the segment.
    ///
    /// # Invariants
    ///
    /// * The segment has at least one unoccupied slot.
    /// * The key is not already present in the segment.
    ///
    /// # Arguments
    ///
    /// * `segment` - Segment to insert into.
    /// * `key` - Key to insert.
    /// * `value` - Value stored alongside the key.
    pub(crate) fn insert_in_segment(&mut self, segment: usize, key: i64, value: i64) -> bool {
        debug_assert!(self.segment_len(segment) < self.segment_capacity);

        let start = segment * self.segment_capacity;
        let capacity = self.segment_capacity;

        // One pass for the insertion point and the gap nearest to it. The
        // scan stops as soon as both are known.
        let mut last_gap = None;
        let mut insert_pos = None;
        let mut new_minimum = true;
        for i in 0..capacity {
            if !self.occupied[start + i] {
                last_gap = Some(i);
                if insert_pos.is_some() {
                    break;
                }
            } else if self.keys[start + i] < key {
                // An existing key precedes the new one.
                new_minimum = false;
            } else if insert_pos.is_none() {
                insert_pos = Some(i);
                if last_gap.is_some() {
                    break;
                }
            }
        }

        // The scan visited every slot before giving up on an insertion
        // point, so this gap is the last one in the segment.
        let gap = last_gap.expect("Segment has a free slot");

        // Move the gap next to the insertion point with a single shift.
        // Every slot between the gap and the insertion point is occupied,
        // otherwise the scan would have recorded a closer gap.
        let keys = &mut self.keys[start..start + capacity];
        let values = &mut self.values[start..start + capacity];
        let place = match insert_pos {
            // All occupied keys are smaller, the new key goes last.
            None => {
                if gap != capacity - 1 {
                    keys.copy_within(gap + 1..capacity, gap);
                    values.copy_within(gap + 1..capacity, gap);
                }
                capacity - 1
            }

            // Gap before the insertion point, slide the span left by one.
            Some(pos) if gap < pos => {
                keys.copy_within(gap + 1..pos, gap);
                values.copy_within(gap + 1..pos, gap);
                pos - 1
            }

            // Gap after the insertion point, slide the span right by one.
            Some(pos) => {
                keys.copy_within(pos..gap, pos + 1);
                values.copy_within(pos..gap, pos + 1);
                pos
            }
        };

        keys[place] = key;
        values[place] = value;

        // The shift consumed the gap slot, the vacated position is filled.
        self.occupied[start + gap] = true;
        self.segment_count[segment] += 1;
        self.num_elements += 1;

        new_minimum
    }

    /// Smallest key currently in a segment, None when the segment is empty.
    ///
    /// # Arguments
    ///
    /// * `segment` - Segment to scan.
    pub(crate) fn segment_minimum(&self, segment: usize) -> Option<i64> {
        self.segment_slots(segment)
            .find(|&slot| self.occupied[slot])
            .map(|slot| self.keys[slot])
    }

    /// Slot holding the given key within a segment, None when absent.
    ///
    /// # Arguments
    ///
    /// * `segment` - Segment to scan.
    /// * `key` - Key to look for.
    pub(crate) fn find_in_segment(&self, segment: usize, key: i64) -> Option<usize> {
        for slot in self.segment_slots(segment) {
            if self.occupied[slot] {
                // Slots are visited in key order, stop once past the key.
                if self.keys[slot] == key {
                    return Some(slot);
                }
                if self.keys[slot] > key {
                    return None;
                }
            }
        }

        None
    }

    /// Clear one occupied slot of a segment.
    ///
    /// # Invariants
    ///
    /// * The slot belongs to the segment and is occupied.
    ///
    /// # Arguments
    ///
    /// * `segment` - Segment the slot belongs to.
    /// * `slot` - Absolute slot index to clear.
    pub(crate) fn remove_from_segment(&mut self, segment: usize, slot: usize) {
        debug_assert!(self.segment_slots(segment).contains(&slot));
        debug_assert!(self.occupied[slot]);

        self.occupied[slot] = false;
        self.segment_count[segment] -= 1;
        self.num_elements -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single segment of eight slots holding the given keys.
    fn segment_with(keys: &[i64]) -> Storage {
        let mut storage = Storage::new(8, 1).unwrap();
        for &key in keys {
            storage.insert_in_segment(0, key, key * 10);
        }
        storage
    }

    fn live_keys(storage: &Storage) -> Vec<i64> {
        (0..storage.capacity)
            .filter(|&slot| storage.occupied[slot])
            .map(|slot| storage.keys[slot])
            .collect()
    }

    #[test]
    fn insert_into_empty_segment() {
        let mut storage = Storage::new(8, 1).unwrap();

        assert!(storage.insert_in_segment(0, 42, 420));
        assert_eq!(storage.segment_len(0), 1);
        assert_eq!(storage.num_elements, 1);
        assert_eq!(live_keys(&storage), [42]);
    }

    #[test]
    fn insert_keeps_key_order() {
        let storage = segment_with(&[5, 1, 7, 3, 6, 2]);

        assert_eq!(live_keys(&storage), [1, 2, 3, 5, 6, 7]);
        assert_eq!(storage.segment_len(0), 6);
    }

    #[test]
    fn insert_past_end_shifts_suffix_left() {
        // Ascending inserts pack slots 1..=7, leaving the gap at slot 0.
        // Removing slot 3 opens a second gap in the middle. A key larger
        // than everything must pull the suffix left and land in slot 7.
        let mut storage = segment_with(&[1, 2, 3, 4, 5, 6, 7]);
        storage.remove_from_segment(0, 3);

        assert!(!storage.insert_in_segment(0, 9, 90));
        assert_eq!(live_keys(&storage), [1, 2, 4, 5, 6, 7, 9]);
    }

    #[test]
    fn insert_shifts_span_right() {
        // Full prefix, gap at the end: the span past the insertion point
        // slides right by one.
        let mut storage = segment_with(&[10, 20, 30, 40, 50, 60, 70, 80]);
        storage.remove_from_segment(0, 7);

        assert!(!storage.insert_in_segment(0, 35, 350));
        assert_eq!(live_keys(&storage), [10, 20, 30, 35, 40, 50, 60, 70]);
    }

    #[test]
    fn new_minimum_is_reported() {
        let mut storage = segment_with(&[5, 9]);

        assert!(storage.insert_in_segment(0, 3, 30));
        assert!(!storage.insert_in_segment(0, 4, 40));
        assert_eq!(storage.segment_minimum(0), Some(3));
    }

    #[test]
    fn minimum_of_empty_segment() {
        let storage = Storage::new(8, 1).unwrap();
        assert_eq!(storage.segment_minimum(0), None);
    }

    #[test]
    fn find_hits_and_misses() {
        let storage = segment_with(&[2, 4, 6]);

        assert!(storage.find_in_segment(0, 4).is_some());
        assert!(storage.find_in_segment(0, 5).is_none());
        assert!(storage.find_in_segment(0, 1).is_none());
        assert!(storage.find_in_segment(0, 9).is_none());
    }
}
