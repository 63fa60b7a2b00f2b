//! Even redistribution of elements: spread within a window, or resize.

use crate::{
    pma::PackedMemoryArray,
    storage::{AlignedVec, Error, Storage},
    tree::CalibratorTree,
};

/// Borrowed source slots of a redistribution.
struct Source<'a> {
    keys: &'a [i64],
    values: &'a [i64],
    occupied: &'a [bool],
}

/// Borrowed destination slots of a redistribution.
struct Target<'a> {
    keys: &'a mut [i64],
    values: &'a mut [i64],
    occupied: &'a mut [bool],
    segment_count: &'a mut [u16],
}

impl PackedMemoryArray {
    /// Make room for a key routed to a full segment, and place it.
    ///
    /// Climbs the calibrator tree away from the full segment until some
    /// window is within its upper density threshold, then spreads that
    /// window. When even the root is too dense the array is resized
    /// instead. Either way the new pair is part of the redistribution, so
    /// no segment-local insert follows.
    ///
    /// ```text
    /// [        abcd       ]   level 3, upper 0.75
    /// [   ab   ] [   cd   ]   level 2
    /// [ aa ][ bb ][ cc ][ dd ]  segments, b is full
    /// ```
    ///
    /// Walking up from `b`, the counted range widens to each level's
    /// aligned window with two running cursors over the per-segment
    /// counts. Density never touches the occupancy bits.
    ///
    /// # Arguments
    ///
    /// * `segment` - The full segment the key was routed to.
    /// * `key` - Key to place.
    /// * `value` - Value stored alongside the key.
    pub(crate) fn rebalance_insert(
        &mut self,
        segment: usize,
        key: i64,
        value: i64,
    ) -> Result<(), Error> {
        let capacity = self.storage.segment_capacity;
        let tree = CalibratorTree::new(self.storage.height);

        // The would-be element count of the full leaf window.
        let mut total = capacity + 1;
        let mut level = 1;
        let (mut start, mut end) = (segment, segment + 1);
        let mut density = total as f64 / capacity as f64;
        let mut upper = 1.0;

        while density > upper && level < self.storage.height {
            level += 1;
            let (window_start, window_end) = tree.window(level, segment);

            // Only the segments newly brought into the window are counted.
            for outer in window_start..start {
                total += self.storage.segment_len(outer);
            }
            for outer in end..window_end {
                total += self.storage.segment_len(outer);
            }

            (start, end) = (window_start, window_end);
            upper = tree.upper(level);
            density = total as f64 / ((end - start) * capacity) as f64;
        }

        if density <= upper {
            self.spread(total, start, end - start, Some((key, value)))
        } else {
            self.resize(Some((key, value)))
        }
    }

    /// Re-even a region after a delete left it too sparse.
    ///
    /// Mirror image of the insert climb: walk up from the deleted-from
    /// segment until some window is back at or above its lower density
    /// threshold, then spread it. When even the root window is under-dense
    /// it is respread in place; capacity is never shrunk.
    ///
    /// # Arguments
    ///
    /// * `segment` - The segment the delete touched.
    pub(crate) fn rebalance_delete(&mut self, segment: usize) -> Result<(), Error> {
        let capacity = self.storage.segment_capacity;
        let tree = CalibratorTree::new(self.storage.height);

        let mut total = self.storage.segment_len(segment);
        let mut level = 1;
        let (mut start, mut end) = (segment, segment + 1);
        let mut density = total as f64 / capacity as f64;

        if density >= tree.lower(level) {
            return Ok(());
        }

        while density < tree.lower(level) && level < self.storage.height {
            level += 1;
            let (window_start, window_end) = tree.window(level, segment);

            for outer in window_start..start {
                total += self.storage.segment_len(outer);
            }
            for outer in end..window_end {
                total += self.storage.segment_len(outer);
            }

            (start, end) = (window_start, window_end);
            density = total as f64 / ((end - start) * capacity) as f64;
        }

        self.spread(total, start, end - start, None)
    }

    /// Evenly respread a window of segments, optionally merging in one
    /// new pair at its sorted position.
    ///
    /// The window image is rebuilt in aligned scratch buffers first and
    /// copied back in one pass, so a failed scratch allocation leaves the
    /// array untouched.
    fn spread(
        &mut self,
        total: usize,
        window_start: usize,
        window_length: usize,
        incoming: Option<(i64, i64)>,
    ) -> Result<(), Error> {
        let capacity = self.storage.segment_capacity;
        let slots = window_length * capacity;
        let first = window_start * capacity;

        let mut keys = AlignedVec::<i64>::zeroed(slots)?;
        let mut values = AlignedVec::<i64>::zeroed(slots)?;
        let mut occupied = AlignedVec::<bool>::zeroed(slots)?;
        let mut segment_count = vec![0u16; window_length];

        let minimums = distribute(
            Source {
                keys: &self.storage.keys[first..first + slots],
                values: &self.storage.values[first..first + slots],
                occupied: &self.storage.occupied[first..first + slots],
            },
            Target {
                keys: &mut keys[..],
                values: &mut values[..],
                occupied: &mut occupied[..],
                segment_count: &mut segment_count[..],
            },
            capacity,
            total,
            incoming,
        );

        // Install the rebuilt window.
        self.storage.keys[first..first + slots].copy_from_slice(&keys);
        self.storage.values[first..first + slots].copy_from_slice(&values);
        self.storage.occupied[first..first + slots].copy_from_slice(&occupied);
        self.storage.segment_count[window_start..window_start + window_length]
            .copy_from_slice(&segment_count);
        self.index.write_window(window_start, &minimums);

        if incoming.is_some() {
            self.storage.num_elements += 1;
        }

        Ok(())
    }

    /// Double the capacity and redistribute everything.
    ///
    /// The doubled storage is fully built before the old one is torn down:
    /// allocation failure surfaces before any mutation, and the swap frees
    /// the old stores exactly once on drop.
    fn resize(&mut self, incoming: Option<(i64, i64)>) -> Result<(), Error> {
        let segments = self.storage.segments() * 2;
        let total = self.storage.num_elements + usize::from(incoming.is_some());

        let mut next = Storage::new(self.storage.segment_capacity, segments)?;

        let minimums = distribute(
            Source {
                keys: &self.storage.keys[..],
                values: &self.storage.values[..],
                occupied: &self.storage.occupied[..],
            },
            Target {
                keys: &mut next.keys[..],
                values: &mut next.values[..],
                occupied: &mut next.occupied[..],
                segment_count: &mut next.segment_count[..],
            },
            self.storage.segment_capacity,
            total,
            incoming,
        );
        next.num_elements = total;

        self.storage = next;
        self.index.replace(minimums);

        Ok(())
    }
}

/// Evenly redistribute an ordered element stream across segments.
///
/// Walks the occupied source slots in order, merging the optional incoming
/// pair at its sorted position, and packs each segment's share into its
/// leading slots: `total / segments` elements each, with the remainder
/// going one apiece to the leftmost segments.
///
/// Returns the new minimum key of every segment. A segment left empty
/// (only possible when `total` is below the segment count) carries the last
/// emitted key so that the minimums stay sorted.
fn distribute(
    source: Source<'_>,
    target: Target<'_>,
    segment_capacity: usize,
    total: usize,
    mut incoming: Option<(i64, i64)>,
) -> Vec<i64> {
    let segments = target.segment_count.len();
    let base = total / segments;
    let extras = total % segments;

    let mut minimums = Vec::with_capacity(segments);
    let mut cursor = next_occupied(source.occupied, 0);
    let mut last_key = 0;

    for segment in 0..segments {
        let quota = base + usize::from(segment < extras);

        // The segment minimum is whatever gets emitted next.
        minimums.push(match (incoming, cursor) {
            (Some((key, _)), Some(slot)) => key.min(source.keys[slot]),
            (Some((key, _)), None) => key,
            (None, Some(slot)) => source.keys[slot],
            (None, None) => last_key,
        });

        let start = segment * segment_capacity;
        for offset in 0..quota {
            // Pop the smaller of the incoming pair and the source cursor.
            let take_incoming = match (incoming, cursor) {
                (Some((key, _)), Some(slot)) => key < source.keys[slot],
                (Some(_), None) => true,
                (None, _) => false,
            };

            let (key, value) = if take_incoming {
                incoming.take().expect("Incoming pair is present")
            } else {
                let slot = cursor.expect("Quotas do not exceed the element total");
                cursor = next_occupied(source.occupied, slot + 1);
                (source.keys[slot], source.values[slot])
            };

            target.keys[start + offset] = key;
            target.values[start + offset] = value;
            target.occupied[start + offset] = true;
            last_key = key;
        }

        target.segment_count[segment] = quota as u16;
    }

    // Quotas sum to the total, which counts both streams fully.
    debug_assert!(incoming.is_none());
    debug_assert!(cursor.is_none());

    minimums
}

/// First occupied slot at or after `from`, None when the tail is empty.
fn next_occupied(occupied: &[bool], from: usize) -> Option<usize> {
    occupied[from..]
        .iter()
        .position(|&occupied| occupied)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a distribution over hand-built slot arrays.
    fn run(
        keys: &[i64],
        occupied: &[bool],
        segments: usize,
        segment_capacity: usize,
        incoming: Option<(i64, i64)>,
    ) -> (Vec<i64>, Vec<bool>, Vec<u16>, Vec<i64>) {
        let values: Vec<i64> = keys.iter().map(|key| key * 10).collect();
        let slots = segments * segment_capacity;

        let mut out_keys = vec![0; slots];
        let mut out_values = vec![0; slots];
        let mut out_occupied = vec![false; slots];
        let mut out_count = vec![0; segments];

        let total =
            occupied.iter().filter(|&&occupied| occupied).count() + usize::from(incoming.is_some());
        let minimums = distribute(
            Source {
                keys,
                values: &values,
                occupied,
            },
            Target {
                keys: &mut out_keys,
                values: &mut out_values,
                occupied: &mut out_occupied,
                segment_count: &mut out_count,
            },
            segment_capacity,
            total,
            incoming,
        );

        (out_keys, out_occupied, out_count, minimums)
    }

    #[test]
    fn even_quotas_with_remainder_left() {
        // Five elements across two segments of four slots.
        let keys = [1, 2, 0, 3, 4, 0, 5, 0];
        let occupied = [true, true, false, true, true, false, true, false];

        let (out_keys, out_occupied, count, minimums) = run(&keys, &occupied, 2, 4, None);

        assert_eq!(count, [3, 2]);
        assert_eq!(minimums, [1, 4]);
        assert_eq!(&out_keys[..3], [1, 2, 3]);
        assert_eq!(&out_keys[4..6], [4, 5]);
        assert!(!out_occupied[3] && !out_occupied[6] && !out_occupied[7]);
    }

    #[test]
    fn incoming_pair_merges_in_order() {
        let keys = [1, 3, 0, 0, 5, 7, 0, 0];
        let occupied = [true, true, false, false, true, true, false, false];

        let (out_keys, _, count, minimums) = run(&keys, &occupied, 2, 4, Some((4, 40)));

        assert_eq!(count, [3, 2]);
        assert_eq!(minimums, [1, 5]);
        assert_eq!(&out_keys[..3], [1, 3, 4]);
        assert_eq!(&out_keys[4..6], [5, 7]);
    }

    #[test]
    fn incoming_smaller_than_everything_goes_first() {
        let keys = [5, 6, 0, 0];
        let occupied = [true, true, false, false];

        let (out_keys, _, count, minimums) = run(&keys, &occupied, 2, 2, Some((1, 10)));

        assert_eq!(count, [2, 1]);
        assert_eq!(minimums, [1, 6]);
        assert_eq!(&out_keys[..2], [1, 5]);
        assert_eq!(out_keys[2], 6);
    }

    #[test]
    fn exhausted_stream_carries_last_key() {
        // One element across four segments: trailing segments stay empty
        // but their minimums must not regress.
        let keys = [9, 0, 0, 0, 0, 0, 0, 0];
        let occupied = [true, false, false, false, false, false, false, false];

        let (_, _, count, minimums) = run(&keys, &occupied, 4, 2, None);

        assert_eq!(count, [1, 0, 0, 0]);
        assert_eq!(minimums, [9, 9, 9, 9]);
    }
}
