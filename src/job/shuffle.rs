//! Shuffle stage: range partitioning, map-output collection, sort and group.

use crate::tagged::TaggedRecord;
use crossbeam_channel::Receiver;
use std::ops::Range;

/// Routes row-major key positions to reduce partitions in contiguous ranges.
///
/// Only the key's position is consulted, never its tag, so every record of
/// a key lands in the same partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePartitioner {
    key_space: u128,
    partitions: usize,
}

impl RangePartitioner {
    pub fn new(key_space: u128, partitions: usize) -> Self {
        Self {
            key_space: key_space.max(1),
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Partition owning a key position (`position < key_space`).
    pub fn partition(&self, position: u128) -> usize {
        debug_assert!(position < self.key_space);
        (position * self.partitions as u128 / self.key_space) as usize
    }

    /// Key positions owned by a partition; the inverse of [`Self::partition`].
    pub fn range(&self, partition: usize) -> Range<u128> {
        let n = self.partitions as u128;
        let start = (partition as u128 * self.key_space).div_ceil(n);
        let end = ((partition as u128 + 1) * self.key_space).div_ceil(n);
        start..end
    }
}

/// A committed batch of map output destined for one partition.
pub type MapOutputBatch<K, V> = (usize, Vec<TaggedRecord<K, V>>);

/// Drain committed map output into per-partition buffers until every
/// sender is gone.
pub fn collect_map_output<K, V>(
    rx: Receiver<MapOutputBatch<K, V>>,
    partitions: usize,
) -> Vec<Vec<TaggedRecord<K, V>>> {
    let mut buffers: Vec<Vec<TaggedRecord<K, V>>> = (0..partitions).map(|_| Vec::new()).collect();
    for (partition, batch) in rx {
        buffers[partition].extend(batch);
    }
    buffers
}

/// Order a partition by key, then by tag (`Compare` before `Data`, sources
/// ascending). The sort is stable.
pub fn sort_partition<K: Ord, V>(records: &mut [TaggedRecord<K, V>]) {
    records.sort_by(|a, b| a.shuffle_cmp(b));
}

/// Split a sorted partition into one slice per key.
pub fn group_by_key<K: Ord, V>(
    records: &[TaggedRecord<K, V>],
) -> impl Iterator<Item = &[TaggedRecord<K, V>]> {
    records.chunk_by(|a, b| a.same_group(b))
}
