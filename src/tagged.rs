//! Provenance-tagged records flowing from mappers to reducers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Where a record came from.
///
/// The derived ordering puts `Compare` before every `Data`, and `Data`
/// records in ascending source index. Reducers rely on this to resolve a
/// key in a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// From the baseline (pre-loop) matrix.
    Compare,
    /// From a partial result; `source` is its position in the merge inputs.
    Data { source: u32 },
}

impl Tag {
    pub fn data(source: u32) -> Self {
        Tag::Data { source }
    }

    pub fn is_compare(self) -> bool {
        matches!(self, Tag::Compare)
    }
}

/// A keyed value with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRecord<K, V> {
    pub key: K,
    pub tag: Tag,
    pub value: V,
}

impl<K: Ord, V> TaggedRecord<K, V> {
    pub fn new(key: K, tag: Tag, value: V) -> Self {
        Self { key, tag, value }
    }

    /// Shuffle sort order: key first, then tag.
    pub fn shuffle_cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.tag.cmp(&other.tag))
    }

    /// Grouping predicate: the tag is ignored.
    pub fn same_group(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_sorts_before_data() {
        assert!(Tag::Compare < Tag::data(0));
        assert!(Tag::data(0) < Tag::data(1));
        assert!(Tag::data(1) < Tag::data(10));
    }

    #[test]
    fn test_shuffle_order_is_key_then_tag() {
        let mut records = vec![
            TaggedRecord::new(2u64, Tag::data(0), 'a'),
            TaggedRecord::new(1u64, Tag::data(3), 'b'),
            TaggedRecord::new(1u64, Tag::Compare, 'c'),
            TaggedRecord::new(1u64, Tag::data(1), 'd'),
        ];
        records.sort_by(|a, b| a.shuffle_cmp(b));
        let order: Vec<char> = records.iter().map(|r| r.value).collect();
        assert_eq!(order, vec!['c', 'd', 'b', 'a']);
        assert!(records[0].same_group(&records[2]));
        assert!(!records[2].same_group(&records[3]));
    }
}
