use crate::cg_interface::NodeId;

const WORD_BITS: usize = 64;

/// Bit-indexed set of node ids.
///
/// Used for dissemination histories and forbidden sets in peer selection.
/// Union and membership cost one word operation per 64 ids; the set grows
/// on insert so callers never size it up front.
#[derive(Clone, Default)]
pub struct NodeSet {
    words: Vec<u64>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn with_capacity(nodes: usize) -> Self {
        Self {
            words: Vec::with_capacity(nodes.div_ceil(WORD_BITS)),
        }
    }

    /// Set containing every id in `0..nodes`
    pub fn full(nodes: usize) -> Self {
        let mut set = Self::with_capacity(nodes);
        for id in 0..nodes {
            set.insert(id);
        }
        set
    }

    /// Inserts `id`, returns true if it was not present
    pub fn insert(&mut self, id: NodeId) -> bool {
        let (word, bit) = (id / WORD_BITS, id % WORD_BITS);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let absent = self.words[word] & mask == 0;
        self.words[word] |= mask;
        absent
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let (word, bit) = (id / WORD_BITS, id % WORD_BITS);
        match self.words.get_mut(word) {
            Some(w) => {
                let mask = 1u64 << bit;
                let present = *w & mask != 0;
                *w &= !mask;
                present
            }
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.words
            .get(id / WORD_BITS)
            .map_or(false, |w| w & (1u64 << (id % WORD_BITS)) != 0)
    }

    /// In-place union; returns true if any bit was added
    pub fn union_with(&mut self, other: &NodeSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *mine | theirs;
            changed |= merged != *mine;
            *mine = merged;
        }
        changed
    }

    pub fn is_superset(&self, other: &NodeSet) -> bool {
        other.words.iter().enumerate().all(|(i, theirs)| {
            let mine = self.words.get(i).copied().unwrap_or(0);
            theirs & !mine == 0
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl PartialEq for NodeSet {
    fn eq(&self, other: &Self) -> bool {
        let longest = self.words.len().max(other.words.len());
        (0..longest).all(|i| {
            self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for NodeSet {}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_insert_contains_remove() {
        let mut set = NodeSet::new();
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(130));
        assert!(set.contains(3));
        assert!(set.contains(130));
        assert!(!set.contains(64));
        assert!(!set.contains(10_000));
        assert_eq!(set.len(), 2);

        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(999));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![130]);
    }

    #[test]
    fn test_union_reports_change() {
        let mut a: NodeSet = [1, 2].into_iter().collect();
        let b: NodeSet = [2, 200].into_iter().collect();
        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 200]);
        assert!(a.is_superset(&b));
        assert!(!b.is_superset(&a));
    }

    #[test]
    fn test_full_and_clear() {
        let mut set = NodeSet::full(70);
        assert_eq!(set.len(), 70);
        assert!(set.contains(69));
        assert!(!set.contains(70));
        set.clear();
        assert!(set.is_empty());
    }

    proptest! {
        #[test]
        fn prop_matches_btreeset(a in proptest::collection::vec(0usize..500, 0..60),
                                 b in proptest::collection::vec(0usize..500, 0..60)) {
            let mut bits: NodeSet = a.iter().copied().collect();
            let other: NodeSet = b.iter().copied().collect();
            bits.union_with(&other);

            let expected: BTreeSet<usize> = a.iter().chain(b.iter()).copied().collect();
            prop_assert_eq!(bits.len(), expected.len());
            prop_assert_eq!(bits.iter().collect::<Vec<_>>(), expected.into_iter().collect::<Vec<_>>());
        }
    }
}
