//! Node population masks.
//!
//! A `NodeMask` is a fixed-width bitmap over the node table: bit *i* refers
//! to the node with index *i*. All derived populations (`avail`, `idle`,
//! `sharable`, `completing`, `powered_down`) and every candidate set flowing
//! through the picker are `NodeMask`s of identical width.
//!
//! Operations are word-parallel. Masks of different widths must never meet;
//! this is a programming error and is checked in debug builds.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeMask {
    bits: BitVec<u64, Lsb0>,
}

impl NodeMask {
    /// All-zero mask of the given width.
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// All-one mask of the given width.
    pub fn filled(len: usize) -> Self {
        let mut mask = Self::new(len);
        mask.bits.fill(true);
        mask
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// True if at least one bit is set.
    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    /// Population count.
    pub fn count(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    /// `self &= other`
    pub fn intersect(&mut self, other: &NodeMask) {
        debug_assert_eq!(self.len(), other.len());
        for (word, mask) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *word &= *mask;
        }
    }

    /// `self |= other`
    pub fn union(&mut self, other: &NodeMask) {
        debug_assert_eq!(self.len(), other.len());
        for (word, mask) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *word |= *mask;
        }
    }

    /// `self &= !other`
    pub fn subtract(&mut self, other: &NodeMask) {
        debug_assert_eq!(self.len(), other.len());
        for (word, mask) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *word &= !*mask;
        }
    }

    /// Fresh mask with every in-range bit flipped.
    pub fn complement(&self) -> NodeMask {
        let mut out = Self::filled(self.len());
        out.subtract(self);
        out
    }

    /// True if every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .all(|(a, b)| a & !b == 0)
    }

    pub fn overlaps(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .any(|(a, b)| a & b != 0)
    }

    /// Population count of the intersection, without materializing it.
    pub fn overlap_count(&self, other: &NodeMask) -> u32 {
        debug_assert_eq!(self.len(), other.len());
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .map(|(a, b)| (a & b).count_ones())
            .sum()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

impl FromIterator<usize> for NodeMask {
    /// Builds a mask exactly wide enough for the largest index. Mostly a
    /// test convenience; production masks come from `ClusterState`.
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let indices: Vec<usize> = iter.into_iter().collect();
        let len = indices.iter().map(|i| i + 1).max().unwrap_or(0);
        let mut mask = NodeMask::new(len);
        for i in indices {
            mask.set(i);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(len: usize, ones: &[usize]) -> NodeMask {
        let mut m = NodeMask::new(len);
        for &i in ones {
            m.set(i);
        }
        m
    }

    #[test]
    fn set_test_count() {
        let m = mask(130, &[0, 64, 129]);
        assert_eq!(m.count(), 3);
        assert!(m.test(64));
        assert!(!m.test(63));
        assert_eq!(m.first_set(), Some(0));
        assert_eq!(m.last_set(), Some(129));
    }

    #[test]
    fn boolean_ops() {
        let mut a = mask(100, &[1, 2, 3, 70]);
        let b = mask(100, &[2, 3, 4]);
        a.intersect(&b);
        assert_eq!(a.ones().collect::<Vec<_>>(), vec![2, 3]);

        let mut c = mask(100, &[1]);
        c.union(&b);
        assert_eq!(c.count(), 4);

        c.subtract(&mask(100, &[2, 4]));
        assert_eq!(c.ones().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn subset_and_overlap() {
        let small = mask(90, &[5, 6]);
        let big = mask(90, &[4, 5, 6, 7]);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(small.overlaps(&big));
        assert_eq!(small.overlap_count(&big), 2);
        assert!(!small.overlaps(&mask(90, &[8])));
    }

    #[test]
    fn complement_stays_in_range() {
        let m = mask(70, &[0, 69]);
        let c = m.complement();
        assert_eq!(c.count(), 68);
        assert!(!c.test(0));
        assert!(c.test(1));
        // Spare bits of the last storage word must not leak into the count.
        assert_eq!(c.ones().max(), Some(68));
    }
}
