//! Fixed-size bitmap over node-table indices.

use std::fmt;

use bitvec::prelude::*;

use crate::types::NodeIndex;

/// A set of node indices with a fixed universe size.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeBitmap {
    bits: BitVec<u64, Lsb0>,
}

impl NodeBitmap {
    /// Empty bitmap over `len` nodes.
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; len],
        }
    }

    /// Bitmap with every node set.
    pub fn full(len: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 1; len],
        }
    }

    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = NodeIndex>) -> Self {
        let mut map = Self::new(len);
        for i in indices {
            map.set(i);
        }
        map
    }

    /// Universe size.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn set(&mut self, i: NodeIndex) {
        assert!(i < self.len(), "node index {i} out of range {}", self.len());
        self.bits.set(i, true);
    }

    pub fn clear(&mut self, i: NodeIndex) {
        assert!(i < self.len(), "node index {i} out of range {}", self.len());
        self.bits.set(i, false);
    }

    pub fn test(&self, i: NodeIndex) -> bool {
        i < self.len() && self.bits[i]
    }

    /// Population count.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn first(&self) -> Option<NodeIndex> {
        self.bits.first_one()
    }

    /// Set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.bits.iter_ones()
    }

    pub fn and(&mut self, other: &NodeBitmap) {
        self.check_len(other);
        self.bits &= other.bits.as_bitslice();
    }

    pub fn or(&mut self, other: &NodeBitmap) {
        self.check_len(other);
        self.bits |= other.bits.as_bitslice();
    }

    /// Clear every bit that is set in `other`.
    pub fn and_not(&mut self, other: &NodeBitmap) {
        self.check_len(other);
        self.bits &= !other.bits.clone();
    }

    pub fn is_subset_of(&self, other: &NodeBitmap) -> bool {
        self.check_len(other);
        self.bits.iter_ones().all(|i| other.bits[i])
    }

    pub fn overlaps(&self, other: &NodeBitmap) -> bool {
        self.check_len(other);
        (self.bits.clone() & other.bits.as_bitslice()).any()
    }

    fn check_len(&self, other: &NodeBitmap) {
        assert_eq!(self.len(), other.len(), "bitmap size mismatch");
    }
}

impl fmt::Debug for NodeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Renders ranges the way node lists are usually printed: `0-3,7`.
impl fmt::Display for NodeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
