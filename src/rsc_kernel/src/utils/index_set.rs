//! A set of small indices
use core::fmt;

/// The number of indices an [`IndexSet`] can hold.
pub const INDEX_SET_LEN: usize = 32;

/// A set of indices in `0..INDEX_SET_LEN`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexSet(u32);

impl IndexSet {
    pub const EMPTY: Self = Self(0);

    /// The set `0..len`.
    pub fn all(len: usize) -> Self {
        if len >= INDEX_SET_LEN {
            Self(u32::MAX)
        } else {
            Self((1 << len) - 1)
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, i: usize) -> bool {
        i < INDEX_SET_LEN && self.0 & (1 << i) != 0
    }

    pub fn insert(&mut self, i: usize) {
        assert!(i < INDEX_SET_LEN);
        self.0 |= 1 << i;
    }

    pub fn remove(&mut self, i: usize) {
        if i < INDEX_SET_LEN {
            self.0 &= !(1 << i);
        }
    }

    pub fn with(mut self, i: usize) -> Self {
        self.insert(i);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Iterate over the members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let i = bits.trailing_zeros();
                bits &= bits - 1;
                Some(i as usize)
            }
        })
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = Self::EMPTY;
        for i in iter {
            set.insert(i);
        }
        set
    }
}

impl fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_order() {
        let set: IndexSet = [5, 0, 31, 7].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 5, 7, 31]);
        assert_eq!(set.len(), 4);
        assert!(set.contains(31));
        assert!(!set.contains(32));
    }

    #[test]
    fn all_saturates() {
        assert_eq!(IndexSet::all(3).bits(), 0b111);
        assert_eq!(IndexSet::all(40).bits(), u32::MAX);
        assert!(IndexSet::all(0).is_empty());
    }
}
