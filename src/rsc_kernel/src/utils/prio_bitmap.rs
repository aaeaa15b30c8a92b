//! Provides `PrioBitmap`, a bit array structure supporting
//! logarithmic-time bit scan operations.
use alloc::{boxed::Box, vec};
use core::fmt;

type Word = usize;
const WORD_LEN: usize = core::mem::size_of::<Word>() * 8;

/// The maximum bit count supported by [`PrioBitmap`].
pub const PRIO_BITMAP_MAX_LEN: usize = WORD_LEN * WORD_LEN;

/// A two-level bit array whose length is chosen at run time.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone)]
pub struct PrioBitmap {
    // Invariant: `first` bit `i` is set iff `second[i] != 0`
    first: Word,
    second: Box<[Word]>,
    len: usize,
}

impl PrioBitmap {
    /// Construct an empty bitmap of `len` bits.
    ///
    /// Panics if `len` exceeds [`PRIO_BITMAP_MAX_LEN`].
    pub fn new(len: usize) -> Self {
        assert!(len <= PRIO_BITMAP_MAX_LEN);
        Self {
            first: 0,
            second: vec![0; (len + WORD_LEN - 1) / WORD_LEN].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len);
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        assert!(i < self.len);
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first &= !(1 << (i / WORD_LEN));
        }
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len);
        self.second[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.first |= 1 << (i / WORD_LEN);
    }

    /// Get the position of the first set bit.
    pub fn find_set(&self) -> Option<usize> {
        if self.first == 0 {
            return None;
        }
        let group_i = self.first.trailing_zeros() as usize;
        let group = self.second[group_i];
        let subgroup_i = group.trailing_zeros() as usize;
        debug_assert_ne!(subgroup_i, WORD_LEN);
        Some(subgroup_i + group_i * WORD_LEN)
    }

    fn one_digits(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.one_digits()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn test_inner(bytecode: Vec<u8>, size: usize) {
        let mut subject = PrioBitmap::new(size);
        let mut reference = BTreePrioBitmap::new();

        log::info!("size = {size}");

        for cmd in interpret(&bytecode, size) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(subject.one_digits().collect::<Vec<_>>(), reference.enum_set_bits());
    }

    macro_rules! gen_test {
        ($(#[$m:meta])* mod $name:ident, $size:literal) => {
            $(#[$m])*
            mod $name {
                use super::*;

                #[quickcheck]
                fn test(bytecode: Vec<u8>) {
                    test_inner(bytecode, $size);
                }
            }
        };
    }

    gen_test!(mod size_0, 0);
    gen_test!(mod size_1, 1);
    gen_test!(mod size_10, 10);
    gen_test!(mod size_100, 100);
    gen_test!(mod size_1000, 1000);

    #[test]
    fn finds_lowest_across_groups() {
        let mut bitmap = PrioBitmap::new(200);
        bitmap.set(150);
        bitmap.set(70);
        assert_eq!(bitmap.find_set(), Some(70));
        bitmap.clear(70);
        assert_eq!(bitmap.find_set(), Some(150));
        bitmap.clear(150);
        assert_eq!(bitmap.find_set(), None);
    }
}
