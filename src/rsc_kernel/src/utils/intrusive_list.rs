//! Circular doubly-linked lists whose links are stored in the elements of an
//! arena
//!
//! An element is identified by its index in the arena. An element can be
//! linked into at most one list through a given [`Link`] field.

/// The link field embedded in a list element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: usize,
    pub next: usize,
}

/// Provides access to the link field of the elements of an arena.
pub trait LinkArena {
    fn link(&self, i: usize) -> Option<Link>;
    fn set_link(&mut self, i: usize, link: Option<Link>);
}

/// The head of a list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: Option<usize>,
}

fn expect_link(arena: &impl LinkArena, i: usize) -> Link {
    match arena.link(i) {
        Some(link) => link,
        None => unreachable!("element {i} is not linked"),
    }
}

impl ListHead {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn last(&self, arena: &impl LinkArena) -> Option<usize> {
        self.first.map(|first| expect_link(arena, first).prev)
    }

    /// Insert `i` before `at`. `i` must not be linked.
    fn insert_before(&mut self, arena: &mut impl LinkArena, i: usize, at: Option<usize>) {
        debug_assert!(arena.link(i).is_none());
        match at.or(self.first) {
            None => {
                arena.set_link(i, Some(Link { prev: i, next: i }));
                self.first = Some(i);
            }
            Some(next) => {
                let mut next_link = expect_link(arena, next);
                let prev = next_link.prev;
                arena.set_link(i, Some(Link { prev, next }));

                next_link.prev = i;
                arena.set_link(next, Some(next_link));

                let mut prev_link = expect_link(arena, prev);
                prev_link.next = i;
                arena.set_link(prev, Some(prev_link));
            }
        }
    }

    /// Append `i` to the list.
    pub fn push_back(&mut self, arena: &mut impl LinkArena, i: usize) {
        self.insert_before(arena, i, None);
    }

    /// Prepend `i` to the list.
    pub fn push_front(&mut self, arena: &mut impl LinkArena, i: usize) {
        self.insert_before(arena, i, None);
        self.first = Some(i);
    }

    /// Unlink `i`, which must be an element of this list.
    pub fn remove(&mut self, arena: &mut impl LinkArena, i: usize) {
        let link = expect_link(arena, i);
        if link.next == i {
            debug_assert_eq!(self.first, Some(i));
            self.first = None;
        } else {
            let mut prev_link = expect_link(arena, link.prev);
            prev_link.next = link.next;
            arena.set_link(link.prev, Some(prev_link));

            let mut next_link = expect_link(arena, link.next);
            next_link.prev = link.prev;
            arena.set_link(link.next, Some(next_link));

            if self.first == Some(i) {
                self.first = Some(link.next);
            }
        }
        arena.set_link(i, None);
    }

    /// Iterate over the elements from front to back.
    pub fn iter<'a, A: LinkArena>(&self, arena: &'a A) -> impl Iterator<Item = usize> + 'a {
        let first = self.first;
        let mut cur = first;
        core::iter::from_fn(move || {
            let i = cur?;
            let next = expect_link(arena, i).next;
            cur = if Some(next) == first { None } else { Some(next) };
            Some(i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    struct Arena(Vec<Option<Link>>);

    impl LinkArena for Arena {
        fn link(&self, i: usize) -> Option<Link> {
            self.0[i]
        }
        fn set_link(&mut self, i: usize, link: Option<Link>) {
            self.0[i] = link;
        }
    }

    #[quickcheck]
    fn matches_vec_deque(bytecode: Vec<u8>) {
        const LEN: usize = 16;
        let mut arena = Arena(vec![None; LEN]);
        let mut head = ListHead::new();
        let mut reference = VecDeque::new();

        for &b in &bytecode {
            let i = usize::from(b) % LEN;
            if let Some(pos) = reference.iter().position(|&x| x == i) {
                log::trace!("    remove {i}");
                reference.remove(pos);
                head.remove(&mut arena, i);
            } else if b & 0x80 != 0 {
                log::trace!("    push_front {i}");
                reference.push_front(i);
                head.push_front(&mut arena, i);
            } else {
                log::trace!("    push_back {i}");
                reference.push_back(i);
                head.push_back(&mut arena, i);
            }

            assert_eq!(head.iter(&arena).collect::<Vec<_>>(), Vec::from(reference.clone()));
            assert_eq!(head.last(&arena), reference.back().copied());
        }
    }
}
