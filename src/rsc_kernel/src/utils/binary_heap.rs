//! Binary heap with a contextful comparator and position tracking
//!
//! Elements report their own position through [`BinaryHeapCtx::on_move`] so
//! that an owner can remove an arbitrary element in logarithmic time.
use alloc::vec::Vec;

/// Context type for [`BinaryHeap`]'s operations.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;

    /// Called when the element `e` is moved to the new position `new_index`.
    fn on_move(&mut self, e: &mut Element, new_index: usize) {
        let _ = (e, new_index);
    }
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// Min-heap.
pub trait BinaryHeap {
    type Element;

    /// Remove the least item from the heap and return it.
    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element>;

    /// Remove the item at the specified position and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap and return its position.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;
}

impl<T> BinaryHeap for Vec<T> {
    type Element = T;

    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<T>) -> Option<T> {
        self.heap_remove(0, ctx)
    }

    fn heap_remove(&mut self, i: usize, mut ctx: impl BinaryHeapCtx<T>) -> Option<T> {
        if i >= self.len() {
            return None;
        }

        let item = self.swap_remove(i);
        if i < self.len() {
            // The last item now occupies `i`
            ctx.on_move(&mut self[i], i);

            let should_sift_up = i > 0 && ctx.lt(&self[i], &self[(i - 1) / 2]);
            if should_sift_up {
                sift_up(self, i, &mut ctx);
            } else {
                sift_down(self, i, &mut ctx);
            }
        }
        Some(item)
    }

    fn heap_push(&mut self, item: T, mut ctx: impl BinaryHeapCtx<T>) -> usize {
        let i = self.len();
        self.push(item);
        ctx.on_move(&mut self[i], i);
        sift_up(self, i, &mut ctx)
    }
}

/// Move the element at `pos` up the heap while it's less than its parent.
/// Returns its final position.
fn sift_up<T>(this: &mut [T], mut pos: usize, ctx: &mut impl BinaryHeapCtx<T>) -> usize {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&this[pos], &this[parent]) {
            break;
        }
        this.swap(pos, parent);
        ctx.on_move(&mut this[pos], pos);
        ctx.on_move(&mut this[parent], parent);
        pos = parent;
    }
    pos
}

/// Move the element at `pos` down the heap while its children are less.
fn sift_down<T>(this: &mut [T], mut pos: usize, ctx: &mut impl BinaryHeapCtx<T>) {
    let end = this.len();
    loop {
        let mut child = 2 * pos + 1;
        if child >= end {
            break;
        }
        let right = child + 1;
        // compare with the lesser of the two children
        if right < end && !ctx.lt(&this[child], &this[right]) {
            child = right;
        }

        // if we are already in order, stop.
        if !ctx.lt(&this[child], &this[pos]) {
            break;
        }

        this.swap(pos, child);
        ctx.on_move(&mut this[pos], pos);
        ctx.on_move(&mut this[child], child);
        pos = child;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeMap;

    #[derive(Debug)]
    struct El {
        value: usize,
        id: usize,
    }

    /// Tracks every element's position in `positions[id]`.
    struct Ctx<'a> {
        positions: &'a mut Vec<usize>,
    }

    impl BinaryHeapCtx<El> for Ctx<'_> {
        fn lt(&mut self, x: &El, y: &El) -> bool {
            (x.value, x.id) < (y.value, y.id)
        }

        fn on_move(&mut self, e: &mut El, new_index: usize) {
            self.positions[e.id] = new_index;
        }
    }

    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
        Pop,
    }

    /// Map random bytes to operations on the heap.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut len = 0usize;
        std::iter::from_fn(move || {
            let instr = bytecode.get(i..i + 3)?;
            i += 3;
            let value = u16::from_le_bytes([instr[1], instr[2]]) as usize;
            match instr[0] % 4 {
                _ if len == 0 => {
                    len += 1;
                    Some(Cmd::Insert(value))
                }
                0 | 1 => {
                    len += 1;
                    Some(Cmd::Insert(value))
                }
                2 => {
                    len -= 1;
                    Some(Cmd::Remove(value % (len + 1)))
                }
                _ => {
                    len -= 1;
                    Some(Cmd::Pop)
                }
            }
        })
    }

    #[quickcheck]
    fn matches_reference(bytecode: Vec<u8>) {
        let mut subject: Vec<El> = Vec::new();
        let mut positions: Vec<usize> = Vec::new();
        let mut reference = BTreeMap::new();
        let mut live_ids: Vec<usize> = Vec::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(value) => {
                    let id = positions.len();
                    positions.push(usize::MAX);
                    let pos = subject.heap_push(
                        El { value, id },
                        Ctx {
                            positions: &mut positions,
                        },
                    );
                    assert_eq!(positions[id], pos);
                    reference.insert((value, id), ());
                    live_ids.push(id);
                }
                Cmd::Remove(nth) => {
                    let id = live_ids.swap_remove(nth);
                    let pos = positions[id];
                    let el = subject
                        .heap_remove(
                            pos,
                            Ctx {
                                positions: &mut positions,
                            },
                        )
                        .unwrap();
                    assert_eq!(el.id, id);
                    reference.remove(&(el.value, el.id)).unwrap();
                }
                Cmd::Pop => {
                    let el = subject
                        .heap_pop(Ctx {
                            positions: &mut positions,
                        })
                        .unwrap();
                    let (&(value, id), _) = reference.iter().next().unwrap();
                    assert_eq!((el.value, el.id), (value, id));
                    reference.remove(&(value, id));
                    live_ids.retain(|&x| x != id);
                }
            }

            for (i, el) in subject.iter().enumerate() {
                assert_eq!(positions[el.id], i);
            }
        }
    }
}
