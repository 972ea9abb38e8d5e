//! Min-heap over a fixed-capacity vector
//!
//! The ordering and a position callback are supplied per operation through
//! [`BinaryHeapCtx`]. The virtual timer queues use the callback to record
//! each request's heap index in its pool entry, which lets a cancellation
//! remove it from the middle of the heap in logarithmic time.
use core::ops;

/// The backing storage of a [`BinaryHeap`].
pub trait VecLike: ops::DerefMut<Target = [<Self as VecLike>::Element]> {
    type Element;

    /// Append `x`. Panics if the container is full.
    fn push(&mut self, x: Self::Element);

    fn pop(&mut self) -> Option<Self::Element>;
}

impl<T, const CAP: usize> VecLike for arrayvec::ArrayVec<T, CAP> {
    type Element = T;

    #[inline]
    fn push(&mut self, x: T) {
        arrayvec::ArrayVec::push(self, x)
    }

    #[inline]
    fn pop(&mut self) -> Option<T> {
        arrayvec::ArrayVec::pop(self)
    }
}

/// The ordering of a heap and the hook notified of element moves.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x` must come out of the heap before `y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;

    /// `e` now sits at index `pos`.
    fn on_move(&mut self, e: &mut Element, pos: usize);
}

/// Min-heap operations, available on every [`VecLike`].
pub trait BinaryHeap: VecLike {
    fn heap_peek(&self) -> Option<&Self::Element> {
        self.first()
    }

    /// Insert `x` and return its final index.
    fn heap_push(&mut self, x: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;

    fn heap_pop(&mut self, ctx: impl BinaryHeapCtx<Self::Element>) -> Option<Self::Element> {
        self.heap_remove(0, ctx)
    }

    /// Remove and return the element at index `pos`.
    fn heap_remove(
        &mut self,
        pos: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;
}

impl<V: VecLike> BinaryHeap for V {
    fn heap_push(&mut self, x: Self::Element, mut ctx: impl BinaryHeapCtx<Self::Element>) -> usize {
        self.push(x);
        let pos = self.len() - 1;
        sift_up(&mut **self, pos, &mut ctx)
    }

    fn heap_remove(
        &mut self,
        pos: usize,
        mut ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element> {
        let last = self.len().checked_sub(1)?;
        if pos > last {
            return None;
        }

        // Fill the hole with the last element, then restore the order around
        // it. It may belong above or below `pos`.
        self.swap(pos, last);
        let removed = self.pop();
        if pos < last {
            let pos = sift_up(&mut **self, pos, &mut ctx);
            sift_down(&mut **self, pos, &mut ctx);
        }
        removed
    }
}

/// Swap the element at `pos` with its parent until the parent isn't greater.
/// Returns the element's final index.
fn sift_up<E>(heap: &mut [E], mut pos: usize, ctx: &mut impl BinaryHeapCtx<E>) -> usize {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&heap[pos], &heap[parent]) {
            break;
        }
        heap.swap(pos, parent);
        ctx.on_move(&mut heap[pos], pos);
        pos = parent;
    }
    ctx.on_move(&mut heap[pos], pos);
    pos
}

/// Swap the element at `pos` with its lesser child while that child is less.
fn sift_down<E>(heap: &mut [E], mut pos: usize, ctx: &mut impl BinaryHeapCtx<E>) {
    loop {
        let left = 2 * pos + 1;
        let right = left + 1;
        let mut least = pos;
        if left < heap.len() && ctx.lt(&heap[left], &heap[least]) {
            least = left;
        }
        if right < heap.len() && ctx.lt(&heap[right], &heap[least]) {
            least = right;
        }
        if least == pos {
            break;
        }
        heap.swap(pos, least);
        ctx.on_move(&mut heap[pos], pos);
        pos = least;
    }
    ctx.on_move(&mut heap[pos], pos);
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;
    use quickcheck_macros::quickcheck;

    /// Elements are `(key, id)`. `positions[id]` follows the element through
    /// `on_move`.
    struct Tracking<'a>(&'a mut Vec<usize>);

    impl BinaryHeapCtx<(u8, usize)> for Tracking<'_> {
        fn lt(&mut self, x: &(u8, usize), y: &(u8, usize)) -> bool {
            x.0 < y.0
        }

        fn on_move(&mut self, e: &mut (u8, usize), pos: usize) {
            self.0[e.1] = pos;
        }
    }

    /// Push and remove at random positions, comparing the minimum against a
    /// sorted vector and the reported positions against the actual ones.
    #[quickcheck]
    fn tracks_min_and_positions(ops: Vec<(bool, u8)>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut heap: ArrayVec<(u8, usize), 16> = ArrayVec::new();
        let mut sorted = Vec::new();
        let mut positions = Vec::new();

        for (push, value) in ops {
            if (push && !heap.is_full()) || heap.is_empty() {
                let id = positions.len();
                positions.push(usize::MAX);
                let pos = heap.heap_push((value, id), Tracking(&mut positions));
                assert_eq!(positions[id], pos);
                sorted.insert(sorted.partition_point(|&x| x <= value), value);
            } else {
                let pos = usize::from(value) % heap.len();
                let (key, _) = heap.heap_remove(pos, Tracking(&mut positions)).unwrap();
                let i = sorted.binary_search(&key).unwrap();
                sorted.remove(i);
            }
            log::trace!("{heap:?}");

            assert_eq!(heap.heap_peek().map(|e| e.0), sorted.first().copied());
            for (pos, &(_, id)) in heap.iter().enumerate() {
                assert_eq!(positions[id], pos, "stale position of element {id}");
            }
        }
    }

    #[test]
    fn pops_in_order() {
        let mut positions = vec![0; 5];
        let mut heap: ArrayVec<(u8, usize), 8> = ArrayVec::new();
        for (id, key) in [5, 1, 4, 1, 3].into_iter().enumerate() {
            heap.heap_push((key, id), Tracking(&mut positions));
        }
        let keys: Vec<_> =
            std::iter::from_fn(|| heap.heap_pop(Tracking(&mut positions)).map(|e| e.0)).collect();
        assert_eq!(keys, [1, 1, 3, 4, 5]);
        assert_eq!(heap.heap_remove(0, Tracking(&mut positions)), None);
    }
}
