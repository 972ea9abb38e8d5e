//! Circular doubly linked lists threaded through a pool by index
//!
//! The run-queues chain task control blocks by pid. The links live in the
//! control blocks themselves, so a list is nothing more than a [`ListHead`]
//! plus whatever [`LinkStore`] gives access to the links.
use core::fmt;

use super::Init;

/// The neighbors of a linked element. The first element's `prev` is the
/// last element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: usize,
    pub next: usize,
}

/// Gives access to the per-element links of a pool.
///
/// `None` means the element isn't on any list.
pub trait LinkStore {
    fn link(&self, i: usize) -> Option<Link>;
    fn set_link(&mut self, i: usize, link: Option<Link>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// Tried to insert an element that's already on a list.
    AlreadyLinked,
    /// Tried to remove an element that isn't on a list.
    NotLinked,
    /// A neighbor's link is missing.
    Corrupted,
}

/// The entry point of a list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ListHead {
    first: Option<usize>,
}

impl Init for ListHead {
    const INIT: Self = Self { first: None };
}

impl fmt::Debug for ListHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.first {
            Some(i) => write!(f, "ListHead({i})"),
            None => f.write_str("ListHead(empty)"),
        }
    }
}

impl ListHead {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.first
    }

    pub fn push_back(&mut self, store: &mut impl LinkStore, i: usize) -> Result<(), ListError> {
        if store.link(i).is_some() {
            return Err(ListError::AlreadyLinked);
        }

        let Some(first) = self.first else {
            store.set_link(i, Some(Link { prev: i, next: i }));
            self.first = Some(i);
            return Ok(());
        };

        let last = store.link(first).ok_or(ListError::Corrupted)?.prev;
        update(store, last, |l| l.next = i)?;
        update(store, first, |l| l.prev = i)?;
        store.set_link(
            i,
            Some(Link {
                prev: last,
                next: first,
            }),
        );
        Ok(())
    }

    pub fn remove(&mut self, store: &mut impl LinkStore, i: usize) -> Result<(), ListError> {
        let Link { prev, next } = store.link(i).ok_or(ListError::NotLinked)?;
        store.set_link(i, None);

        if next == i {
            // `i` was the only element
            self.first = None;
            return Ok(());
        }

        update(store, prev, |l| l.next = next)?;
        update(store, next, |l| l.prev = prev)?;
        if self.first == Some(i) {
            self.first = Some(next);
        }
        Ok(())
    }

    /// Move the front element to the back and return it.
    ///
    /// The list is circular, so this only advances the head.
    pub fn rotate(&mut self, store: &impl LinkStore) -> Result<Option<usize>, ListError> {
        let Some(first) = self.first else {
            return Ok(None);
        };
        self.first = Some(store.link(first).ok_or(ListError::Corrupted)?.next);
        Ok(Some(first))
    }

    /// Iterate over the elements from front to back.
    pub fn iter<'a, S: LinkStore>(&self, store: &'a S) -> impl Iterator<Item = usize> + 'a {
        let first = self.first;
        let mut cursor = first;
        core::iter::from_fn(move || {
            let i = cursor?;
            cursor = store
                .link(i)
                .map(|l| l.next)
                .filter(|&next| Some(next) != first);
            Some(i)
        })
    }
}

fn update(
    store: &mut impl LinkStore,
    i: usize,
    f: impl FnOnce(&mut Link),
) -> Result<(), ListError> {
    let mut link = store.link(i).ok_or(ListError::Corrupted)?;
    f(&mut link);
    store.set_link(i, Some(link));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    impl LinkStore for Vec<Option<Link>> {
        fn link(&self, i: usize) -> Option<Link> {
            self[i]
        }
        fn set_link(&mut self, i: usize, link: Option<Link>) {
            self[i] = link;
        }
    }

    #[test]
    fn push_remove_rotate() {
        let mut links = vec![None; 4];
        let mut head = ListHead::INIT;

        for i in [2, 0, 3] {
            head.push_back(&mut links, i).unwrap();
        }
        assert_eq!(head.push_back(&mut links, 0), Err(ListError::AlreadyLinked));
        assert_eq!(head.iter(&links).collect::<Vec<_>>(), [2, 0, 3]);

        assert_eq!(head.rotate(&links), Ok(Some(2)));
        assert_eq!(head.iter(&links).collect::<Vec<_>>(), [0, 3, 2]);

        head.remove(&mut links, 0).unwrap();
        assert_eq!(head.remove(&mut links, 0), Err(ListError::NotLinked));
        assert_eq!(head.front(), Some(3));

        head.remove(&mut links, 2).unwrap();
        head.remove(&mut links, 3).unwrap();
        assert!(head.is_empty());
        assert_eq!(head.rotate(&links), Ok(None));
        assert!(links.iter().all(Option::is_none));
    }

    /// Drive a list and a `VecDeque` through the same operations.
    #[quickcheck]
    fn matches_vecdeque(ops: Vec<u8>) {
        let mut links = vec![None; 8];
        let mut head = ListHead::INIT;
        let mut model = VecDeque::new();

        for op in ops {
            let i = usize::from(op % 8);
            match (op / 8 % 3, model.contains(&i)) {
                (0, false) => {
                    head.push_back(&mut links, i).unwrap();
                    model.push_back(i);
                }
                (1, true) => {
                    head.remove(&mut links, i).unwrap();
                    model.retain(|&x| x != i);
                }
                (2, _) => {
                    assert_eq!(head.rotate(&links).unwrap(), model.front().copied());
                    model.rotate_left(model.len().min(1));
                }
                _ => {}
            }

            assert!(head.iter(&links).eq(model.iter().copied()));
        }
    }
}
