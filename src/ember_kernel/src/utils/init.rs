use core::sync::atomic::{AtomicBool, AtomicUsize};

/// A compile-time default value.
///
/// The kernel state, the task pool and the timer pools are `static`s built
/// by [`build!`](crate::build) from `INIT`, so every field type in them has
/// to provide one.
pub trait Init {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T: Init, Keyhole: Init> Init for tokenlock::UnsyncTokenLock<T, Keyhole> {
    const INIT: Self = Self::new(Keyhole::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<T, const CAP: usize> Init for arrayvec::ArrayVec<T, CAP> {
    const INIT: Self = Self::new_const();
}

impl Init for bool {
    const INIT: Self = false;
}

impl Init for u32 {
    const INIT: Self = 0;
}

impl Init for u64 {
    const INIT: Self = 0;
}

impl Init for usize {
    const INIT: Self = 0;
}

impl Init for AtomicBool {
    const INIT: Self = AtomicBool::new(false);
}

impl Init for AtomicUsize {
    const INIT: Self = AtomicUsize::new(0);
}
