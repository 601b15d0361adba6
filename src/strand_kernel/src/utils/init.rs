#![allow(clippy::declare_interior_mutable_const)]
use core::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    sync::atomic,
};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T: 'static> Init for &'_ [T] {
    const INIT: Self = &[];
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::TokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T: Init, const CAP: usize> Init for arrayvec::ArrayVec<T, CAP> {
    const INIT: Self = arrayvec::ArrayVec::new_const();
}

macro_rules! impl_init {
    (
        $(
            $( #[$meta:meta] )*
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            $( #[$meta] )*
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    u128 => 0,
    usize => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    i128 => 0,
    isize => 0,
    () => (),
    atomic::AtomicBool => atomic::AtomicBool::new(false),
    atomic::AtomicU8 => atomic::AtomicU8::new(0),
    atomic::AtomicU16 => atomic::AtomicU16::new(0),
    atomic::AtomicU32 => atomic::AtomicU32::new(0),
    atomic::AtomicUsize => atomic::AtomicUsize::new(0),
    atomic::AtomicI32 => atomic::AtomicI32::new(0),
}
