//! Kernel lock
//!
//! Every piece of mutable state shared between threads (the thread registry,
//! the kernel object table, per-thread bookkeeping fields) lives in a
//! [`KernelLockCell`], which can only be accessed through a [`KernelLockToken`]
//! borrowed from a [`KernelLockGuard`]. There's only one guard per system at
//! any point of time, so the type system enforces the locking discipline.
use core::{fmt, marker::PhantomData, ops};
use tokenlock::{Token, TokenLock};

use crate::{error::BadContextError, utils::Init, PortThreading};

/// The key that "unlocks" [`KernelLockCell`].
#[non_exhaustive]
pub struct KernelLockToken<System> {
    _phantom: PhantomData<fn() -> System>,
}

/// The keyhole type for [`TokenLock`] that can be "unlocked" by
/// [`KernelLockToken`].
#[derive(Clone, Copy)]
pub struct KernelLockKeyhole<System> {
    _phantom: PhantomData<fn() -> System>,
}

impl<System> fmt::Debug for KernelLockKeyhole<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelLockKeyhole").finish()
    }
}

// This is safe because `KernelLockToken` only can be borrowed from
// `KernelLockGuard`, and there is only one instance of `KernelLockGuard` at any
// point of time
unsafe impl<System> Token<KernelLockKeyhole<System>> for KernelLockToken<System> {
    fn eq_id(&self, _: &KernelLockKeyhole<System>) -> bool {
        true
    }
}

impl<System> Init for KernelLockKeyhole<System> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type that can be accessed by [`KernelLockToken`] (which can be
/// obtained by [`lock_kernel`]).
pub struct KernelLockCell<System, T: ?Sized>(TokenLock<T, KernelLockKeyhole<System>>);

impl<System, T> KernelLockCell<System, T> {
    pub const fn new(x: T) -> Self {
        Self(TokenLock::new(KernelLockKeyhole::INIT, x))
    }
}

impl<System, T: Copy> KernelLockCell<System, T> {
    /// Copy the contents out.
    #[inline]
    pub(crate) fn get(&self, token: &KernelLockToken<System>) -> T {
        *self.0.read(token)
    }

    /// Replace the contents, returning the old value.
    #[inline]
    pub(crate) fn replace(&self, token: &mut KernelLockToken<System>, x: T) -> T {
        core::mem::replace(self.0.write(token), x)
    }
}

impl<System: PortThreading, T: ?Sized> KernelLockCell<System, T> {
    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. Note that the kernel lock is held when
    /// the closure is called.
    pub(crate) fn debug_fmt_with_ref<'a, F: 'a + Fn(&T, &mut fmt::Formatter) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWithRef<'a, System, T: ?Sized, F> {
            cell: &'a KernelLockCell<System, T>,
            f: F,
        }

        impl<System: PortThreading, T: ?Sized, F: Fn(&T, &mut fmt::Formatter) -> fmt::Result>
            fmt::Debug for DebugFmtWithRef<'_, System, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Ok(lock) = lock_kernel::<System>() {
                    f.write_str("KernelLockCell(")?;
                    (self.f)(self.cell.0.read(&*lock), f)?;
                    f.write_str(")")
                } else {
                    f.write_str("KernelLockCell(< locked >)")
                }
            }
        }

        DebugFmtWithRef { cell: self, f }
    }
}

impl<System: PortThreading, T: fmt::Debug> fmt::Debug for KernelLockCell<System, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.debug_fmt_with_ref(|x, f| x.fmt(f)).fmt(f)
    }
}

impl<System, T: Init> Init for KernelLockCell<System, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<System, T: ?Sized> ops::Deref for KernelLockCell<System, T> {
    type Target = TokenLock<T, KernelLockKeyhole<System>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Attempt to acquire the kernel lock and get an RAII guard.
/// Return `BadContext` if the kernel lock is already held by the current
/// context.
pub fn lock_kernel<System: PortThreading>() -> Result<KernelLockGuard<System>, BadContextError> {
    // Safety: `try_enter_kernel_lock` is only meant to be called by the kernel
    if unsafe { System::try_enter_kernel_lock() } {
        // Safety: We just acquired the kernel lock
        Ok(unsafe { assume_kernel_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Assume the kernel lock is held and get `KernelLockGuard`.
///
/// # Safety
///
/// The kernel lock must be really held by the current context, and the caller
/// must be its owner (no other guard may exist).
pub unsafe fn assume_kernel_lock<System: PortThreading>() -> KernelLockGuard<System> {
    debug_assert!(System::is_kernel_lock_active());

    KernelLockGuard {
        token: KernelLockToken {
            _phantom: PhantomData,
        },
    }
}

/// RAII guard for the kernel lock.
///
/// [`KernelLockToken`] can be borrowed from this type.
pub struct KernelLockGuard<System: PortThreading> {
    token: KernelLockToken<System>,
}

impl<System: PortThreading> KernelLockGuard<System> {
    /// Construct a [`KernelLockGuardBorrowMut`] by borrowing `self`.
    pub fn borrow_mut(&mut self) -> KernelLockGuardBorrowMut<'_, System> {
        KernelLockGuardBorrowMut {
            token: KernelLockToken {
                _phantom: PhantomData,
            },
            _phantom: PhantomData,
        }
    }
}

impl<System: PortThreading> Drop for KernelLockGuard<System> {
    fn drop(&mut self) {
        // Safety: The kernel lock is currently held, and it's us (the kernel)
        // who are currently controlling it
        unsafe {
            System::leave_kernel_lock();
        }
    }
}

impl<System: PortThreading> ops::Deref for KernelLockGuard<System> {
    type Target = KernelLockToken<System>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<System: PortThreading> ops::DerefMut for KernelLockGuard<System> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`KernelLockGuard`]. This is equivalent to
/// `&'a mut KernelLockGuard` but does not consume memory.
///
///  - Always prefer this over `&mut KernelLockGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `KernelLockGuardBorrowMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: KernelLockGuardBorrowMut::borrow_mut
pub struct KernelLockGuardBorrowMut<'a, System: PortThreading> {
    token: KernelLockToken<System>,
    _phantom: PhantomData<&'a mut KernelLockGuard<System>>,
}

impl<System: PortThreading> KernelLockGuardBorrowMut<'_, System> {
    /// Construct a `KernelLockGuardBorrowMut` by reborrowing `self`.
    pub fn borrow_mut(&mut self) -> KernelLockGuardBorrowMut<'_, System> {
        KernelLockGuardBorrowMut {
            token: KernelLockToken {
                _phantom: PhantomData,
            },
            _phantom: PhantomData,
        }
    }
}

impl<System: PortThreading> ops::Deref for KernelLockGuardBorrowMut<'_, System> {
    type Target = KernelLockToken<System>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<System: PortThreading> ops::DerefMut for KernelLockGuardBorrowMut<'_, System> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
