//! Thread stacks and the stack layout engine
//!
//! A stack object is a raw memory region supplied by the application. When a
//! thread is set up, the region is carved up as follows (for a downward-growing
//! stack):
//!
//! ```text
//!  base                buf_start                                   base + obj_size
//!   |                      |                                             |
//!   v                      v                                             v
//!   +----------------------+-----------------------------+--------+------+
//!   | reserved             | usable buffer ...           | random | TLS, |
//!   | (guard / priv stack) |                <-- grows    | offset | data |
//!   +----------------------+-----------------------------+--------+------+
//!                                                        ^
//!                                          initial stack pointer
//!                                          (= base + obj_size - delta)
//! ```
use core::{cell::UnsafeCell, fmt, marker::PhantomData};
use elain::{Align, Alignment};

use crate::{
    error::{BadContextError, StackSpaceError},
    klock::lock_kernel,
    thread::{ThreadCb, ThreadSt},
    utils::{checked_round_up, round_up, Init},
    Kernel, PortThreading,
};

#[cfg(feature = "userspace")]
use crate::kobj::{KObject, KObjectKind};

/// The byte pattern stacks are filled with when `init_stacks` is enabled.
pub const STACK_POISON: u8 = 0xaa;

/// The magic word written at the lowest address of each stack when
/// `stack_sentinel` is enabled.
pub const STACK_SENTINEL: u32 = 0xf0f0_f0f0;

/// The usable part of a thread's stack, computed when the thread is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackInfo {
    /// The lowest address of the usable buffer.
    pub start: usize,
    /// The size of the usable buffer.
    pub size: usize,
    /// The number of bytes at the initial end of the stack consumed by
    /// thread-local storage, user-mode runtime data, and the random offset.
    pub delta: usize,
}

impl Init for StackInfo {
    const INIT: Self = Self {
        start: 0,
        size: 0,
        delta: 0,
    };
}

impl StackInfo {
    /// The initial stack pointer for a downward-growing stack.
    pub const fn initial_stack_ptr(&self) -> usize {
        self.start + self.size - self.delta
    }
}

/// A memory region usable as a thread's stack.
///
/// # Safety
///
/// `as_ptr()..as_ptr() + obj_size()` must be a valid memory region that
/// nothing but the kernel and the thread set up on it accesses.
pub unsafe trait ThreadStackObj<System: PortThreading>: Sync + 'static {
    /// The lowest address of the region.
    fn as_ptr(&self) -> *mut u8;

    /// The size of the region in bytes.
    fn obj_size(&self) -> usize;

    /// Return `true` if user-mode threads can run on this stack.
    fn is_user_capable(&self) -> bool;

    /// The kernel object header of the stack.
    #[cfg(feature = "userspace")]
    fn kobj(&self) -> &KObject<System>;
}

/// A reference to a stack object that outlives every thread set up on it.
pub type StackRef<System> = &'static dyn ThreadStackObj<System>;

/// A statically allocated stack object of `LEN` bytes aligned to `ALIGN`
/// bytes.
///
/// Use [`thread_stack_len`] or [`kernel_stack_len`] to include the
/// port-specific reserved area in `LEN`.
#[repr(C)]
pub struct ThreadStack<System: PortThreading, const LEN: usize, const ALIGN: usize = 16>
where
    Align<ALIGN>: Alignment,
{
    buf: UnsafeCell<StackBuf<LEN, ALIGN>>,
    user_capable: bool,
    #[cfg(feature = "userspace")]
    kobj: KObject<System>,
    _phantom: PhantomData<fn() -> System>,
}

#[repr(C)]
struct StackBuf<const LEN: usize, const ALIGN: usize>
where
    Align<ALIGN>: Alignment,
{
    _align: Align<ALIGN>,
    bytes: [u8; LEN],
}

// Safety: The buffer is only accessed through raw pointers by the kernel
// (while setting up a thread on it) and by the thread running on it
unsafe impl<System: PortThreading, const LEN: usize, const ALIGN: usize> Sync
    for ThreadStack<System, LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
}

impl<System: PortThreading, const LEN: usize, const ALIGN: usize> ThreadStack<System, LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
    /// Construct a user-capable stack object.
    pub const fn new() -> Self {
        Self::with_capability(true)
    }

    /// Construct a stack object only usable by kernel-mode threads.
    pub const fn new_kernel() -> Self {
        Self::with_capability(false)
    }

    const fn with_capability(user_capable: bool) -> Self {
        Self {
            buf: UnsafeCell::new(StackBuf {
                _align: Align::NEW,
                bytes: [0; LEN],
            }),
            user_capable,
            #[cfg(feature = "userspace")]
            kobj: KObject::new(KObjectKind::Stack),
            _phantom: PhantomData,
        }
    }
}

unsafe impl<System: PortThreading, const LEN: usize, const ALIGN: usize> ThreadStackObj<System>
    for ThreadStack<System, LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.buf.get().cast()
    }

    #[inline]
    fn obj_size(&self) -> usize {
        LEN
    }

    #[inline]
    fn is_user_capable(&self) -> bool {
        self.user_capable
    }

    #[cfg(feature = "userspace")]
    #[inline]
    fn kobj(&self) -> &KObject<System> {
        &self.kobj
    }
}

impl<System: PortThreading, const LEN: usize, const ALIGN: usize> fmt::Debug
    for ThreadStack<System, LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadStack")
            .field("ptr", &self.as_ptr())
            .field("len", &LEN)
            .field("user_capable", &self.user_capable)
            .finish()
    }
}

/// The object size of a user-capable stack providing `size` usable bytes.
pub const fn thread_stack_len<System: PortThreading>(size: usize) -> usize {
    round_up(size, System::STACK_ALIGN) + System::THREAD_STACK_RESERVED
}

/// The object size of a kernel-only stack providing `size` usable bytes.
pub const fn kernel_stack_len<System: PortThreading>(size: usize) -> usize {
    round_up(size, System::STACK_ALIGN) + System::KERNEL_STACK_RESERVED
}

/// The size of the stack sentinel word.
pub const STACK_SENTINEL_SIZE: usize = core::mem::size_of::<u32>();

/// The platform parameters the layout of a stack depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackGeometry {
    pub align: usize,
    pub reserved: usize,
    pub grows_up: bool,
    pub random_max: usize,
    pub local_data_size: usize,
    /// A sentinel word is placed at the lowest address of the buffer.
    pub sentinel: bool,
}

/// An inconsistent combination of stack parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    AlignNotPowerOfTwo,
    MisalignedReserve,
    RandomOnUpwardStack,
    SentinelOnUpwardStack,
}

impl StackGeometry {
    /// Get the geometry of the port's user-capable or kernel-only stacks.
    pub const fn of<System: PortThreading>(user_capable: bool) -> Self {
        Self {
            align: System::STACK_ALIGN,
            reserved: if user_capable {
                System::THREAD_STACK_RESERVED
            } else {
                System::KERNEL_STACK_RESERVED
            },
            grows_up: System::STACK_GROWS_UP,
            random_max: System::STACK_POINTER_RANDOM,
            local_data_size: if cfg!(feature = "userspace") {
                System::USERSPACE_LOCAL_DATA_SIZE
            } else {
                0
            },
            sentinel: cfg!(feature = "stack_sentinel"),
        }
    }

    pub const fn validate(&self) -> Result<(), GeometryError> {
        if !self.align.is_power_of_two() {
            Err(GeometryError::AlignNotPowerOfTwo)
        } else if self.reserved % self.align != 0 {
            Err(GeometryError::MisalignedReserve)
        } else if self.grows_up && self.random_max != 0 {
            Err(GeometryError::RandomOnUpwardStack)
        } else if self.grows_up && self.sentinel {
            // The sentinel would sit where the stack starts growing
            Err(GeometryError::SentinelOnUpwardStack)
        } else {
            Ok(())
        }
    }

    /// The smallest usable buffer a thread can be set up with.
    pub const fn min_buf_size(&self) -> usize {
        if self.sentinel {
            STACK_SENTINEL_SIZE
        } else {
            0
        }
    }
}

/// Rejects inconsistent port stack constants at compile time.
struct GeometryCheck<System>(PhantomData<System>);

impl<System: PortThreading> GeometryCheck<System> {
    const VALID: () = {
        expect_valid(StackGeometry::of::<System>(false).validate());
        expect_valid(StackGeometry::of::<System>(true).validate());
    };
}

const fn expect_valid(result: Result<(), GeometryError>) {
    match result {
        Ok(()) => {}
        Err(GeometryError::AlignNotPowerOfTwo) => panic!("`STACK_ALIGN` must be a power of two"),
        Err(GeometryError::MisalignedReserve) => {
            panic!("reserved stack areas must be multiples of `STACK_ALIGN`")
        }
        Err(GeometryError::RandomOnUpwardStack) => {
            panic!("stack pointer randomization is not supported on upward-growing stacks")
        }
        Err(GeometryError::SentinelOnUpwardStack) => {
            panic!("`stack_sentinel` is not supported on upward-growing stacks")
        }
    }
}

/// The partitioning of a stack object, before the delta is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// The size reserved for the stack, including the reserved area.
    pub obj_size: usize,
    /// The lowest address usable by the thread.
    pub buf_start: usize,
    /// The size of the area usable by the thread.
    pub buf_size: usize,
}

/// The initial stack pointer would fall outside the usable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPointerOutOfBounds {
    pub delta: usize,
    pub buf_size: usize,
}

impl StackLayout {
    /// Partition the stack object at `base` for a stack of `stack_size`
    /// usable bytes. Returns `None` if the computation wraps around.
    pub fn new(geometry: &StackGeometry, base: usize, stack_size: usize) -> Option<Self> {
        let obj_size = checked_round_up(stack_size, geometry.align)?.checked_add(geometry.reserved)?;
        base.checked_add(obj_size)?;
        Some(Self {
            obj_size,
            buf_start: base + geometry.reserved,
            buf_size: obj_size - geometry.reserved,
        })
    }

    /// The end of the buffer a stack starts from, before the delta is
    /// applied.
    pub fn initial_end(&self, geometry: &StackGeometry) -> usize {
        if geometry.grows_up {
            self.buf_start
        } else {
            self.buf_start + self.buf_size
        }
    }

    /// Compute the delta from the TLS area size reported by the port and a
    /// raw random number.
    pub fn delta(&self, geometry: &StackGeometry, tls_size: usize, random: usize) -> usize {
        let delta = tls_size
            .saturating_add(geometry.local_data_size)
            .saturating_add(random_offset(random, geometry.random_max, self.buf_size));
        checked_round_up(delta, geometry.align).unwrap_or(usize::MAX)
    }

    /// Compute the initial stack pointer.
    pub fn stack_ptr(
        &self,
        geometry: &StackGeometry,
        delta: usize,
    ) -> Result<usize, StackPointerOutOfBounds> {
        if delta > self.buf_size {
            return Err(StackPointerOutOfBounds {
                delta,
                buf_size: self.buf_size,
            });
        }
        Ok(if geometry.grows_up {
            self.buf_start + delta
        } else {
            self.buf_start + self.buf_size - delta
        })
    }
}

/// Reduce `random` to an offset less than `max`. The offset is zero if it
/// would consume more than half of a `buf_size`-byte buffer.
pub const fn random_offset(random: usize, max: usize, buf_size: usize) -> usize {
    if max == 0 {
        return 0;
    }
    let fuzz = random % max;
    if fuzz.saturating_mul(2) > buf_size {
        0
    } else {
        fuzz
    }
}

/// The outcome of [`prepare`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PreparedStack {
    pub(crate) info: StackInfo,
    pub(crate) stack_ptr: usize,
    /// The address of the user-mode runtime data block, or `0`.
    pub(crate) local_data: usize,
}

/// Lay out `stack` for `thread`, poisoning it and writing the sentinel if
/// enabled.
///
/// Panics if the layout doesn't fit in the stack object.
///
/// Precondition: Kernel lock inactive, `thread` is not live
pub(crate) fn prepare<System: Kernel>(
    thread: &'static ThreadCb<System>,
    stack: StackRef<System>,
    stack_size: usize,
) -> PreparedStack {
    #[allow(clippy::let_unit_value)]
    let () = GeometryCheck::<System>::VALID;

    let geometry = StackGeometry::of::<System>(stack.is_user_capable());
    let base = stack.as_ptr() as usize;
    assert!(
        base % geometry.align == 0,
        "stack object {base:#x} is not aligned to {} bytes",
        geometry.align
    );

    let layout = StackLayout::new(&geometry, base, stack_size)
        .unwrap_or_else(|| panic!("stack size {stack_size} overflows"));
    assert!(
        layout.obj_size <= stack.obj_size(),
        "stack object is too small ({} < {})",
        stack.obj_size(),
        layout.obj_size
    );
    assert!(
        layout.buf_size >= geometry.min_buf_size(),
        "a {}-byte stack can't hold the stack sentinel",
        layout.buf_size
    );

    #[cfg(feature = "init_stacks")]
    // Safety: The buffer is inside the stack object, which isn't used by any
    // live thread
    unsafe {
        core::ptr::write_bytes(layout.buf_start as *mut u8, STACK_POISON, layout.buf_size);
    }

    #[cfg(feature = "stack_sentinel")]
    // Safety: Ditto
    unsafe {
        (layout.buf_start as *mut u32).write_unaligned(STACK_SENTINEL);
    }

    let end = layout.initial_end(&geometry);

    // Safety: The kernel lock is inactive, and the stack is ours
    let tls_size = unsafe { System::tls_stack_setup(thread, end) };

    let local_data = match (geometry.local_data_size, geometry.grows_up) {
        (0, _) => 0,
        (_, false) => end.wrapping_sub(tls_size + geometry.local_data_size),
        (_, true) => end + tls_size,
    };

    let random = if geometry.random_max != 0 {
        System::stack_random()
    } else {
        0
    };

    let delta = layout.delta(&geometry, tls_size, random);
    let stack_ptr = layout.stack_ptr(&geometry, delta).unwrap_or_else(|e| {
        panic!(
            "initial stack pointer is out of bounds (delta {} > buffer size {})",
            e.delta, e.buf_size
        )
    });

    log::debug!(
        "stack {base:#x}: obj_size {}, buffer {:#x}..{:#x}, delta {delta}, sp {stack_ptr:#x}",
        layout.obj_size,
        layout.buf_start,
        layout.buf_start + layout.buf_size,
    );

    PreparedStack {
        info: StackInfo {
            start: layout.buf_start,
            size: layout.buf_size,
            delta,
        },
        stack_ptr,
        local_data,
    }
}

/// Check that the current thread's stack sentinel is intact. If it has been
/// overwritten, restore it and terminate the thread through
/// [`fatal_error`](crate::fatal::fatal_error) with
/// [`FatalReason::StackCheckFail`](crate::FatalReason::StackCheckFail).
///
/// Does nothing for a dummy thread, or if `stack_sentinel` is disabled.
pub fn check_stack_sentinel<System: Kernel>() -> Result<(), BadContextError> {
    #[cfg(feature = "stack_sentinel")]
    {
        let Some(thread) = System::current_thread() else {
            return Ok(());
        };

        let lock = lock_kernel::<System>()?;
        if thread.st.get(&lock) == ThreadSt::Dummy || thread.stack_obj.get(&lock).is_none() {
            return Ok(());
        }
        let start = thread.stack_info.get(&lock).start as *mut u32;
        drop(lock);

        // Safety: `start` points to the current thread's stack buffer
        if unsafe { start.read_unaligned() } != STACK_SENTINEL {
            // Restore it so further checks don't trigger this same error
            // Safety: Ditto
            unsafe { start.write_unaligned(STACK_SENTINEL) };
            crate::fatal::fatal_error(crate::FatalReason::StackCheckFail, Some(thread));
        }
    }
    Ok(())
}

/// Measure the never-used part of `thread`'s stack by counting the poison
/// bytes at its far end.
pub fn stack_space_get<System: Kernel>(
    thread: &'static ThreadCb<System>,
) -> Result<usize, StackSpaceError> {
    #[cfg(feature = "init_stacks")]
    {
        let lock = lock_kernel::<System>()?;
        if thread.st.get(&lock) == ThreadSt::Dummy || thread.stack_obj.get(&lock).is_none() {
            return Err(StackSpaceError::NotSupported);
        }
        let info = thread.stack_info.get(&lock);
        drop(lock);

        let (mut start, mut size) = (info.start as *const u8, info.size);
        if cfg!(feature = "stack_sentinel") {
            // Skip the sentinel
            let skip = STACK_SENTINEL_SIZE.min(size);
            start = start.wrapping_add(skip);
            size -= skip;
        }

        // Safety: The range is inside the thread's stack buffer. Volatile
        // reads because the thread may be using the stack concurrently.
        let is_poison = |i: usize| unsafe { start.add(i).read_volatile() } == STACK_POISON;
        let unused = if System::STACK_GROWS_UP {
            (0..size).rev().take_while(|&i| is_poison(i)).count()
        } else {
            (0..size).take_while(|&i| is_poison(i)).count()
        };
        Ok(unused)
    }
    #[cfg(not(feature = "init_stacks"))]
    {
        let _ = thread;
        Err(StackSpaceError::NotSupported)
    }
}
