//! Thread registry
//!
//! Every live thread is kept in a singly linked list headed by
//! `State::threads` (when `thread_monitor` is enabled) for introspection and
//! postmortem tooling. Threads are inserted at the head by [`setup`] and
//! removed when the scheduler retires them.
//!
//! Each insertion is tagged with an increasing sequence number, so the list
//! is always sorted by descending sequence number. [`foreach_unlocked`] uses
//! this to resume a walk after the kernel lock was released:
//!
//!  - A thread removed during the walk is never visited again.
//!  - A thread inserted during the walk is never visited.
//!
//! When `thread_monitor` is disabled, the registry is empty and every
//! operation is a no-op.
//!
//! [`setup`]: crate::thread::setup
use crate::{
    error::ForeachThreadError,
    klock::{lock_kernel, KernelLockGuardBorrowMut},
    thread::ThreadCb,
    Kernel,
};

#[cfg(feature = "thread_monitor")]
use crate::{utils::Init, PortThreading};

/// The registry linkage embedded in [`ThreadCb`].
#[cfg(feature = "thread_monitor")]
pub(crate) struct MonitorLink<System: PortThreading> {
    /// The next (older) thread in the registry. Only meaningful when
    /// `linked` is set.
    next: Option<&'static ThreadCb<System>>,
    linked: bool,
    /// The sequence number assigned at the last insertion.
    seq: u64,
}

#[cfg(feature = "thread_monitor")]
impl<System: PortThreading> Clone for MonitorLink<System> {
    fn clone(&self) -> Self {
        *self
    }
}

#[cfg(feature = "thread_monitor")]
impl<System: PortThreading> Copy for MonitorLink<System> {}

#[cfg(feature = "thread_monitor")]
impl<System: PortThreading> Init for MonitorLink<System> {
    const INIT: Self = Self {
        next: None,
        linked: false,
        seq: 0,
    };
}

#[cfg(feature = "thread_monitor")]
impl<System: PortThreading> core::fmt::Debug for MonitorLink<System> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MonitorLink")
            .field("next", &self.next.map(|t| t as *const ThreadCb<System>))
            .field("linked", &self.linked)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Return `true` if `thread` is in the registry.
pub(crate) fn is_linked<System: Kernel>(
    lock: &KernelLockGuardBorrowMut<'_, System>,
    thread: &ThreadCb<System>,
) -> bool {
    #[cfg(feature = "thread_monitor")]
    {
        thread.link.read(&**lock).linked
    }
    #[cfg(not(feature = "thread_monitor"))]
    {
        let _ = (lock, thread);
        false
    }
}

/// Insert `thread` at the head of the registry.
pub(crate) fn insert<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    #[cfg(feature = "thread_monitor")]
    {
        let state = System::state();
        let seq = state.next_monitor_seq.get(&lock);
        state.next_monitor_seq.replace(&mut lock, seq + 1);

        let head = state.threads.replace(&mut lock, Some(thread));

        let link = thread.link.write(&mut *lock);
        assert!(!link.linked, "thread is already in the registry");
        *link = MonitorLink {
            next: head,
            linked: true,
            seq,
        };
        log::trace!("registry: inserted {:p} (seq {seq})", thread);
    }
    #[cfg(not(feature = "thread_monitor"))]
    {
        let _ = (lock, thread);
    }
}

/// Remove `thread` from the registry. Returns `false` if it wasn't there.
pub(crate) fn remove<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) -> bool {
    #[cfg(feature = "thread_monitor")]
    {
        let link = thread.link.get(&lock);
        if !link.linked {
            return false;
        }

        let state = System::state();
        let mut prev: Option<&'static ThreadCb<System>> = None;
        let mut cur = state.threads.get(&lock);
        while let Some(t) = cur {
            if core::ptr::eq(t, thread) {
                break;
            }
            prev = Some(t);
            cur = t.link.read(&*lock).next;
        }
        assert!(cur.is_some(), "registry is inconsistent");

        match prev {
            None => {
                state.threads.replace(&mut lock, link.next);
            }
            Some(prev) => prev.link.write(&mut *lock).next = link.next,
        }

        let link = thread.link.write(&mut *lock);
        link.next = None;
        link.linked = false;
        log::trace!("registry: removed {:p}", thread);
        true
    }
    #[cfg(not(feature = "thread_monitor"))]
    {
        let _ = (lock, thread);
        false
    }
}

/// Call `f` for every thread in the registry with the kernel lock held for
/// the entire walk.
///
/// `f` must not create or terminate threads. Kernel operations that need the
/// kernel lock fail with `BadContext` when called from `f`.
pub fn foreach<System: Kernel>(
    mut f: impl FnMut(&'static ThreadCb<System>),
) -> Result<(), ForeachThreadError> {
    let lock = lock_kernel::<System>()?;

    #[cfg(feature = "thread_monitor")]
    {
        let mut cur = System::state().threads.get(&lock);
        while let Some(t) = cur {
            f(t);
            cur = t.link.read(&*lock).next;
        }
    }
    #[cfg(not(feature = "thread_monitor"))]
    let _ = &mut f;

    drop(lock);
    Ok(())
}

/// Call `f` for every thread in the registry, releasing the kernel lock
/// around each call so that `f` can create or terminate threads (including
/// the one being visited).
///
/// See [the module documentation](self) for the consistency guarantees.
pub fn foreach_unlocked<System: Kernel>(
    mut f: impl FnMut(&'static ThreadCb<System>),
) -> Result<(), ForeachThreadError> {
    #[cfg_attr(not(feature = "thread_monitor"), allow(unused_mut))]
    let mut lock = lock_kernel::<System>()?;

    #[cfg(feature = "thread_monitor")]
    {
        let state = System::state();
        let mut cur = state.threads.get(&lock);
        while let Some(t) = cur {
            let seq = t.link.read(&*lock).seq;

            drop(lock);
            f(t);
            lock = lock_kernel::<System>()?;

            let link = t.link.get(&lock);
            cur = if link.linked && link.seq == seq {
                link.next
            } else {
                // `t` was removed (and maybe reinserted). Resume from the
                // first thread older than `t`.
                let mut cur = state.threads.get(&lock);
                while let Some(t) = cur {
                    let link = t.link.read(&*lock);
                    if link.seq < seq {
                        break;
                    }
                    cur = link.next;
                }
                cur
            };
        }
    }
    #[cfg(not(feature = "thread_monitor"))]
    let _ = &mut f;

    drop(lock);
    Ok(())
}

/// Collect the registry into a fixed-capacity vector, newest first. Threads
/// that don't fit are omitted.
pub fn snapshot<System: Kernel, const N: usize>(
) -> Result<arrayvec::ArrayVec<&'static ThreadCb<System>, N>, ForeachThreadError> {
    let mut out = arrayvec::ArrayVec::new();
    foreach::<System>(|t| {
        let _ = out.try_push(t);
    })?;
    Ok(out)
}
