//! Thread lifecycle: set up, create, start, retire
use super::{is_valid_prio, set_state, ThreadAttr, ThreadCb, ThreadEntry, ThreadOptions, ThreadSt, Timeout};
use crate::{
    error::{BadContextError, CreateThreadError, ObjectAccessError},
    klock::{lock_kernel, KernelLockGuardBorrowMut},
    monitor,
    stack::{self, StackGeometry, StackInfo},
    stats, Kernel,
};

#[cfg(feature = "thread_monitor")]
use super::EntryRecord;
#[cfg(feature = "sched_cpu_mask")]
use super::CPU_MASK_ALL;
#[cfg(feature = "userspace")]
use crate::{
    klock::KernelLockToken,
    kobj, mem_domain,
    stack::StackLayout,
    thread::{is_current_user, is_prio_lower_or_equal},
    utils::Init,
};

/// Initialize `thread` so that it's ready to be started, and return the
/// initial stack pointer.
///
/// The thread is left in the Prestart state. Use [`start`] (or [`create`]
/// instead of this function) to make it runnable.
///
/// # Panics
///
/// Panics if the priority is invalid for the given options, if `thread` is
/// live, or if the stack doesn't fit in the stack object. These indicate a
/// configuration defect.
pub fn setup<System: Kernel>(
    thread: &'static ThreadCb<System>,
    attr: &ThreadAttr<'_, System>,
) -> Result<usize, BadContextError> {
    assert!(
        is_valid_prio::<System>(attr.priority, attr.options),
        "invalid priority {} for a thread with options {:?}",
        attr.priority,
        attr.options
    );

    let mut lock = lock_kernel::<System>()?;
    claim(lock.borrow_mut(), thread, attr);
    drop(lock);

    finish_setup(thread, attr)
}

/// Take the ownership of the dead `thread` and move it to the Prestart state.
/// Everything that decides whether `thread` can be set up happens here, so
/// that a caller validating a request under the same lock can't race with
/// another creator.
fn claim<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
    attr: &ThreadAttr<'_, System>,
) {
    let stack = attr.stack;

    let st = thread.st.get(&lock);
    assert!(!st.is_live(), "thread {thread:p} is still live ({st})");
    assert!(
        !monitor::is_linked(&lock.borrow_mut(), thread),
        "thread {thread:p} is still in the registry"
    );

    #[cfg(feature = "userspace")]
    {
        if attr.options.contains(ThreadOptions::USER) {
            assert!(
                stack.is_user_capable(),
                "a user thread requires a user-capable stack"
            );
        }
        kobj::init(lock.borrow_mut(), &thread.kobj);
        kobj::init(lock.borrow_mut(), stack.kobj());
        if let Err(e) = kobj::grant(lock.borrow_mut(), &thread.kobj, thread) {
            panic!("can't grant thread {thread:p} access to itself: {e:?}");
        }
    }

    set_state(lock.borrow_mut(), thread, ThreadSt::Prestart);
    thread.priority.replace(&mut *lock, attr.priority);
    thread.options.replace(&mut *lock, attr.options);
    thread.sched_locked.replace(&mut *lock, 0);
    thread.stack_obj.replace(&mut *lock, Some(stack));
}

/// Lay out the stack of a claimed thread, construct its initial context, and
/// register it.
fn finish_setup<System: Kernel>(
    thread: &'static ThreadCb<System>,
    attr: &ThreadAttr<'_, System>,
) -> Result<usize, BadContextError> {
    let prepared = stack::prepare(thread, attr.stack, attr.stack_size);

    // Safety: The kernel lock is inactive, and the thread is in the Prestart
    // state
    unsafe {
        System::initialize_thread_state(thread, prepared.stack_ptr, attr.entry, attr.params);
    }

    let mut lock = lock_kernel::<System>()?;
    thread.stack_info.replace(&mut lock, prepared.info);
    #[cfg(feature = "userspace")]
    thread.local_data.replace(&mut lock, prepared.local_data);
    thread.init_data.replace(&mut lock, None);
    #[cfg(feature = "custom_data")]
    thread.custom_data.replace(&mut lock, 0);
    #[cfg(feature = "thread_monitor")]
    thread.entry.replace(
        &mut lock,
        Some(EntryRecord {
            entry: attr.entry,
            params: attr.params,
        }),
    );
    monitor::insert(lock.borrow_mut(), thread);
    #[cfg(feature = "thread_name")]
    thread.name.write(&mut *lock).set(attr.name);
    #[cfg(feature = "sched_cpu_mask")]
    thread.cpu_mask.replace(&mut lock, CPU_MASK_ALL);

    let creator = System::current_thread();
    let pool = creator.and_then(|c| c.resource_pool.get(&lock));
    thread.resource_pool.replace(&mut lock, pool);

    #[cfg(feature = "userspace")]
    {
        mem_domain::init_thread(lock.borrow_mut(), thread);
        if let Some(creator) = creator {
            if attr.options.contains(ThreadOptions::INHERIT_PERMS) {
                if let Err(e) = kobj::perms_inherit(lock.borrow_mut(), creator, thread) {
                    panic!("can't inherit permissions from {creator:p}: {e:?}");
                }
            }
        }
    }

    stats::reset(lock.borrow_mut(), thread);

    log::debug!(
        "thread {thread:p} set up: priority {}, options {:?}, sp {:#x}",
        attr.priority,
        attr.options,
        prepared.stack_ptr
    );

    Ok(prepared.stack_ptr)
}

/// Set up `thread` and schedule it to start after `delay`.
///
/// When the caller is a user-mode thread, the request is validated before
/// anything is modified, and a rejected request leaves the kernel state
/// untouched. The thread is claimed without releasing the kernel lock after
/// the validation, so concurrent requests for the same thread fail with
/// `BadObjectState`. Otherwise, the request is trusted and an invalid one is
/// a panic (see [`setup`]).
pub fn create<System: Kernel>(
    thread: &'static ThreadCb<System>,
    attr: &ThreadAttr<'_, System>,
    delay: Timeout,
) -> Result<&'static ThreadCb<System>, CreateThreadError> {
    if System::is_in_isr() {
        return Err(CreateThreadError::BadContext);
    }

    #[cfg(feature = "userspace")]
    {
        let mut lock = lock_kernel::<System>()?;
        if is_current_user(&lock) {
            if let Err(e) = verify_user_create(&lock, thread, attr) {
                log::warn!("rejected a thread creation request from user mode: {e:?}");
                return Err(e);
            }
            claim(lock.borrow_mut(), thread, attr);
            drop(lock);

            finish_setup(thread, attr)?;
            schedule_new_thread(thread, delay)?;
            return Ok(thread);
        }
    }

    setup(thread, attr)?;
    schedule_new_thread(thread, delay)?;
    Ok(thread)
}

/// Check a `create` request from a user-mode thread.
#[cfg(feature = "userspace")]
fn verify_user_create<System: Kernel>(
    token: &KernelLockToken<System>,
    thread: &'static ThreadCb<System>,
    attr: &ThreadAttr<'_, System>,
) -> Result<(), CreateThreadError> {
    kobj::validate_new_thread(token, thread, attr.stack)?;
    if thread.st.get(token).is_live() {
        return Err(CreateThreadError::BadObjectState);
    }

    let total = System::THREAD_STACK_RESERVED
        .checked_add(attr.stack_size)
        .ok_or(CreateThreadError::Overflow)?;
    let geometry = StackGeometry::of::<System>(true);
    let layout = StackLayout::new(&geometry, attr.stack.as_ptr() as usize, attr.stack_size)
        .ok_or(CreateThreadError::Overflow)?;
    if total > attr.stack.obj_size()
        || layout.obj_size > attr.stack.obj_size()
        || layout.buf_size < geometry.min_buf_size()
    {
        return Err(CreateThreadError::NoMemory);
    }

    if !attr.options.contains(ThreadOptions::USER) || attr.options.contains(ThreadOptions::ESSENTIAL) {
        return Err(CreateThreadError::NotPermitted);
    }

    if !is_valid_prio::<System>(attr.priority, attr.options) {
        return Err(CreateThreadError::BadParam);
    }

    let current_prio = System::current_thread().map_or(i32::MIN, |c| c.priority.get(token));
    if !is_prio_lower_or_equal(attr.priority, current_prio) {
        return Err(CreateThreadError::NotPermitted);
    }

    Ok(())
}

/// Start `thread` according to the `delay` given to [`create`].
pub(crate) fn schedule_new_thread<System: Kernel>(
    thread: &'static ThreadCb<System>,
    delay: Timeout,
) -> Result<(), BadContextError> {
    match delay.normalize() {
        Timeout::NoWait => start_unchecked(thread)?,
        Timeout::After(delay) => {
            // Safety: The kernel lock is inactive, and the thread is in the
            // Prestart state
            unsafe { System::add_thread_timeout(thread, delay) };
        }
        Timeout::Forever => {}
    }
    Ok(())
}

/// Make a Prestart thread runnable.
///
/// A thread that has already been started is left untouched (with a
/// warning).
pub fn start<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<(), ObjectAccessError> {
    #[cfg(feature = "userspace")]
    {
        let lock = lock_kernel::<System>()?;
        kobj::validate_thread(&lock, thread)?;
    }
    start_unchecked(thread)?;
    Ok(())
}

fn start_unchecked<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    let st = thread.st.get(&lock);
    if st != ThreadSt::Prestart {
        log::warn!("thread {thread:p} has already been started ({st})");
        return Ok(());
    }
    set_state(lock.borrow_mut(), thread, ThreadSt::Queued);
    drop(lock);

    // Safety: The kernel lock is inactive, and the thread is in the Queued
    // state
    unsafe { System::start_thread(thread) };
    Ok(())
}

/// Remove `thread` from the registry.
pub(crate) fn monitor_exit<System: Kernel>(
    lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    if !monitor::remove(lock, thread) && cfg!(feature = "thread_monitor") {
        log::warn!("exiting thread {thread:p} was not in the registry");
    }
}

/// The teardown of a terminated thread. Called once through
/// [`PortToKernel::thread_exited`].
///
/// [`PortToKernel::thread_exited`]: crate::PortToKernel::thread_exited
pub(crate) fn retire<System: Kernel>(thread: &'static ThreadCb<System>) {
    let Ok(mut lock) = lock_kernel::<System>() else {
        panic!("a thread exited while the kernel lock was held");
    };

    set_state(lock.borrow_mut(), thread, ThreadSt::Dead);
    monitor_exit(lock.borrow_mut(), thread);

    #[cfg(feature = "userspace")]
    {
        mem_domain::exit_thread(lock.borrow_mut(), thread);
        kobj::uninit(lock.borrow_mut(), &thread.kobj);
        if let Some(stack) = thread.stack_obj.get(&lock) {
            kobj::uninit(lock.borrow_mut(), stack.kobj());
        }
        kobj::thread_perms_all_clear(lock.borrow_mut(), thread);
    }

    log::debug!("thread {thread:p} exited");
}

/// Turn `thread` into the bootstrap pseudo-thread, which stands in for the
/// current thread until the scheduler starts. It has no stack and is
/// excluded from stack checks and statistics.
pub fn init_dummy_thread<System: Kernel>(
    thread: &'static ThreadCb<System>,
) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    set_state(lock.borrow_mut(), thread, ThreadSt::Dummy);
    thread.options.replace(&mut lock, ThreadOptions::ESSENTIAL);
    thread.sched_locked.replace(&mut lock, 0);
    thread.stack_obj.replace(&mut lock, None);
    thread.stack_info.replace(&mut lock, StackInfo::default());
    thread.resource_pool.replace(&mut lock, None);
    #[cfg(feature = "userspace")]
    {
        thread.local_data.replace(&mut lock, Init::INIT);
        mem_domain::init_thread(lock.borrow_mut(), thread);
    }
    stats::reset(lock.borrow_mut(), thread);
    Ok(())
}

/// Drop the current thread to user mode and continue execution from
/// `entry(params[0], params[1], params[2])` on a fresh stack.
///
/// The thread loses its essential flag.
///
/// # Panics
///
/// Panics if there's no current thread, if it has no stack, or (with
/// `userspace`) if its stack isn't user-capable.
pub fn user_mode_enter<System: Kernel>(entry: ThreadEntry, params: [usize; 3]) -> ! {
    let Some(thread) = System::current_thread() else {
        panic!("`user_mode_enter` requires a thread context");
    };

    let Ok(mut lock) = lock_kernel::<System>() else {
        panic!("`user_mode_enter` called with the kernel lock held");
    };
    let options = thread.options.write(&mut *lock);
    options.insert(ThreadOptions::USER);
    options.remove(ThreadOptions::ESSENTIAL);
    #[cfg(feature = "thread_monitor")]
    thread.entry.replace(&mut lock, Some(EntryRecord { entry, params }));
    let stack = thread.stack_obj.get(&lock);
    let info = thread.stack_info.get(&lock);
    #[cfg(feature = "userspace")]
    let local_data = thread.local_data.get(&lock);
    drop(lock);

    let Some(stack) = stack else {
        panic!("thread {thread:p} has no stack");
    };

    #[cfg(feature = "userspace")]
    assert!(
        stack.is_user_capable(),
        "thread {thread:p} can't enter user mode on a kernel-only stack"
    );

    let geometry = StackGeometry::of::<System>(stack.is_user_capable());

    #[cfg(feature = "userspace")]
    if local_data != 0 {
        // Safety: The block is inside the current thread's stack, above the
        // initial stack pointer
        unsafe {
            core::ptr::write_bytes(local_data as *mut u8, 0, geometry.local_data_size);
        }
    }

    let (end, stack_ptr) = if geometry.grows_up {
        (info.start, info.start + info.delta)
    } else {
        (info.start + info.size, info.initial_stack_ptr())
    };

    // Safety: The kernel lock is inactive, and the area is owned by the
    // current thread
    unsafe { System::tls_stack_setup(thread, end) };

    log::debug!("thread {thread:p} entering user mode (sp {stack_ptr:#x})");

    // Safety: We are in the current thread's context, and the kernel lock is
    // inactive
    unsafe { System::user_mode_enter(entry, params, stack_ptr) }
}

/// Reset the access permissions of `thread` so that only the thread itself
/// can access it. See [`kobj::thread_recycle`].
///
/// Without `userspace`, there are no permissions and this does nothing.
pub fn recycle<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<(), ObjectAccessError> {
    #[cfg(feature = "userspace")]
    {
        kobj::thread_recycle(thread)
    }
    #[cfg(not(feature = "userspace"))]
    {
        let _ = thread;
        Ok(())
    }
}
