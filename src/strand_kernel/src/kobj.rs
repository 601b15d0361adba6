//! Kernel objects and access permissions
//!
//! Every kernel object that user-mode threads may name in a system call
//! embeds a [`KObject`] header. The header holds a permission bitmap indexed
//! by the per-thread permission index, and flags tracking whether the object
//! has been initialized.
//!
//! Trusted (kernel-mode) code bypasses every check here.
use core::fmt;

use crate::{
    error::{BadContextError, ObjectAccessError},
    klock::{lock_kernel, KernelLockCell, KernelLockGuardBorrowMut, KernelLockToken},
    stack::{ThreadStack, ThreadStackObj},
    thread::{self, ThreadCb},
    utils::{PermBitmap, MAX_THREADS},
    Kernel, PortThreading,
};

bitflags::bitflags! {
    /// The state flags of a [`KObject`].
    pub struct KObjectFlags: u8 {
        /// The object has been initialized. System calls creating an object
        /// in place require this to be clear.
        const INITIALIZED = 1 << 0;
        /// Every thread may access the object.
        const PUBLIC = 1 << 1;
    }
}

/// The type of a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KObjectKind {
    Thread,
    Stack,
    /// Any other object (semaphores, device instances, and so on).
    Other,
}

/// The header of a kernel object.
pub struct KObject<System: 'static> {
    kind: KObjectKind,
    flags: KernelLockCell<System, KObjectFlags>,
    perms: KernelLockCell<System, PermBitmap>,
    registered: KernelLockCell<System, bool>,
    /// The next object in the object table.
    next: KernelLockCell<System, Option<&'static KObject<System>>>,
}

impl<System: 'static> KObject<System> {
    pub const fn new(kind: KObjectKind) -> Self {
        Self {
            kind,
            flags: KernelLockCell::new(KObjectFlags::empty()),
            perms: KernelLockCell::new(PermBitmap::new()),
            registered: KernelLockCell::new(false),
            next: KernelLockCell::new(None),
        }
    }

    pub const fn kind(&self) -> KObjectKind {
        self.kind
    }
}

impl<System: Kernel> KObject<System> {
    /// Get the object's flags.
    pub fn flags(&self) -> Result<KObjectFlags, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.flags.get(&lock))
    }

    /// Get the object's permission bitmap.
    pub fn perms(&self) -> Result<PermBitmap, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.perms.get(&lock))
    }
}

impl<System: PortThreading> fmt::Debug for KObject<System> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KObject")
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("perms", &self.perms)
            .finish_non_exhaustive()
    }
}

/// Implemented by types embedding a [`KObject`] header.
pub trait KernelObject<System: PortThreading>: Sync + 'static {
    fn kobj(&self) -> &KObject<System>;
}

impl<System: PortThreading> KernelObject<System> for KObject<System> {
    fn kobj(&self) -> &KObject<System> {
        self
    }
}

impl<System: PortThreading> KernelObject<System> for ThreadCb<System> {
    fn kobj(&self) -> &KObject<System> {
        &self.kobj
    }
}

impl<System: PortThreading, const LEN: usize, const ALIGN: usize> KernelObject<System>
    for ThreadStack<System, LEN, ALIGN>
where
    elain::Align<ALIGN>: elain::Alignment,
{
    fn kobj(&self) -> &KObject<System> {
        ThreadStackObj::kobj(self)
    }
}

/// A build-time grant of object permissions to a static thread.
pub struct ObjectAssignment<System: PortThreading> {
    pub thread: &'static ThreadCb<System>,
    pub objects: &'static [&'static dyn KernelObject<System>],
}

/// The initialization state an object must be in to pass [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitCheck {
    MustBeInit,
    MustNotBeInit,
    DontCare,
}

/// Add `obj` to the object table so that user-mode threads can name it.
pub fn object_register<System: Kernel>(obj: &'static KObject<System>) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    register(lock.borrow_mut(), obj);
    Ok(())
}

/// Register `obj` and mark it initialized.
pub fn object_init<System: Kernel>(obj: &'static KObject<System>) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    init(lock.borrow_mut(), obj);
    Ok(())
}

/// Mark `obj` uninitialized.
pub fn object_uninit<System: Kernel>(obj: &'static KObject<System>) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    obj.flags.write(&mut *lock).remove(KObjectFlags::INITIALIZED);
    Ok(())
}

/// Allow `thread` to access `obj`.
pub fn object_access_grant<System: Kernel>(
    obj: &'static KObject<System>,
    thread: &'static ThreadCb<System>,
) -> Result<(), ObjectAccessError> {
    let mut lock = lock_kernel::<System>()?;
    grant(lock.borrow_mut(), obj, thread)
}

/// Disallow `thread` from accessing `obj`.
pub fn object_access_revoke<System: Kernel>(
    obj: &'static KObject<System>,
    thread: &'static ThreadCb<System>,
) -> Result<(), ObjectAccessError> {
    let mut lock = lock_kernel::<System>()?;
    if let Some(i) = thread.perm_index.get(&lock) {
        obj.perms.write(&mut *lock).clear(i as usize);
    }
    Ok(())
}

/// Allow every thread to access `obj`.
pub fn object_access_all_grant<System: Kernel>(
    obj: &'static KObject<System>,
) -> Result<(), BadContextError> {
    let mut lock = lock_kernel::<System>()?;
    register(lock.borrow_mut(), obj);
    obj.flags.write(&mut *lock).insert(KObjectFlags::PUBLIC);
    Ok(())
}

/// Return `true` if `thread` may access `obj`.
pub fn object_has_access<System: Kernel>(
    obj: &'static KObject<System>,
    thread: &'static ThreadCb<System>,
) -> Result<bool, BadContextError> {
    let lock = lock_kernel::<System>()?;
    Ok(has_access(&lock, obj, thread))
}

/// Reset `obj` for reuse: clear all permissions, grant the calling thread
/// access, and mark the object initialized.
pub fn object_recycle<System: Kernel>(obj: &'static KObject<System>) -> Result<(), ObjectAccessError> {
    let mut lock = lock_kernel::<System>()?;
    reset_perms(lock.borrow_mut(), obj, System::current_thread())
}

/// Reset the thread object of `thread` for reuse: clear all permissions
/// except the thread's access to itself, and mark the object initialized.
///
/// The thread's scheduling fields and stack are left untouched.
pub fn thread_recycle<System: Kernel>(thread: &'static ThreadCb<System>) -> Result<(), ObjectAccessError> {
    let mut lock = lock_kernel::<System>()?;
    reset_perms(lock.borrow_mut(), &thread.kobj, Some(thread))
}

fn reset_perms<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    obj: &'static KObject<System>,
    owner: Option<&'static ThreadCb<System>>,
) -> Result<(), ObjectAccessError> {
    register(lock.borrow_mut(), obj);
    obj.perms.write(&mut *lock).clear_all();
    if let Some(owner) = owner {
        grant(lock.borrow_mut(), obj, owner)?;
    }
    obj.flags.write(&mut *lock).insert(KObjectFlags::INITIALIZED);
    Ok(())
}

pub(crate) fn register<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    obj: &'static KObject<System>,
) {
    if obj.registered.replace(&mut lock, true) {
        return;
    }
    let state = System::state();
    let head = state.objects.replace(&mut lock, Some(obj));
    obj.next.replace(&mut lock, head);
}

pub(crate) fn init<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    obj: &'static KObject<System>,
) {
    register(lock.borrow_mut(), obj);
    obj.flags.write(&mut *lock).insert(KObjectFlags::INITIALIZED);
}

pub(crate) fn uninit<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    obj: &KObject<System>,
) {
    obj.flags.write(&mut *lock).remove(KObjectFlags::INITIALIZED);
}

pub(crate) fn grant<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    obj: &'static KObject<System>,
    thread: &'static ThreadCb<System>,
) -> Result<(), ObjectAccessError> {
    let i = assign_thread_index(lock.borrow_mut(), thread)?;
    register(lock.borrow_mut(), obj);
    obj.perms.write(&mut *lock).set(i as usize);
    Ok(())
}

pub(crate) fn has_access<System: Kernel>(
    token: &KernelLockToken<System>,
    obj: &KObject<System>,
    thread: &ThreadCb<System>,
) -> bool {
    obj.flags.get(token).contains(KObjectFlags::PUBLIC)
        || thread
            .perm_index
            .get(token)
            .is_some_and(|i| obj.perms.get(token).get(i as usize))
}

/// Fail with `NoAccess` unless the current thread may access `obj`.
pub(crate) fn check_current_access<System: Kernel>(
    token: &KernelLockToken<System>,
    obj: &KObject<System>,
) -> Result<(), ObjectAccessError> {
    let current = System::current_thread().ok_or(ObjectAccessError::NoAccess)?;
    if *obj.registered.read(token) && has_access(token, obj, current) {
        Ok(())
    } else {
        Err(ObjectAccessError::NoAccess)
    }
}

/// Validate an object named by a user-mode caller.
pub(crate) fn validate<System: Kernel>(
    token: &KernelLockToken<System>,
    obj: &KObject<System>,
    kind: KObjectKind,
    init: InitCheck,
) -> Result<(), ObjectAccessError> {
    if obj.kind != kind {
        return Err(ObjectAccessError::NoAccess);
    }
    check_current_access(token, obj)?;

    let initialized = obj.flags.get(token).contains(KObjectFlags::INITIALIZED);
    match (init, initialized) {
        (InitCheck::MustBeInit, false) | (InitCheck::MustNotBeInit, true) => {
            Err(ObjectAccessError::BadObjectState)
        }
        _ => Ok(()),
    }
}

/// Get the permission index of `thread`, allocating one if it has none.
pub(crate) fn assign_thread_index<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &ThreadCb<System>,
) -> Result<u8, ObjectAccessError> {
    if let Some(i) = thread.perm_index.get(&lock) {
        return Ok(i);
    }
    let indices = System::state().thread_indices.write(&mut *lock);
    let i = indices.first_clear().ok_or(ObjectAccessError::NoMemory)?;
    indices.set(i);
    debug_assert!(i < MAX_THREADS);
    let i = i as u8;
    thread.perm_index.replace(&mut lock, Some(i));
    Ok(i)
}

/// Return `true` if [`assign_thread_index`] would succeed for `thread`.
pub(crate) fn can_assign_thread_index<System: Kernel>(
    token: &KernelLockToken<System>,
    thread: &ThreadCb<System>,
) -> bool {
    thread.perm_index.get(token).is_some()
        || System::state().thread_indices.read(token).first_clear().is_some()
}

/// Give `child` access to every object `parent` can access, except `parent`
/// itself.
pub(crate) fn perms_inherit<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    parent: &'static ThreadCb<System>,
    child: &'static ThreadCb<System>,
) -> Result<(), ObjectAccessError> {
    let Some(parent_i) = parent.perm_index.get(&lock) else {
        return Ok(());
    };
    let child_i = assign_thread_index(lock.borrow_mut(), child)? as usize;

    let mut cur = System::state().objects.get(&lock);
    while let Some(obj) = cur {
        if !core::ptr::eq(obj, &parent.kobj) {
            let perms = obj.perms.write(&mut *lock);
            if perms.get(parent_i as usize) {
                perms.set(child_i);
            }
        }
        cur = obj.next.get(&lock);
    }
    Ok(())
}

/// Remove every permission held by `thread`.
pub(crate) fn thread_perms_all_clear<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &ThreadCb<System>,
) {
    let Some(i) = thread.perm_index.get(&lock) else {
        return;
    };
    let mut cur = System::state().objects.get(&lock);
    while let Some(obj) = cur {
        obj.perms.write(&mut *lock).clear(i as usize);
        cur = obj.next.get(&lock);
    }
}

/// Apply the build-time object assignment table.
pub(crate) fn grant_static_access<System: Kernel>() -> Result<(), ObjectAccessError> {
    for assignment in System::object_assignments() {
        let mut lock = lock_kernel::<System>()?;
        for &obj in assignment.objects {
            let obj: &'static dyn KernelObject<System> = obj;
            if let Err(e) = grant(lock.borrow_mut(), obj.kobj(), assignment.thread) {
                log::error!(
                    "failed to grant static object access to thread {:p}: {e:?}",
                    assignment.thread
                );
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Validate the objects named by a user-mode `thread::create` call.
pub(crate) fn validate_new_thread<System: Kernel>(
    token: &KernelLockToken<System>,
    thread: &'static ThreadCb<System>,
    stack: &dyn ThreadStackObj<System>,
) -> Result<(), ObjectAccessError> {
    validate(token, &thread.kobj, KObjectKind::Thread, InitCheck::MustNotBeInit)?;
    if !stack.is_user_capable() {
        return Err(ObjectAccessError::NoAccess);
    }
    validate(token, stack.kobj(), KObjectKind::Stack, InitCheck::MustNotBeInit)?;
    if !can_assign_thread_index(token, thread) {
        return Err(ObjectAccessError::NoMemory);
    }
    Ok(())
}

/// Validate a thread named by a user-mode caller.
pub(crate) fn validate_thread<System: Kernel>(
    token: &KernelLockToken<System>,
    thread: &'static ThreadCb<System>,
) -> Result<(), ObjectAccessError> {
    if thread::is_current_user(token) {
        validate(token, &thread.kobj, KObjectKind::Thread, InitCheck::DontCare)
    } else {
        Ok(())
    }
}
