//! Memory domains
//!
//! A memory domain is a set of memory partitions that the threads in the
//! domain may access from user mode. Every thread belongs to at most one
//! domain. A thread joins its creator's domain when it's set up, or the
//! default domain if it has no creator.
use arrayvec::ArrayVec;

use crate::{
    error::{BadContextError, MemDomainError},
    klock::{lock_kernel, KernelLockCell, KernelLockGuardBorrowMut},
    thread::ThreadCb,
    Kernel, PortThreading,
};

/// The maximum number of partitions in a memory domain.
pub const MAX_PARTITIONS: usize = 8;

bitflags::bitflags! {
    /// Access permissions of a memory partition for user-mode threads.
    pub struct PartitionAttr: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A contiguous memory region with user-mode access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPartition {
    pub start: usize,
    pub size: usize,
    pub attr: PartitionAttr,
}

impl MemPartition {
    pub const fn new(start: usize, size: usize, attr: PartitionAttr) -> Self {
        Self { start, size, attr }
    }

    fn end(&self) -> usize {
        self.start.saturating_add(self.size)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

pub type Partitions = ArrayVec<MemPartition, MAX_PARTITIONS>;

/// A memory domain. Usually a `static`.
pub struct MemDomain<System> {
    partitions: KernelLockCell<System, Partitions>,
    num_threads: KernelLockCell<System, usize>,
}

impl<System> MemDomain<System> {
    pub const fn new() -> Self {
        Self {
            partitions: KernelLockCell::new(ArrayVec::new_const()),
            num_threads: KernelLockCell::new(0),
        }
    }
}

impl<System: PortThreading> core::fmt::Debug for MemDomain<System> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MemDomain")
            .field("partitions", &self.partitions)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl<System: Kernel> MemDomain<System> {
    /// Get a copy of the partitions.
    pub fn partitions(&self) -> Result<Partitions, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.partitions.read(&*lock).clone())
    }

    /// Get the number of threads in the domain.
    pub fn num_threads(&self) -> Result<usize, BadContextError> {
        let lock = lock_kernel::<System>()?;
        Ok(self.num_threads.get(&lock))
    }

    /// Add a partition. It must be non-empty and must not overlap the
    /// existing partitions.
    pub fn add_partition(&self, part: MemPartition) -> Result<(), MemDomainError> {
        if part.size == 0 || part.start.checked_add(part.size).is_none() {
            return Err(MemDomainError::BadParam);
        }
        let mut lock = lock_kernel::<System>()?;
        let partitions = self.partitions.write(&mut *lock);
        if partitions.iter().any(|p| p.overlaps(&part)) {
            return Err(MemDomainError::BadParam);
        }
        partitions
            .try_push(part)
            .map_err(|_| MemDomainError::NoMemory)
    }

    /// Remove a partition previously added by [`Self::add_partition`].
    pub fn remove_partition(&self, part: MemPartition) -> Result<(), MemDomainError> {
        let mut lock = lock_kernel::<System>()?;
        let partitions = self.partitions.write(&mut *lock);
        let i = partitions
            .iter()
            .position(|p| *p == part)
            .ok_or(MemDomainError::BadObjectState)?;
        partitions.remove(i);
        Ok(())
    }

    /// Move `thread` into this domain.
    pub fn add_thread(&'static self, thread: &'static ThreadCb<System>) -> Result<(), MemDomainError> {
        let mut lock = lock_kernel::<System>()?;
        move_thread(lock.borrow_mut(), thread, Some(self));
        Ok(())
    }
}

/// Get the default memory domain.
pub fn default_domain<System: Kernel>() -> &'static MemDomain<System> {
    &System::state().default_mem_domain
}

/// Get the domain `thread` belongs to.
pub fn thread_mem_domain<System: Kernel>(
    thread: &'static ThreadCb<System>,
) -> Result<Option<&'static MemDomain<System>>, BadContextError> {
    let lock = lock_kernel::<System>()?;
    Ok(thread.mem_domain.get(&lock))
}

/// Put a new thread into its creator's domain.
pub(crate) fn init_thread<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    let domain = System::current_thread()
        .and_then(|current| current.mem_domain.get(&lock))
        .unwrap_or_else(default_domain::<System>);
    move_thread(lock.borrow_mut(), thread, Some(domain));
}

/// Take an exiting thread out of its domain.
pub(crate) fn exit_thread<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
) {
    move_thread(lock.borrow_mut(), thread, None);
}

fn move_thread<System: Kernel>(
    mut lock: KernelLockGuardBorrowMut<'_, System>,
    thread: &'static ThreadCb<System>,
    domain: Option<&'static MemDomain<System>>,
) {
    if let Some(old) = thread.mem_domain.replace(&mut lock, domain) {
        *old.num_threads.write(&mut *lock) -= 1;
    }
    if let Some(new) = domain {
        *new.num_threads.write(&mut *lock) += 1;
    }
}
