use crate::{
    error::ObjectAccessError,
    klock::lock_kernel,
    thread::{self, Timeout},
    Kernel,
};

/// Create the threads in [`KernelCfg::static_threads`] and start the ones
/// with a delay other than [`Timeout::Forever`].
///
/// None of the threads runs before all of them are scheduled. Should be
/// called once at boot by the port, with no kernel lock held.
///
/// [`KernelCfg::static_threads`]: crate::KernelCfg::static_threads
pub fn init_static_threads<System: Kernel>() -> Result<(), ObjectAccessError> {
    let static_threads = System::static_threads();
    log::info!("initializing {} static thread(s)", static_threads.len());

    for def in static_threads {
        thread::setup(def.thread, &def.to_attr())?;
        let mut lock = lock_kernel::<System>()?;
        def.thread.init_data.replace(&mut lock, Some(def));
    }

    #[cfg(feature = "userspace")]
    crate::kobj::grant_static_access::<System>()?;

    // Safety: The kernel lock is inactive
    unsafe { System::sched_lock() };
    let result = static_threads
        .iter()
        .filter(|def| def.delay != Timeout::Forever)
        .try_for_each(|def| thread::schedule_new_thread(def.thread, def.delay));
    // Safety: Paired with the `sched_lock` above
    unsafe { System::sched_unlock() };

    result?;
    Ok(())
}
