//! Device driver registration
//!
//! Drivers are described by [`Device`] records listed in the build-time
//! device table ([`KernelCfg::devices`]). At boot, [`init_devices`] is called
//! once per [`InitLevel`] and invokes each driver's init function exactly
//! once, in ascending priority order.
//!
//! [`KernelCfg::devices`]: crate::KernelCfg::devices
use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{error::InitDeviceError, Kernel, ResultCode};

/// The boot phase in which a driver is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitLevel {
    /// Before the kernel is set up. Only hardware with no dependencies.
    PreKernel1,
    /// Before the kernel is set up. May depend on `PreKernel1` devices.
    PreKernel2,
    /// After the kernel is set up, before static threads are started.
    PostKernel,
    /// Application-level drivers.
    Application,
}

/// A driver's init function. Receives the device record so that it can
/// reach its `data` and `config`.
pub type DeviceInitFn = fn(&Device) -> Result<(), ResultCode>;

const STATUS_PENDING: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_READY: u8 = 2;
const STATUS_FAILED: u8 = 3;

/// A device instance.
pub struct Device {
    name: &'static str,
    init: DeviceInitFn,
    level: InitLevel,
    priority: u8,
    /// The driver's mutable state, opaque to the kernel.
    pub data: usize,
    /// The driver's read-only configuration, opaque to the kernel.
    pub config: usize,
    status: AtomicU8,
}

impl Device {
    pub const fn new(name: &'static str, level: InitLevel, priority: u8, init: DeviceInitFn) -> Self {
        Self {
            name,
            init,
            level,
            priority,
            data: 0,
            config: 0,
            status: AtomicU8::new(STATUS_PENDING),
        }
    }

    /// Attach the driver's `data` and `config` pointers.
    pub const fn with_data(self, data: usize, config: usize) -> Self {
        Self {
            data,
            config,
            ..self
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn level(&self) -> InitLevel {
        self.level
    }

    pub const fn priority(&self) -> u8 {
        self.priority
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("priority", &self.priority)
            .field("ready", &device_is_ready(self))
            .finish_non_exhaustive()
    }
}

/// Initialize every device of `level` that hasn't been initialized yet.
///
/// A driver's failure is logged and recorded (see [`device_is_ready`]) but
/// doesn't stop the remaining drivers from being initialized.
///
/// Precondition: Kernel lock inactive, not an interrupt handler
pub fn init_devices<System: Kernel>(level: InitLevel) -> Result<(), InitDeviceError> {
    if System::is_in_isr() || System::is_kernel_lock_active() {
        return Err(InitDeviceError::BadContext);
    }

    let devices = System::devices();
    while let Some(dev) = devices
        .iter()
        .copied()
        .filter(|d| d.level == level && d.status.load(Ordering::Relaxed) == STATUS_PENDING)
        .min_by_key(|d| d.priority)
    {
        if dev
            .status
            .compare_exchange(STATUS_PENDING, STATUS_RUNNING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }

        log::debug!("initializing device '{}' ({level:?}, priority {})", dev.name, dev.priority);
        let status = match (dev.init)(dev) {
            Ok(()) => STATUS_READY,
            Err(e) => {
                log::error!("device '{}' failed to initialize: {e:?}", dev.name);
                STATUS_FAILED
            }
        };
        dev.status.store(status, Ordering::Release);
    }
    Ok(())
}

/// Return `true` if `dev`'s driver was initialized successfully.
pub fn device_is_ready(dev: &Device) -> bool {
    dev.status.load(Ordering::Acquire) == STATUS_READY
}
