//! Result codes and error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use strand_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel's system calls can
    /// return.
    ///
    /// A user-mode caller sees these as the negative status of a rejected
    /// system call.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The operation is not supported by the current kernel configuration.
        NotSupported = -9,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified kernel object is unknown, or the caller lacks the
        /// permission to access it.
        NoAccess = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The caller is not privileged enough to request the operation.
        NotPermitted = -27,
        /// A supplied memory region is too small.
        NoMemory = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// A size calculation wrapped around.
        Overflow = -45,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// `BadContext`. Returned when the kernel lock is already held by the
    /// current context.
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod object_access_error {}
    /// Error type for the kernel object operations.
    pub enum ObjectAccessError: BadContextError {
        BadContext,
        /// The object is unknown, or the caller lacks the permission to access
        /// it.
        NoAccess,
        /// The object isn't in the initialization state the operation
        /// requires.
        BadObjectState,
        /// The thread permission index pool is exhausted.
        NoMemory,
    }
}

define_error! {
    mod create_thread_error {}
    /// Error type for [`thread::create`].
    ///
    /// Only a thread running in user mode can observe the errors other than
    /// `BadContext`; the same conditions are treated as assertion failures when
    /// the caller is trusted.
    ///
    /// [`thread::create`]: crate::thread::create
    pub enum CreateThreadError: BadContextError, ObjectAccessError {
        /// The caller is an interrupt handler, or the kernel lock is already
        /// held.
        BadContext,
        /// The thread or stack object is unknown, or the caller can't access
        /// it.
        NoAccess,
        /// The thread or stack object is already initialized.
        BadObjectState,
        /// The stack size plus the reserved area wraps around.
        Overflow,
        /// The stack object is too small for the requested stack size.
        NoMemory,
        /// The caller asked for a kernel-mode or essential thread, or for a
        /// priority higher than its own.
        NotPermitted,
        /// The priority is out of range.
        BadParam,
    }
}

define_error! {
    mod get_runtime_stats_error {}
    /// Error type for [`stats::thread_runtime_stats`].
    ///
    /// [`stats::thread_runtime_stats`]: crate::stats::thread_runtime_stats
    pub enum GetRuntimeStatsError: BadContextError {
        BadContext,
        /// No thread was specified.
        BadParam,
        /// Runtime statistics are disabled.
        NotSupported,
    }
}

define_error! {
    mod foreach_thread_error {}
    /// Error type for [`monitor::foreach`] and [`monitor::foreach_unlocked`].
    ///
    /// [`monitor::foreach`]: crate::monitor::foreach
    /// [`monitor::foreach_unlocked`]: crate::monitor::foreach_unlocked
    pub enum ForeachThreadError: BadContextError {
        /// The kernel lock is already held, e.g., because this was called from
        /// inside a [`monitor::foreach`] callback.
        ///
        /// [`monitor::foreach`]: crate::monitor::foreach
        BadContext,
    }
}

define_error! {
    mod set_thread_name_error {}
    /// Error type for [`thread::set_name`].
    ///
    /// [`thread::set_name`]: crate::thread::set_name
    pub enum SetThreadNameError: BadContextError {
        /// There's no current thread to rename.
        BadContext,
        /// The caller can't access the target thread.
        NoAccess,
        /// Thread names are disabled.
        NotSupported,
    }
}

define_error! {
    mod get_thread_name_error {}
    /// Error type for [`thread::copy_name`].
    ///
    /// [`thread::copy_name`]: crate::thread::copy_name
    pub enum GetThreadNameError: BadContextError {
        BadContext,
        /// The destination buffer can't hold the name and its terminator.
        BadParam,
        /// Thread names are disabled.
        NotSupported,
    }
}

define_error! {
    mod custom_data_error {}
    /// Error type for [`thread::custom_data_set`] and
    /// [`thread::custom_data_get`].
    ///
    /// [`thread::custom_data_set`]: crate::thread::custom_data_set
    /// [`thread::custom_data_get`]: crate::thread::custom_data_get
    pub enum CustomDataError: BadContextError {
        /// There's no current thread.
        BadContext,
        /// Custom data slots are disabled.
        NotSupported,
    }
}

define_error! {
    mod stack_space_error {}
    /// Error type for [`stack::stack_space_get`].
    ///
    /// [`stack::stack_space_get`]: crate::stack::stack_space_get
    pub enum StackSpaceError: BadContextError {
        BadContext,
        /// Stack poisoning is disabled, or the thread has no stack.
        NotSupported,
    }
}

define_error! {
    mod cpu_mask_error {}
    /// Error type for the CPU affinity mask operations.
    pub enum CpuMaskError: BadContextError {
        BadContext,
        /// The CPU index is out of range.
        BadParam,
        /// The thread has already been started.
        BadObjectState,
        /// CPU affinity masks are disabled.
        NotSupported,
    }
}

define_error! {
    mod mem_domain_error {}
    /// Error type for the memory domain operations.
    pub enum MemDomainError: BadContextError {
        BadContext,
        /// The partition overlaps an existing one, or is empty.
        BadParam,
        /// The domain is out of partition slots.
        NoMemory,
        /// The partition isn't a member of the domain.
        BadObjectState,
    }
}

define_error! {
    mod init_device_error {}
    /// Error type for [`device::init_devices`].
    ///
    /// [`device::init_devices`]: crate::device::init_devices
    pub enum InitDeviceError: BadContextError {
        BadContext,
    }
}
