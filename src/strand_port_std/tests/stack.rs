//! Stack layout, poisoning, and overflow detection
use quickcheck_macros::quickcheck;
use std::sync::atomic::{AtomicBool, Ordering};
use strand_kernel::{
    stack::{self, kernel_stack_len, thread_stack_len, STACK_POISON, STACK_SENTINEL},
    thread, FatalReason, StackSpaceError, ThreadAttr, ThreadCb, ThreadOptions, ThreadSt,
    ThreadStack, ThreadStackObj, Timeout,
};
use strand_port_std::{Event, ThreadId};

fn nop(_: usize, _: usize, _: usize) {}

mod layout {
    use super::*;

    strand_port_std::use_port!(unsafe struct System {
        const STACK_ALIGN: usize = 16;
        const KERNEL_STACK_RESERVED: usize = 16;
        const THREAD_STACK_RESERVED: usize = 64;
        const STACK_POINTER_RANDOM: usize = 100;
    });
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static USER_STACK: ThreadStack<System, 1024, 16> = ThreadStack::new();
    static KERNEL_STACK: ThreadStack<System, 1024, 16> = ThreadStack::new_kernel();

    /// The initial stack pointer is aligned and inside the usable buffer,
    /// which excludes the reserved area.
    #[quickcheck]
    fn initial_stack_pointer_in_bounds(random: usize, tls_size: u8, size_units: u8, user: bool) {
        strand_port_std::init_logger();
        strand_port_std::set_stack_random::<System>(random);
        let tls_size = tls_size as usize % 128;
        strand_port_std::set_tls_size::<System>(tls_size);

        let stack_size = 256 + (size_units % 6) as usize * 100;
        let (stack, reserved): (&'static ThreadStack<System, 1024, 16>, usize) = if user {
            (&USER_STACK, 64)
        } else {
            (&KERNEL_STACK, 16)
        };
        let attr = ThreadAttr {
            stack,
            stack_size,
            entry: nop,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        };

        strand_port_std::take_events::<System>();
        let sp = thread::setup(&T1, &attr).unwrap();
        let info = T1.stack_info().unwrap();
        log::trace!("{info:?} sp = {sp:#x}");

        let base = stack.as_ptr() as usize;
        assert_eq!(info.start, base + reserved);
        assert!(info.size >= stack_size);
        assert!(info.start + info.size <= base + 1024);
        assert!(info.start <= sp && sp <= info.start + info.size);
        assert_eq!(sp % 16, 0);
        assert_eq!(sp, info.initial_stack_ptr());
        assert!(info.delta >= tls_size);
        assert!(info.delta < tls_size + 100 + 16);
        assert_eq!(
            strand_port_std::events::<System>()[0],
            Event::Initialized {
                thread: ThreadId::of(&T1),
                stack_ptr: sp,
            }
        );

        thread::start(&T1).unwrap();
    }

    #[test]
    fn object_sizes() {
        assert_eq!(thread_stack_len::<System>(250), 256 + 64);
        assert_eq!(kernel_stack_len::<System>(250), 256 + 16);
        assert_eq!(kernel_stack_len::<System>(0), 16);
    }
}

mod poison {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static DUMMY: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();

    #[test]
    fn unused_space() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 512,
            entry: nop,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        };
        thread::create(&T1, &attr, Timeout::Forever).unwrap();
        let info = T1.stack_info().unwrap();

        // Everything but the sentinel is untouched
        assert_eq!(stack::stack_space_get(&T1), Ok(info.size - 4));
        let sentinel = unsafe { (info.start as *const u32).read_unaligned() };
        assert_eq!(sentinel, STACK_SENTINEL);

        // Simulate the thread using the top 100 bytes
        let top = (info.start + info.size - 100) as *mut u8;
        unsafe {
            assert_eq!(top.read(), STACK_POISON);
            std::ptr::write_bytes(top, 0, 100);
        }
        assert_eq!(stack::stack_space_get(&T1), Ok(info.size - 4 - 100));

        thread::init_dummy_thread(&DUMMY).unwrap();
        assert_eq!(
            stack::stack_space_get(&DUMMY),
            Err(StackSpaceError::NotSupported)
        );
    }
}

mod overflow {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();
    static CONTINUED: AtomicBool = AtomicBool::new(false);

    fn overflowing(_: usize, _: usize, _: usize) {
        // An intact sentinel passes
        stack::check_stack_sentinel::<System>().unwrap();

        let start = T1.stack_info().unwrap().start as *mut u32;
        unsafe { start.write_unaligned(0) };
        stack::check_stack_sentinel::<System>().unwrap();

        CONTINUED.store(true, Ordering::Relaxed);
    }

    #[test]
    fn corrupted_sentinel_aborts_the_thread() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 512,
            entry: overflowing,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        };
        thread::create(&T1, &attr, Timeout::NoWait).unwrap();

        assert!(!CONTINUED.load(Ordering::Relaxed));
        assert_eq!(T1.state().unwrap(), ThreadSt::Dead);

        let id = ThreadId::of(&T1);
        let events = strand_port_std::events::<System>();
        assert_eq!(
            events[events.len() - 4..],
            [
                Event::Ran(id),
                Event::Fatal {
                    reason: FatalReason::StackCheckFail,
                    thread: Some(id),
                },
                Event::Aborted(id),
                Event::Exited(id),
            ]
        );

        // The sentinel was restored
        let start = T1.stack_info().unwrap().start as *const u32;
        assert_eq!(unsafe { start.read_unaligned() }, STACK_SENTINEL);
    }
}

mod essential_overflow {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();

    fn overflowing(_: usize, _: usize, _: usize) {
        let start = T1.stack_info().unwrap().start as *mut u32;
        unsafe { start.write_unaligned(!STACK_SENTINEL) };
        let _ = stack::check_stack_sentinel::<System>();
    }

    #[test]
    #[should_panic(expected = "essential thread")]
    fn halts_the_system() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 512,
            entry: overflowing,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::ESSENTIAL,
            name: None,
        };
        let _ = thread::create(&T1, &attr, Timeout::NoWait);
    }
}

mod tiny {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 64> = ThreadStack::new();

    #[test]
    #[should_panic(expected = "can't hold the stack sentinel")]
    fn empty_stack_is_rejected() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 0,
            entry: nop,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        };
        let _ = thread::setup(&T1, &attr);
    }

    #[test]
    fn smallest_stack_holds_only_the_sentinel() {
        strand_port_std::init_logger();

        static T2: ThreadCb<System> = ThreadCb::new();
        static SMALL: ThreadStack<System, 8> = ThreadStack::new();
        let attr = ThreadAttr {
            stack: &SMALL,
            stack_size: 4,
            entry: nop,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        };
        thread::setup(&T2, &attr).unwrap();
        let info = T2.stack_info().unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(stack::stack_space_get(&T2), Ok(4));
    }
}
