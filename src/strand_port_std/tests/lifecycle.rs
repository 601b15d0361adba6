//! Creating, starting, and retiring threads
use std::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use strand_kernel::{
    monitor,
    thread::{self, ResourcePool, ThreadName},
    BadContextError, CpuMaskError, CreateThreadError, CustomDataError, GetThreadNameError,
    ThreadAttr, ThreadCb, ThreadOptions, ThreadSt, ThreadStack, Timeout,
};
use strand_port_std::{Event, ThreadId};

fn nop(_: usize, _: usize, _: usize) {}

mod no_wait {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK1: ThreadStack<System, 1024> = ThreadStack::new();
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn entry(a: usize, b: usize, c: usize) {
        assert_eq!((a, b, c), (1, 2, 3));
        let me = thread::current::<System>().unwrap();
        assert!(ptr::eq(me, &T1));
        assert_eq!(T1.state().unwrap(), ThreadSt::Queued);
        assert_eq!(monitor::snapshot::<System, 4>().unwrap().len(), 1);
        RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn runs_to_completion_and_leaves_the_registry() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK1,
            stack_size: 512,
            entry,
            params: [1, 2, 3],
            priority: 5,
            options: ThreadOptions::empty(),
            name: Some("worker"),
        };
        let t = thread::create(&T1, &attr, Timeout::NoWait).unwrap();
        assert!(ptr::eq(t, &T1));

        assert_eq!(RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(T1.state().unwrap(), ThreadSt::Dead);
        assert!(monitor::snapshot::<System, 4>().unwrap().is_empty());

        let id = ThreadId::of(&T1);
        let events = strand_port_std::events::<System>();
        assert!(
            matches!(events[0], Event::Initialized { thread, .. } if thread == id),
            "{events:?}"
        );
        assert_eq!(
            events[1..],
            [Event::Started(id), Event::Ran(id), Event::Exited(id)]
        );

        // The storage can be reused once the thread is dead
        thread::create(&T1, &attr, Timeout::NoWait).unwrap();
        assert_eq!(RUNS.load(Ordering::Relaxed), 2);
    }
}

mod delayed {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static T2: ThreadCb<System> = ThreadCb::new();
    static STACK1: ThreadStack<System, 512> = ThreadStack::new();
    static STACK2: ThreadStack<System, 512> = ThreadStack::new();

    fn attr(stack: &'static ThreadStack<System, 512>) -> ThreadAttr<'static, System> {
        ThreadAttr {
            stack,
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority: 3,
            options: ThreadOptions::empty(),
            name: None,
        }
    }

    #[test]
    fn starts_after_timeout_or_on_request() {
        strand_port_std::init_logger();
        let (id1, id2) = (ThreadId::of(&T1), ThreadId::of(&T2));

        thread::create(&T1, &attr(&STACK1), Timeout::from_millis(50)).unwrap();
        thread::create(&T2, &attr(&STACK2), Timeout::Forever).unwrap();
        assert_eq!(T1.state().unwrap(), ThreadSt::Prestart);
        assert_eq!(T2.state().unwrap(), ThreadSt::Prestart);

        let events = strand_port_std::take_events::<System>();
        assert!(events.contains(&Event::TimeoutAdded {
            thread: id1,
            delay: Duration::from_millis(50),
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::TimeoutAdded { thread, .. } if *thread == id2)));

        strand_port_std::advance::<System>(Duration::from_millis(49));
        assert_eq!(T1.state().unwrap(), ThreadSt::Prestart);

        strand_port_std::advance::<System>(Duration::from_millis(1));
        assert_eq!(T1.state().unwrap(), ThreadSt::Dead);
        assert_eq!(
            strand_port_std::take_events::<System>(),
            [Event::Started(id1), Event::Ran(id1), Event::Exited(id1)]
        );

        // `Forever` waits for an explicit start
        strand_port_std::advance::<System>(Duration::from_secs(10));
        assert_eq!(T2.state().unwrap(), ThreadSt::Prestart);
        thread::start(&T2).unwrap();
        assert_eq!(T2.state().unwrap(), ThreadSt::Dead);

        // Starting a thread that isn't in the Prestart state does nothing
        strand_port_std::take_events::<System>();
        thread::start(&T2).unwrap();
        assert!(strand_port_std::events::<System>().is_empty());
    }
}

mod invalid {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System, coop_priorities: 2, preempt_priorities: 8);

    static T1: ThreadCb<System> = ThreadCb::new();
    static T2: ThreadCb<System> = ThreadCb::new();
    static T3: ThreadCb<System> = ThreadCb::new();
    static T4: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();
    static STACK2: ThreadStack<System, 512> = ThreadStack::new();
    static STACK3: ThreadStack<System, 512> = ThreadStack::new();
    static KSTACK: ThreadStack<System, 512> = ThreadStack::new_kernel();

    fn attr(priority: i32, options: ThreadOptions) -> ThreadAttr<'static, System> {
        ThreadAttr {
            stack: &STACK,
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority,
            options,
            name: None,
        }
    }

    #[test]
    fn priority_range() {
        use strand_kernel::thread::is_valid_prio;
        let none = ThreadOptions::empty();
        assert!(is_valid_prio::<System>(-2, none));
        assert!(!is_valid_prio::<System>(-3, none));
        assert!(is_valid_prio::<System>(7, none));
        assert!(!is_valid_prio::<System>(8, none));
        assert!(is_valid_prio::<System>(8, ThreadOptions::ESSENTIAL));
        assert!(!is_valid_prio::<System>(
            8,
            ThreadOptions::ESSENTIAL | ThreadOptions::USER
        ));
    }

    #[test]
    #[should_panic(expected = "invalid priority")]
    fn idle_priority_for_ordinary_thread() {
        let _ = thread::setup(&T1, &attr(8, ThreadOptions::empty()));
    }

    #[test]
    #[should_panic(expected = "invalid priority")]
    fn out_of_range_priority() {
        let _ = thread::setup(&T1, &attr(-3, ThreadOptions::empty()));
    }

    #[test]
    fn idle_priority_for_essential_thread() {
        let mut attr = attr(8, ThreadOptions::ESSENTIAL);
        attr.stack = &STACK2;
        thread::setup(&T2, &attr).unwrap();
        assert_eq!(T2.priority().unwrap(), 8);
        assert_eq!(T2.state().unwrap(), ThreadSt::Prestart);
    }

    #[test]
    #[should_panic(expected = "still live")]
    fn setting_up_a_live_thread() {
        let mut attr = attr(0, ThreadOptions::empty());
        attr.stack = &STACK3;
        thread::setup(&T3, &attr).unwrap();
        let _ = thread::setup(&T3, &attr);
    }

    #[test]
    #[should_panic(expected = "user-capable")]
    fn user_thread_on_kernel_stack() {
        let mut attr = attr(0, ThreadOptions::USER);
        attr.stack = &KSTACK;
        let _ = thread::setup(&T4, &attr);
    }
}

mod context {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();

    fn attr() -> ThreadAttr<'static, System> {
        ThreadAttr {
            stack: &STACK,
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority: 0,
            options: ThreadOptions::empty(),
            name: None,
        }
    }

    #[test]
    fn rejected_in_interrupt_or_under_lock() {
        strand_port_std::init_logger();

        let result = strand_port_std::simulate_interrupt::<System, _>(|| {
            thread::create(&T1, &attr(), Timeout::NoWait)
        });
        assert_eq!(result.unwrap_err(), CreateThreadError::BadContext);

        let lock = strand_kernel::lock_kernel::<System>().unwrap();
        assert_eq!(
            thread::create(&T1, &attr(), Timeout::NoWait).unwrap_err(),
            CreateThreadError::BadContext
        );
        assert_eq!(T1.state(), Err(BadContextError::BadContext));
        drop(lock);

        // Neither attempt touched the thread
        assert_eq!(T1.state().unwrap(), ThreadSt::Dead);
        assert!(strand_port_std::events::<System>().is_empty());
    }
}

mod attributes {
    use super::*;

    strand_port_std::use_port!(unsafe struct System {
        const NUM_CPUS: usize = 2;
    });
    strand_kernel::build!(System);

    static NAMED: ThreadCb<System> = ThreadCb::new();
    static MASKED: ThreadCb<System> = ThreadCb::new();
    static STACKS: [ThreadStack<System, 512>; 2] = [const { ThreadStack::new() }; 2];

    fn attr(i: usize, name: Option<&str>) -> ThreadAttr<'_, System> {
        ThreadAttr {
            stack: &STACKS[i],
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority: 4,
            options: ThreadOptions::empty(),
            name,
        }
    }

    #[test]
    fn names() {
        let long = "a-thread-name-that-does-not-fit-in-the-buffer";
        thread::create(&NAMED, &attr(0, Some(long)), Timeout::Forever).unwrap();
        let name = thread::name(&NAMED).unwrap();
        assert_eq!(name.as_str(), &long[..31]);

        let mut buf = [0xffu8; 8];
        assert_eq!(
            thread::copy_name(&NAMED, &mut buf),
            Err(GetThreadNameError::BadParam)
        );

        thread::set_name(Some(&NAMED), "short").unwrap();
        assert_eq!(thread::copy_name(&NAMED, &mut buf), Ok(5));
        assert_eq!(&buf[..6], b"short\0");
        assert_eq!(thread::name(&NAMED).unwrap(), ThreadName::new(Some("short")));
    }

    #[test]
    fn cpu_mask() {
        thread::create(&MASKED, &attr(1, None), Timeout::Forever).unwrap();
        assert_eq!(MASKED.cpu_mask().unwrap(), thread::CPU_MASK_ALL);

        thread::cpu_mask_clear(&MASKED).unwrap();
        assert_eq!(MASKED.cpu_mask().unwrap(), 0);
        thread::cpu_mask_enable(&MASKED, 1).unwrap();
        assert_eq!(MASKED.cpu_mask().unwrap(), 0b10);
        thread::cpu_mask_disable(&MASKED, 1).unwrap();
        thread::cpu_mask_enable(&MASKED, 0).unwrap();
        assert_eq!(MASKED.cpu_mask().unwrap(), 0b01);
        assert_eq!(
            thread::cpu_mask_enable(&MASKED, 2),
            Err(CpuMaskError::BadParam)
        );

        thread::start(&MASKED).unwrap();
        assert_eq!(
            thread::cpu_mask_enable_all(&MASKED),
            Err(CpuMaskError::BadObjectState)
        );
    }
}

mod custom_data {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 512> = ThreadStack::new();

    #[test]
    fn private_slot_and_essential_flag() {
        assert_eq!(
            thread::custom_data_get::<System>(),
            Err(CustomDataError::BadContext)
        );

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority: 4,
            options: ThreadOptions::empty(),
            name: None,
        };
        thread::create(&T1, &attr, Timeout::Forever).unwrap();
        strand_port_std::with_current(&T1, || {
            assert_eq!(thread::custom_data_get::<System>(), Ok(0));
            thread::custom_data_set::<System>(0x1234).unwrap();
            assert_eq!(thread::custom_data_get::<System>(), Ok(0x1234));

            assert_eq!(thread::is_essential::<System>(), Ok(false));
            thread::essential_set::<System>().unwrap();
            assert_eq!(thread::is_essential::<System>(), Ok(true));
            thread::essential_clear::<System>().unwrap();
            assert_eq!(thread::is_essential::<System>(), Ok(false));
        });
    }
}

mod inheritance {
    use super::*;
    use strand_kernel::mem_domain;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static PARENT: ThreadCb<System> = ThreadCb::new();
    static CHILD: ThreadCb<System> = ThreadCb::new();
    static STACKS: [ThreadStack<System, 512>; 2] = [const { ThreadStack::new() }; 2];
    static POOL: ResourcePool = ResourcePool::new("net");

    fn attr(i: usize) -> ThreadAttr<'static, System> {
        ThreadAttr {
            stack: &STACKS[i],
            stack_size: 256,
            entry: nop,
            params: [0; 3],
            priority: 4,
            options: ThreadOptions::empty(),
            name: None,
        }
    }

    #[test]
    fn creator_pool_and_domain() {
        thread::create(&PARENT, &attr(0), Timeout::Forever).unwrap();
        assert!(PARENT.resource_pool().unwrap().is_none());
        thread::resource_pool_assign(&PARENT, &POOL).unwrap();

        strand_port_std::with_current(&PARENT, || {
            thread::create(&CHILD, &attr(1), Timeout::Forever).unwrap();
        });
        let pool = CHILD.resource_pool().unwrap().unwrap();
        assert!(ptr::eq(pool, &POOL));
        assert_eq!(pool.name(), "net");

        // `PARENT` had no creator, so it's in the default domain
        let default = mem_domain::default_domain::<System>();
        let parent_domain = mem_domain::thread_mem_domain(&PARENT).unwrap().unwrap();
        let child_domain = mem_domain::thread_mem_domain(&CHILD).unwrap().unwrap();
        assert!(ptr::eq(parent_domain, default));
        assert!(ptr::eq(child_domain, default));
        assert_eq!(default.num_threads().unwrap(), 2);

        thread::start(&CHILD).unwrap();
        assert_eq!(default.num_threads().unwrap(), 1);
        assert!(mem_domain::thread_mem_domain(&CHILD).unwrap().is_none());
    }
}

mod bootstrap {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static DUMMY: ThreadCb<System> = ThreadCb::new();
    static T1: ThreadCb<System> = ThreadCb::new();
    static STACK: ThreadStack<System, 1024> = ThreadStack::new();
    static USER_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn kernel_entry(_: usize, _: usize, _: usize) {
        assert_eq!(thread::is_essential::<System>(), Ok(true));
        thread::user_mode_enter::<System>(user_entry, [4, 5, 6]);
    }

    fn user_entry(a: usize, b: usize, c: usize) {
        assert_eq!([a, b, c], [4, 5, 6]);
        let options = T1.options().unwrap();
        assert!(options.contains(ThreadOptions::USER));
        assert!(!options.contains(ThreadOptions::ESSENTIAL));

        let record = T1.entry().unwrap().unwrap();
        assert_eq!(record.params, [4, 5, 6]);
        USER_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn dummy_thread() {
        thread::init_dummy_thread(&DUMMY).unwrap();
        assert_eq!(DUMMY.state().unwrap(), ThreadSt::Dummy);
        assert!(DUMMY.options().unwrap().contains(ThreadOptions::ESSENTIAL));
        assert_eq!(DUMMY.stack_info().unwrap(), Default::default());
        assert!(DUMMY.init_data().unwrap().is_none());
    }

    #[test]
    fn drop_to_user_mode() {
        strand_port_std::init_logger();

        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 512,
            entry: kernel_entry,
            params: [0; 3],
            priority: 2,
            options: ThreadOptions::ESSENTIAL,
            name: Some("init"),
        };
        let sp = thread::setup(&T1, &attr).unwrap();
        assert_eq!(T1.stack_info().unwrap().initial_stack_ptr(), sp);
        thread::start(&T1).unwrap();

        assert_eq!(USER_RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(T1.state().unwrap(), ThreadSt::Dead);

        let id = ThreadId::of(&T1);
        let events: Vec<_> = strand_port_std::events::<System>()
            .into_iter()
            .filter(|e| !matches!(e, Event::Initialized { .. } | Event::Started(_)))
            .collect();
        assert_eq!(
            events,
            [
                Event::Ran(id),
                Event::UserModeEntered {
                    thread: Some(id),
                    stack_ptr: sp,
                },
                Event::Exited(id),
            ]
        );
    }
}
