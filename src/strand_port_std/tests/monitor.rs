//! The thread registry
use quickcheck_macros::quickcheck;
use std::{collections::HashSet, ptr};
use strand_kernel::{
    monitor, thread, utils::Init, ForeachThreadError, ThreadAttr, ThreadCb, ThreadOptions,
    ThreadSt, ThreadStack, Timeout,
};

const NUM_THREADS: usize = 8;

fn nop(_: usize, _: usize, _: usize) {}

macro_rules! thread_pool {
    () => {
        static THREADS: [ThreadCb<System>; NUM_THREADS] = Init::INIT;
        static STACKS: [ThreadStack<System, 256>; NUM_THREADS] =
            [const { ThreadStack::new() }; NUM_THREADS];

        /// Set up `THREADS[i]` without starting it.
        fn spawn(i: usize) {
            let attr = ThreadAttr {
                stack: &STACKS[i],
                stack_size: 128,
                entry: nop,
                params: [0; 3],
                priority: 1,
                options: ThreadOptions::empty(),
                name: None,
            };
            thread::create(&THREADS[i], &attr, Timeout::Forever).unwrap();
        }

        /// Let `THREADS[i]` run to completion.
        fn kill(i: usize) {
            thread::start(&THREADS[i]).unwrap();
            assert_eq!(THREADS[i].state().unwrap(), ThreadSt::Dead);
        }

        fn index_of(t: &ThreadCb<System>) -> usize {
            THREADS
                .iter()
                .position(|x| ptr::eq(x, t))
                .expect("unknown thread in the registry")
        }
    };
}

mod consistency {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);
    thread_pool!();

    /// The registry holds exactly the live threads, newest first.
    #[quickcheck]
    fn registry_matches_live_threads(ops: Vec<u8>) {
        strand_port_std::init_logger();

        // Newest first
        let mut model: Vec<usize> = Vec::new();
        let check = |model: &[usize]| {
            let snapshot = monitor::snapshot::<System, NUM_THREADS>().unwrap();
            let actual: Vec<usize> = snapshot.iter().map(|t| index_of(t)).collect();
            assert_eq!(actual, model);
        };

        for op in ops {
            let i = op as usize % NUM_THREADS;
            if let Some(pos) = model.iter().position(|&x| x == i) {
                log::trace!("kill {i}");
                kill(i);
                model.remove(pos);
            } else {
                log::trace!("spawn {i}");
                spawn(i);
                model.insert(0, i);
            }
            check(&model);
        }

        for i in model.drain(..) {
            kill(i);
        }
        check(&model);
    }
}

mod unlocked_walk {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);
    thread_pool!();

    const NUM_INITIAL: usize = 6;

    /// A walk with the lock released visits each thread at most once, never
    /// visits a thread after it was removed, never visits a thread inserted
    /// during the walk, and visits every thread that stayed in the registry
    /// throughout.
    #[quickcheck]
    fn visits_each_surviving_thread_once(num_initial: u8, kills: Vec<Option<u8>>, spawns: Vec<bool>) {
        strand_port_std::init_logger();

        let num_initial = 1 + num_initial as usize % NUM_INITIAL;
        for i in 0..num_initial {
            spawn(i);
        }

        let mut visited = Vec::new();
        let mut killed = HashSet::new();
        let mut spawned = Vec::new();
        let mut step = 0;

        monitor::foreach_unlocked::<System>(|t| {
            let i = index_of(t);
            assert_ne!(t.state().unwrap(), ThreadSt::Dead, "visited a dead thread");
            visited.push(i);

            if let Some(Some(k)) = kills.get(step) {
                let k = *k as usize % num_initial;
                if killed.insert(k) {
                    kill(k);
                }
            }

            let next_spare = NUM_INITIAL + spawned.len();
            if spawns.get(step) == Some(&true) && next_spare < NUM_THREADS {
                spawn(next_spare);
                spawned.push(next_spare);
            }

            step += 1;
        })
        .unwrap();

        log::trace!("visited = {visited:?}, killed = {killed:?}, spawned = {spawned:?}");

        let unique: HashSet<_> = visited.iter().copied().collect();
        assert_eq!(unique.len(), visited.len(), "a thread was visited twice");
        assert!(visited.iter().all(|i| *i < num_initial));
        for i in 0..num_initial {
            if !killed.contains(&i) {
                assert!(unique.contains(&i), "thread {i} was skipped");
            }
        }

        for i in (0..num_initial).filter(|i| !killed.contains(i)).chain(spawned) {
            kill(i);
        }
        assert!(monitor::snapshot::<System, NUM_THREADS>().unwrap().is_empty());
    }
}

mod locked_walk {
    use super::*;

    strand_port_std::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    #[test]
    fn forbids_reentry() {
        strand_port_std::init_logger();

        static T: ThreadCb<System> = ThreadCb::new();
        static STACK: ThreadStack<System, 256> = ThreadStack::new();
        let attr = ThreadAttr {
            stack: &STACK,
            stack_size: 128,
            entry: nop,
            params: [0; 3],
            priority: 1,
            options: ThreadOptions::empty(),
            name: None,
        };
        thread::create(&T, &attr, Timeout::Forever).unwrap();

        let mut found = false;
        monitor::foreach::<System>(|t| {
            found |= ptr::eq(t, &T);
            assert!(t.state().is_err());
            assert_eq!(
                monitor::foreach::<System>(|_| {}),
                Err(ForeachThreadError::BadContext)
            );
        })
        .unwrap();
        assert!(found);

        thread::start(&T).unwrap();
    }
}
