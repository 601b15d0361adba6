//! The fake scheduler state
use std::time::Duration;
use strand_kernel::{PortThreading, ThreadCb};

pub(crate) struct Sched<Traits: PortThreading> {
    /// The thread whose entry function is executing.
    pub(crate) current: Option<&'static ThreadCb<Traits>>,
    /// The `sched_lock` nesting depth.
    pub(crate) sched_locked: usize,
    /// Threads started while the scheduler was locked.
    pub(crate) deferred: Vec<&'static ThreadCb<Traits>>,
    /// Pending delayed starts, in no particular order.
    timeouts: Vec<(Duration, &'static ThreadCb<Traits>)>,
    /// The simulated time.
    pub(crate) now: Duration,
}

impl<Traits: PortThreading> Sched<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            current: None,
            sched_locked: 0,
            deferred: Vec::new(),
            timeouts: Vec::new(),
            now: Duration::ZERO,
        }
    }

    pub(crate) fn add_timeout(&mut self, thread: &'static ThreadCb<Traits>, delay: Duration) {
        self.timeouts.push((self.now + delay, thread));
    }

    /// Advance the time and remove the timeouts that have elapsed, returning
    /// their threads in the order of their deadlines.
    pub(crate) fn advance(&mut self, duration: Duration) -> Vec<&'static ThreadCb<Traits>> {
        self.now += duration;
        let now = self.now;

        let mut expired: Vec<_> = self.timeouts.iter().copied().filter(|&(at, _)| at <= now).collect();
        self.timeouts.retain(|&(at, _)| at > now);
        expired.sort_by_key(|&(at, _)| at);
        expired.into_iter().map(|(_, thread)| thread).collect()
    }

    /// Remove every pending start of `thread`.
    pub(crate) fn forget(&mut self, thread: &'static ThreadCb<Traits>) {
        self.deferred.retain(|t| !std::ptr::eq(*t, thread));
        self.timeouts.retain(|(_, t)| !std::ptr::eq(*t, thread));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    crate::use_port!(unsafe struct System);
    strand_kernel::build!(System);

    static THREADS: [ThreadCb<System>; 4] = [ThreadCb::new(), ThreadCb::new(), ThreadCb::new(), ThreadCb::new()];

    #[quickcheck]
    fn timeouts_expire_in_deadline_order(delays: Vec<(u8, u8)>, step: u8) -> bool {
        let mut sched = Sched::<System>::new();
        for &(delay, i) in &delays {
            sched.add_timeout(&THREADS[i as usize % 4], Duration::from_millis(delay as u64));
        }

        let step = Duration::from_millis(step as u64);
        let expired = sched.advance(step);
        let num_expected = delays.iter().filter(|&&(d, _)| Duration::from_millis(d as u64) <= step).count();

        expired.len() == num_expected && sched.timeouts.len() == delays.len() - num_expected
    }

    #[test]
    fn forget_removes_all_pending_starts() {
        let mut sched = Sched::<System>::new();
        sched.add_timeout(&THREADS[0], Duration::from_millis(5));
        sched.add_timeout(&THREADS[1], Duration::from_millis(5));
        sched.deferred.push(&THREADS[0]);

        sched.forget(&THREADS[0]);

        assert!(sched.deferred.is_empty());
        let expired = sched.advance(Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert!(std::ptr::eq(expired[0], &THREADS[1]));
    }
}
