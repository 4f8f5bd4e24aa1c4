//! Cooperative idle-task scheduler.
//!
//! The embedding host drives everything — engine polls, event dispatch,
//! handler invocations — through this single-threaded queue. Tasks run one
//! at a time in FIFO order; a continuous activity (like a server's poll
//! chain) re-arms itself by scheduling a fresh task from inside the running
//! one. The next unit of work only runs after the current one returns, so
//! there is never parallelism between poll ticks and handler execution.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

/// A one-shot idle task. Receives the scheduler so it can re-arm itself.
pub type IdleTask = Box<dyn FnOnce(&mut IdleScheduler)>;

/// A single-threaded FIFO queue of idle tasks.
///
/// # Examples
///
/// ```
/// use embhttp::IdleScheduler;
///
/// let mut scheduler = IdleScheduler::new();
/// scheduler.schedule(|_| println!("one turn"));
/// assert!(scheduler.run_once());
/// assert!(!scheduler.run_once()); // queue drained
/// ```
#[derive(Default)]
pub struct IdleScheduler {
    queue: VecDeque<IdleTask>,
}

impl IdleScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task for the next idle turn.
    pub fn schedule(&mut self, task: impl FnOnce(&mut IdleScheduler) + 'static) {
        self.queue.push_back(Box::new(task));
    }

    /// Runs one queued task. Returns `false` if the queue was empty.
    pub fn run_once(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(task) => {
                task(self);
                true
            }
            None => false,
        }
    }

    /// Drives the queue until `duration` has elapsed. Sleeps briefly while
    /// the queue is empty so an idle host does not spin.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if !self.run_once() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn empty_queue_reports_idle() {
        let mut s = IdleScheduler::new();
        assert!(!s.run_once());
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn tasks_run_in_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut s = IdleScheduler::new();
        for i in 0..3 {
            let order = Rc::clone(&order);
            s.schedule(move |_| order.borrow_mut().push(i));
        }
        while s.run_once() {}
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn task_can_rearm_itself() {
        fn arm(counter: Rc<RefCell<u32>>, s: &mut IdleScheduler) {
            s.schedule(move |s| {
                *counter.borrow_mut() += 1;
                if *counter.borrow() < 5 {
                    arm(counter, s);
                }
            });
        }

        let counter = Rc::new(RefCell::new(0));
        let mut s = IdleScheduler::new();
        arm(Rc::clone(&counter), &mut s);

        while s.run_once() {}
        assert_eq!(*counter.borrow(), 5);
    }

    #[test]
    fn run_for_returns_after_deadline() {
        let mut s = IdleScheduler::new();
        let start = Instant::now();
        s.run_for(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
