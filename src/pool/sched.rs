//! a minimal scheduler for tasks run in the future.
//!
//! designed for multi-worker usage ground up: tasks can be scheduled in front
//! of the one currently waiting and the run loop can sit idle with nothing
//! scheduled. scheduled actions are expected to be cheap trampolines that
//! re-enqueue real work onto the worker queue, so the scheduler is never
//! blocked by user code.

use core::{cmp::Ordering as CmpOrdering, time::Duration};

use std::{
    collections::BinaryHeap,
    sync::{Condvar, Mutex},
    time::Instant,
};

use tracing::warn;

pub(crate) type Action = Box<dyn FnOnce() + Send>;

struct Task {
    time: Instant,
    seq: u64,
    /// `None` stops the run loop.
    action: Option<Action>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest task comes first
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedState {
    queue: BinaryHeap<Task>,
    seq: u64,
}

pub(crate) struct Scheduler {
    state: Mutex<SchedState>,
    event: Condvar,
}

impl Scheduler {
    const EMPTY_QUEUE_TIMEOUT: Duration = Duration::from_secs(600);

    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SchedState {
                queue: BinaryHeap::new(),
                seq: 0,
            }),
            event: Condvar::new(),
        }
    }

    /// schedule an action `delay` in the future. a `None` action stops the
    /// run loop.
    pub(crate) fn enter(&self, delay: Duration, action: Option<Action>) {
        self.enterabs(Instant::now() + delay, action)
    }

    pub(crate) fn enterabs(&self, time: Instant, action: Option<Action>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.seq += 1;
        let seq = state.seq;
        state.queue.push(Task { time, seq, action });
        let first = state.queue.peek().map(|t| t.seq) == Some(seq);
        drop(state);
        if first {
            self.event.notify_one();
        }
    }

    /// execute the scheduled actions. runs on its own thread until a `None`
    /// action is scheduled.
    pub(crate) fn run(&self) {
        loop {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let due = match state.queue.peek() {
                Some(task) if task.time <= now => state.queue.pop(),
                Some(task) => {
                    let delay = task.time - now;
                    let (guard, _) = self
                        .event
                        .wait_timeout(state, delay)
                        .unwrap_or_else(|e| e.into_inner());
                    drop(guard);
                    continue;
                }
                None => {
                    let (guard, _) = self
                        .event
                        .wait_timeout(state, Self::EMPTY_QUEUE_TIMEOUT)
                        .unwrap_or_else(|e| e.into_inner());
                    drop(guard);
                    continue;
                }
            };
            drop(state);

            match due.and_then(|t| t.action) {
                None => break,
                Some(action) => {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                        warn!("scheduled task run failed");
                    }
                }
            }
        }
    }
}

/// the cooperative flavour, driven as a task on the runtime.
pub(crate) struct AsyncScheduler {
    state: Mutex<SchedState>,
    event: tokio::sync::Notify,
}

impl AsyncScheduler {
    const EMPTY_QUEUE_TIMEOUT: Duration = Duration::from_secs(600);

    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SchedState {
                queue: BinaryHeap::new(),
                seq: 0,
            }),
            event: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn enter(&self, delay: Duration, action: Option<Action>) {
        self.enterabs(Instant::now() + delay, action)
    }

    pub(crate) fn enterabs(&self, time: Instant, action: Option<Action>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.seq += 1;
        let seq = state.seq;
        state.queue.push(Task { time, seq, action });
        let first = state.queue.peek().map(|t| t.seq) == Some(seq);
        drop(state);
        if first {
            self.event.notify_one();
        }
    }

    pub(crate) async fn run(&self) {
        loop {
            let (due, delay) = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                match state.queue.peek() {
                    Some(task) if task.time <= now => (state.queue.pop(), Duration::ZERO),
                    Some(task) => (None, task.time - now),
                    None => (None, Self::EMPTY_QUEUE_TIMEOUT),
                }
            };

            match due {
                Some(task) => match task.action {
                    None => break,
                    Some(action) => {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                            warn!("scheduled task run failed");
                        }
                    }
                },
                None => {
                    let _ = tokio::time::timeout(delay, self.event.notified()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn runs_tasks_in_time_order() {
        let sched = Arc::new(Scheduler::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let runner = {
            let sched = sched.clone();
            std::thread::spawn(move || sched.run())
        };

        let push = |tag: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = order.clone();
            Box::new(move || order.lock().unwrap().push(tag)) as Action
        };

        sched.enter(Duration::from_millis(60), Some(push("second", &order)));
        sched.enter(Duration::from_millis(20), Some(push("first", &order)));
        sched.enter(Duration::from_millis(120), None);

        runner.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn none_action_stops_the_loop() {
        let sched = Arc::new(Scheduler::new());
        let runner = {
            let sched = sched.clone();
            std::thread::spawn(move || sched.run())
        };
        sched.enter(Duration::ZERO, None);
        runner.join().unwrap();
    }

    #[tokio::test]
    async fn async_scheduler_runs_tasks() {
        let sched = Arc::new(AsyncScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));

        let handle = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.run().await })
        };

        let c = count.clone();
        sched.enter(
            Duration::from_millis(10),
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        sched.enter(Duration::from_millis(50), None);

        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
