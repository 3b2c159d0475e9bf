use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Task>,
    running: bool,
    /// `true` while a dequeued task is executing outside the lock, so
    /// `join`'s predicate reflects true idleness rather than just an empty
    /// queue.
    task_in_flight: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Single-threaded background executor for `close`/`unmap`/`truncate` tasks.
///
/// All tasks act on segment metadata guarded by the segment's own latch, so
/// running them on one thread sidesteps the need for a larger lock
/// discipline and keeps file-system operation ordering deterministic for a
/// given segment. The thread exits after sitting idle for `idle_timeout` and
/// is respawned by the next [`Worker::enqueue`].
pub struct Worker {
    inner: Arc<Inner>,
    idle_timeout: Duration,
}

impl Worker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    running: false,
                    task_in_flight: false,
                }),
                cond: Condvar::new(),
            }),
            idle_timeout,
        }
    }

    /// Enqueue `task` to run on the background thread. Spawns the thread if
    /// it is not currently running.
    ///
    /// Callers must synchronize calls to `enqueue` externally if ordering
    /// between enqueued tasks matters (mirrors the `mWorker` monitor of the
    /// originating design).
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(Box::new(task));
        if !state.running {
            state.running = true;
            drop(state);
            self.spawn();
        } else {
            self.inner.cond.notify_all();
        }
    }

    fn spawn(&self) {
        let inner = self.inner.clone();
        let idle_timeout = self.idle_timeout;
        thread::Builder::new()
            .name("termlog-worker".into())
            .spawn(move || Self::run(inner, idle_timeout))
            .expect("failed to spawn term log worker thread");
    }

    fn run(inner: Arc<Inner>, idle_timeout: Duration) {
        loop {
            let mut state = inner.state.lock().unwrap();
            if let Some(task) = state.queue.pop_front() {
                state.task_in_flight = true;
                drop(state);
                task();
                let mut state = inner.state.lock().unwrap();
                state.task_in_flight = false;
                inner.cond.notify_all();
                continue;
            }
            let (mut state, timeout) = inner.cond.wait_timeout(state, idle_timeout).unwrap();
            if state.queue.is_empty() && timeout.timed_out() {
                trace!("term log worker idle, exiting");
                state.running = false;
                inner.cond.notify_all();
                return;
            }
        }
    }

    /// Block until the task queue is empty and no dequeued task is still
    /// running.
    pub fn join(&self) {
        let state = self.inner.state.lock().unwrap();
        let _ = self.inner.cond.wait_while(state, |s| !s.queue.is_empty() || s.task_in_flight).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_enqueued_tasks_in_order() {
        let worker = Worker::new(Duration::from_millis(50));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            worker.enqueue(move || seen.lock().unwrap().push(i));
        }
        worker.join();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn respawns_after_idle_exit() {
        let worker = Worker::new(Duration::from_millis(20));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            worker.enqueue(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.join();
        // Let the worker thread time out and exit.
        thread::sleep(Duration::from_millis(80));

        {
            let count = count.clone();
            worker.enqueue(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.join();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn join_waits_for_in_flight_task_to_finish() {
        let worker = Worker::new(Duration::from_secs(5));
        let done = Arc::new(AtomicUsize::new(0));
        let done_in_task = done.clone();
        worker.enqueue(move || {
            thread::sleep(Duration::from_millis(100));
            done_in_task.store(1, Ordering::SeqCst);
        });
        worker.join();
        assert_eq!(
            done.load(Ordering::SeqCst),
            1,
            "join must not return while the dequeued task is still running"
        );
    }
}
