//! Deferred work: continuations that run immediately, at a time, or when an
//! external event happens.
//!
//! Task bodies run one at a time. A body refers to its job by id and looks it
//! up when it fires, so a job that has gone away is an ordinary outcome.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// External events a task can wait for.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TaskEvent {
    /// A child process with this pid exited.
    ChildExit(u32),
    /// The execution host reported that this job's processes ended.
    JobObit(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    /// Next scheduler pass.
    Immediate,
    At(Instant),
    Event(TaskEvent),
}

impl Trigger {
    pub fn after(delay: Duration) -> Self {
        Trigger::At(Instant::now() + delay)
    }

    fn is_due(&self, now: Instant) -> bool {
        match self {
            Trigger::Immediate => true,
            Trigger::At(at) => *at <= now,
            Trigger::Event(_) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskHandle(u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

pub type TaskBody = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    trigger: Trigger,
    job: Option<String>,
    label: &'static str,
    body: TaskBody,
}

pub struct TaskScheduler {
    tasks: Mutex<BTreeMap<TaskHandle, Task>>,
    next_id: AtomicU64,
    /// Held while a body runs.
    running: Mutex<()>,
    wake: Notify,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            running: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, BTreeMap<TaskHandle, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `body` to run on `trigger`. `job` ties the task to a job so
    /// it can be swept when the job is purged.
    pub fn schedule(
        &self,
        trigger: Trigger,
        job: Option<&str>,
        label: &'static str,
        body: TaskBody,
    ) -> TaskHandle {
        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(%handle, label, job_id = ?job, ?trigger, "scheduled");
        self.lock_tasks().insert(
            handle,
            Task {
                trigger,
                job: job.map(str::to_owned),
                label,
                body,
            },
        );
        self.wake.notify_one();
        handle
    }

    /// Drops a task. Returns false if it already ran or never existed.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.lock_tasks().remove(&handle).is_some()
    }

    /// Drops every task tied to `job_id`, returning how many there were.
    pub fn cancel_job(&self, job_id: &str) -> usize {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, t| t.job.as_deref() != Some(job_id));
        let n = before - tasks.len();
        if n > 0 {
            debug!(job_id, n, "cancelled job tasks");
        }
        n
    }

    /// Drops the tasks tied to `job_id` that carry `label`.
    pub fn cancel_labelled(&self, job_id: &str, label: &str) -> usize {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.job.as_deref() == Some(job_id) && t.label == label)
        });
        before - tasks.len()
    }

    pub fn pending_for_job(&self, job_id: &str) -> usize {
        self.lock_tasks()
            .values()
            .filter(|t| t.job.as_deref() == Some(job_id))
            .count()
    }

    pub fn pending_labelled(&self, job_id: &str, label: &str) -> usize {
        self.lock_tasks()
            .values()
            .filter(|t| t.job.as_deref() == Some(job_id) && t.label == label)
            .count()
    }

    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.lock_tasks().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every task waiting on `event` due. Returns how many there were.
    pub fn signal_event(&self, event: &TaskEvent) -> usize {
        let mut n = 0;
        for task in self.lock_tasks().values_mut() {
            if task.trigger == Trigger::Event(event.clone()) {
                task.trigger = Trigger::Immediate;
                n += 1;
            }
        }
        if n > 0 {
            self.wake.notify_one();
        }
        n
    }

    /// Runs every task due at `now`, oldest trigger first, returning how many
    /// ran. Bodies may schedule or cancel tasks.
    pub fn run_due(&self, now: Instant) -> usize {
        let mut due: Vec<(Option<Instant>, TaskHandle, Task)> = {
            let mut tasks = self.lock_tasks();
            let handles: Vec<_> = tasks
                .iter()
                .filter(|(_, t)| t.trigger.is_due(now))
                .map(|(h, _)| *h)
                .collect();
            handles
                .into_iter()
                .filter_map(|h| tasks.remove(&h).map(|t| (h, t)))
                .map(|(h, t)| {
                    let at = match t.trigger {
                        Trigger::At(at) => Some(at),
                        _ => None,
                    };
                    (at, h, t)
                })
                .collect()
        };
        // Immediate tasks (None) sort first.
        due.sort_by_key(|(at, h, _)| (*at, *h));

        let _running =
            self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let n = due.len();
        for (_, handle, task) in due {
            trace!(%handle, label = task.label, job_id = ?task.job, "running");
            (task.body)();
        }
        n
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock_tasks()
            .values()
            .filter_map(|t| match t.trigger {
                Trigger::At(at) => Some(at),
                _ => None,
            })
            .min()
    }

    /// Runs tasks as they fall due until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.run_due(Instant::now());

            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {},
                _ = sleep_until(deadline) => {},
            }
        }
        debug!(dropped = self.shutdown(), "task scheduler stopped");
    }

    /// Drops every pending task.
    pub fn shutdown(&self) -> usize {
        let mut tasks = self.lock_tasks();
        let n = tasks.len();
        tasks.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder() -> (Log, impl Fn(&'static str) -> TaskBody) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> TaskBody {
                let log = Arc::clone(&log);
                Box::new(move || log.lock().unwrap().push(name))
            }
        };
        (log, make)
    }

    #[test]
    fn triggers_fire_in_order() {
        let (log, task) = recorder();
        let s = TaskScheduler::new();
        let t0 = Instant::now();

        let at = |secs| Trigger::At(t0 + Duration::from_secs(secs));
        s.schedule(at(2), None, "t", task("late"));
        s.schedule(at(1), None, "t", task("early"));
        s.schedule(Trigger::Immediate, None, "t", task("now"));
        s.schedule(
            Trigger::Event(TaskEvent::ChildExit(7)),
            None,
            "t",
            task("child"),
        );

        assert_eq!(s.run_due(t0), 1);
        assert_eq!(s.run_due(t0 + Duration::from_secs(5)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["now", "early", "late"]);

        assert_eq!(s.signal_event(&TaskEvent::ChildExit(8)), 0);
        assert_eq!(s.signal_event(&TaskEvent::ChildExit(7)), 1);
        assert_eq!(s.run_due(t0), 1);
        assert_eq!(log.lock().unwrap().last(), Some(&"child"));
        assert!(s.is_empty());
    }

    #[test]
    fn cancel_is_a_no_op_for_gone_tasks() {
        let (log, task) = recorder();
        let s = TaskScheduler::new();

        let h = s.schedule(Trigger::Immediate, None, "t", task("a"));
        assert!(s.is_pending(h));
        s.run_due(Instant::now());
        assert!(!s.cancel(h));
        assert!(!s.cancel(TaskHandle(999)));

        let h = s.schedule(Trigger::Immediate, None, "t", task("b"));
        assert!(s.cancel(h));
        s.run_due(Instant::now());
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn job_sweep_removes_only_that_job() {
        let (_, task) = recorder();
        let s = TaskScheduler::new();
        let later = Trigger::after(Duration::from_secs(60));

        s.schedule(later.clone(), Some("1.head"), "route", task("x"));
        s.schedule(
            Trigger::Event(TaskEvent::JobObit("1.head".into())),
            Some("1.head"),
            "obit",
            task("y"),
        );
        s.schedule(later, Some("2.head"), "route", task("z"));

        assert_eq!(s.pending_for_job("1.head"), 2);
        assert_eq!(s.pending_labelled("1.head", "route"), 1);
        assert_eq!(s.cancel_job("1.head"), 2);
        assert_eq!(s.cancel_job("1.head"), 0);
        assert_eq!(s.pending_for_job("2.head"), 1);
    }

    #[test]
    fn bodies_can_reschedule() {
        let s = Arc::new(TaskScheduler::new());
        let count = Arc::new(AtomicU64::new(0));

        fn again(s: Arc<TaskScheduler>, count: Arc<AtomicU64>) -> TaskBody {
            Box::new(move || {
                if count.fetch_add(1, Ordering::Relaxed) < 2 {
                    let next = again(Arc::clone(&s), Arc::clone(&count));
                    s.schedule(Trigger::Immediate, None, "again", next);
                }
            })
        }

        s.schedule(
            Trigger::Immediate,
            None,
            "again",
            again(Arc::clone(&s), Arc::clone(&count)),
        );
        let now = Instant::now();
        while s.run_due(now) > 0 {}
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn run_loop_fires_timed_tasks() {
        let s = Arc::new(TaskScheduler::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let runner = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move { s.run(cancel).await })
        };

        s.schedule(
            Trigger::after(Duration::from_millis(20)),
            None,
            "t",
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        runner.await.unwrap();
    }
}
