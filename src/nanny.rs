//! The delete nanny: keeps signalling a running job that is being deleted
//! until it is gone.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{self, JobStore};
use crate::task::{TaskHandle, TaskScheduler, Trigger};
use crate::types::job::{Job, SvrFlags};
use crate::types::states::JobState;

pub const SIGTERM: &str = "SIGTERM";
pub const SIGKILL: &str = "SIGKILL";

const LABEL: &str = "nanny";

/// Delivers a signal to a job on its execution host. Delivery is
/// fire-and-forget; the nanny only trusts the job disappearing.
pub trait JobSignaller: Send + Sync + 'static {
    fn signal(&self, job_id: &str, exec_host: &str, signal: &str);
}

pub struct DeleteNanny {
    me: Weak<DeleteNanny>,
    store: Arc<JobStore>,
    tasks: Arc<TaskScheduler>,
    signaller: Arc<dyn JobSignaller>,
    delay: Duration,
    enabled: AtomicBool,
    generation: AtomicU64,
    active: Mutex<HashMap<String, Armed>>,
}

/// The pending nanny task for one job. A task whose generation no longer
/// matches was replaced by a later install and does nothing when it runs.
#[derive(Clone, Copy, Debug)]
struct Armed {
    generation: u64,
    handle: TaskHandle,
}

impl DeleteNanny {
    pub fn new(
        store: Arc<JobStore>,
        tasks: Arc<TaskScheduler>,
        signaller: Arc<dyn JobSignaller>,
        delay: Duration,
        enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            tasks,
            signaller,
            delay,
            enabled: AtomicBool::new(enabled),
            generation: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Armed>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts terminating `job`, which the caller has locked. Any nanny
    /// already watching the job is replaced.
    pub fn install(&self, job: &mut Job) {
        self.cancel(&job.id);

        job.svrflags.insert(SvrFlags::DELETE_PENDING);
        match job.exec_host.as_deref() {
            Some(host) => self.signaller.signal(&job.id, host, SIGTERM),
            None => {
                warn!(job_id = %job.id, "deleting a job with no execution host")
            },
        }

        if !self.enabled.load(Ordering::Relaxed) {
            debug!(job_id = %job.id, "nanny disabled, not rescheduling");
            return;
        }
        self.arm(&job.id);
    }

    fn arm(&self, job_id: &str) {
        let me = self.me.clone();
        let id = job_id.to_owned();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        // Held across scheduling so the task cannot run before it is recorded.
        let mut active = self.lock_active();
        let handle = self.tasks.schedule(
            Trigger::after(self.delay),
            Some(job_id),
            LABEL,
            Box::new(move || {
                if let Some(nanny) = me.upgrade() {
                    nanny.fire(&id, generation);
                }
            }),
        );
        active.insert(job_id.to_owned(), Armed { generation, handle });
    }

    fn fire(&self, job_id: &str, generation: u64) {
        {
            let mut active = self.lock_active();
            match active.get(job_id) {
                Some(armed) if armed.generation == generation => {
                    active.remove(job_id);
                },
                _ => {
                    debug!(job_id, generation, "nanny replaced, skipping");
                    return;
                },
            }
        }

        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(job) = self.store.get(job_id) else {
            debug!(job_id, "job gone, nanny done");
            return;
        };
        let host = {
            let job = store::lock(&job);
            if job.state == JobState::Complete {
                return;
            }
            job.exec_host.clone()
        };

        info!(job_id, "job still present after delete, escalating");
        if let Some(host) = host {
            self.signaller.signal(job_id, &host, SIGKILL);
        }
        self.arm(job_id);
    }

    /// Stops watching `job_id`.
    pub fn cancel(&self, job_id: &str) -> bool {
        let armed = self.lock_active().remove(job_id);
        match armed {
            Some(armed) => {
                self.tasks.cancel(armed.handle);
                true
            },
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.lock_active().contains_key(job_id)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use tokio::time::Instant;

    use crate::testutil::TestDir;
    use crate::types::states::Phase;

    #[derive(Default)]
    pub(crate) struct RecordingSignaller {
        pub(crate) sent: Mutex<Vec<(String, String)>>,
    }

    impl JobSignaller for RecordingSignaller {
        fn signal(&self, job_id: &str, _exec_host: &str, signal: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((job_id.to_owned(), signal.to_owned()));
        }
    }

    fn running(id: &str) -> Job {
        let mut job = Job::new(id);
        job.set_phase(Phase::TRANS_ICM).unwrap();
        job.set_phase(Phase::QUEUED).unwrap();
        job.set_phase(Phase::PRERUN).unwrap();
        job.set_phase(Phase::RUNNING).unwrap();
        job.exec_host = Some("node1:15002".into());
        job
    }

    struct Fixture {
        _dir: TestDir,
        store: Arc<JobStore>,
        tasks: Arc<TaskScheduler>,
        signals: Arc<RecordingSignaller>,
        nanny: Arc<DeleteNanny>,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = TestDir::new(name);
        let store = Arc::new(JobStore::open(dir.path(), 1).unwrap());
        let tasks = Arc::new(TaskScheduler::new());
        let signals = Arc::new(RecordingSignaller::default());
        let nanny = DeleteNanny::new(
            Arc::clone(&store),
            Arc::clone(&tasks),
            signals.clone(),
            Duration::from_secs(30),
            true,
        );
        Fixture {
            _dir: dir,
            store,
            tasks,
            signals,
            nanny,
        }
    }

    fn signals(f: &Fixture) -> Vec<String> {
        f.signals.sent.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }

    #[test]
    fn escalates_and_reschedules_until_gone() {
        let f = fixture("nanny_escalate");
        let job = f.store.insert(running("1.head")).unwrap();

        f.nanny.install(&mut store::lock(&job));
        assert_eq!(signals(&f), vec![SIGTERM]);
        assert!(store::lock(&job).svrflags.contains(SvrFlags::DELETE_PENDING));
        assert_eq!(f.tasks.pending_labelled("1.head", LABEL), 1);

        // Nothing happens before the delay.
        assert_eq!(f.tasks.run_due(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(f.tasks.run_due(later), 1);
        assert_eq!(signals(&f), vec![SIGTERM, SIGKILL]);
        assert_eq!(f.tasks.pending_labelled("1.head", LABEL), 1);
        assert!(f.nanny.is_active("1.head"));

        // Once the job is gone the nanny stops.
        f.store.remove("1.head");
        let much_later = later + Duration::from_secs(31);
        assert_eq!(f.tasks.run_due(much_later), 1);
        assert_eq!(signals(&f).len(), 2);
        assert_eq!(f.tasks.pending_for_job("1.head"), 0);
        assert!(!f.nanny.is_active("1.head"));
    }

    #[test]
    fn at_most_one_nanny_per_job() {
        let f = fixture("nanny_single");
        let job = f.store.insert(running("2.head")).unwrap();

        for _ in 0..4 {
            f.nanny.install(&mut store::lock(&job));
        }
        assert_eq!(f.tasks.pending_labelled("2.head", LABEL), 1);
        assert_eq!(signals(&f), vec![SIGTERM; 4]);

        assert!(f.nanny.cancel("2.head"));
        assert!(!f.nanny.cancel("2.head"));
        assert_eq!(f.tasks.pending_for_job("2.head"), 0);
    }

    #[test]
    fn reinstall_while_the_old_nanny_is_due_leaves_one() {
        let f = fixture("nanny_reinstall_due");
        let job = f.store.insert(running("5.head")).unwrap();
        f.nanny.install(&mut store::lock(&job));

        // Runs first in the same pass, after the old nanny task was taken
        // out of the table but before its body runs.
        let nanny = Arc::clone(&f.nanny);
        let again = Arc::clone(&job);
        f.tasks.schedule(
            Trigger::Immediate,
            None,
            "delete",
            Box::new(move || nanny.install(&mut store::lock(&again))),
        );

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(f.tasks.run_due(later), 2);
        assert_eq!(f.tasks.pending_labelled("5.head", LABEL), 1);
        assert!(f.nanny.is_active("5.head"));
        assert_eq!(signals(&f), vec![SIGTERM, SIGTERM]);
    }

    #[test]
    fn completed_jobs_and_disabled_nanny_stop_escalation() {
        let f = fixture("nanny_stop");
        let job = f.store.insert(running("3.head")).unwrap();

        f.nanny.install(&mut store::lock(&job));
        {
            let mut j = store::lock(&job);
            j.set_phase(Phase::EXITING).unwrap();
            j.set_phase(Phase::COMPLETE).unwrap();
        }
        let later = Instant::now() + Duration::from_secs(31);
        f.tasks.run_due(later);
        assert_eq!(signals(&f), vec![SIGTERM]);
        assert!(!f.nanny.is_active("3.head"));

        let job = f.store.insert(running("4.head")).unwrap();
        f.nanny.set_enabled(false);
        f.nanny.install(&mut store::lock(&job));
        assert_eq!(f.tasks.pending_for_job("4.head"), 0);
    }
}
