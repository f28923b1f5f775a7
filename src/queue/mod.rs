//! Named job queues: ordered membership, per-state counts, limits and
//! round-robin routing destinations.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::config::QueueConfig;
use crate::types::attribute::Attribute;
use crate::types::job::Job;
use crate::types::protocol::ErrorCode;
use crate::types::states::{JobState, Phase, StateError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Jobs run from here.
    Execution,
    /// Jobs are routed onwards to one of a fixed list of destinations.
    Routing,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum QueueError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("queue '{0}' is not enabled")]
    NotEnabled(String),
    #[error("queue '{0}' is full")]
    MaxQueued(String),
    #[error("job {job} is already in queue '{queue}'")]
    AlreadyQueued { job: String, queue: String },
    #[error("job {0} is not in a queue")]
    NotQueued(String),
    #[error("jobs {0} and {1} are in different queues")]
    DifferentQueues(String, String),
    #[error(transparent)]
    State(#[from] StateError),
}

impl QueueError {
    pub fn reply_code(&self) -> ErrorCode {
        match self {
            QueueError::UnknownQueue(_) => ErrorCode::UnknownQueue,
            QueueError::NotEnabled(_) => ErrorCode::QueueNotEnabled,
            QueueError::MaxQueued(_) => ErrorCode::MaxQueued,
            QueueError::AlreadyQueued { .. } => ErrorCode::Internal,
            QueueError::NotQueued(_) => ErrorCode::Internal,
            QueueError::DifferentQueues(..) | QueueError::State(_) => {
                ErrorCode::BadState
            },
        }
    }
}

/// Every destination of a routing queue has rejected the job.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("all destinations exhausted")]
pub struct Exhausted;

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub kind: QueueKind,
    pub enabled: bool,
    pub started: bool,
    pub max_run: u32,
    pub max_queued: u32,
    pub destinations: Vec<String>,
    pub route_retry: Duration,
    pub route_lifetime: Option<Duration>,
    pub route_held: bool,
    pub route_waiting: bool,
    jobs: VecDeque<String>,
    counts: [u32; JobState::ALL.len()],
    rr_cursor: usize,
}

impl Queue {
    fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            kind: cfg.kind,
            enabled: cfg.enabled,
            started: cfg.started,
            max_run: cfg.max_run,
            max_queued: cfg.max_queued,
            destinations: cfg.destinations.clone(),
            route_retry: Duration::from_secs(cfg.route_retry_secs),
            route_lifetime: (cfg.route_lifetime_secs > 0)
                .then(|| Duration::from_secs(cfg.route_lifetime_secs)),
            route_held: cfg.route_held,
            route_waiting: cfg.route_waiting,
            jobs: VecDeque::new(),
            counts: [0; JobState::ALL.len()],
            rr_cursor: 0,
        }
    }

    /// Job ids in queue order.
    pub fn jobs(&self) -> impl Iterator<Item = &String> + '_ {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.iter().any(|j| j == id)
    }

    pub fn count(&self, state: JobState) -> u32 {
        self.counts[state.code() as usize]
    }

    /// Whether another job may start running from this queue.
    pub fn can_run(&self) -> bool {
        self.max_run == 0 || self.count(JobState::Running) < self.max_run
    }

    fn check_admission(&self) -> Result<(), QueueError> {
        if !self.enabled {
            return Err(QueueError::NotEnabled(self.name.clone()));
        }
        if self.max_queued > 0 && self.jobs.len() >= self.max_queued as usize {
            return Err(QueueError::MaxQueued(self.name.clone()));
        }
        Ok(())
    }

    /// Whether a job in `phase` is a candidate for routing out of here.
    pub fn should_route(&self, phase: Phase) -> bool {
        self.kind == QueueKind::Routing
            && self.started
            && match phase.state {
                JobState::Queued => true,
                JobState::Held => self.route_held,
                JobState::Waiting => self.route_waiting,
                _ => false,
            }
    }

    /// Next destination in round-robin order, skipping those in `rejected`.
    pub fn next_destination(
        &mut self,
        rejected: &BTreeSet<String>,
    ) -> Result<String, Exhausted> {
        let n = self.destinations.len();
        for step in 0..n {
            let i = (self.rr_cursor + step) % n;
            let dest = &self.destinations[i];
            if !rejected.contains(dest) {
                self.rr_cursor = (i + 1) % n;
                return Ok(dest.clone());
            }
        }
        Err(Exhausted)
    }

    fn link(&mut self, job: &mut Job) {
        self.jobs.push_back(job.id.clone());
        self.counts[job.state.code() as usize] += 1;
        job.queue = self.name.clone();
    }

    fn unlink(&mut self, job: &mut Job) {
        if let Some(pos) = self.jobs.iter().position(|j| *j == job.id) {
            self.jobs.remove(pos);
            let c = &mut self.counts[job.state.code() as usize];
            *c = c.saturating_sub(1);
        }
        job.queue.clear();
    }

    /// Status attributes for this queue.
    pub fn status(&self) -> Vec<Attribute> {
        let kind = match self.kind {
            QueueKind::Execution => "Execution",
            QueueKind::Routing => "Route",
        };
        let counts = JobState::ALL
            .iter()
            .map(|s| format!("{s}:{}", self.count(*s)))
            .join(" ");

        let mut attrs = vec![
            Attribute::new("queue_type", kind),
            Attribute::new("total_jobs", self.jobs.len().to_string()),
            Attribute::new("state_count", counts),
            Attribute::new("enabled", self.enabled.to_string()),
            Attribute::new("started", self.started.to_string()),
        ];
        if self.max_run > 0 {
            attrs.push(Attribute::new("max_running", self.max_run.to_string()));
        }
        if self.max_queued > 0 {
            let max = self.max_queued.to_string();
            attrs.push(Attribute::new("max_queuable", max));
        }
        if !self.destinations.is_empty() {
            attrs.push(Attribute::new(
                "route_destinations",
                self.destinations.iter().join(","),
            ));
        }
        attrs
    }
}

pub type QueueRef = Arc<Mutex<Queue>>;

pub fn lock(queue: &QueueRef) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The set of queues.
///
/// Membership changes always happen with the job's lock held by the caller
/// (the `&mut Job`) and the affected queue locks taken here, in name order
/// when there are two. A job is therefore never seen in two queues, and its
/// queue's counts always agree with its state.
#[derive(Debug, Default)]
pub struct QueueManager {
    queues: RwLock<BTreeMap<String, QueueRef>>,
}

impl QueueManager {
    pub fn new(configs: &[QueueConfig]) -> Self {
        let queues = configs
            .iter()
            .map(|c| {
                (c.name.clone(), Arc::new(Mutex::new(Queue::from_config(c))))
            })
            .collect();
        Self {
            queues: RwLock::new(queues),
        }
    }

    pub fn find_by_name(&self, name: &str) -> Result<QueueRef, QueueError> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_owned()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.find_by_name(name).is_ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn kind(&self, name: &str) -> Option<QueueKind> {
        self.find_by_name(name).ok().map(|q| lock(&q).kind)
    }

    /// Checks that `name` accepts another job.
    pub fn check_admission(&self, name: &str) -> Result<(), QueueError> {
        lock(&self.find_by_name(name)?).check_admission()
    }

    /// Links a job that is in no queue into `name`, moving it to `phase`.
    pub fn enqueue(
        &self,
        job: &mut Job,
        name: &str,
        phase: Phase,
    ) -> Result<(), QueueError> {
        if !job.queue.is_empty() {
            return Err(QueueError::AlreadyQueued {
                job: job.id.clone(),
                queue: job.queue.clone(),
            });
        }
        let queue = self.find_by_name(name)?;
        let mut q = lock(&queue);
        job.set_phase(phase)?;
        q.link(job);
        job.queue_time = crate::util::now();
        trace!(job_id = %job.id, queue = name, %phase, "enqueued");
        Ok(())
    }

    /// Unlinks a job from its queue.
    pub fn dequeue(&self, job: &mut Job) -> Result<(), QueueError> {
        if job.queue.is_empty() {
            return Err(QueueError::NotQueued(job.id.clone()));
        }
        let queue = self.find_by_name(&job.queue)?;
        lock(&queue).unlink(job);
        trace!(job_id = %job.id, "dequeued");
        Ok(())
    }

    /// Moves a job from its current queue into `to` and to `phase` in one
    /// step. On error nothing changes.
    pub fn transfer(
        &self,
        job: &mut Job,
        to: &str,
        phase: Phase,
    ) -> Result<(), QueueError> {
        if job.queue.is_empty() {
            return Err(QueueError::NotQueued(job.id.clone()));
        }
        if job.queue == to {
            return self.set_phase(job, phase);
        }
        if !job.phase().can_transition(phase) && job.phase() != phase {
            return Err(StateError::IllegalTransition {
                from: job.phase(),
                to: phase,
            }
            .into());
        }

        let from_q = self.find_by_name(&job.queue)?;
        let to_q = self.find_by_name(to)?;

        // Name order.
        let (mut from_g, mut to_g) = if job.queue.as_str() < to {
            let f = lock(&from_q);
            (f, lock(&to_q))
        } else {
            let t = lock(&to_q);
            (lock(&from_q), t)
        };

        from_g.unlink(job);
        job.set_phase(phase)?;
        to_g.link(job);
        job.queue_time = crate::util::now();
        trace!(job_id = %job.id, from = %from_g.name, to, "transferred");
        Ok(())
    }

    /// Changes a job's phase, keeping its queue's counts in step.
    pub fn set_phase(
        &self,
        job: &mut Job,
        to: Phase,
    ) -> Result<(), QueueError> {
        if job.queue.is_empty() {
            job.set_phase(to)?;
            return Ok(());
        }
        let queue = self.find_by_name(&job.queue)?;
        let mut q = lock(&queue);
        let before = job.state;
        job.set_phase(to)?;
        if before != job.state {
            let c = &mut q.counts[before.code() as usize];
            *c = c.saturating_sub(1);
            q.counts[job.state.code() as usize] += 1;
        }
        Ok(())
    }

    /// Picks the routing destination for `job` from its queue.
    pub fn next_destination(
        &self,
        job: &Job,
    ) -> Result<Result<String, Exhausted>, QueueError> {
        let queue = self.find_by_name(&job.queue)?;
        let mut q = lock(&queue);
        Ok(q.next_destination(&job.rejected_dests))
    }

    /// Swaps the positions of two jobs within their shared queue.
    pub fn order_jobs(&self, a: &Job, b: &Job) -> Result<(), QueueError> {
        if a.queue.is_empty() {
            return Err(QueueError::NotQueued(a.id.clone()));
        }
        if a.queue != b.queue {
            return Err(QueueError::DifferentQueues(a.id.clone(), b.id.clone()));
        }
        let queue = self.find_by_name(&a.queue)?;
        let mut q = lock(&queue);
        let pa = q.jobs.iter().position(|j| *j == a.id);
        let pb = q.jobs.iter().position(|j| *j == b.id);
        match (pa, pb) {
            (Some(pa), Some(pb)) => {
                q.jobs.swap(pa, pb);
                Ok(())
            },
            (None, _) => Err(QueueError::NotQueued(a.id.clone())),
            (_, None) => Err(QueueError::NotQueued(b.id.clone())),
        }
    }

    /// Total jobs per state across all queues.
    pub fn state_counts(&self) -> [u32; JobState::ALL.len()] {
        let mut total = [0; JobState::ALL.len()];
        let queues =
            self.queues.read().unwrap_or_else(PoisonError::into_inner);
        for q in queues.values() {
            let q = lock(q);
            for (t, c) in total.iter_mut().zip(q.counts.iter()) {
                *t += c;
            }
        }
        total
    }
}
