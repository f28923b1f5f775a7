//! Moving jobs: routing between queues, moving to other servers and
//! dispatching to execution hosts.
//!
//! All three use the same two-phase exchange with the receiver:
//!
//! ```text
//! QueueJob -> [JobScript] -> [JobFile...] -> ReadyToCommit -> Commit
//! ```
//!
//! Every durable transition is saved before the message that depends on it
//! goes out. Once ReadyToCommit has been acknowledged the job sits in the
//! commit substate, and any later attempt (including one after a restart)
//! starts again at ReadyToCommit.
pub mod hosts;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use self::hosts::{send_oneway, HostPool};
use crate::config::{DispatchConfig, ServerConfig};
use crate::nanny::DeleteNanny;
use crate::net::{
    Connection, ConnectionRegistry, Disposition, Target, TransportError,
};
use crate::notify::{AccountKind, Notifier};
use crate::queue::{self, Exhausted, QueueKind, QueueManager};
use crate::store::{self, JobStore, SaveMode};
use crate::task::{TaskHandle, TaskScheduler, Trigger};
use crate::types::attribute::{names, Attribute};
use crate::types::job::{Job, SvrFlags};
use crate::types::protocol::{
    BatchReply, BatchRequest, ErrorCode, FileKind, RequestBody,
};
use crate::types::states::{JobSubstate, Phase};
use crate::util;

/// Finished attempts kept for inspection.
const HISTORY_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MoveType {
    /// Automatic, from a routing queue.
    Route,
    /// Requested by a user or manager.
    Move,
    /// To an execution host.
    Exec,
}

/// Where one dispatch attempt is in the exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchPhase {
    Idle,
    Connecting,
    AwaitQueueAck,
    AwaitScriptAck,
    AwaitReadyAck,
    AwaitCommitAck,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success { session_id: Option<i64> },
    /// The receiver refused the job, or the destination can never work.
    PermanentFail(ErrorCode),
    /// The receiver's state is unknown (a step timed out).
    Requeue,
    /// Every attempt failed with a retryable error.
    RetryExhausted(ErrorCode),
    /// The job was deleted while the attempt was in flight.
    Abandoned,
}

/// An in-flight route, move or execution.
#[derive(Clone, Debug)]
pub struct PendingMove {
    pub job_id: String,
    pub move_type: MoveType,
    /// `queue@server[:port]` or `host:port`.
    pub destination: String,
    pub attempts: u32,
    /// Requests sent, over all attempts.
    pub sends: u32,
    pub started: Instant,
    pub phases: Vec<DispatchPhase>,
}

impl PendingMove {
    fn new(job_id: &str, move_type: MoveType, destination: &str) -> Self {
        Self {
            job_id: job_id.to_owned(),
            move_type,
            destination: destination.to_owned(),
            attempts: 0,
            sends: 0,
            started: Instant::now(),
            phases: vec![DispatchPhase::Idle],
        }
    }

    pub fn phase(&self) -> DispatchPhase {
        self.phases.last().copied().unwrap_or(DispatchPhase::Idle)
    }

    fn enter(&mut self, phase: DispatchPhase) {
        debug!(
            job_id = %self.job_id,
            from = ?self.phase(),
            to = ?phase,
            attempt = self.attempts,
            "dispatch phase"
        );
        self.phases.push(phase);
    }
}

/// What is sent, captured under the job lock before any I/O.
struct SendPlan {
    host: String,
    port: u16,
    user: String,
    /// Queue named in QueueJob; empty means the receiver's default.
    queue: String,
    attrs: Vec<Attribute>,
    script: Option<Vec<u8>>,
    files: Vec<(FileKind, Vec<u8>)>,
    /// Start at ReadyToCommit.
    from_commit: bool,
    /// This dispatch picked up a commit left over from an earlier one.
    resumed: bool,
}

enum StepError {
    Transport(TransportError),
    Abandoned,
    State(ErrorCode),
}

impl From<TransportError> for StepError {
    fn from(e: TransportError) -> Self {
        StepError::Transport(e)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// A queue on this server.
    Local(String),
    /// A queue on another server; an empty queue means its default.
    Remote { queue: String, host: String, port: u16 },
}

enum RouteStep {
    Done(Outcome),
    Remote(PendingMove, SendPlan),
}

impl RouteStep {
    fn failed(code: ErrorCode) -> Self {
        RouteStep::Done(Outcome::PermanentFail(code))
    }
}

/// The shared components a dispatch works with.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<JobStore>,
    pub queues: Arc<QueueManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub tasks: Arc<TaskScheduler>,
    pub hosts: Arc<HostPool>,
    pub nanny: Arc<DeleteNanny>,
    pub notifier: Arc<Notifier>,
}

pub struct DispatchEngine {
    me: Weak<DispatchEngine>,
    svc: Services,
    cfg: DispatchConfig,
    server_name: String,
    port: u16,
    default_queue: String,
    history: Mutex<VecDeque<PendingMove>>,
}

impl DispatchEngine {
    pub fn new(svc: Services, config: &ServerConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            svc,
            cfg: config.dispatch.clone(),
            server_name: config.server_name.clone(),
            port: config.port,
            default_queue: config.default_queue.clone(),
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn services(&self) -> &Services {
        &self.svc
    }

    fn record(&self, pm: PendingMove) {
        let mut history =
            self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(pm);
    }

    /// The most recent finished attempt for `job_id`.
    pub fn last_move(&self, job_id: &str) -> Option<PendingMove> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|pm| pm.job_id == job_id)
            .cloned()
    }

    /// Parses `queue`, `queue@server[:port]` or `@server[:port]`.
    pub fn resolve_destination(
        &self,
        dest: &str,
    ) -> Result<Destination, ErrorCode> {
        let (queue, server) = match dest.split_once('@') {
            Some((q, s)) => (q, Some(s)),
            None => (dest, None),
        };

        let target = match server {
            None => Target::Local,
            Some(s) => self
                .svc
                .registry
                .resolve(s, self.port)
                .map_err(|_| ErrorCode::BadHost)?,
        };

        match target {
            Target::Local => {
                let queue = if queue.is_empty() {
                    self.default_queue.as_str()
                } else {
                    queue
                };
                if !self.svc.queues.exists(queue) {
                    return Err(ErrorCode::UnknownQueue);
                }
                Ok(Destination::Local(queue.to_owned()))
            },
            Target::Remote { host, port } => Ok(Destination::Remote {
                queue: queue.to_owned(),
                host,
                port,
            }),
        }
    }

    fn still_wanted(&self, job_id: &str) -> bool {
        self.svc
            .store
            .get(job_id)
            .map(|j| !store::lock(&j).deleted)
            .unwrap_or(false)
    }

    fn check_wanted(&self, job_id: &str) -> Result<(), StepError> {
        if self.still_wanted(job_id) {
            Ok(())
        } else {
            debug!(job_id, "job deleted during dispatch");
            Err(StepError::Abandoned)
        }
    }

    /// Removes a job for good: its tasks first, then its queue link, then
    /// the record and files. Must be called without the job's lock held.
    pub fn purge_job(&self, job_id: &str) {
        self.svc.tasks.cancel_job(job_id);
        self.svc.nanny.cancel(job_id);
        if let Some(job) = self.svc.store.get(job_id) {
            let mut job = store::lock(&job);
            if !job.queue.is_empty() {
                if let Err(error) = self.svc.queues.dequeue(&mut job) {
                    warn!(job_id, %error, "failed to dequeue purged job");
                }
            }
        }
        self.svc.store.purge(job_id);
        debug!(job_id, "purged");
    }

    /// Arranges for `job_id` to be routed after `delay`, unless a route is
    /// already pending.
    pub fn schedule_route(
        &self,
        job_id: &str,
        delay: Duration,
    ) -> Option<TaskHandle> {
        if self.svc.tasks.pending_labelled(job_id, "route") > 0 {
            return None;
        }
        let me = self.me.clone();
        let id = job_id.to_owned();
        Some(self.svc.tasks.schedule(
            trigger_after(delay),
            Some(job_id),
            "route",
            Box::new(move || {
                if let Some(engine) = me.upgrade() {
                    tokio::spawn(async move {
                        engine.route(&id).await;
                    });
                }
            }),
        ))
    }

    /// Arranges for the commit of `job_id` to be retried after `delay`.
    pub fn schedule_resume(
        &self,
        job_id: &str,
        delay: Duration,
    ) -> Option<TaskHandle> {
        if self.svc.tasks.pending_labelled(job_id, "resume") > 0 {
            return None;
        }
        let me = self.me.clone();
        let id = job_id.to_owned();
        Some(self.svc.tasks.schedule(
            trigger_after(delay),
            Some(job_id),
            "resume",
            Box::new(move || {
                if let Some(engine) = me.upgrade() {
                    tokio::spawn(async move {
                        engine.resume(&id).await;
                    });
                }
            }),
        ))
    }

    fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.cfg.backoff_max_ms)
    }

    // Routing.

    /// Routes a job out of its routing queue, trying destinations until one
    /// takes it, none are left, or the outcome is unknown.
    #[instrument(skip(self))]
    pub async fn route(&self, job_id: &str) -> Outcome {
        loop {
            let (pm, plan) = match self.begin_route(job_id) {
                RouteStep::Done(outcome) => return outcome,
                RouteStep::Remote(pm, plan) => (pm, plan),
            };
            let (pm, outcome) = self.send(pm, plan).await;
            if let Some(outcome) = self.finish_route(pm, outcome) {
                return outcome;
            }
        }
    }

    fn begin_route(&self, job_id: &str) -> RouteStep {
        let Some(job_ref) = self.svc.store.get(job_id) else {
            return RouteStep::Done(Outcome::Abandoned);
        };
        let mut job = store::lock(&job_ref);
        if job.deleted || job.dispatching {
            return RouteStep::failed(ErrorCode::BadState);
        }

        let found = self.svc.queues.find_by_name(&job.queue);
        let (routable, lifetime) = match found {
            Ok(q) => {
                let q = queue::lock(&q);
                (q.should_route(job.phase()), q.route_lifetime)
            },
            Err(e) => return RouteStep::failed(e.reply_code()),
        };
        if !routable {
            return RouteStep::failed(ErrorCode::BadState);
        }
        if let Some(lifetime) = lifetime {
            if util::now() - job.queue_time > lifetime.as_secs() as i64 {
                let code = ErrorCode::RouteExpired;
                self.reject(&mut job, code, "route lifetime exceeded");
                return RouteStep::failed(code);
            }
        }

        loop {
            let dest = match self.svc.queues.next_destination(&job) {
                Ok(Ok(dest)) => dest,
                Ok(Err(Exhausted)) => {
                    let code = ErrorCode::RouteReject;
                    let reason = "no destination accepted the job";
                    self.reject(&mut job, code, reason);
                    return RouteStep::failed(code);
                },
                Err(e) => return RouteStep::failed(e.reply_code()),
            };

            match self.resolve_destination(&dest) {
                Ok(Destination::Local(queue)) => {
                    match self.route_local(&mut job, &queue) {
                        Ok(()) => {
                            let done = Outcome::Success { session_id: None };
                            return RouteStep::Done(done);
                        },
                        Err(code) => {
                            debug!(
                                job_id,
                                %dest,
                                %code,
                                "local destination refused job"
                            );
                            job.rejected_dests.insert(dest);
                        },
                    }
                },
                Ok(Destination::Remote { queue, host, port }) => {
                    return match self.begin_transit(
                        &mut job,
                        MoveType::Route,
                        &dest,
                        queue,
                        host,
                        port,
                    ) {
                        Ok((pm, plan)) => RouteStep::Remote(pm, plan),
                        Err(code) => RouteStep::failed(code),
                    };
                },
                Err(code) => {
                    debug!(job_id, %dest, %code, "bad route destination");
                    job.rejected_dests.insert(dest);
                },
            }
        }
    }

    /// Moves a job to another queue of this server. No network; one save.
    fn route_local(&self, job: &mut Job, queue: &str) -> Result<(), ErrorCode> {
        if job.queue == queue {
            return Err(ErrorCode::BadState);
        }
        self.svc
            .queues
            .check_admission(queue)
            .map_err(|e| e.reply_code())?;

        let phase = job.evaluate_phase(util::now());
        self.svc
            .queues
            .transfer(job, queue, phase)
            .map_err(|e| e.reply_code())?;
        job.destin = None;
        job.rejected_dests.clear();
        self.svc.store.save_or_log(job, SaveMode::Quick);
        info!(job_id = %job.id, queue, "moved to local queue");

        if self.svc.queues.kind(queue) == Some(QueueKind::Routing) {
            self.schedule_route(&job.id, Duration::ZERO);
        }
        Ok(())
    }

    /// Marks a job as leaving for `dest`, saves that, and captures what to
    /// send.
    fn begin_transit(
        &self,
        job: &mut Job,
        move_type: MoveType,
        dest: &str,
        queue: String,
        host: String,
        port: u16,
    ) -> Result<(PendingMove, SendPlan), ErrorCode> {
        self.svc
            .queues
            .set_phase(job, Phase::TRANS_OUT)
            .map_err(|e| e.reply_code())?;
        job.destin = Some(dest.to_owned());
        job.dispatching = true;
        self.svc.store.save_or_log(job, SaveMode::Quick);

        let plan = SendPlan {
            host,
            port,
            user: request_user(job),
            queue,
            attrs: job.attrs.to_wire(),
            script: self.read_script(&job.id),
            files: Vec::new(),
            from_commit: false,
            resumed: false,
        };
        Ok((PendingMove::new(&job.id, move_type, dest), plan))
    }

    fn read_script(&self, job_id: &str) -> Option<Vec<u8>> {
        match self.svc.store.read_script(job_id) {
            Ok(script) => script,
            Err(error) => {
                warn!(job_id, %error, "failed to read job script");
                None
            },
        }
    }

    /// Returns `None` when the destination refused the job and routing
    /// should carry on with the next one.
    fn finish_route(
        &self,
        pm: PendingMove,
        outcome: Outcome,
    ) -> Option<Outcome> {
        let job_id = pm.job_id.clone();
        let dest = pm.destination.clone();
        self.record(pm);

        match outcome {
            Outcome::Success { .. } => {
                self.departed(&job_id, &dest);
                Some(outcome)
            },
            Outcome::Abandoned => {
                self.purge_job(&job_id);
                Some(outcome)
            },
            Outcome::PermanentFail(code) => {
                let job_ref = self.svc.store.get(&job_id)?;
                let mut job = store::lock(&job_ref);
                info!(%job_id, %dest, %code, "destination rejected job");
                self.revert_transit(&mut job);
                job.rejected_dests.insert(dest);
                None
            },
            Outcome::Requeue | Outcome::RetryExhausted(_) => {
                let job_ref = self.svc.store.get(&job_id)?;
                let mut job = store::lock(&job_ref);
                let retry = self
                    .svc
                    .queues
                    .find_by_name(&job.queue)
                    .map(|q| queue::lock(&q).route_retry)
                    .unwrap_or_else(|_| self.resume_delay());
                if !self.hold_commit(&mut job, retry) {
                    self.revert_transit(&mut job);
                    self.schedule_route(&job_id, retry);
                }
                Some(outcome)
            },
        }
    }

    /// Keeps a job whose ready-to-commit was acknowledged in the commit
    /// substate and retries the commit after `delay`. The receiver may
    /// already hold the job, so it must not go back to its queue.
    fn hold_commit(&self, job: &mut Job, delay: Duration) -> bool {
        if job.substate != JobSubstate::TransOutCommit {
            return false;
        }
        job.dispatching = false;
        self.schedule_resume(&job.id, delay);
        true
    }

    /// Puts a job that did not leave back into its queue state.
    pub(crate) fn revert_transit(&self, job: &mut Job) {
        let phase = job.evaluate_phase(util::now());
        if let Err(error) = self.svc.queues.set_phase(job, phase) {
            warn!(job_id = %job.id, %error, "failed to revert job state");
        }
        job.destin = None;
        job.dispatching = false;
        self.svc.store.save_or_log(job, SaveMode::Quick);
    }

    /// The job now lives at `dest`: clean up after it here.
    fn departed(&self, job_id: &str, dest: &str) {
        if let Some(job_ref) = self.svc.store.get(job_id) {
            let job = store::lock(&job_ref);
            let leftovers = SvrFlags::STAGED_IN | SvrFlags::CHKPT_COPIED;
            let host = job
                .exec_host
                .as_ref()
                .filter(|_| job.svrflags.intersects(leftovers));
            if let Some(host) = host {
                send_oneway(
                    &self.svc.registry,
                    host,
                    self.svc.hosts.default_port(),
                    self.cfg.step_timeout(),
                    RequestBody::DelFiles {
                        job_id: job_id.to_owned(),
                        files: Vec::new(),
                    },
                );
            }
        }
        let detail = format!("destination={dest}");
        self.svc
            .notifier
            .account(AccountKind::Moved, job_id, &detail);
        self.purge_job(job_id);
    }

    /// Terminal rejection: the job ends without running and its owner is
    /// told.
    fn reject(&self, job: &mut Job, code: ErrorCode, reason: &str) {
        warn!(job_id = %job.id, %code, reason, "rejecting job");
        for phase in [Phase::ABORT, Phase::COMPLETE] {
            if let Err(error) = self.svc.queues.set_phase(job, phase) {
                warn!(job_id = %job.id, %error, "failed to abort job");
            }
        }
        job.set_attr(names::COMMENT, reason);
        job.set_attr(names::EXIT_STATUS, "-1");
        job.destin = None;
        job.dispatching = false;
        self.svc.store.save_or_log(job, SaveMode::Full);
        self.svc.tasks.cancel_job(&job.id);
        self.svc.notifier.account(AccountKind::Aborted, &job.id, reason);
        let message = format!("Job aborted: {reason}");
        drop(self.svc.notifier.notify_owner(job, &message));
    }

    // Moving.

    /// Moves a job to `destination` on behalf of a client, reporting the
    /// result instead of retrying later.
    #[instrument(skip(self))]
    pub async fn move_job(
        &self,
        job_id: &str,
        destination: &str,
    ) -> Result<(), ErrorCode> {
        let Some((pm, plan)) = self.begin_move(job_id, destination)? else {
            return Ok(());
        };
        let (pm, outcome) = self.send(pm, plan).await;
        self.finish_move(pm, outcome)
    }

    /// Returns `None` when the move was local and is already done.
    fn begin_move(
        &self,
        job_id: &str,
        destination: &str,
    ) -> Result<Option<(PendingMove, SendPlan)>, ErrorCode> {
        let job_ref = self.svc.store.get(job_id).ok_or(ErrorCode::UnknownJob)?;
        let mut job = store::lock(&job_ref);
        if !job.state.is_movable() || job.dispatching || job.deleted {
            return Err(ErrorCode::BadState);
        }
        match self.resolve_destination(destination)? {
            Destination::Local(queue) => {
                self.route_local(&mut job, &queue)?;
                Ok(None)
            },
            Destination::Remote { queue, host, port } => self
                .begin_transit(
                    &mut job,
                    MoveType::Move,
                    destination,
                    queue,
                    host,
                    port,
                )
                .map(Some),
        }
    }

    fn finish_move(
        &self,
        pm: PendingMove,
        outcome: Outcome,
    ) -> Result<(), ErrorCode> {
        let job_id = pm.job_id.clone();
        let dest = pm.destination.clone();
        self.record(pm);

        match outcome {
            Outcome::Success { .. } => {
                self.departed(&job_id, &dest);
                Ok(())
            },
            Outcome::Abandoned => {
                self.purge_job(&job_id);
                Err(ErrorCode::UnknownJob)
            },
            Outcome::PermanentFail(code) => {
                if let Some(job_ref) = self.svc.store.get(&job_id) {
                    self.revert_transit(&mut store::lock(&job_ref));
                }
                Err(code)
            },
            Outcome::Requeue | Outcome::RetryExhausted(_) => {
                if let Some(job_ref) = self.svc.store.get(&job_id) {
                    let mut job = store::lock(&job_ref);
                    if !self.hold_commit(&mut job, self.resume_delay()) {
                        self.revert_transit(&mut job);
                    }
                }
                match outcome {
                    Outcome::RetryExhausted(code) => Err(code),
                    _ => Err(ErrorCode::Timeout),
                }
            },
        }
    }

    /// Retries the commit of a job left in the commit substate by a timed
    /// out attempt or a restart, starting at ReadyToCommit.
    #[instrument(skip(self))]
    pub async fn resume(&self, job_id: &str) -> Outcome {
        let (pm, plan) = match self.begin_resume(job_id) {
            Ok(x) => x,
            Err(outcome) => return outcome,
        };
        let move_type = pm.move_type;
        let (pm, outcome) = self.send(pm, plan).await;
        match move_type {
            MoveType::Route => match self.finish_route(pm, outcome) {
                Some(outcome) => outcome,
                None => {
                    self.schedule_route(job_id, Duration::ZERO);
                    outcome
                },
            },
            _ => {
                let _ = self.finish_move(pm, outcome);
                outcome
            },
        }
    }

    fn begin_resume(
        &self,
        job_id: &str,
    ) -> Result<(PendingMove, SendPlan), Outcome> {
        let job_ref = self.svc.store.get(job_id).ok_or(Outcome::Abandoned)?;
        let mut job = store::lock(&job_ref);
        if job.phase() != Phase::TRANS_OUT_COMMIT
            || job.dispatching
            || job.deleted
        {
            return Err(Outcome::PermanentFail(ErrorCode::BadState));
        }
        let dest = job.destin.clone().unwrap_or_default();
        let (queue, host, port) = match self.resolve_destination(&dest) {
            Ok(Destination::Remote { queue, host, port }) => {
                (queue, host, port)
            },
            _ => {
                warn!(job_id, %dest, "cannot resume commit, reverting");
                self.revert_transit(&mut job);
                return Err(Outcome::PermanentFail(ErrorCode::BadHost));
            },
        };
        let move_type = match self.svc.queues.kind(&job.queue) {
            Some(QueueKind::Routing) => MoveType::Route,
            _ => MoveType::Move,
        };
        job.dispatching = true;

        let plan = SendPlan {
            host,
            port,
            user: request_user(&job),
            queue,
            attrs: Vec::new(),
            script: None,
            files: Vec::new(),
            from_commit: true,
            resumed: true,
        };
        info!(job_id, %dest, "resuming commit");
        Ok((PendingMove::new(job_id, move_type, &dest), plan))
    }

    // Execution.

    /// Dispatches a queued job to an execution host, `host` or the next
    /// healthy one. Returns the session id the host reported.
    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        job_id: &str,
        host: Option<&str>,
    ) -> Result<Option<i64>, ErrorCode> {
        let (pm, plan) = self.begin_exec(job_id, host)?;
        let (pm, outcome) = self.send(pm, plan).await;
        self.finish_exec(pm, outcome)
    }

    /// Checks a job can be run now.
    pub fn check_runnable(&self, job_id: &str) -> Result<(), ErrorCode> {
        let job_ref = self.svc.store.get(job_id).ok_or(ErrorCode::UnknownJob)?;
        let job = store::lock(&job_ref);
        self.runnable(&job)
    }

    /// Must be called with the job locked by whoever goes on to start it.
    fn runnable(&self, job: &Job) -> Result<(), ErrorCode> {
        if job.phase() != Phase::QUEUED || job.dispatching || job.deleted {
            return Err(ErrorCode::BadState);
        }
        let q = self
            .svc
            .queues
            .find_by_name(&job.queue)
            .map_err(|e| e.reply_code())?;
        let q = queue::lock(&q);
        if q.kind != QueueKind::Execution {
            return Err(ErrorCode::BadState);
        }
        if !q.can_run() {
            return Err(ErrorCode::ExLimit);
        }
        Ok(())
    }

    fn begin_exec(
        &self,
        job_id: &str,
        host: Option<&str>,
    ) -> Result<(PendingMove, SendPlan), ErrorCode> {
        let host = match host.filter(|h| !h.is_empty()) {
            Some(h) => self.svc.hosts.normalize(h),
            None => self.svc.hosts.pick().ok_or(ErrorCode::NoServer)?,
        };
        let default_port = self.svc.hosts.default_port();
        let (h, port) = match self.svc.registry.resolve(&host, default_port) {
            Ok(Target::Remote { host, port }) => (host, port),
            _ => return Err(ErrorCode::BadHost),
        };

        let job_ref = self.svc.store.get(job_id).ok_or(ErrorCode::UnknownJob)?;
        let mut job = store::lock(&job_ref);
        self.runnable(&job)?;
        self.svc
            .queues
            .set_phase(&mut job, Phase::PRERUN)
            .map_err(|e| e.reply_code())?;
        job.destin = Some(host.clone());
        job.exec_host = Some(host.clone());
        job.set_attr(names::EXEC_HOST, host.as_str());
        job.dispatching = true;
        self.svc.store.save_or_log(&mut job, SaveMode::Quick);

        let mut files = Vec::new();
        if job.svrflags.contains(SvrFlags::HAS_RUN) {
            let kinds =
                [FileKind::StdOut, FileKind::StdErr, FileKind::Checkpoint];
            for kind in kinds {
                match self.svc.store.read_run_file(job_id, kind) {
                    Ok(Some(data)) => files.push((kind, data)),
                    Ok(None) => {},
                    Err(error) => {
                        warn!(job_id, ?kind, %error, "failed to read run file")
                    },
                }
            }
        }

        let plan = SendPlan {
            host: h,
            port,
            user: request_user(&job),
            queue: String::new(),
            attrs: job.attrs.to_wire_for_mom(),
            script: self.read_script(job_id),
            files,
            from_commit: false,
            resumed: false,
        };
        Ok((PendingMove::new(job_id, MoveType::Exec, &host), plan))
    }

    fn finish_exec(
        &self,
        pm: PendingMove,
        outcome: Outcome,
    ) -> Result<Option<i64>, ErrorCode> {
        let job_id = pm.job_id.clone();
        let host = pm.destination.clone();
        self.record(pm);

        if outcome == Outcome::Abandoned {
            self.purge_job(&job_id);
            return Err(ErrorCode::UnknownJob);
        }

        let job_ref = self.svc.store.get(&job_id).ok_or(ErrorCode::UnknownJob)?;
        let mut job = store::lock(&job_ref);
        job.dispatching = false;
        job.destin = None;

        match outcome {
            Outcome::Success { session_id } => {
                let res = self.svc.queues.set_phase(&mut job, Phase::RUNNING);
                if let Err(error) = res {
                    warn!(%job_id, %error, "failed to mark job running");
                }
                job.svrflags.insert(SvrFlags::HAS_RUN);
                job.session_id = session_id;
                if let Some(sid) = session_id {
                    job.set_attr(names::SESSION_ID, sid.to_string());
                }
                self.svc.store.save_or_log(&mut job, SaveMode::Full);
                let detail = format!("exec_host={host}");
                self.svc
                    .notifier
                    .account(AccountKind::Started, &job_id, &detail);
                if job.deleted {
                    self.svc.nanny.install(&mut job);
                }
                Ok(session_id)
            },
            Outcome::PermanentFail(code) | Outcome::RetryExhausted(code) => {
                self.svc.hosts.mark_suspect(&host);
                self.requeue_from_host(&mut job);
                Err(code)
            },
            Outcome::Requeue | Outcome::Abandoned => {
                self.svc.hosts.mark_suspect(&host);
                self.requeue_from_host(&mut job);
                Err(ErrorCode::Timeout)
            },
        }
    }

    /// Returns a job that did not start back to its queue.
    pub fn requeue_from_host(&self, job: &mut Job) {
        // Leaving the running state always goes through Queued.
        for phase in [Phase::QUEUED, job.evaluate_phase(util::now())] {
            if let Err(error) = self.svc.queues.set_phase(job, phase) {
                warn!(job_id = %job.id, %error, "failed to requeue job");
            }
        }
        job.exec_host = None;
        job.session_id = None;
        job.clear_attr(names::EXEC_HOST);
        job.clear_attr(names::SESSION_ID);
        job.destin = None;
        self.svc.store.save_or_log(job, SaveMode::Quick);
        info!(job_id = %job.id, phase = %job.phase(), "requeued");
    }

    // The exchange.

    async fn send(
        &self,
        mut pm: PendingMove,
        mut plan: SendPlan,
    ) -> (PendingMove, Outcome) {
        let cap = self.cfg.retry_cap.max(1);

        let outcome = loop {
            pm.attempts += 1;
            let delay = self.cfg.backoff(pm.attempts);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if !self.still_wanted(&pm.job_id) {
                break Outcome::Abandoned;
            }

            match self.attempt(&mut pm, &mut plan).await {
                Ok(session_id) => break Outcome::Success { session_id },
                Err(StepError::Abandoned) => break Outcome::Abandoned,
                Err(StepError::State(code)) => {
                    break Outcome::PermanentFail(code)
                },
                Err(StepError::Transport(error)) => {
                    let code = error.reply_code();
                    let outcome = match error.disposition() {
                        Disposition::Fatal => Outcome::PermanentFail(code),
                        Disposition::Timeout => Outcome::Requeue,
                        Disposition::Retry if pm.attempts >= cap => {
                            Outcome::RetryExhausted(code)
                        },
                        Disposition::Retry => {
                            debug!(
                                job_id = %pm.job_id,
                                %error,
                                attempt = pm.attempts,
                                "retrying"
                            );
                            continue;
                        },
                    };
                    warn!(
                        job_id = %pm.job_id,
                        dest = %pm.destination,
                        %error,
                        attempts = pm.attempts,
                        ?outcome,
                        "dispatch failed"
                    );
                    break outcome;
                },
            }
        };

        pm.enter(DispatchPhase::Done);
        debug!(
            job_id = %pm.job_id,
            ?outcome,
            attempts = pm.attempts,
            sends = pm.sends,
            elapsed_ms = pm.started.elapsed().as_millis() as u64,
            "dispatch finished"
        );
        (pm, outcome)
    }

    /// One connection's worth of the exchange.
    async fn attempt(
        &self,
        pm: &mut PendingMove,
        plan: &mut SendPlan,
    ) -> Result<Option<i64>, StepError> {
        pm.enter(DispatchPhase::Connecting);
        let mut conn = self
            .svc
            .registry
            .connect(&plan.host, plan.port)
            .await
            .map_err(TransportError::from)?;

        let res = self.exchange(pm, plan, &mut conn).await;
        match &res {
            // The connection is still in step with the peer.
            Ok(_)
            | Err(StepError::Abandoned)
            | Err(StepError::State(_))
            | Err(StepError::Transport(TransportError::Rejected(_))) => {
                self.svc.registry.disconnect(conn).await
            },
            Err(_) => drop(conn),
        }
        res
    }

    async fn exchange(
        &self,
        pm: &mut PendingMove,
        plan: &mut SendPlan,
        conn: &mut Connection,
    ) -> Result<Option<i64>, StepError> {
        let id = pm.job_id.clone();
        let exec = pm.move_type == MoveType::Exec;
        self.check_wanted(&id)?;

        if !plan.from_commit {
            pm.enter(DispatchPhase::AwaitQueueAck);
            let body = RequestBody::QueueJob {
                job_id: id.clone(),
                destination: plan.queue.clone(),
                attrs: plan.attrs.clone(),
            };
            let mut have_job = false;
            match self.step(pm, conn, &plan.user, body).await {
                Ok(_) => {},
                Err(TransportError::Rejected(ErrorCode::JobExists)) if exec => {
                    debug!(job_id = %id, "execution host already has the job");
                    have_job = true;
                },
                Err(e) => return Err(e.into()),
            }
            self.check_wanted(&id)?;

            if !have_job {
                if let Some(script) = &plan.script {
                    pm.enter(DispatchPhase::AwaitScriptAck);
                    let body = RequestBody::JobScript {
                        job_id: id.clone(),
                        seq: 0,
                        data: script.clone(),
                    };
                    self.step(pm, conn, &plan.user, body).await?;
                    self.check_wanted(&id)?;
                }
                for (kind, data) in &plan.files {
                    let body = RequestBody::JobFile {
                        job_id: id.clone(),
                        kind: *kind,
                        seq: 0,
                        data: data.clone(),
                    };
                    self.step(pm, conn, &plan.user, body).await?;
                    self.check_wanted(&id)?;
                }
            }
        }

        pm.enter(DispatchPhase::AwaitReadyAck);
        let body = RequestBody::ReadyToCommit { job_id: id.clone() };
        match self.step(pm, conn, &plan.user, body).await {
            Ok(_) => {},
            Err(TransportError::Rejected(ErrorCode::JobExists))
                if plan.resumed || exec =>
            {
                debug!(job_id = %id, "receiver already committed the job");
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        }
        self.check_wanted(&id)?;

        if !plan.from_commit || exec {
            self.enter_commit_phase(&id, pm.move_type)?;
        }
        plan.from_commit = true;
        plan.resumed = true;

        pm.enter(DispatchPhase::AwaitCommitAck);
        let body = RequestBody::Commit { job_id: id.clone() };
        let reply = match self.step(pm, conn, &plan.user, body).await {
            Ok(reply) => reply,
            Err(TransportError::Rejected(ErrorCode::JobExists)) => {
                debug!(job_id = %id, "commit already applied");
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };

        Ok((exec && reply.aux > 0).then(|| reply.aux as i64))
    }

    /// Records that ready-to-commit was acknowledged, before committing.
    fn enter_commit_phase(
        &self,
        job_id: &str,
        move_type: MoveType,
    ) -> Result<(), StepError> {
        let job_ref = self.svc.store.get(job_id).ok_or(StepError::Abandoned)?;
        let mut job = store::lock(&job_ref);
        if job.deleted {
            return Err(StepError::Abandoned);
        }
        let to = match move_type {
            MoveType::Exec => Phase::EXEC_COMMIT,
            _ => Phase::TRANS_OUT_COMMIT,
        };
        self.svc.queues.set_phase(&mut job, to).map_err(|error| {
            warn!(job_id, %error, "cannot enter commit phase");
            StepError::State(ErrorCode::Internal)
        })?;
        self.svc.store.save_or_log(&mut job, SaveMode::Quick);
        Ok(())
    }

    async fn step(
        &self,
        pm: &mut PendingMove,
        conn: &mut Connection,
        user: &str,
        body: RequestBody,
    ) -> Result<BatchReply, TransportError> {
        pm.sends += 1;
        let req = BatchRequest::new(user, body);
        conn.request(&req, self.cfg.step_timeout()).await
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

fn trigger_after(delay: Duration) -> Trigger {
    if delay.is_zero() {
        Trigger::Immediate
    } else {
        Trigger::after(delay)
    }
}

fn request_user(job: &Job) -> String {
    match job.owner_user() {
        "" => "root".to_owned(),
        user => user.to_owned(),
    }
}

#[cfg(test)]
mod tests;
