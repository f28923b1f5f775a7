//! Request handlers.
//!
//! Each handler takes the locks it needs in a synchronous helper and releases
//! them before anything is awaited.
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tracing::{debug, error, info, instrument, trace, warn};

use super::Server;
use crate::nanny::SIGTERM;
use crate::notify::AccountKind;
use crate::queue::{self, QueueKind};
use crate::store::array::{is_parent_id, parent_id_for, ArrayRecord};
use crate::store::{self, JobRef, SaveMode};
use crate::task::{TaskEvent, Trigger};
use crate::types::attribute::{names, Attribute};
use crate::types::job::{ArrayMembership, Job, SvrFlags, MAX_JOB_ID_LEN};
use crate::types::protocol::{
    BatchReply, BatchRequest, ErrorCode, FileKind, ReplyBody, RequestBody,
    StatusEntry,
};
use crate::types::states::{JobState, JobSubstate, Phase};
use crate::util;

/// Attributes only the server itself sets.
const READ_ONLY: &[&str] = &[
    names::EXEC_HOST,
    names::SESSION_ID,
    names::EXIT_STATUS,
    names::ARRAY_ID,
    names::ARRAY_REQUEST,
];

type Reply = Result<BatchReply, ErrorCode>;

fn null() -> Reply {
    Ok(BatchReply::null())
}

impl Server {
    /// Answers one request. Refusals become error replies.
    #[instrument(skip_all, fields(request = req.body.name(), user = %req.user))]
    pub async fn handle_request(&self, req: BatchRequest) -> BatchReply {
        let BatchRequest { user, body } = req;
        let name = body.name();
        let user = user.as_str();

        use RequestBody::*;
        let res = match body {
            QueueJob {
                job_id,
                destination,
                attrs,
            } => self.queue_job(user, job_id, &destination, attrs),
            JobCred { .. } => null(),
            JobScript { job_id, seq, data } => {
                self.job_data(&job_id, None, seq, &data)
            },
            JobFile {
                job_id,
                kind,
                seq,
                data,
            } => self.job_data(&job_id, Some(kind), seq, &data),
            ReadyToCommit { job_id } => self.ready_to_commit(&job_id),
            Commit { job_id } => self.commit(&job_id),

            DeleteJob { job_id } => self.delete_job(user, &job_id),
            HoldJob { job_id, hold } => self.hold_job(user, &job_id, &hold),
            ReleaseJob { job_id, hold } => {
                self.release_job(user, &job_id, &hold)
            },
            ModifyJob { job_id, attrs } => {
                self.modify_job(user, &job_id, &attrs)
            },
            MoveJob {
                job_id,
                destination,
            } => self.move_job(user, &job_id, &destination).await,
            RunJob {
                job_id,
                destination,
            } => self.run_job(user, &job_id, &destination, true).await,
            AsyncRunJob {
                job_id,
                destination,
            } => self.run_job(user, &job_id, &destination, false).await,
            Rerun { job_id } => self.rerun_job(user, &job_id),
            SignalJob { job_id, signal } => {
                self.signal_job(user, &job_id, &signal)
            },
            OrderJob { job_a, job_b } => self.order_job(user, &job_a, &job_b),

            LocateJob { job_id } => self.locate_job(&job_id),
            StatusJob { id, attrs } => self.status_job(&id, &attrs),
            StatusQueue { name } => self.status_queue(&name),
            StatusServer => Ok(self.status_server()),
            StatusNode { name } => {
                let hosts = self.svc.hosts.status(&name);
                Ok(BatchReply::ok(ReplyBody::Status(hosts)))
            },

            Shutdown { manner } => self.shutdown(user, manner),
            JobObit {
                job_id,
                exit_status,
                attrs,
            } => self.job_obit(user, &job_id, exit_status, &attrs),
            CopyFiles { .. } | DelFiles { .. } => Err(ErrorCode::NoSupport),
            Disconnect => null(),
        };

        match res {
            Ok(reply) => reply,
            Err(code) => {
                debug!(request = name, %code, "request refused");
                BatchReply::error(code)
            },
        }
    }

    fn job_ref(&self, id: &str) -> Result<JobRef, ErrorCode> {
        self.svc.store.get(id).ok_or(ErrorCode::UnknownJob)
    }

    fn authorize(&self, user: &str, job: &Job) -> Result<(), ErrorCode> {
        if self.auth.may_modify(user, job) {
            Ok(())
        } else {
            warn!(user, job_id = %job.id, "permission denied");
            Err(ErrorCode::PermissionDenied)
        }
    }

    fn require_manager(&self, user: &str) -> Result<(), ErrorCode> {
        if self.auth.is_manager(user) {
            Ok(())
        } else {
            warn!(user, "manager privilege required");
            Err(ErrorCode::PermissionDenied)
        }
    }

    fn save(&self, job: &mut Job, mode: SaveMode) -> Result<(), ErrorCode> {
        self.svc.store.save(job, mode).map_err(|error| {
            error!(job_id = %job.id, %error, "failed to save job");
            ErrorCode::System
        })
    }

    /// Follow-up work for a job that has just become eligible in its queue.
    pub(crate) fn after_requeue(&self, job: &Job) {
        match job.phase() {
            Phase::WAITING => self.schedule_wait(job),
            _ if self.svc.queues.kind(&job.queue)
                == Some(QueueKind::Routing) =>
            {
                let should_route = self
                    .svc
                    .queues
                    .find_by_name(&job.queue)
                    .map(|q| queue::lock(&q).should_route(job.phase()))
                    .unwrap_or(false);
                if should_route {
                    self.engine.schedule_route(&job.id, Duration::ZERO);
                }
            },
            _ => {},
        }
    }

    /// Arranges for a waiting job to be released at its execution time.
    fn schedule_wait(&self, job: &Job) {
        let at = job
            .attrs
            .get(names::EXECUTION_TIME)
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or(0);
        let delay = Duration::from_secs((at - util::now()).max(0) as u64);
        self.svc.tasks.cancel_labelled(&job.id, "wait");

        let me = self.me.clone();
        let id = job.id.clone();
        self.svc.tasks.schedule(
            Trigger::after(delay),
            Some(&job.id),
            "wait",
            Box::new(move || {
                if let Some(server) = me.upgrade() {
                    server.end_wait(&id);
                }
            }),
        );
    }

    fn end_wait(&self, id: &str) {
        let Some(job_ref) = self.svc.store.get(id) else {
            return;
        };
        let mut job = store::lock(&job_ref);
        if job.state != JobState::Waiting || job.dispatching {
            return;
        }
        let phase = job.evaluate_phase(util::now());
        if phase == Phase::WAITING {
            self.schedule_wait(&job);
            return;
        }
        if let Err(error) = self.svc.queues.set_phase(&mut job, phase) {
            warn!(job_id = id, %error, "failed to release waiting job");
            return;
        }
        self.svc.store.save_or_log(&mut job, SaveMode::Quick);
        debug!(job_id = id, %phase, "execution time reached");
        self.after_requeue(&job);
    }

    // Receiving side.

    fn queue_job(
        &self,
        user: &str,
        job_id: String,
        destination: &str,
        attrs: Vec<Attribute>,
    ) -> Reply {
        let queue = if destination.is_empty() {
            self.config.default_queue.as_str()
        } else {
            destination
        };
        self.svc
            .queues
            .check_admission(queue)
            .map_err(|e| e.reply_code())?;

        let array_size = attrs
            .iter()
            .find(|a| a.name == names::ARRAY_REQUEST)
            .map(|a| self.parse_array_request(&a.value))
            .transpose()?;

        let id = if job_id.is_empty() {
            let id = self
                .svc
                .store
                .next_job_id(&self.config.server_name)
                .map_err(|error| {
                    error!(%error, "failed to allocate a job id");
                    ErrorCode::System
                })?;
            match array_size {
                Some(_) => parent_id_for(&id),
                None => id,
            }
        } else {
            job_id
        };
        if id.len() > MAX_JOB_ID_LEN || id.contains('/') {
            return Err(ErrorCode::BadAttrValue);
        }
        if self.svc.store.array(&id).is_some() {
            return Err(ErrorCode::JobExists);
        }

        if let Some(existing) = self.svc.store.get(&id) {
            let stale = {
                let job = store::lock(&existing);
                matches!(job.phase(), Phase::TRANS_IN | Phase::TRANS_ICM)
            };
            if !stale {
                return Err(ErrorCode::JobExists);
            }
            info!(job_id = %id, "replacing incomplete transfer");
            self.engine.purge_job(&id);
        }

        let mut job = Job::new(id.clone());
        job.attrs.apply(&attrs);
        if job.owner().is_empty() {
            job.set_attr(names::JOB_OWNER, user);
        }
        job.destin = Some(queue.to_owned());
        self.save(&mut job, SaveMode::Full)?;
        if self.svc.store.insert(job).is_none() {
            return Err(ErrorCode::JobExists);
        }

        info!(job_id = %id, queue, "receiving job");
        Ok(BatchReply::ok(ReplyBody::Queue(id)))
    }

    fn parse_array_request(&self, value: &str) -> Result<u32, ErrorCode> {
        match value.trim().parse::<u32>() {
            Ok(n) if n > 0 && n <= self.config.max_array_size => Ok(n),
            _ => Err(ErrorCode::BadAttrValue),
        }
    }

    fn job_data(
        &self,
        id: &str,
        kind: Option<FileKind>,
        seq: u32,
        data: &[u8],
    ) -> Reply {
        let job_ref = self.job_ref(id)?;
        let job = store::lock(&job_ref);
        if job.phase() != Phase::TRANS_IN {
            return Err(ErrorCode::BadState);
        }
        let res = match kind {
            None => self.svc.store.write_script(id, seq, data),
            Some(kind) => self.svc.store.write_run_file(id, kind, seq, data),
        };
        res.map_err(|error| {
            error!(job_id = id, %error, "failed to store job data");
            ErrorCode::System
        })?;
        debug!(job_id = id, ?kind, seq, len = data.len(), "stored chunk");
        let head = &data[..data.len().min(64)];
        trace!(head = util::bytes_to_human_str(head), "chunk head");
        null()
    }

    fn ready_to_commit(&self, id: &str) -> Reply {
        let Some(job_ref) = self.svc.store.get(id) else {
            return Err(self.missing(id));
        };
        let mut job = store::lock(&job_ref);
        match job.phase() {
            Phase::TRANS_IN => {
                job.set_phase(Phase::TRANS_ICM)
                    .map_err(|_| ErrorCode::BadState)?;
                self.save(&mut job, SaveMode::Quick)?;
            },
            Phase::TRANS_ICM => debug!(job_id = id, "repeated ready-to-commit"),
            _ => return Err(ErrorCode::JobExists),
        }
        Ok(BatchReply::ok(ReplyBody::ReadyToCommit(id.to_owned())))
    }

    /// Error for a commit-phase request naming a job this server lacks.
    fn missing(&self, id: &str) -> ErrorCode {
        if self.svc.store.array(id).is_some() {
            ErrorCode::JobExists
        } else {
            ErrorCode::UnknownJob
        }
    }

    fn commit(&self, id: &str) -> Reply {
        let Some(job_ref) = self.svc.store.get(id) else {
            return Err(self.missing(id));
        };
        let mut job = store::lock(&job_ref);
        match job.phase() {
            Phase::TRANS_ICM => {},
            p if p.state == JobState::Transit => {
                return Err(ErrorCode::BadState)
            },
            _ => return Err(ErrorCode::JobExists),
        }

        let queue = job
            .destin
            .clone()
            .unwrap_or_else(|| self.config.default_queue.clone());

        let array_size = match job.attrs.get(names::ARRAY_REQUEST) {
            Some(v) if is_parent_id(id) => Some(self.parse_array_request(v)?),
            _ => None,
        };
        if let Some(size) = array_size {
            self.expand_array(&job, &queue, size)?;
            drop(job);
            // The children stand in for the template from here on.
            self.engine.purge_job(id);
            return Ok(BatchReply::ok(ReplyBody::Commit(id.to_owned())));
        }

        let phase = job.evaluate_phase(util::now());
        self.svc
            .queues
            .enqueue(&mut job, &queue, phase)
            .map_err(|e| e.reply_code())?;
        job.destin = None;
        job.rejected_dests.clear();
        self.save(&mut job, SaveMode::Full)?;

        self.svc
            .notifier
            .account(AccountKind::Queued, id, &format!("queue={queue}"));
        info!(job_id = id, %queue, %phase, "job committed");
        self.after_requeue(&job);
        Ok(BatchReply::ok(ReplyBody::Commit(id.to_owned())))
    }

    /// Clones `template` into `size` children in `queue`.
    fn expand_array(
        &self,
        template: &Job,
        queue: &str,
        size: u32,
    ) -> Result<(), ErrorCode> {
        let store = &self.svc.store;
        let system = |error: store::StoreError| {
            error!(array_id = %template.id, %error, "array expansion failed");
            ErrorCode::System
        };

        let mut rec = ArrayRecord::new(template.id.clone(), size);
        store.save_array(rec.clone()).map_err(system)?;

        for index in 0..size {
            let child_id = rec.child_id(index);
            let mut child = Job::new(child_id.clone());
            child.attrs = template.attrs.clone();
            child.attrs.remove(names::ARRAY_REQUEST);
            child.set_attr(names::ARRAY_ID, template.id.clone());
            child.array = Some(ArrayMembership {
                parent_id: template.id.clone(),
                index,
            });
            child
                .set_phase(Phase::TRANS_ICM)
                .map_err(|_| ErrorCode::Internal)?;

            store.copy_script(&template.id, &child_id).map_err(system)?;
            let phase = child.evaluate_phase(util::now());
            self.svc
                .queues
                .enqueue(&mut child, queue, phase)
                .map_err(|e| e.reply_code())?;
            if let Err(code) = self.save(&mut child, SaveMode::Full) {
                let _ = self.svc.queues.dequeue(&mut child);
                return Err(code);
            }

            self.after_requeue(&child);
            if store.insert(child).is_none() {
                warn!(job_id = %child_id, "array child already present");
            }
            self.svc.notifier.account(
                AccountKind::Queued,
                &child_id,
                &format!("queue={queue}"),
            );
            rec.cloned = index + 1;
        }

        store.save_array(rec).map_err(system)?;
        info!(array_id = %template.id, size, queue, "array expanded");
        Ok(())
    }

    // Job control.

    fn delete_job(&self, user: &str, id: &str) -> Reply {
        if is_parent_id(id) {
            return self.delete_array(user, id);
        }
        self.delete_one(user, id)?;
        null()
    }

    fn delete_array(&self, user: &str, parent: &str) -> Reply {
        let mut rec =
            self.svc.store.array(parent).ok_or(ErrorCode::UnknownJob)?;
        let children = self.svc.store.array_children(parent);

        match children.first().and_then(|c| self.svc.store.get(c)) {
            Some(first) => self.authorize(user, &store::lock(&first))?,
            None => self.require_manager(user)?,
        }

        rec.deleting = true;
        self.svc.store.save_array(rec).map_err(|error| {
            error!(array_id = parent, %error, "failed to mark array deleting");
            ErrorCode::System
        })?;
        info!(array_id = parent, children = children.len(), "deleting array");

        for child in &children {
            if let Err(code) = self.delete_one(user, child) {
                debug!(job_id = %child, %code, "array child not deleted");
            }
        }
        if self.svc.store.array_children(parent).is_empty() {
            self.svc.store.remove_array(parent);
        }
        null()
    }

    fn delete_one(&self, user: &str, id: &str) -> Result<(), ErrorCode> {
        let job_ref = self.job_ref(id)?;
        let purge_now = {
            let mut job = store::lock(&job_ref);
            self.authorize(user, &job)?;

            match job.state {
                JobState::Complete => true,
                JobState::Running | JobState::Transit if job.dispatching => {
                    info!(job_id = id, "delete requested during dispatch");
                    job.deleted = true;
                    false
                },
                JobState::Running | JobState::Exiting => {
                    job.deleted = true;
                    if self.svc.nanny.is_active(id) {
                        debug!(job_id = id, "already being deleted");
                    } else {
                        self.svc.nanny.install(&mut job);
                    }
                    self.svc.store.save_or_log(&mut job, SaveMode::Quick);
                    false
                },
                JobState::Transit
                    if matches!(
                        job.substate,
                        JobSubstate::TransIn | JobSubstate::TransICM
                    ) =>
                {
                    true
                },
                JobState::Transit
                | JobState::Queued
                | JobState::Held
                | JobState::Waiting => {
                    self.abort_job(&mut job, &format!("deleted by {user}"));
                    self.in_deleting_array(&job)
                },
            }
        };

        self.svc
            .notifier
            .account(AccountKind::Deleted, id, &format!("requestor={user}"));
        if purge_now {
            self.engine.purge_job(id);
        }
        Ok(())
    }

    fn in_deleting_array(&self, job: &Job) -> bool {
        job.array
            .as_ref()
            .map(|a| self.svc.store.array_deleting(&a.parent_id))
            .unwrap_or(false)
    }

    /// Ends a job that is not running.
    fn abort_job(&self, job: &mut Job, reason: &str) {
        for phase in [Phase::ABORT, Phase::COMPLETE] {
            if let Err(error) = self.svc.queues.set_phase(job, phase) {
                warn!(job_id = %job.id, %error, "failed to abort job");
            }
        }
        job.set_attr(names::COMMENT, reason);
        job.destin = None;
        job.dispatching = false;
        self.svc.store.save_or_log(job, SaveMode::Full);
        self.svc.tasks.cancel_job(&job.id);
        info!(job_id = %job.id, reason, "job aborted");
    }

    fn hold_job(&self, user: &str, id: &str, hold: &str) -> Reply {
        let job_ref = self.job_ref(id)?;
        let mut job = store::lock(&job_ref);
        self.authorize(user, &job)?;
        if !job.state.is_movable() || job.dispatching {
            return Err(ErrorCode::BadState);
        }

        let hold = if hold.is_empty() { "u" } else { hold };
        job.set_attr(names::HOLD_TYPES, hold);
        self.svc
            .queues
            .set_phase(&mut job, Phase::HELD)
            .map_err(|e| e.reply_code())?;
        self.save(&mut job, SaveMode::Full)?;
        info!(job_id = id, hold, "job held");
        null()
    }

    fn release_job(&self, user: &str, id: &str, _hold: &str) -> Reply {
        let job_ref = self.job_ref(id)?;
        let mut job = store::lock(&job_ref);
        self.authorize(user, &job)?;
        if job.attrs.get(names::HOLD_TYPES).is_none()
            && job.state != JobState::Held
        {
            return null();
        }

        job.clear_attr(names::HOLD_TYPES);
        if job.state == JobState::Held && !job.dispatching {
            let phase = job.evaluate_phase(util::now());
            self.svc
                .queues
                .set_phase(&mut job, phase)
                .map_err(|e| e.reply_code())?;
        }
        self.save(&mut job, SaveMode::Full)?;
        info!(job_id = id, phase = %job.phase(), "job released");
        self.after_requeue(&job);
        null()
    }

    fn modify_job(&self, user: &str, id: &str, attrs: &[Attribute]) -> Reply {
        let job_ref = self.job_ref(id)?;
        let mut job = store::lock(&job_ref);
        self.authorize(user, &job)?;
        if !job.state.is_movable() || job.dispatching {
            return Err(ErrorCode::BadState);
        }

        for a in attrs {
            if READ_ONLY.contains(&a.name.as_str()) {
                return Err(ErrorCode::BadAttrValue);
            }
            if a.name == names::JOB_OWNER {
                self.require_manager(user)?;
            }
            if a.name == names::EXECUTION_TIME
                && a.value.parse::<i64>().is_err()
            {
                return Err(ErrorCode::BadAttrValue);
            }
        }
        if !job.attrs.apply(attrs) {
            return null();
        }
        job.modified = true;

        let phase = job.evaluate_phase(util::now());
        self.svc
            .queues
            .set_phase(&mut job, phase)
            .map_err(|e| e.reply_code())?;
        self.save(&mut job, SaveMode::Full)?;
        let changed = attrs.iter().map(|a| &a.name).join(",");
        info!(job_id = id, %changed, "job modified");
        self.after_requeue(&job);
        null()
    }

    fn check_modify(&self, user: &str, id: &str) -> Result<(), ErrorCode> {
        let job_ref = self.job_ref(id)?;
        let job = store::lock(&job_ref);
        self.authorize(user, &job)
    }

    async fn move_job(&self, user: &str, id: &str, destination: &str) -> Reply {
        self.check_modify(user, id)?;
        self.engine.move_job(id, destination).await?;
        null()
    }

    async fn run_job(
        &self,
        user: &str,
        id: &str,
        destination: &str,
        wait: bool,
    ) -> Reply {
        self.require_manager(user)?;
        let host = (!destination.is_empty()).then(|| destination.to_owned());

        if wait {
            self.engine.execute(id, host.as_deref()).await?;
            return null();
        }

        self.engine.check_runnable(id)?;
        let engine = Arc::clone(&self.engine);
        let id = id.to_owned();
        tokio::spawn(async move {
            if let Err(code) = engine.execute(&id, host.as_deref()).await {
                warn!(job_id = %id, %code, "asynchronous run failed");
            }
        });
        null()
    }

    fn rerun_job(&self, user: &str, id: &str) -> Reply {
        let job_ref = self.job_ref(id)?;
        let mut job = store::lock(&job_ref);
        self.authorize(user, &job)?;
        if job.phase() != Phase::RUNNING || job.dispatching {
            return Err(ErrorCode::BadState);
        }

        self.svc
            .queues
            .set_phase(&mut job, Phase::RERUN)
            .map_err(|e| e.reply_code())?;
        if let Some(host) = &job.exec_host {
            self.signaller.signal(id, host, SIGTERM);
        }
        self.svc.store.save_or_log(&mut job, SaveMode::Quick);
        self.svc
            .notifier
            .account(AccountKind::Rerun, id, &format!("requestor={user}"));
        null()
    }

    fn signal_job(&self, user: &str, id: &str, signal: &str) -> Reply {
        let job_ref = self.job_ref(id)?;
        let job = store::lock(&job_ref);
        self.authorize(user, &job)?;
        match (&job.exec_host, job.state, job.dispatching) {
            (Some(host), JobState::Running, false) => {
                self.signaller.signal(id, host, signal);
                null()
            },
            _ => Err(ErrorCode::BadState),
        }
    }

    fn order_job(&self, user: &str, a: &str, b: &str) -> Reply {
        let snapshot = |id: &str| -> Result<Job, ErrorCode> {
            let job = store::lock(&self.job_ref(id)?).clone();
            self.authorize(user, &job)?;
            if !job.state.is_movable() {
                return Err(ErrorCode::BadState);
            }
            Ok(job)
        };
        let (a, b) = (snapshot(a)?, snapshot(b)?);
        self.svc
            .queues
            .order_jobs(&a, &b)
            .map_err(|e| e.reply_code())?;
        null()
    }

    // Queries.

    fn locate_job(&self, id: &str) -> Reply {
        if self.svc.store.contains(id) || self.svc.store.array(id).is_some() {
            Ok(BatchReply::ok(ReplyBody::Locate(self.config.server_id())))
        } else {
            Err(ErrorCode::UnknownJob)
        }
    }

    fn job_status(&self, job: &Job, want: &[Attribute]) -> StatusEntry {
        let mut attrs: Vec<Attribute> = job.attrs.iter().collect();
        attrs.push(Attribute::new("job_state", job.state.letter().to_string()));
        attrs.push(Attribute::new("substate", job.substate.code().to_string()));
        attrs.push(Attribute::new("server", self.config.server_name.clone()));
        if !job.queue.is_empty() {
            attrs.push(Attribute::new("queue", job.queue.clone()));
        }
        if !want.is_empty() {
            attrs.retain(|a| want.iter().any(|w| w.name == a.name));
        }
        StatusEntry {
            name: job.id.clone(),
            attrs,
        }
    }

    fn status_job(&self, id: &str, want: &[Attribute]) -> Reply {
        let ids = if id.is_empty() {
            self.svc.store.ids()
        } else if is_parent_id(id) {
            if self.svc.store.array(id).is_none() {
                return Err(ErrorCode::UnknownJob);
            }
            self.svc.store.array_children(id)
        } else {
            if !self.svc.store.contains(id) {
                return Err(ErrorCode::UnknownJob);
            }
            vec![id.to_owned()]
        };

        let entries = ids
            .iter()
            .filter_map(|id| self.svc.store.get(id))
            .map(|job| self.job_status(&store::lock(&job), want))
            .collect();
        Ok(BatchReply::ok(ReplyBody::Status(entries)))
    }

    fn status_queue(&self, name: &str) -> Reply {
        let names = if name.is_empty() {
            self.svc.queues.names()
        } else {
            vec![name.to_owned()]
        };
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let q = self
                .svc
                .queues
                .find_by_name(&name)
                .map_err(|e| e.reply_code())?;
            let attrs = queue::lock(&q).status();
            entries.push(StatusEntry { name, attrs });
        }
        Ok(BatchReply::ok(ReplyBody::Status(entries)))
    }

    fn status_server(&self) -> BatchReply {
        let counts = self.svc.queues.state_counts();
        let state_count = JobState::ALL
            .iter()
            .zip(counts)
            .map(|(s, c)| format!("{s}:{c}"))
            .join(" ");
        let state = if self.cancel.is_cancelled() {
            "Terminating"
        } else {
            "Active"
        };

        let attrs = vec![
            Attribute::new("server_state", state),
            Attribute::new("total_jobs", self.svc.store.len().to_string()),
            Attribute::new("state_count", state_count),
            Attribute::new("default_queue", self.config.default_queue.clone()),
            Attribute::new("managers", self.config.managers.iter().join(",")),
            Attribute::new("pending_tasks", self.svc.tasks.len().to_string()),
            Attribute::new(
                "connections",
                self.svc.registry.active().to_string(),
            ),
        ];
        BatchReply::ok(ReplyBody::Status(vec![StatusEntry {
            name: self.config.server_name.clone(),
            attrs,
        }]))
    }

    // Server control and execution host reports.

    fn shutdown(&self, user: &str, manner: u32) -> Reply {
        self.require_manager(user)?;
        info!(user, manner, "shutdown requested");
        self.cancel.cancel();
        null()
    }

    fn job_obit(
        &self,
        user: &str,
        id: &str,
        exit_status: i32,
        attrs: &[Attribute],
    ) -> Reply {
        self.require_manager(user)?;
        let job_ref = self.job_ref(id)?;

        let purge_now = {
            let mut job = store::lock(&job_ref);
            let live =
                matches!(job.state, JobState::Running | JobState::Exiting);
            if !live || job.dispatching {
                return Err(ErrorCode::BadState);
            }
            job.attrs.apply(attrs);
            job.set_attr(names::EXIT_STATUS, exit_status.to_string());
            job.svrflags.remove(SvrFlags::DELETE_PENDING);

            if job.substate.is_rerun() && !job.deleted {
                self.engine.requeue_from_host(&mut job);
                info!(job_id = id, exit_status, "job requeued for rerun");
                self.after_requeue(&job);
                false
            } else {
                for phase in [Phase::EXITING, Phase::COMPLETE] {
                    let res = self.svc.queues.set_phase(&mut job, phase);
                    if let Err(error) = res {
                        warn!(job_id = id, %error, "failed to complete job");
                    }
                }
                self.svc.store.save_or_log(&mut job, SaveMode::Full);
                self.svc.notifier.account(
                    AccountKind::Exited,
                    id,
                    &format!("exit_status={exit_status}"),
                );
                drop(self.svc.notifier.notify_owner(
                    &job,
                    &format!("Job ended with exit status {exit_status}"),
                ));
                self.in_deleting_array(&job)
            }
        };

        self.svc.nanny.cancel(id);
        self.svc.tasks.signal_event(&TaskEvent::JobObit(id.to_owned()));
        if purge_now {
            self.engine.purge_job(id);
        }
        null()
    }
}
