//! Startup reconciliation of the spool.
//!
//! Every job file found is brought back into the tables, then nudged out of
//! whatever half-finished exchange the previous run left it in:
//!
//! * a job still arriving (`TransIn`) is discarded; its sender will retry,
//! * a job ready to commit (`TransICM`) waits, unqueued, for the commit,
//! * a job leaving before its commit (`TransOut`) goes back to its queue,
//! * a job leaving inside its commit (`TransOutCommit`) resumes at the commit,
//! * a job caught starting on an execution host is requeued,
//! * a running job with a delete in progress gets a fresh nanny.
use std::time::Duration;

use tracing::{info, warn};

use super::Server;
use crate::store::array::is_parent_id;
use crate::store::{self, StoreError};
use crate::types::job::{Job, SvrFlags};
use crate::types::states::{JobState, Phase};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Jobs back in the tables.
    pub recovered: usize,
    /// Jobs thrown away.
    pub discarded: usize,
    /// Jobs put back into their queue after an interrupted dispatch.
    pub requeued: usize,
    /// Moves picked up again at the commit.
    pub resumed: usize,
    /// Array descriptors with no children left.
    pub arrays_dropped: usize,
}

enum Fate {
    Discard,
    Keep { nanny: bool },
}

impl Server {
    /// Loads the spool into the tables. Call once, before serving.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut jobs = self.svc.store.recover()?;
        // Restores each queue's order.
        jobs.sort_by_key(|j| j.queue_time);

        let mut report = RecoveryReport::default();
        for mut job in jobs {
            let id = job.id.clone();
            match self.reconcile(&mut job, &mut report) {
                Fate::Discard => {
                    self.svc.store.purge(&id);
                    report.discarded += 1;
                },
                Fate::Keep { nanny } => {
                    let Some(job_ref) = self.svc.store.insert(job) else {
                        warn!(job_id = %id, "duplicate job file");
                        continue;
                    };
                    if nanny {
                        let mut job = store::lock(&job_ref);
                        self.svc.nanny.install(&mut job);
                    }
                    report.recovered += 1;
                },
            }
        }

        for parent in self.svc.store.array_ids() {
            if self.svc.store.array_children(&parent).is_empty() {
                self.svc.store.remove_array(&parent);
                report.arrays_dropped += 1;
            }
        }

        info!(
            recovered = report.recovered,
            discarded = report.discarded,
            requeued = report.requeued,
            resumed = report.resumed,
            arrays_dropped = report.arrays_dropped,
            "recovery complete"
        );
        Ok(report)
    }

    fn reconcile(&self, job: &mut Job, report: &mut RecoveryReport) -> Fate {
        let queue = std::mem::take(&mut job.queue);
        let queue_time = job.queue_time;
        job.dispatching = false;
        job.deleted = false;

        match job.phase() {
            Phase::TRANS_IN => {
                info!(job_id = %job.id, "discarding incomplete transfer");
                return Fate::Discard;
            },
            Phase::TRANS_ICM => {
                if is_parent_id(&job.id)
                    && self.svc.store.array(&job.id).is_some()
                {
                    info!(
                        job_id = %job.id,
                        "discarding expanded array template"
                    );
                    return Fate::Discard;
                }
                return Fate::Keep { nanny: false };
            },
            _ => {},
        }

        if !self.svc.queues.exists(&queue) {
            warn!(
                job_id = %job.id,
                %queue,
                "queue no longer exists, discarding job"
            );
            return Fate::Discard;
        }
        let phase = job.phase();
        if let Err(error) = self.svc.queues.enqueue(job, &queue, phase) {
            warn!(job_id = %job.id, %error, "failed to requeue recovered job");
            return Fate::Discard;
        }
        job.queue_time = queue_time;

        match job.phase() {
            Phase::TRANS_OUT => {
                self.engine.revert_transit(job);
                report.requeued += 1;
                self.after_requeue(job);
            },
            Phase::TRANS_OUT_COMMIT => {
                self.engine.schedule_resume(&job.id, Duration::ZERO);
                report.resumed += 1;
            },
            Phase::PRERUN | Phase::EXEC_COMMIT => {
                self.engine.requeue_from_host(job);
                report.requeued += 1;
                self.after_requeue(job);
            },
            p if p.state.is_movable() => self.after_requeue(job),
            p if matches!(p.state, JobState::Running | JobState::Exiting) => {
                return Fate::Keep {
                    nanny: job.svrflags.contains(SvrFlags::DELETE_PENDING),
                };
            },
            _ => {},
        }
        Fate::Keep { nanny: false }
    }
}
