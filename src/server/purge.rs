//! Removal of completed jobs once their retention period has passed.
use std::time::Duration;

use tracing::{debug, info};

use super::Server;
use crate::config::PurgeConfig;
use crate::nanny::DeleteNanny;
use crate::store::{self, JobStore};
use crate::task::Trigger;
use crate::types::job::Job;
use crate::types::states::JobState;
use crate::util;

#[derive(Clone, Debug)]
pub struct PurgePolicy {
    keep: i64,
    interval: Duration,
}

impl PurgePolicy {
    pub fn new(cfg: &PurgeConfig) -> Self {
        Self {
            keep: cfg.keep_completed_secs.min(i64::MAX as u64) as i64,
            interval: Duration::from_secs(cfg.sweep_interval_secs.max(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `job` may be removed now. Jobs with a delete in progress and
    /// children of an array being deleted are left to whoever is deleting them.
    pub fn is_purgeable(
        &self,
        job: &Job,
        now: i64,
        nanny: &DeleteNanny,
        store: &JobStore,
    ) -> bool {
        job.state == JobState::Complete
            && now - job.state_time >= self.keep
            && !job.dispatching
            && !nanny.is_active(&job.id)
            && !job
                .array
                .as_ref()
                .is_some_and(|a| store.array_deleting(&a.parent_id))
    }
}

impl Server {
    /// Purges every completed job past its retention. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = util::now();
        let doomed: Vec<String> = self
            .svc
            .store
            .ids()
            .into_iter()
            .filter(|id| {
                self.svc.store.get(id).is_some_and(|job| {
                    self.purge.is_purgeable(
                        &store::lock(&job),
                        now,
                        &self.svc.nanny,
                        &self.svc.store,
                    )
                })
            })
            .collect();

        for id in &doomed {
            self.engine.purge_job(id);
        }
        if doomed.is_empty() {
            debug!("nothing to purge");
        } else {
            info!(purged = doomed.len(), "purged completed jobs");
        }
        doomed.len()
    }

    pub(crate) fn schedule_sweep(&self) {
        let me = self.me.clone();
        self.svc.tasks.schedule(
            Trigger::after(self.purge.interval()),
            None,
            "purge",
            Box::new(move || {
                if let Some(server) = me.upgrade() {
                    server.sweep();
                    server.schedule_sweep();
                }
            }),
        );
    }
}
