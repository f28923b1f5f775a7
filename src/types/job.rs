use std::collections::BTreeSet;

use bitflags::bitflags;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::attribute::{names, AttributeMap};
use super::states::{JobState, JobSubstate, Phase, StateError};

/// Longest job id the server accepts; it must fit the critical record.
pub const MAX_JOB_ID_LEN: usize = 86;

bitflags! {
    /// Server-side job flags kept in the critical record.
    pub struct SvrFlags: u32 {
        /// The job has been dispatched to an execution host at least once.
        const HAS_RUN = 1 << 0;
        /// Input files were staged in on the execution host.
        const STAGED_IN = 1 << 1;
        /// The job has a checkpoint image.
        const CHECKPOINTED = 1 << 2;
        /// The checkpoint may be restarted on another host.
        const CHKPT_MIGRATEABLE = 1 << 3;
        /// Restart from checkpoint when next run.
        const HOT_START = 1 << 4;
        /// A delete was requested while the job was running.
        const DELETE_PENDING = 1 << 5;
        /// Checkpoint files were copied to the execution host.
        const CHKPT_COPIED = 1 << 6;
    }
}

/// Position of a job inside a job array.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArrayMembership {
    pub parent_id: String,
    pub index: u32,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub substate: JobSubstate,
    pub svrflags: SvrFlags,
    /// Name of the queue the job is linked into; empty while not in one.
    pub queue: String,
    /// Where the current route/move/exec attempt is aimed.
    pub destin: Option<String>,
    pub exec_host: Option<String>,
    pub session_id: Option<i64>,
    pub attrs: AttributeMap,
    pub array: Option<ArrayMembership>,
    /// Seconds since the epoch the job entered its current queue.
    pub queue_time: i64,
    /// Seconds since the epoch of the last state change.
    pub state_time: i64,
    /// Destinations that rejected this job while routing.
    pub rejected_dests: BTreeSet<String>,
    /// Set by a delete while a dispatch attempt is in flight.
    pub deleted: bool,
    /// A dispatch attempt currently owns this job.
    pub dispatching: bool,
    /// Attributes changed since the last full save.
    pub modified: bool,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();

        Self {
            id: id.into(),
            state: JobState::Transit,
            substate: JobSubstate::TransIn,
            svrflags: SvrFlags::empty(),
            queue: String::new(),
            destin: None,
            exec_host: None,
            session_id: None,
            attrs: AttributeMap::new(),
            array: None,
            queue_time: now,
            state_time: now,
            rejected_dests: BTreeSet::new(),
            deleted: false,
            dispatching: false,
            modified: true,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::new(self.state, self.substate)
    }

    /// Moves the job to `to`, rejecting transitions outside the table.
    ///
    /// Callers that keep queue counters must go through
    /// [`crate::queue::QueueManager::set_phase`] instead.
    pub fn set_phase(&mut self, to: Phase) -> Result<(), StateError> {
        let from = self.phase();
        if !to.is_legal() {
            return Err(StateError::IllegalPair(to));
        }
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(StateError::IllegalTransition { from, to });
        }
        self.state = to.state;
        self.substate = to.substate;
        self.state_time = Utc::now().timestamp();
        Ok(())
    }

    pub fn owner(&self) -> &str {
        self.attrs.get(names::JOB_OWNER).unwrap_or("")
    }

    /// Owner user name without the submit host.
    pub fn owner_user(&self) -> &str {
        let owner = self.owner();
        owner.split_once('@').map(|(u, _)| u).unwrap_or(owner)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        if self.attrs.set(name, value) {
            self.modified = true;
        }
    }

    pub fn clear_attr(&mut self, name: &str) {
        if self.attrs.remove(name) {
            self.modified = true;
        }
    }

    /// The state a job should take when it (re)enters a queue, from its hold
    /// and execution-time attributes.
    pub fn evaluate_phase(&self, now: i64) -> Phase {
        let held = self
            .attrs
            .get(names::HOLD_TYPES)
            .map(|h| !h.is_empty() && h != "n")
            .unwrap_or(false);
        if held {
            return Phase::HELD;
        }

        let waiting = self
            .attrs
            .get(names::EXECUTION_TIME)
            .and_then(|t| t.parse::<i64>().ok())
            .map(|t| t > now)
            .unwrap_or(false);
        if waiting {
            return Phase::WAITING;
        }

        Phase::QUEUED
    }

    /// Array index, or 0 for plain jobs.
    pub fn array_index(&self) -> u32 {
        self.array.as_ref().map(|a| a.index).unwrap_or(0)
    }
}

/// Splits a job id into its sequence part and server part.
pub fn split_job_id(id: &str) -> (&str, &str) {
    id.split_once('.').unwrap_or((id, ""))
}
