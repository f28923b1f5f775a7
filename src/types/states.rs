use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse job state, as reported to clients.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub enum JobState {
    Transit,
    Queued,
    Held,
    Waiting,
    Running,
    Exiting,
    Complete,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Transit,
        JobState::Queued,
        JobState::Held,
        JobState::Waiting,
        JobState::Running,
        JobState::Exiting,
        JobState::Complete,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Single-letter form used in status output.
    pub fn letter(self) -> char {
        use JobState::*;

        match self {
            Transit => 'T',
            Queued => 'Q',
            Held => 'H',
            Waiting => 'W',
            Running => 'R',
            Exiting => 'E',
            Complete => 'C',
        }
    }

    /// States a job may be routed or moved out of.
    pub fn is_movable(self) -> bool {
        matches!(self, JobState::Queued | JobState::Held | JobState::Waiting)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JobState::*;

        f.write_str(match self {
            Transit => "transit",
            Queued => "queued",
            Held => "held",
            Waiting => "waiting",
            Running => "running",
            Exiting => "exiting",
            Complete => "complete",
        })
    }
}

/// Fine-grained phase within a [`JobState`]. The substate is what makes a
/// retried dispatch resumable at the right protocol step.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub enum JobSubstate {
    /// Being received; no commit yet.
    TransIn,
    /// Received and ready-to-commit acknowledged; awaiting commit.
    TransICM,
    /// Being sent; the destination has not yet acknowledged ready-to-commit.
    TransOut,
    /// Being sent; ready-to-commit acknowledged, commit outstanding.
    TransOutCommit,
    Queued,
    Held,
    Waiting,
    /// Being dispatched to an execution host.
    Prerun,
    Running,
    Exiting,
    /// Deleted while not running, or a terminal rejection.
    Abort,
    /// Rerun requested; the execution host is cleaning up.
    Rerun,
    Complete,
}

impl JobSubstate {
    const ALL: [JobSubstate; 13] = [
        JobSubstate::TransIn,
        JobSubstate::TransICM,
        JobSubstate::TransOut,
        JobSubstate::TransOutCommit,
        JobSubstate::Queued,
        JobSubstate::Held,
        JobSubstate::Waiting,
        JobSubstate::Prerun,
        JobSubstate::Running,
        JobSubstate::Exiting,
        JobSubstate::Abort,
        JobSubstate::Rerun,
        JobSubstate::Complete,
    ];

    /// Numeric form stored in the critical record and shown in status.
    pub fn code(self) -> u8 {
        use JobSubstate::*;

        match self {
            TransIn => 0,
            TransICM => 1,
            TransOut => 2,
            TransOutCommit => 3,
            Queued => 10,
            Held => 20,
            Waiting => 30,
            Prerun => 41,
            Running => 42,
            Exiting => 50,
            Abort => 58,
            Complete => 59,
            Rerun => 60,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    pub fn is_rerun(self) -> bool {
        self == JobSubstate::Rerun
    }
}

impl fmt::Display for JobSubstate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A (state, substate) pair.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub state: JobState,
    pub substate: JobSubstate,
}

impl Phase {
    pub const fn new(state: JobState, substate: JobSubstate) -> Self {
        Self { state, substate }
    }

    pub const TRANS_IN: Phase =
        Phase::new(JobState::Transit, JobSubstate::TransIn);
    pub const TRANS_ICM: Phase =
        Phase::new(JobState::Transit, JobSubstate::TransICM);
    pub const TRANS_OUT: Phase =
        Phase::new(JobState::Transit, JobSubstate::TransOut);
    pub const TRANS_OUT_COMMIT: Phase =
        Phase::new(JobState::Transit, JobSubstate::TransOutCommit);
    pub const QUEUED: Phase = Phase::new(JobState::Queued, JobSubstate::Queued);
    pub const HELD: Phase = Phase::new(JobState::Held, JobSubstate::Held);
    pub const WAITING: Phase =
        Phase::new(JobState::Waiting, JobSubstate::Waiting);
    pub const PRERUN: Phase =
        Phase::new(JobState::Running, JobSubstate::Prerun);
    pub const EXEC_COMMIT: Phase =
        Phase::new(JobState::Running, JobSubstate::TransOutCommit);
    pub const RUNNING: Phase =
        Phase::new(JobState::Running, JobSubstate::Running);
    pub const EXITING: Phase =
        Phase::new(JobState::Exiting, JobSubstate::Exiting);
    pub const ABORT: Phase = Phase::new(JobState::Exiting, JobSubstate::Abort);
    pub const RERUN: Phase = Phase::new(JobState::Exiting, JobSubstate::Rerun);
    pub const COMPLETE: Phase =
        Phase::new(JobState::Complete, JobSubstate::Complete);

    /// Whether this pair is one of the enumerated legal combinations.
    pub fn is_legal(self) -> bool {
        use JobState as S;
        use JobSubstate as SS;

        match self.state {
            S::Transit => matches!(
                self.substate,
                SS::TransIn | SS::TransICM | SS::TransOut | SS::TransOutCommit
            ),
            S::Queued => self.substate == SS::Queued,
            S::Held => self.substate == SS::Held,
            S::Waiting => self.substate == SS::Waiting,
            S::Running => matches!(
                self.substate,
                SS::Prerun | SS::TransOutCommit | SS::Running
            ),
            S::Exiting => {
                matches!(self.substate, SS::Exiting | SS::Abort | SS::Rerun)
            },
            S::Complete => self.substate == SS::Complete,
        }
    }

    /// Whether a job may go from `self` to `to`.
    pub fn can_transition(self, to: Phase) -> bool {
        use JobState as S;
        use JobSubstate as SS;

        if !self.is_legal() || !to.is_legal() {
            return false;
        }

        match (self.state, self.substate, to.state, to.substate) {
            // Receiving side.
            (S::Transit, SS::TransIn, S::Transit, SS::TransICM) => true,
            (S::Transit, SS::TransICM, S::Queued | S::Held | S::Waiting, _) => {
                true
            },

            // Sending side: route/move begin, commit phase, revert.
            (S::Queued | S::Held | S::Waiting, _, S::Transit, SS::TransOut) => {
                true
            },
            (S::Transit, SS::TransOut, S::Transit, SS::TransOutCommit) => true,
            (
                S::Transit,
                SS::TransOut | SS::TransOutCommit,
                S::Queued | S::Held | S::Waiting,
                _,
            ) => true,

            // Execution dispatch.
            (S::Queued, _, S::Running, SS::Prerun) => true,
            (S::Running, SS::Prerun, S::Running, SS::TransOutCommit) => true,
            (
                S::Running,
                SS::Prerun | SS::TransOutCommit,
                S::Running,
                SS::Running,
            ) => true,
            (S::Running, SS::Prerun | SS::TransOutCommit, S::Queued, _) => true,

            // Hold, release, wait.
            (
                S::Queued | S::Held | S::Waiting,
                _,
                S::Queued | S::Held | S::Waiting,
                _,
            ) => true,

            // Termination.
            (S::Running, SS::Running, S::Exiting, _) => true,
            (S::Running, SS::Running, S::Complete, _) => true,
            (S::Exiting, _, S::Exiting, _) => true,
            (S::Exiting, _, S::Complete, _) => true,
            (S::Exiting, from, S::Queued, _) => from.is_rerun(),

            // Delete or terminal rejection of a job that is not running.
            (
                S::Queued | S::Held | S::Waiting | S::Transit,
                _,
                S::Exiting,
                SS::Abort,
            ) => true,
            (S::Transit, SS::TransOut | SS::TransOutCommit, S::Complete, _) => {
                true
            },

            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.substate)
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum StateError {
    #[error("illegal state pair {0}")]
    IllegalPair(Phase),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for s in JobState::ALL {
            assert_eq!(JobState::from_code(s.code()), Some(s));
        }
        for ss in JobSubstate::ALL {
            assert_eq!(JobSubstate::from_code(ss.code()), Some(ss));
        }
        assert_eq!(JobState::from_code(7), None);
        assert_eq!(JobSubstate::from_code(99), None);
    }

    #[test]
    fn illegal_pairs_are_rejected() {
        assert!(!Phase::new(JobState::Queued, JobSubstate::Running).is_legal());
        let done_queued = Phase::new(JobState::Complete, JobSubstate::Queued);
        assert!(!done_queued.is_legal());
        let queued_abort = Phase::new(JobState::Queued, JobSubstate::Abort);
        assert!(!Phase::QUEUED.can_transition(queued_abort));
    }

    #[test]
    fn transition_table() {
        #[track_caller]
        fn ok(from: Phase, to: Phase) {
            assert!(from.can_transition(to), "{from} -> {to} should be legal");
        }

        #[track_caller]
        fn no(from: Phase, to: Phase) {
            let msg = format!("{from} -> {to} should be illegal");
            assert!(!from.can_transition(to), "{msg}");
        }

        ok(Phase::TRANS_IN, Phase::TRANS_ICM);
        ok(Phase::TRANS_ICM, Phase::QUEUED);
        no(Phase::TRANS_IN, Phase::QUEUED);

        ok(Phase::QUEUED, Phase::TRANS_OUT);
        ok(Phase::HELD, Phase::TRANS_OUT);
        ok(Phase::TRANS_OUT, Phase::TRANS_OUT_COMMIT);
        ok(Phase::TRANS_OUT_COMMIT, Phase::QUEUED);
        no(Phase::TRANS_OUT_COMMIT, Phase::TRANS_OUT);
        no(Phase::RUNNING, Phase::TRANS_OUT);

        ok(Phase::QUEUED, Phase::PRERUN);
        no(Phase::HELD, Phase::PRERUN);
        ok(Phase::PRERUN, Phase::EXEC_COMMIT);
        ok(Phase::EXEC_COMMIT, Phase::RUNNING);
        ok(Phase::PRERUN, Phase::QUEUED);
        no(Phase::RUNNING, Phase::QUEUED);

        ok(Phase::RUNNING, Phase::RERUN);
        ok(Phase::RERUN, Phase::QUEUED);
        no(Phase::EXITING, Phase::QUEUED);
        ok(Phase::EXITING, Phase::COMPLETE);

        ok(Phase::QUEUED, Phase::ABORT);
        ok(Phase::ABORT, Phase::COMPLETE);
        no(Phase::COMPLETE, Phase::QUEUED);
        no(Phase::COMPLETE, Phase::COMPLETE);
    }
}
