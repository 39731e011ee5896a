use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::states::JobState;
use crate::error::{Error, Result};

/// The unit of work held by a tube.
///
/// A job is exclusively owned by the tube holding it; the tube's lock is
/// the only writer gate, so the job itself carries no synchronisation. The
/// transition methods enforce the legal lifecycle edges:
///
/// ```text
///    put with delay               release with delay
///   ----------------> [DELAYED] <------------.
///                         |                   |
///                         | (time passes)     |
///                         |                   |
///    put                  v     reserve       |       delete
///   -----------------> [READY] ---------> [RESERVED] --------> *poof*
///                        ^  ^                |  |
///                        |   \  release      |  |
///                        |    `-------------'   |
///                        | kick / time passes   |
///                        |                      |
///                        |       bury           |
///                     [BURIED] <---------------'
///                        |
///                        |  delete
///                         `--------> *poof*
/// ```
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub pri: i64,
    pub data: Bytes,
    pub delay: Duration,
    pub ttr: Duration,
    state: JobState,
    pub created: Instant,
    /// Stamp of the ready/delayed queue entry currently pointing at this
    /// job. Entries with a stale stamp are skipped when popped.
    pub(crate) queue_seq: u64,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl Job {
    /// Creates a job in the ready state (zero delay) or the delayed state.
    pub(crate) fn new(
        id: u64,
        pri: i64,
        delay: Duration,
        ttr: Duration,
        data: Bytes,
        now: Instant,
    ) -> Self {
        let state = if delay.is_zero() {
            JobState::Ready
        } else {
            JobState::Delayed { until: now + delay }
        };

        Self {
            id,
            pri,
            data,
            delay,
            ttr,
            state,
            created: now,
            queue_seq: 0,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// READY is reachable from the delayed, reserved, and buried states.
    pub(crate) fn set_ready(&mut self) -> Result<()> {
        use JobState::*;

        match self.state {
            Delayed { until: _ } | Reserved { deadline: _ } | Buried => {
                self.state = Ready;
                Ok(())
            },
            _ => Err(self.bad_transition("ready")),
        }
    }

    /// DELAYED is reachable from RESERVED only (a release with delay).
    pub(crate) fn set_delayed(
        &mut self,
        delay: Duration,
        now: Instant,
    ) -> Result<()> {
        match self.state {
            JobState::Reserved { deadline: _ } => {
                self.delay = delay;
                self.state = JobState::Delayed { until: now + delay };
                Ok(())
            },
            _ => Err(self.bad_transition("delayed")),
        }
    }

    /// RESERVED is reachable from READY only. Starts the TTR window.
    pub(crate) fn set_reserved(&mut self, now: Instant) -> Result<()> {
        match self.state {
            JobState::Ready => {
                self.state = JobState::Reserved {
                    deadline: now + self.ttr,
                };
                self.reserves += 1;
                Ok(())
            },
            _ => Err(self.bad_transition("reserved")),
        }
    }

    /// BURIED is reachable from RESERVED only. A buried job must be kicked
    /// back to ready before it can be reserved again.
    pub(crate) fn set_buried(&mut self) -> Result<()> {
        match self.state {
            JobState::Reserved { deadline: _ } => {
                self.state = JobState::Buried;
                self.buries += 1;
                Ok(())
            },
            _ => Err(self.bad_transition("buried")),
        }
    }

    /// Restarts the TTR window of a reserved job.
    pub(crate) fn touch(&mut self, now: Instant) -> Result<()> {
        match self.state {
            JobState::Reserved { deadline: _ } => {
                self.state = JobState::Reserved {
                    deadline: now + self.ttr,
                };
                Ok(())
            },
            _ => Err(Error::NotReserved(self.id)),
        }
    }

    /// Deletion is legal from the reserved and buried states only. Ready
    /// and delayed jobs must be reserved first.
    pub(crate) fn deletable(&self) -> bool {
        matches!(
            self.state,
            JobState::Reserved { deadline: _ } | JobState::Buried
        )
    }

    /// Seconds until this job leaves a time-bound state, for stats.
    pub fn time_left(&self, now: Instant) -> Duration {
        match self.state {
            JobState::Delayed { until } => {
                until.saturating_duration_since(now)
            },
            JobState::Reserved { deadline } => {
                deadline.saturating_duration_since(now)
            },
            _ => Duration::ZERO,
        }
    }

    fn bad_transition(&self, to: &'static str) -> Error {
        Error::InvalidTransition {
            from: self.state.name(),
            to,
        }
    }
}

/// A read-only snapshot of a job handed to a reserving or peeking client.
/// The job itself stays owned by the tube.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobView {
    pub id: u64,
    pub pri: i64,
    pub data: Bytes,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            pri: job.pri,
            data: job.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(delay: u64) -> Job {
        Job::new(
            1,
            100,
            Duration::from_secs(delay),
            Duration::from_secs(60),
            Bytes::from_static(b"payload"),
            Instant::now(),
        )
    }

    // Asserts an attempted transition fails and leaves the state unchanged.
    #[track_caller]
    fn refused(res: Result<()>, j: &Job, was: JobState) {
        assert!(matches!(res, Err(Error::InvalidTransition { .. })));
        assert_eq!(j.state(), was);
    }

    #[test]
    fn test_new_job_state_follows_delay() {
        assert_eq!(job(0).state(), JobState::Ready);
        assert_eq!(job(5).state().name(), "delayed");
    }

    #[test]
    fn test_legal_lifecycle() {
        let now = Instant::now();
        let mut j = job(0);

        j.set_reserved(now).unwrap();
        assert_eq!(
            j.state(),
            JobState::Reserved {
                deadline: now + Duration::from_secs(60)
            }
        );
        assert_eq!(j.reserves, 1);

        // release with delay, then promote
        j.set_delayed(Duration::from_secs(3), now).unwrap();
        assert_eq!(
            j.state(),
            JobState::Delayed {
                until: now + Duration::from_secs(3)
            }
        );
        j.set_ready().unwrap();

        // reserve, bury, kick
        j.set_reserved(now).unwrap();
        j.set_buried().unwrap();
        assert_eq!(j.buries, 1);
        j.set_ready().unwrap();
        assert_eq!(j.state(), JobState::Ready);
    }

    #[test]
    fn test_illegal_edges_refused() {
        let now = Instant::now();

        // From READY: only RESERVED is legal.
        let mut j = job(0);
        refused(j.set_ready(), &j, JobState::Ready);
        refused(
            j.set_delayed(Duration::from_secs(1), now),
            &j,
            JobState::Ready,
        );
        refused(j.set_buried(), &j, JobState::Ready);

        // From DELAYED: no direct bury or reserve.
        let mut j = job(5);
        let was = j.state();
        refused(j.set_buried(), &j, was);
        refused(j.set_reserved(now), &j, was);

        // From BURIED: no direct reserve or delay.
        let mut j = job(0);
        j.set_reserved(now).unwrap();
        j.set_buried().unwrap();
        refused(j.set_reserved(now), &j, JobState::Buried);
        refused(
            j.set_delayed(Duration::from_secs(1), now),
            &j,
            JobState::Buried,
        );

        // From RESERVED: a second reserve is illegal.
        let mut j = job(0);
        j.set_reserved(now).unwrap();
        let was = j.state();
        refused(j.set_reserved(now), &j, was);
    }

    #[test]
    fn test_deletable_only_reserved_or_buried() {
        let now = Instant::now();

        let mut j = job(0);
        assert!(!j.deletable());
        j.set_reserved(now).unwrap();
        assert!(j.deletable());
        j.set_buried().unwrap();
        assert!(j.deletable());

        assert!(!job(5).deletable());
    }

    #[test]
    fn test_touch_restarts_ttr() {
        let now = Instant::now();
        let mut j = job(0);

        assert_eq!(j.touch(now), Err(Error::NotReserved(1)));

        j.set_reserved(now).unwrap();
        let later = now + Duration::from_secs(30);
        j.touch(later).unwrap();
        assert_eq!(j.time_left(later), Duration::from_secs(60));
    }
}
