//! A tube: one independently-locked named queue of jobs.
//!
//! The tube owns every job filed into it and is the sole concurrency
//! boundary: all operations take the tube lock, mutate job state through
//! the transition methods on [`Job`], and re-file the job into the correct
//! collection. Ready and delayed jobs live in min-heaps keyed by
//! `(pri, seq)` and `(until, seq)` respectively, where `seq` is a per-tube
//! insertion counter providing FIFO order among equal keys. Heap entries
//! are validated lazily against the job arena, so an entry whose job was
//! plucked out-of-band (`kick-job`, `reserve-job`) is skipped when popped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::journal::{Journal, JournalOp};
use crate::types::job::{Job, JobView};
use crate::types::protocol::{JobStats, TubeStats};
use crate::types::states::JobState;

/// Ready jobs with a priority below this count as "urgent" in stats.
const URGENT_PRI_LIMIT: i64 = 1024;

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct TubeConfig {
    /// Cap on jobs held by one tube across all states.
    pub max_jobs: usize,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
        }
    }
}

/// Min-heap entry for the ready collection: lowest `(pri, seq)` first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ReadyEntry {
    pri: i64,
    seq: u64,
    id: u64,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the lowest key pops first.
        (other.pri, other.seq).cmp(&(self.pri, self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap entry for the delayed collection: soonest `until` first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct DelayedEntry {
    until: Instant,
    seq: u64,
    id: u64,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.until, other.seq).cmp(&(self.until, self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A consumer blocked on a reserve, in arrival order. The sender is the
/// single-use delivery slot of the consumer's [`ReserveTicket`]; the
/// delivered job is reserved under `owner`.
#[derive(Debug)]
struct Waiter {
    id: u64,
    owner: u64,
    tx: oneshot::Sender<JobView>,
}

pub struct Tube {
    name: String,
    inner: Mutex<Inner>,
}

struct Inner {
    name: String,
    max_jobs: usize,
    /// Arena of all jobs in this tube, keyed by id. A job id appears in
    /// exactly one of the ready/delayed/buried/reserved collections below.
    jobs: HashMap<u64, Job>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    /// FIFO of buried job ids; maintained eagerly (no stale entries).
    buried: VecDeque<u64>,
    /// Jobs currently checked out, keyed by id, holding the owning
    /// consumer; deadlines are read from job state.
    reserved: HashMap<u64, u64>,
    waiting: VecDeque<Waiter>,
    paused_until: Option<Instant>,
    pause_total: Duration,
    next_seq: u64,
    next_waiter: u64,
    total_jobs: u64,
    timeouts: u64,
    deletes: u64,
    pauses: u64,
    journal: Option<Journal>,
}

impl Tube {
    pub fn new(
        name: impl Into<String>,
        config: TubeConfig,
        journal: Option<Journal>,
    ) -> Self {
        let name = name.into();
        Self {
            name: name.clone(),
            inner: Mutex::new(Inner {
                name,
                max_jobs: config.max_jobs,
                jobs: HashMap::new(),
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                buried: VecDeque::new(),
                reserved: HashMap::new(),
                waiting: VecDeque::new(),
                paused_until: None,
                pause_total: Duration::ZERO,
                next_seq: 0,
                next_waiter: 0,
                total_jobs: 0,
                timeouts: 0,
                deletes: 0,
                pauses: 0,
                journal,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Files a new job, ready immediately (zero delay) or delayed. The id
    /// comes from the broker's counter so it is unique across tubes.
    pub fn put(
        &self,
        id: u64,
        pri: i64,
        delay: Duration,
        ttr: Duration,
        data: Bytes,
    ) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.jobs.len() >= inner.max_jobs {
            return Err(Error::CapacityExceeded(inner.max_jobs));
        }

        let job = Job::new(id, pri, delay, ttr, data, now);
        let state = job.state();
        inner.jobs.insert(id, job);
        inner.total_jobs += 1;

        match state {
            JobState::Delayed { until } => inner.push_delayed(id, until),
            _ => inner.push_ready(id),
        }

        inner.record(id, JournalOp::Put);
        inner.dispatch(now);

        trace!(tube = %inner.name, id, %state, "put job");
        Ok(id)
    }

    /// Registers a waiting-consumer handle on this tube for `owner`. If a
    /// ready job is available it is delivered into the ticket's slot
    /// before this returns; otherwise the ticket resolves when a future
    /// put/release/kick/sweep dispatches a job to it. Dropping an
    /// unresolved ticket deregisters it, re-filing any job that raced
    /// into the slot.
    pub fn ticket(&self, owner: u64) -> ReserveTicket<'_> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let mut inner = self.inner.lock();
        inner.sweep(now);
        let waiter_id = inner.next_waiter;
        inner.next_waiter += 1;
        inner.waiting.push_back(Waiter {
            id: waiter_id,
            owner,
            tx,
        });
        inner.dispatch(now);
        drop(inner);

        ReserveTicket {
            tube: self,
            waiter_id,
            rx,
            done: false,
        }
    }

    /// Reserves the minimum-key ready job for `owner`, blocking until one
    /// is dispatched to this caller or `timeout` elapses.
    pub async fn reserve(
        &self,
        owner: u64,
        timeout: Option<Duration>,
    ) -> Result<JobView> {
        let mut ticket = self.ticket(owner);

        match timeout {
            None => (&mut ticket).await,
            Some(t) => match time::timeout(t, &mut ticket).await {
                Ok(res) => res,
                // The ticket is dropped below, which atomically removes
                // the waiter and re-files any job that raced in.
                Err(_elapsed) => Err(Error::TimedOut),
            },
        }
    }

    /// Reserves a specific job by id for `owner`. Only a ready job can be
    /// reserved.
    pub fn reserve_job(&self, owner: u64, id: u64) -> Result<JobView> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sweep(now);

        if !inner.jobs.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        inner.reserve_ready(id, owner, now)?;

        Ok(JobView::from(&inner.jobs[&id]))
    }

    /// Returns a job reserved by `owner` to ready (zero delay) or
    /// delayed, updating its priority.
    pub fn release(
        &self,
        owner: u64,
        id: u64,
        pri: i64,
        delay: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.check_reserved(owner, id)?;

        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(Error::NotFound(id));
        };
        job.pri = pri;
        if delay.is_zero() {
            job.set_ready()?;
        } else {
            job.set_delayed(delay, now)?;
        }
        job.releases += 1;
        let state = job.state();

        inner.reserved.remove(&id);
        match state {
            JobState::Delayed { until } => inner.push_delayed(id, until),
            _ => inner.push_ready(id),
        }
        inner.record(id, JournalOp::Release);
        inner.dispatch(now);

        Ok(())
    }

    /// Moves a job reserved by `owner` to the buried FIFO, updating its
    /// priority.
    pub fn bury(&self, owner: u64, id: u64, pri: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_reserved(owner, id)?;

        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(Error::NotFound(id));
        };
        job.set_buried()?;
        job.pri = pri;

        inner.reserved.remove(&id);
        inner.buried.push_back(id);
        inner.record(id, JournalOp::Bury);

        Ok(())
    }

    /// Restarts the TTR window of a job reserved by `owner`.
    pub fn touch(&self, owner: u64, id: u64) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.check_reserved(owner, id)?;

        match inner.jobs.get_mut(&id) {
            Some(job) => job.touch(now)?,
            None => return Err(Error::NotFound(id)),
        }
        inner.record(id, JournalOp::Touch);

        Ok(())
    }

    /// Kicks up to `bound` buried jobs to ready, oldest first. If there
    /// are no buried jobs, delayed jobs (soonest due first) are promoted
    /// instead. Returns the number of jobs kicked.
    pub fn kick(&self, bound: u64) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut kicked = 0;

        while kicked < bound {
            let Some(id) = inner.buried.pop_front() else { break };
            if inner.kick_to_ready(id) {
                kicked += 1;
            }
        }

        if kicked == 0 {
            while kicked < bound {
                let Some((id, _until)) = inner.delayed_head() else {
                    break;
                };
                inner.delayed.pop();
                if inner.kick_to_ready(id) {
                    kicked += 1;
                }
            }
        }

        if kicked > 0 {
            inner.dispatch(now);
        }
        kicked
    }

    /// Kicks a single buried or delayed job to ready by id.
    pub fn kick_job(&self, id: u64) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let state = match inner.jobs.get(&id) {
            Some(job) => job.state(),
            None => return Err(Error::NotFound(id)),
        };
        match state {
            JobState::Buried => inner.buried.retain(|b| *b != id),
            // The stale delayed-heap entry is invalidated by the re-stamp
            // in push_ready below.
            JobState::Delayed { until: _ } => {},
            _ => return Err(Error::NotFound(id)),
        }

        if !inner.kick_to_ready(id) {
            return Err(Error::NotFound(id));
        }
        inner.dispatch(now);

        Ok(())
    }

    /// Removes a job entirely. Legal only from the buried state or when
    /// reserved by `owner`; ready and delayed jobs must be reserved
    /// first, and another consumer's reservation cannot be destroyed.
    pub fn delete(&self, owner: u64, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();

        let Some(job) = inner.jobs.get(&id) else {
            return Err(Error::NotFound(id));
        };
        if !job.deletable() {
            return Err(Error::InvalidDeletion(id));
        }
        let was_buried = job.state() == JobState::Buried;
        if !was_buried && inner.reserved.get(&id) != Some(&owner) {
            return Err(Error::NotReserved(id));
        }

        inner.jobs.remove(&id);
        inner.reserved.remove(&id);
        if was_buried {
            inner.buried.retain(|b| *b != id);
        }
        inner.deletes += 1;
        inner.record(id, JournalOp::Delete);

        Ok(())
    }

    pub fn peek(&self, id: u64) -> Result<JobView> {
        let inner = self.inner.lock();
        inner
            .jobs
            .get(&id)
            .map(JobView::from)
            .ok_or(Error::NotFound(id))
    }

    /// The job the next reserve would receive.
    pub fn peek_ready(&self) -> Option<JobView> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sweep(now);
        inner
            .ready_head()
            .map(|id| JobView::from(&inner.jobs[&id]))
    }

    /// The delayed job that will become ready soonest.
    pub fn peek_delayed(&self) -> Option<JobView> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sweep(now);
        inner
            .delayed_head()
            .map(|(id, _until)| JobView::from(&inner.jobs[&id]))
    }

    /// The oldest buried job.
    pub fn peek_buried(&self) -> Option<JobView> {
        let inner = self.inner.lock();
        inner
            .buried
            .front()
            .and_then(|id| inner.jobs.get(id))
            .map(JobView::from)
    }

    /// Returns every job reserved by `owner` to the ready state,
    /// dispatching them to other waiting consumers. Called when the
    /// owning connection goes away, so its in-flight jobs do not linger
    /// until their TTR expires. Returns the number of jobs released.
    pub fn release_owned(&self, owner: u64) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let owned: Vec<u64> = inner
            .reserved
            .iter()
            .filter(|(_id, o)| **o == owner)
            .map(|(id, _o)| *id)
            .collect();
        for &id in &owned {
            inner.reserved.remove(&id);
            match inner.jobs.get_mut(&id).map(Job::set_ready) {
                Some(Ok(())) => {
                    inner.push_ready(id);
                    inner.record(id, JournalOp::Release);
                },
                _ => trace!(id, "skipped an inconsistent reservation"),
            }
        }
        if !owned.is_empty() {
            inner.dispatch(now);
        }

        owned.len()
    }

    /// Prevents reservations from this tube until `delay` has passed.
    pub fn pause(&self, delay: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.paused_until = Some(now + delay);
        inner.pause_total += delay;
        inner.pauses += 1;
    }

    /// Promotes due delayed jobs, times out overdue reservations, clears
    /// an elapsed pause, and dispatches. Returns the number of jobs moved.
    pub fn sweep(&self) -> usize {
        self.inner.lock().sweep(Instant::now())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().jobs.contains_key(&id)
    }

    pub fn stats(&self) -> TubeStats {
        let now = Instant::now();
        let inner = self.inner.lock();

        let mut stats = TubeStats {
            name: inner.name.clone(),
            current_jobs_urgent: 0,
            current_jobs_ready: 0,
            current_jobs_reserved: 0,
            current_jobs_delayed: 0,
            current_jobs_buried: 0,
            total_jobs: inner.total_jobs,
            current_waiting: inner.waiting.len() as u64,
            job_timeouts: inner.timeouts,
            cmd_delete: inner.deletes,
            cmd_pause_tube: inner.pauses,
            pause: inner.pause_total.as_secs(),
            pause_time_left: inner
                .paused_until
                .map_or(0, |p| p.saturating_duration_since(now).as_secs()),
        };

        for job in inner.jobs.values() {
            match job.state() {
                JobState::Ready => {
                    stats.current_jobs_ready += 1;
                    if job.pri < URGENT_PRI_LIMIT {
                        stats.current_jobs_urgent += 1;
                    }
                },
                JobState::Delayed { until: _ } => {
                    stats.current_jobs_delayed += 1
                },
                JobState::Reserved { deadline: _ } => {
                    stats.current_jobs_reserved += 1
                },
                JobState::Buried => stats.current_jobs_buried += 1,
            }
        }

        stats
    }

    pub fn job_stats(&self, id: u64) -> Result<JobStats> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let job = inner.jobs.get(&id).ok_or(Error::NotFound(id))?;

        Ok(JobStats {
            id: job.id,
            tube: inner.name.clone(),
            state: job.state(),
            pri: job.pri,
            age: now.saturating_duration_since(job.created).as_secs(),
            delay: job.delay.as_secs(),
            ttr: job.ttr.as_secs(),
            time_left: job.time_left(now).as_secs(),
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        })
    }

    /// Ticket-drop path: removes the waiter and re-files any job that was
    /// delivered into a slot its consumer had already abandoned.
    fn abandon(&self, waiter_id: u64, rx: &mut oneshot::Receiver<JobView>) {
        let mut inner = self.inner.lock();
        inner.waiting.retain(|w| w.id != waiter_id);
        if let Ok(view) = rx.try_recv() {
            trace!(
                tube = %inner.name,
                id = view.id,
                "requeueing abandoned delivery"
            );
            inner.requeue(view.id, Instant::now());
        }
    }
}

impl Inner {
    fn record(&self, id: u64, op: JournalOp) {
        if let Some(journal) = &self.journal {
            journal.record(&self.name, id, op);
        }
    }

    fn is_paused(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }

    /// Stamps the job and files a ready-heap entry for it.
    fn push_ready(&mut self, id: u64) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let pri = match self.jobs.get_mut(&id) {
            Some(job) => {
                job.queue_seq = seq;
                job.pri
            },
            None => return,
        };
        self.ready.push(ReadyEntry { pri, seq, id });
    }

    fn push_delayed(&mut self, id: u64, until: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        match self.jobs.get_mut(&id) {
            Some(job) => job.queue_seq = seq,
            None => return,
        }
        self.delayed.push(DelayedEntry { until, seq, id });
    }

    /// The id of the minimum-key ready job, discarding stale entries.
    fn ready_head(&mut self) -> Option<u64> {
        while let Some(&ReadyEntry { seq, id, .. }) = self.ready.peek() {
            match self.jobs.get(&id) {
                Some(job)
                    if job.queue_seq == seq
                        && job.state() == JobState::Ready =>
                {
                    return Some(id)
                },
                _ => {
                    self.ready.pop();
                },
            }
        }
        None
    }

    /// The soonest-due delayed job, discarding stale entries.
    fn delayed_head(&mut self) -> Option<(u64, Instant)> {
        while let Some(&DelayedEntry { until, seq, id }) = self.delayed.peek()
        {
            match self.jobs.get(&id) {
                Some(job)
                    if job.queue_seq == seq
                        && matches!(
                            job.state(),
                            JobState::Delayed { until: _ }
                        ) =>
                {
                    return Some((id, until))
                },
                _ => {
                    self.delayed.pop();
                },
            }
        }
        None
    }

    /// NotFound for unknown ids, NotReserved for jobs not currently held
    /// by this consumer (whether unreserved or reserved by another).
    fn check_reserved(&self, owner: u64, id: u64) -> Result<()> {
        if !self.jobs.contains_key(&id) {
            Err(Error::NotFound(id))
        } else if self.reserved.get(&id) != Some(&owner) {
            Err(Error::NotReserved(id))
        } else {
            Ok(())
        }
    }

    /// Commits a READY -> RESERVED transition and files the job as
    /// checked out by `owner`.
    fn reserve_ready(&mut self, id: u64, owner: u64, now: Instant) -> Result<()> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Err(Error::NotFound(id));
        };
        job.set_reserved(now)?;
        self.reserved.insert(id, owner);
        self.record(id, JournalOp::Reserve);
        Ok(())
    }

    fn kick_to_ready(&mut self, id: u64) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            trace!(id, "kick skipped a vanished job");
            return false;
        };
        if let Err(error) = job.set_ready() {
            trace!(%error, id, "kick skipped an unkickable job");
            return false;
        }
        job.kicks += 1;
        self.push_ready(id);
        self.record(id, JournalOp::Kick);
        true
    }

    /// Greedy matcher: while a ready job and a waiting consumer both
    /// exist, hand the minimum-key job to the oldest waiter. The snapshot
    /// is offered to waiters in FIFO order until a live handle accepts it;
    /// only then is the RESERVED transition committed, so a job offered to
    /// nothing but dead handles never leaves ready.
    fn dispatch(&mut self, now: Instant) {
        while !self.waiting.is_empty() && !self.is_paused(now) {
            let Some(id) = self.ready_head() else { return };
            let Some(view) = self.jobs.get(&id).map(JobView::from) else {
                return;
            };

            let mut delivered = None;
            while let Some(waiter) = self.waiting.pop_front() {
                let owner = waiter.owner;
                if waiter.tx.send(view.clone()).is_ok() {
                    delivered = Some(owner);
                    break;
                }
                // Receiver already dropped: a dead handle, discard it.
            }
            let Some(owner) = delivered else { return };

            self.ready.pop();
            if let Err(error) = self.reserve_ready(id, owner, now) {
                // Unreachable if the ready heap is consistent.
                error!(%error, id, "dispatched job failed to reserve");
            }
        }
    }

    /// Re-files a job whose delivery was abandoned by its consumer.
    fn requeue(&mut self, id: u64, now: Instant) {
        if self.reserved.remove(&id).is_none() {
            return;
        }
        match self.jobs.get_mut(&id) {
            Some(job) => match job.set_ready() {
                Ok(()) => {
                    self.push_ready(id);
                    self.record(id, JournalOp::Release);
                    self.dispatch(now);
                },
                Err(error) => {
                    error!(%error, id, "abandoned job in unexpected state")
                },
            },
            None => trace!(id, "abandoned delivery for a deleted job"),
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let mut moved = 0;

        // Promote delayed jobs whose delay has elapsed.
        while let Some((id, until)) = self.delayed_head() {
            if until > now {
                break;
            }
            self.delayed.pop();
            match self.jobs.get_mut(&id).map(Job::set_ready) {
                Some(Ok(())) => {
                    self.push_ready(id);
                    self.record(id, JournalOp::Promoted);
                    moved += 1;
                },
                _ => trace!(id, "sweep skipped an inconsistent delayed job"),
            }
        }

        // Force overdue reservations back to ready ("time out").
        let expired: Vec<u64> = self
            .reserved
            .keys()
            .copied()
            .filter(|id| match self.jobs.get(id).map(Job::state) {
                Some(JobState::Reserved { deadline }) => deadline <= now,
                // Inconsistent entry; collect it for cleanup below.
                _ => true,
            })
            .collect();
        for id in expired {
            self.reserved.remove(&id);
            let Some(job) = self.jobs.get_mut(&id) else {
                trace!(id, "sweep skipped a vanished reservation");
                continue;
            };
            if let Err(error) = job.set_ready() {
                trace!(%error, id, "sweep skipped an unexpired reservation");
                continue;
            }
            job.timeouts += 1;
            self.timeouts += 1;
            self.push_ready(id);
            self.record(id, JournalOp::TimedOut);
            moved += 1;
        }

        if matches!(self.paused_until, Some(until) if until <= now) {
            self.paused_until = None;
        }

        self.dispatch(now);
        moved
    }
}

/// A waiting-consumer handle: resolves to the job dispatched to it. The
/// delivery slot is single-use; after a job (or an error) comes out, the
/// ticket is spent. Dropping a pending ticket atomically deregisters the
/// waiter and re-files any job that was delivered concurrently, so a
/// cancelled reserve can never strand a job.
pub struct ReserveTicket<'a> {
    tube: &'a Tube,
    waiter_id: u64,
    rx: oneshot::Receiver<JobView>,
    done: bool,
}

impl Future for ReserveTicket<'_> {
    type Output = Result<JobView>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(view)) => {
                self.done = true;
                Poll::Ready(Ok(view))
            },
            Poll::Ready(Err(_closed)) => {
                // Only possible while the tube itself is torn down.
                self.done = true;
                Poll::Ready(Err(Error::TimedOut))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReserveTicket<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tube.abandon(self.waiter_id, &mut self.rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::task::yield_now;
    use tokio::time::advance;

    const ZERO: Option<Duration> = Some(Duration::ZERO);

    // Consumer identities.
    const C1: u64 = 1;
    const C2: u64 = 2;

    fn tube() -> Arc<Tube> {
        Arc::new(Tube::new("test", TubeConfig::default(), None))
    }

    #[track_caller]
    fn put(t: &Tube, id: u64, pri: i64, delay: u64, ttr: u64) {
        t.put(
            id,
            pri,
            Duration::from_secs(delay),
            Duration::from_secs(ttr),
            Bytes::from_static(b"body"),
        )
        .unwrap();
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_reserve() {
        let t = tube();
        put(&t, 1, 5, 0, 60);

        let view = t.reserve(C1, ZERO).await.unwrap();
        assert_eq!(view.id, 1);
        assert_eq!(view.pri, 5);
        assert_eq!(view.data, Bytes::from_static(b"body"));
        assert_eq!(t.job_stats(1).unwrap().state.name(), "reserved");
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_fifo_on_ties() {
        let t = tube();
        put(&t, 1, 10, 0, 60);
        put(&t, 2, 5, 0, 60);
        put(&t, 3, 10, 0, 60);
        put(&t, 4, -1, 0, 60);

        for expect in [4, 2, 1, 3] {
            assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, expect);
        }
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_becomes_visible_after_delay() {
        let t = tube();
        put(&t, 1, 1, 2, 60);

        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));

        advance(secs(2)).await;
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_blocks_until_put() {
        let t = tube();

        let consumer = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.reserve(C1, None).await })
        };
        yield_now().await;
        yield_now().await;

        put(&t, 7, 0, 0, 60);
        assert_eq!(consumer.await.unwrap().unwrap().id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_fairness_between_waiters() {
        let t = tube();

        let a = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.reserve(C1, None).await })
        };
        yield_now().await;
        yield_now().await;
        let b = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.reserve(C2, None).await })
        };
        yield_now().await;
        yield_now().await;

        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 0, 60);

        assert_eq!(a.await.unwrap().unwrap().id, 1);
        assert_eq!(b.await.unwrap().unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_job_single_winner() {
        let t = tube();
        put(&t, 1, 0, 0, 60);

        let mut handles = vec![];
        for consumer in 1..=3 {
            let t = Arc::clone(&t);
            handles.push(tokio::spawn(async move {
                t.reserve(consumer, Some(secs(1))).await
            }));
        }

        let mut won = 0;
        let mut timed_out = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(view) => {
                    assert_eq!(view.id, 1);
                    won += 1;
                },
                Err(Error::TimedOut) => timed_out += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((won, timed_out), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttr_expiry_returns_job_to_ready() {
        let t = tube();
        put(&t, 1, 0, 0, 3);

        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));

        advance(secs(3)).await;
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);

        let stats = t.job_stats(1).unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.reserves, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_delay_counts_from_release() {
        let t = tube();
        put(&t, 1, 0, 0, 60);

        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
        advance(secs(5)).await;

        t.release(C1, 1, 0, secs(2)).unwrap();
        assert_eq!(t.job_stats(1).unwrap().state.name(), "delayed");
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));

        advance(secs(2)).await;
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
        assert_eq!(t.job_stats(1).unwrap().releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_delay_is_immediately_ready() {
        let t = tube();
        put(&t, 1, 9, 0, 60);

        t.reserve(C1, ZERO).await.unwrap();
        t.release(C1, 1, 3, Duration::ZERO).unwrap();

        let view = t.reserve(C1, ZERO).await.unwrap();
        assert_eq!((view.id, view.pri), (1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_requires_reservation() {
        let t = tube();
        put(&t, 1, 0, 0, 60);

        assert_eq!(
            t.release(C1, 1, 0, Duration::ZERO),
            Err(Error::NotReserved(1))
        );
        assert_eq!(
            t.release(C1, 99, 0, Duration::ZERO),
            Err(Error::NotFound(99))
        );
        assert_eq!(t.bury(C1, 1, 0), Err(Error::NotReserved(1)));
        assert_eq!(t.touch(C1, 1), Err(Error::NotReserved(1)));
    }

    // The first scenario from the lifecycle walkthrough: put, reserve,
    // bury, delete, then a reserve on the empty tube times out.
    #[tokio::test(start_paused = true)]
    async fn test_bury_delete_scenario() {
        let t = tube();
        put(&t, 1, 5, 0, 60);

        let view = t.reserve(C1, ZERO).await.unwrap();
        assert_eq!(view.id, 1);
        assert_eq!(t.job_stats(1).unwrap().state.name(), "reserved");

        t.bury(C1, 1, 5).unwrap();
        assert_eq!(t.job_stats(1).unwrap().state.name(), "buried");

        t.delete(C1, 1).unwrap();
        assert_eq!(t.delete(C1, 1), Err(Error::NotFound(1)));
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_refused_for_ready_and_delayed() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 30, 60);

        assert_eq!(t.delete(C1, 1), Err(Error::InvalidDeletion(1)));
        assert_eq!(t.delete(C1, 2), Err(Error::InvalidDeletion(2)));

        // Reserving first makes the job deletable.
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
        t.delete(C1, 1).unwrap();
        assert!(!t.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_oldest_buried_first() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 0, 60);
        t.reserve(C1, ZERO).await.unwrap();
        t.reserve(C1, ZERO).await.unwrap();
        t.bury(C1, 1, 0).unwrap();
        t.bury(C1, 2, 0).unwrap();

        assert_eq!(t.kick(1), 1);
        assert_eq!(t.job_stats(1).unwrap().state.name(), "ready");
        assert_eq!(t.job_stats(2).unwrap().state.name(), "buried");

        assert_eq!(t.kick(10), 1);
        assert_eq!(t.job_stats(2).unwrap().state.name(), "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_falls_back_to_delayed() {
        let t = tube();
        put(&t, 1, 0, 600, 60);
        put(&t, 2, 0, 300, 60);

        assert_eq!(t.kick(10), 2);
        // Delayed kicks promote the soonest-due job first.
        let first = t.reserve(C1, ZERO).await.unwrap();
        assert_eq!(first.id, 2);
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_job_by_id() {
        let t = tube();
        put(&t, 1, 0, 600, 60);
        put(&t, 2, 0, 0, 60);

        // Delayed jobs are kickable by id; ready and reserved are not.
        t.kick_job(1).unwrap();
        assert_eq!(t.job_stats(1).unwrap().state.name(), "ready");
        assert_eq!(t.kick_job(2), Err(Error::NotFound(2)));

        t.reserve(C1, ZERO).await.unwrap();
        assert_eq!(t.kick_job(1), Err(Error::NotFound(1)));
        assert_eq!(t.kick_job(99), Err(Error::NotFound(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_restarts_the_ttr_window() {
        let t = tube();
        put(&t, 1, 0, 0, 2);
        t.reserve(C1, ZERO).await.unwrap();

        advance(secs(1)).await;
        t.touch(C1, 1).unwrap();

        // The original deadline has passed, but the touched one has not.
        advance(secs(1)).await;
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));

        advance(secs(1)).await;
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit() {
        let t = Arc::new(Tube::new(
            "small",
            TubeConfig { max_jobs: 2 },
            None,
        ));
        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 0, 60);

        let res = t.put(
            3,
            0,
            Duration::ZERO,
            secs(60),
            Bytes::from_static(b"body"),
        );
        assert_eq!(res, Err(Error::CapacityExceeded(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_ticket_requeues_delivery() {
        let t = tube();

        // Register a waiter, deliver a job into its slot, then abandon
        // the ticket without consuming it.
        let ticket = t.ticket(C1);
        put(&t, 1, 0, 0, 60);
        drop(ticket);

        let stats = t.stats();
        assert_eq!(stats.current_jobs_ready, 1);
        assert_eq!(stats.current_jobs_reserved, 0);
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_gates_reservation() {
        let t = tube();
        t.pause(secs(5));
        put(&t, 1, 0, 0, 60);

        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));

        advance(secs(5)).await;
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_tube_wakes_waiter_on_expiry() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        t.pause(secs(3));

        let consumer = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.reserve(C1, None).await })
        };
        yield_now().await;

        advance(secs(3)).await;
        t.sweep();
        assert_eq!(consumer.await.unwrap().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peeks() {
        let t = tube();
        put(&t, 1, 1, 0, 60);
        put(&t, 2, 0, 600, 60);
        put(&t, 3, 9, 0, 60);

        t.reserve(C1, ZERO).await.unwrap(); // takes id 1 (lowest pri)
        t.bury(C1, 1, 1).unwrap();

        assert_eq!(t.peek_ready().unwrap().id, 3);
        assert_eq!(t.peek_delayed().unwrap().id, 2);
        assert_eq!(t.peek_buried().unwrap().id, 1);
        assert_eq!(t.peek(2).unwrap().id, 2);
        assert_eq!(t.peek(99), Err(Error::NotFound(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_job_by_id() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 0, 60);
        put(&t, 3, 0, 600, 60);

        assert_eq!(t.reserve_job(C1, 2).unwrap().id, 2);
        // Not ready: delayed, already-reserved, and unknown ids fail.
        assert!(t.reserve_job(C1, 3).is_err());
        assert!(t.reserve_job(C2, 2).is_err());
        assert_eq!(t.reserve_job(C1, 99), Err(Error::NotFound(99)));

        // The stale ready-heap entry for id 2 must not resurface.
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);
        assert_eq!(t.reserve(C1, ZERO).await, Err(Error::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_counts() {
        let t = tube();
        put(&t, 1, 1, 0, 60); // urgent ready
        put(&t, 2, 5000, 0, 60); // non-urgent ready
        put(&t, 3, 0, 600, 60); // delayed
        put(&t, 4, 0, 0, 60);
        t.reserve_job(C1, 4).unwrap(); // reserved

        let stats = t.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.current_jobs_urgent, 1);
        assert_eq!(stats.current_jobs_ready, 2);
        assert_eq!(stats.current_jobs_reserved, 1);
        assert_eq!(stats.current_jobs_delayed, 1);
        assert_eq!(stats.current_jobs_buried, 0);
        assert_eq!(stats.total_jobs, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservations_are_consumer_scoped() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        assert_eq!(t.reserve(C1, ZERO).await.unwrap().id, 1);

        // Another consumer cannot mutate or destroy the reservation.
        assert_eq!(
            t.release(C2, 1, 0, Duration::ZERO),
            Err(Error::NotReserved(1))
        );
        assert_eq!(t.bury(C2, 1, 0), Err(Error::NotReserved(1)));
        assert_eq!(t.touch(C2, 1), Err(Error::NotReserved(1)));
        assert_eq!(t.delete(C2, 1), Err(Error::NotReserved(1)));
        assert_eq!(t.job_stats(1).unwrap().state.name(), "reserved");

        // The owner still can.
        t.release(C1, 1, 0, Duration::ZERO).unwrap();
        assert_eq!(t.job_stats(1).unwrap().state.name(), "ready");

        // Buried jobs are fair game for any consumer.
        assert_eq!(t.reserve(C2, ZERO).await.unwrap().id, 1);
        t.bury(C2, 1, 0).unwrap();
        t.delete(C1, 1).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_owned_frees_only_that_consumers_jobs() {
        let t = tube();
        put(&t, 1, 0, 0, 60);
        put(&t, 2, 0, 0, 60);
        put(&t, 3, 0, 0, 60);
        t.reserve(C1, ZERO).await.unwrap();
        t.reserve(C1, ZERO).await.unwrap();
        t.reserve(C2, ZERO).await.unwrap();

        assert_eq!(t.release_owned(C1), 2);
        assert_eq!(t.release_owned(C1), 0);

        let stats = t.stats();
        assert_eq!(stats.current_jobs_ready, 2);
        assert_eq!(stats.current_jobs_reserved, 1);
        assert_eq!(t.job_stats(3).unwrap().state.name(), "reserved");
    }

    // The multi-tube reserve pattern: one ticket per watched tube, first
    // delivery wins, and dropping the losing tickets re-files any job
    // that raced into them.
    #[tokio::test(start_paused = true)]
    async fn test_first_delivery_wins_across_tubes() {
        let a = tube();
        let b = Arc::new(Tube::new("other", TubeConfig::default(), None));

        let mut ta = a.ticket(C1);
        let mut tb = b.ticket(C1);

        // Both tubes deliver into their tickets before either is polled.
        put(&a, 1, 0, 0, 60);
        put(&b, 2, 0, 0, 60);

        let view = std::future::poll_fn(|cx| {
            if let Poll::Ready(res) = Pin::new(&mut ta).poll(cx) {
                return Poll::Ready(res);
            }
            Pin::new(&mut tb).poll(cx)
        })
        .await
        .unwrap();
        assert_eq!(view.id, 1);

        drop(ta);
        drop(tb);

        // The winner's reservation stands; the loser's delivery went
        // back to ready for the next consumer.
        assert_eq!(a.job_stats(1).unwrap().state.name(), "reserved");
        assert_eq!(b.job_stats(2).unwrap().state.name(), "ready");
        assert_eq!(b.reserve(C2, ZERO).await.unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_receives_transitions() {
        let (journal, mut rx) = Journal::new();
        let t =
            Arc::new(Tube::new("test", TubeConfig::default(), Some(journal)));

        put(&t, 1, 0, 0, 60);
        t.reserve(C1, ZERO).await.unwrap();
        t.touch(C1, 1).unwrap();
        t.delete(C1, 1).unwrap();

        let mut ops = vec![];
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.tube, "test");
            assert_eq!(event.id, 1);
            ops.push(event.op);
        }
        assert_eq!(
            ops,
            [
                JournalOp::Put,
                JournalOp::Reserve,
                JournalOp::Touch,
                JournalOp::Delete
            ]
        );
    }
}
