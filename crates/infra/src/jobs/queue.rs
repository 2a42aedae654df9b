//! Bounded work queue shared by submitters and workers.
//!
//! Capacity bounds the number of *tracked* tasks: queued, waiting out a retry
//! backoff, or held by a worker. Admission through [`WorkQueue::try_enqueue`]
//! takes a slot that is only given back by [`WorkQueue::release`], so a task
//! that was admitted can always re-enter the queue.
//!
//! Three lanes:
//! - `arrivals`: fresh submissions and retries whose backoff elapsed; workers
//!   are woken for these.
//! - `backlog`: tasks still pending/running remotely, stamped with the time
//!   they were parked; swept on ticks.
//! - `delayed`: retries keyed by fire time (min-heap).

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use super::types::TaskRecord;

/// Why the queue refused a task. The task is handed back.
#[derive(Debug)]
pub enum EnqueueError {
    /// Every slot is taken by a tracked task.
    Full(TaskRecord),
    /// The queue was closed by scheduler shutdown.
    Closed(TaskRecord),
}

impl EnqueueError {
    pub fn into_task(self) -> TaskRecord {
        match self {
            EnqueueError::Full(task) | EnqueueError::Closed(task) => task,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub tracked: usize,
    pub arrivals: usize,
    pub backlog: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub closed: bool,
}

struct Parked {
    since: Instant,
    task: TaskRecord,
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: TaskRecord,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    arrivals: VecDeque<TaskRecord>,
    backlog: VecDeque<Parked>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    in_flight: usize,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn tracked(&self) -> usize {
        self.arrivals.len() + self.backlog.len() + self.delayed.len() + self.in_flight
    }

    /// Move every retry whose fire time has passed into the arrivals lane.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.due > now {
                break;
            }
            if let Some(Reverse(entry)) = self.delayed.pop() {
                self.arrivals.push_back(entry.task);
            }
        }
    }

    fn checkout(&mut self, task: Option<TaskRecord>) -> Option<TaskRecord> {
        if task.is_some() {
            self.in_flight += 1;
        }
        task
    }

    fn checkin(&mut self) {
        debug_assert!(self.in_flight > 0, "checkin without a checked-out task");
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// Multi-producer work queue with a fixed number of task slots.
pub struct WorkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    arrived: Notify,
    rescheduled: Notify,
}

impl WorkQueue {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            state: Mutex::new(QueueState::default()),
            arrived: Notify::new(),
            rescheduled: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new task without blocking. Takes one slot on success.
    pub fn try_enqueue(&self, task: TaskRecord) -> Result<(), EnqueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(EnqueueError::Closed(task));
            }
            if state.tracked() >= self.capacity {
                return Err(EnqueueError::Full(task));
            }
            state.arrivals.push_back(task);
        }
        self.arrived.notify_one();
        Ok(())
    }

    /// Check out the next task from any lane (arrivals first).
    pub fn try_dequeue(&self) -> Option<TaskRecord> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        let task = match state.arrivals.pop_front() {
            Some(task) => Some(task),
            None => state.backlog.pop_front().map(|p| p.task),
        };
        state.checkout(task)
    }

    /// Check out the next fresh arrival (including retries that came due).
    pub fn take_arrival(&self) -> Option<TaskRecord> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        let task = state.arrivals.pop_front();
        state.checkout(task)
    }

    /// Check out the oldest backlog task if it was parked before `cutoff`.
    ///
    /// Parking times are non-decreasing along the backlog, so a sweep that
    /// passes its own start time visits every task parked before it once.
    pub fn take_backlog_before(&self, cutoff: Instant) -> Option<TaskRecord> {
        let mut state = self.lock();
        let task = match state.backlog.front() {
            Some(parked) if parked.since < cutoff => state.backlog.pop_front().map(|p| p.task),
            _ => None,
        };
        state.checkout(task)
    }

    /// Return a checked-out task to the backlog. Never fails: the slot is kept.
    pub fn requeue(&self, task: TaskRecord) {
        let mut state = self.lock();
        state.checkin();
        state.backlog.push_back(Parked {
            since: Instant::now(),
            task,
        });
    }

    /// Return a checked-out task to be retried at `due`. Never fails.
    ///
    /// Wakes [`WorkQueue::rescheduled`] waiters when `due` becomes the
    /// earliest retry deadline.
    pub fn defer(&self, task: TaskRecord, due: Instant) {
        let earliest = {
            let mut state = self.lock();
            state.checkin();
            let earliest = state
                .delayed
                .peek()
                .is_none_or(|Reverse(head)| due < head.due);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.delayed.push(Reverse(Delayed { due, seq, task }));
            earliest
        };
        if earliest {
            self.rescheduled.notify_waiters();
        }
    }

    /// Give back the slot of a checked-out task that was finalized.
    pub fn release(&self) {
        self.lock().checkin();
    }

    /// Earliest retry fire time, if any retry is waiting.
    pub fn next_due(&self) -> Option<Instant> {
        self.lock().delayed.peek().map(|Reverse(entry)| entry.due)
    }

    /// Resolves once a task was admitted since the last wake-up.
    pub fn arrived(&self) -> Notified<'_> {
        self.arrived.notified()
    }

    /// Resolves when a retry deadline earlier than every previous one is added.
    ///
    /// Only futures created before the [`WorkQueue::defer`] call are woken.
    pub fn rescheduled(&self) -> Notified<'_> {
        self.rescheduled.notified()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the queue and check out every task still waiting in it.
    ///
    /// The returned tasks count as in flight until released. Tasks currently
    /// held by workers are not included.
    pub fn close_and_drain(&self) -> Vec<TaskRecord> {
        let mut state = self.lock();
        state.closed = true;

        let mut drained: Vec<TaskRecord> = state.arrivals.drain(..).collect();
        drained.extend(state.backlog.drain(..).map(|p| p.task));
        let mut delayed: Vec<Delayed> = state.delayed.drain().map(|Reverse(d)| d).collect();
        delayed.sort();
        drained.extend(delayed.into_iter().map(|d| d.task));

        state.in_flight += drained.len();
        drained
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            capacity: self.capacity,
            tracked: state.tracked(),
            arrivals: state.arrivals.len(),
            backlog: state.backlog.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight,
            closed: state.closed,
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{CompletionSink, UserData};
    use futures::FutureExt;
    use jobtrack_core::{JobDescriptor, JobId};
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;

    fn task(id: &str) -> TaskRecord {
        TaskRecord::new(
            JobId::new(id).unwrap(),
            JobDescriptor::parse("https://files.example.com/in.json").unwrap(),
            UserData::new(),
            CompletionSink::Ignore,
        )
    }

    fn queue(capacity: usize) -> WorkQueue {
        WorkQueue::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn rejects_admission_beyond_capacity() {
        let q = queue(2);
        q.try_enqueue(task("a")).unwrap();
        q.try_enqueue(task("b")).unwrap();

        let err = q.try_enqueue(task("c")).unwrap_err();
        assert!(matches!(err, EnqueueError::Full(_)));
        assert_eq!(err.into_task().id().as_str(), "c");
        assert_eq!(q.snapshot().tracked, 2);
    }

    #[test]
    fn checked_out_tasks_keep_their_slot() {
        let q = queue(1);
        q.try_enqueue(task("a")).unwrap();

        let a = q.try_dequeue().unwrap();
        assert!(matches!(q.try_enqueue(task("b")), Err(EnqueueError::Full(_))));

        // Requeue cannot fail even though the queue is at capacity.
        q.requeue(a);
        assert_eq!(q.snapshot().backlog, 1);

        let a = q.try_dequeue().unwrap();
        q.release();
        drop(a);
        assert_eq!(q.snapshot().tracked, 0);
        q.try_enqueue(task("b")).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn arrivals_are_served_before_backlog() {
        let q = queue(4);
        q.try_enqueue(task("old")).unwrap();
        let old = q.take_arrival().unwrap();
        q.requeue(old);
        q.try_enqueue(task("new")).unwrap();

        assert!(q.try_dequeue().is_some_and(|t| t.id().as_str() == "new"));
        assert!(q.take_arrival().is_none());
        assert!(q.try_dequeue().is_some_and(|t| t.id().as_str() == "old"));
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_sweep_stops_at_tasks_parked_after_cutoff() {
        let q = queue(4);
        for id in ["a", "b"] {
            q.try_enqueue(task(id)).unwrap();
        }
        let a = q.take_arrival().unwrap();
        q.requeue(a);
        tokio::time::advance(Duration::from_secs(1)).await;
        let cutoff = Instant::now();
        let b = q.take_arrival().unwrap();
        q.requeue(b);

        assert!(q.take_backlog_before(cutoff).is_some_and(|t| t.id().as_str() == "a"));
        assert!(q.take_backlog_before(cutoff).is_none());
        assert_eq!(q.snapshot().backlog, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_tasks_surface_in_fire_time_order() {
        let q = queue(4);
        for id in ["late", "early"] {
            q.try_enqueue(task(id)).unwrap();
        }
        let late = q.take_arrival().unwrap();
        let early = q.take_arrival().unwrap();

        let now = Instant::now();
        q.defer(late, now + Duration::from_secs(8));
        q.defer(early, now + Duration::from_secs(2));
        assert_eq!(q.next_due(), Some(now + Duration::from_secs(2)));
        assert!(q.take_arrival().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(q.take_arrival().is_some_and(|t| t.id().as_str() == "early"));
        assert!(q.take_arrival().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(q.take_arrival().is_some_and(|t| t.id().as_str() == "late"));
        assert_eq!(q.snapshot().in_flight, 2);
    }

    #[test]
    fn close_and_drain_empties_every_lane() {
        let q = queue(4);
        for id in ["a", "b", "c"] {
            q.try_enqueue(task(id)).unwrap();
        }
        let b = q.take_arrival().unwrap();
        q.requeue(b);
        let c = q.take_arrival().unwrap();
        q.defer(c, Instant::now() + Duration::from_secs(60));

        let drained = q.close_and_drain();
        assert_eq!(drained.len(), 3);

        let snap = q.snapshot();
        assert!(snap.closed);
        assert_eq!(snap.in_flight, 3);
        assert_eq!(snap.tracked, 3);
        assert!(matches!(q.try_enqueue(task("d")), Err(EnqueueError::Closed(_))));
    }

    #[tokio::test]
    async fn admission_wakes_a_waiting_worker() {
        let q = std::sync::Arc::new(queue(1));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                q.arrived().await;
                q.take_arrival().map(|t| t.id().to_string())
            })
        };
        tokio::task::yield_now().await;
        q.try_enqueue(task("a")).unwrap();
        assert_eq!(waiter.await.unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn earlier_retry_deadlines_wake_rescheduled_waiters() {
        let q = queue(4);
        for id in ["a", "b", "c"] {
            q.try_enqueue(task(id)).unwrap();
        }
        let (a, b, c) = (
            q.take_arrival().unwrap(),
            q.take_arrival().unwrap(),
            q.take_arrival().unwrap(),
        );
        let now = Instant::now();

        let waiter = q.rescheduled();
        q.defer(a, now + Duration::from_secs(8));
        assert!(waiter.now_or_never().is_some());

        let waiter = q.rescheduled();
        q.defer(b, now + Duration::from_secs(16));
        assert!(waiter.now_or_never().is_none());

        let waiter = q.rescheduled();
        q.defer(c, now + Duration::from_secs(2));
        assert!(waiter.now_or_never().is_some());
        assert_eq!(q.next_due(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const CAPACITY: usize = 64;
        let q = queue(CAPACITY);

        let mut accepted: Vec<String> = thread::scope(|s| {
            let producers: Vec<_> = (0..8)
                .map(|p| {
                    let q = &q;
                    s.spawn(move || {
                        (0..32)
                            .map(|i| format!("job-{p}-{i}"))
                            .filter(|id| q.try_enqueue(task(id)).is_ok())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            producers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(accepted.len(), CAPACITY);
        assert_eq!(q.snapshot().tracked, CAPACITY);

        // Each task is requeued, deferred, then finalized by whichever consumer holds it.
        let finished = Mutex::new(Vec::new());
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while finished.lock().unwrap().len() < CAPACITY {
                        let Some(mut task) = q.try_dequeue() else {
                            thread::yield_now();
                            continue;
                        };
                        match task.record_probe_failure() {
                            1 => q.requeue(task),
                            2 => q.defer(task, Instant::now()),
                            _ => {
                                q.release();
                                finished.lock().unwrap().push(task.id().to_string());
                            }
                        }
                    }
                });
            }
        });

        let mut finished = finished.into_inner().unwrap();
        finished.sort();
        accepted.sort();
        assert_eq!(finished, accepted);

        let snap = q.snapshot();
        assert_eq!(snap.tracked, 0);
        assert_eq!(snap.in_flight, 0);
    }

    proptest! {
        /// Property: with no draining consumer, exactly `capacity` admissions succeed.
        #[test]
        fn admissions_never_exceed_capacity(capacity in 1usize..32, extra in 0usize..8) {
            let q = queue(capacity);
            let mut accepted = 0;
            let mut rejected = 0;
            for i in 0..capacity + extra {
                match q.try_enqueue(task(&format!("job-{i}"))) {
                    Ok(()) => accepted += 1,
                    Err(EnqueueError::Full(_)) => rejected += 1,
                    Err(EnqueueError::Closed(_)) => prop_assert!(false, "queue unexpectedly closed"),
                }
            }
            prop_assert_eq!(accepted, capacity);
            prop_assert_eq!(rejected, extra);
        }
    }
}
