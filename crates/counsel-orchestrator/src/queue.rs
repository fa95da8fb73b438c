use crate::clock::{Clock, SharedClock};
use crate::types::{Capability, DeadLetter, Task, TaskStatus};
use counsel_core::{CounselError, CounselResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many acked task ids the completion ledger remembers.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// How many dead letters a queue keeps in memory. Older ones live on in the sink.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

/// Retry and backoff settings for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which a task is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering a task that has failed `attempt + 1` times.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Bounded record of acked task ids, shared by all queues for dependency gating.
pub struct CompletionLedger {
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl CompletionLedger {
    /// Ledger remembering at most `capacity` ids, oldest evicted first.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Mark a task as completed.
    pub fn record(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        if !inner.ids.insert(id) {
            return;
        }
        inner.order.push_back(id);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.ids.remove(&old);
            }
        }
    }

    /// Whether a task is known to have completed.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.lock().ids.contains(id)
    }

    fn all_completed(&self, ids: &[Uuid]) -> bool {
        let inner = self.inner.lock();
        ids.iter().all(|id| inner.ids.contains(id))
    }
}

impl Default for CompletionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

/// What happened to a negatively acknowledged task.
#[derive(Debug, Clone)]
pub enum NackOutcome {
    /// Scheduled for redelivery after `delay`.
    Requeued {
        /// Failed attempts so far.
        retry_count: u32,
        /// Backoff before the task is deliverable again.
        delay: Duration,
    },
    /// Retry budget exhausted.
    DeadLettered(DeadLetter),
}

/// Depth counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Deliverable now, dependencies permitting.
    pub ready: usize,
    /// Waiting out a retry backoff.
    pub delayed: usize,
    /// Leased to a worker.
    pub in_flight: usize,
    /// Dead letters still retained in memory.
    pub dead_letters: usize,
}

/// Priority descending, then enqueue order ascending.
type ReadyKey = (Reverse<i32>, u64);

struct Lease {
    task: Task,
    seq: u64,
    expires: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: BTreeMap<ReadyKey, Task>,
    delayed: BTreeMap<(Instant, u64), Task>,
    in_flight: HashMap<Uuid, Lease>,
    dead: VecDeque<DeadLetter>,
    /// Deadline expiries nobody has reported yet.
    expired: Vec<DeadLetter>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Leased priority queue for one task category.
///
/// Delivery is at-least-once: a dequeued task is held under a lease and goes
/// back to the ready set if neither [`ack`](Self::ack) nor
/// [`nack`](Self::nack) arrives before the lease expires.
pub struct TaskQueue {
    category: Capability,
    policy: RetryPolicy,
    lease_timeout: Duration,
    dead_letter_capacity: usize,
    clock: SharedClock,
    ledger: Arc<CompletionLedger>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    /// Empty queue for `category` with a 5 minute lease.
    pub fn new(
        category: Capability,
        policy: RetryPolicy,
        clock: SharedClock,
        ledger: Arc<CompletionLedger>,
    ) -> Self {
        Self {
            category,
            policy,
            lease_timeout: Duration::from_secs(300),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            clock,
            ledger,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Set the visibility timeout for dequeued tasks.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Cap the in-memory dead-letter list, dropping the oldest first.
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    /// Category this queue serves.
    pub fn category(&self) -> Capability {
        self.category
    }

    /// How long a dequeued task stays invisible to other workers.
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Retry policy applied on `nack`.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add a task to the ready set.
    pub fn enqueue(&self, mut task: Task) -> CounselResult<Uuid> {
        if task.category != self.category {
            return Err(CounselError::Configuration(format!(
                "task {} belongs to '{}', not queue '{}'",
                task.id, task.category, self.category
            )));
        }
        if task.dependencies.contains(&task.id) {
            return Err(CounselError::Configuration(format!(
                "task {} depends on itself",
                task.id
            )));
        }

        let id = task.id;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CounselError::QueueUnavailable(format!(
                    "queue '{}' is closed",
                    self.category
                )));
            }
            task.status = TaskStatus::Pending;
            let seq = state.take_seq();
            state.ready.insert((Reverse(task.priority), seq), task);
        }
        debug!(task_id = %id, category = %self.category, "Task enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Take the best ready task, if any.
    pub fn try_dequeue(&self) -> Option<Task> {
        self.try_dequeue_with(|_| Some(())).map(|(task, ())| task)
    }

    /// Take the best ready task that `admit` accepts.
    ///
    /// Candidates are offered in priority-then-FIFO order, skipping tasks with
    /// unmet dependencies. `admit` runs under the queue lock and must not block;
    /// the value it returns travels with the task (for example a concurrency
    /// permit).
    pub fn try_dequeue_with<P>(&self, mut admit: impl FnMut(&Task) -> Option<P>) -> Option<(Task, P)> {
        let now = Instant::now();
        let wall = self.clock.now();
        let mut state = self.state.lock();

        self.reclaim_expired_leases(&mut state, now);
        promote_due(&mut state, now);
        self.expire_deadlines(&mut state, wall);

        let mut chosen = None;
        for (key, task) in &state.ready {
            if !task.dependencies.is_empty() && !self.ledger.all_completed(&task.dependencies) {
                continue;
            }
            if let Some(permit) = admit(task) {
                chosen = Some((*key, permit));
                break;
            }
        }

        let (key, permit) = chosen?;
        let mut task = state.ready.remove(&key)?;
        task.status = TaskStatus::Running;
        state.in_flight.insert(
            task.id,
            Lease {
                task: task.clone(),
                seq: key.1,
                expires: now + self.lease_timeout,
            },
        );
        Some((task, permit))
    }

    /// Dequeue, waiting up to `max_wait` for work to arrive.
    pub async fn dequeue(&self, max_wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.wait_for_work(deadline - now).await;
        }
    }

    /// Sleep until something may have become deliverable, at most `max_wait`.
    ///
    /// Wakes early on enqueue, ack, or when the next delayed task or lease falls due.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let wait = match self.next_due_in() {
            Some(due) => due.min(max_wait),
            None => max_wait,
        };
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Wake one waiting consumer, for example after a concurrency slot frees up.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Remove a delivered task permanently and record it as completed.
    pub fn ack(&self, task_id: Uuid) -> CounselResult<Task> {
        let lease = self.state.lock().in_flight.remove(&task_id).ok_or_else(|| {
            CounselError::NotFound(format!("no in-flight task {task_id} in '{}'", self.category))
        })?;
        let mut task = lease.task;
        task.status = TaskStatus::Completed;
        self.ledger.record(task_id);
        debug!(task_id = %task_id, category = %self.category, "Task acked");
        self.notify.notify_one();
        Ok(task)
    }

    /// Return a delivered task after a failed attempt.
    ///
    /// The retry count is incremented; once it reaches the task's `max_retries`
    /// the task is dead-lettered, otherwise it becomes deliverable again after
    /// the policy's backoff.
    pub fn nack(&self, task_id: Uuid, reason: impl Into<String>) -> CounselResult<NackOutcome> {
        let reason = reason.into();
        let mut state = self.state.lock();
        let lease = state.in_flight.remove(&task_id).ok_or_else(|| {
            CounselError::NotFound(format!("no in-flight task {task_id} in '{}'", self.category))
        })?;

        let mut task = lease.task;
        task.retry_count += 1;
        task.last_error = Some(reason.clone());

        if task.retry_count >= task.max_retries.max(1) {
            task.status = TaskStatus::DeadLettered {
                reason: reason.clone(),
            };
            let letter = DeadLetter {
                attempts: task.retry_count,
                task,
                reason,
                dead_lettered_at: self.clock.now(),
            };
            self.retain_dead(&mut state, letter.clone());
            return Ok(NackOutcome::DeadLettered(letter));
        }

        let delay = self.policy.backoff(task.retry_count - 1);
        let retry_count = task.retry_count;
        task.status = TaskStatus::Pending;
        let seq = state.take_seq();
        state.delayed.insert((Instant::now() + delay, seq), task);
        drop(state);

        debug!(
            task_id = %task_id,
            category = %self.category,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Task requeued with backoff"
        );
        Ok(NackOutcome::Requeued { retry_count, delay })
    }

    /// Dead-letter a delivered task without spending its remaining retries.
    ///
    /// Used for failures that no retry can fix.
    pub fn dead_letter(&self, task_id: Uuid, reason: impl Into<String>) -> CounselResult<DeadLetter> {
        let reason = reason.into();
        let mut state = self.state.lock();
        let lease = state.in_flight.remove(&task_id).ok_or_else(|| {
            CounselError::NotFound(format!("no in-flight task {task_id} in '{}'", self.category))
        })?;

        let mut task = lease.task;
        task.retry_count += 1;
        task.last_error = Some(reason.clone());
        task.status = TaskStatus::DeadLettered {
            reason: reason.clone(),
        };
        let letter = DeadLetter {
            attempts: task.retry_count,
            task,
            reason,
            dead_lettered_at: self.clock.now(),
        };
        self.retain_dead(&mut state, letter.clone());
        Ok(letter)
    }

    /// Hand over tasks dead-lettered by deadline expiry since the last call.
    ///
    /// Each expiry is returned exactly once, so the caller can report it.
    pub fn take_expired(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.state.lock().expired)
    }

    /// Snapshot of the retained dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.iter().cloned().collect()
    }

    /// Current depth counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead.len(),
        }
    }

    /// Tasks not yet terminal: ready, delayed, or in flight.
    pub fn pending_count(&self) -> usize {
        let stats = self.stats();
        stats.ready + stats.delayed + stats.in_flight
    }

    /// Reachability check used by the health monitor.
    pub fn probe(&self) -> CounselResult<()> {
        if self.state.lock().closed {
            Err(CounselError::QueueUnavailable(format!(
                "queue '{}' is closed",
                self.category
            )))
        } else {
            Ok(())
        }
    }

    /// Refuse further enqueues. Queued tasks stay inspectable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock();
        let next_delayed = state.delayed.keys().next().map(|(at, _)| *at);
        let next_lease = state.in_flight.values().map(|l| l.expires).min();
        let due = match (next_delayed, next_lease) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };
        Some(due.saturating_duration_since(Instant::now()))
    }

    fn reclaim_expired_leases(&self, state: &mut QueueState, now: Instant) {
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = state.in_flight.remove(&id) {
                warn!(
                    task_id = %id,
                    category = %self.category,
                    "Lease expired without ack, redelivering"
                );
                let mut task = lease.task;
                task.status = TaskStatus::Pending;
                state.ready.insert((Reverse(task.priority), lease.seq), task);
            }
        }
    }

    fn expire_deadlines(&self, state: &mut QueueState, wall: chrono::DateTime<chrono::Utc>) {
        let expired: Vec<ReadyKey> = state
            .ready
            .iter()
            .filter(|(_, task)| task.is_expired(wall))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(mut task) = state.ready.remove(&key) {
                let reason = "deadline expired".to_string();
                warn!(task_id = %task.id, category = %self.category, "Task deadline expired before delivery");
                task.status = TaskStatus::DeadLettered {
                    reason: reason.clone(),
                };
                let letter = DeadLetter {
                    attempts: task.retry_count,
                    task,
                    reason,
                    dead_lettered_at: wall,
                };
                state.expired.push(letter.clone());
                self.retain_dead(state, letter);
            }
        }
    }

    fn retain_dead(&self, state: &mut QueueState, letter: DeadLetter) {
        state.dead.push_back(letter);
        while state.dead.len() > self.dead_letter_capacity {
            state.dead.pop_front();
        }
    }
}

fn promote_due(state: &mut QueueState, now: Instant) {
    while let Some(entry) = state.delayed.first_entry() {
        if entry.key().0 > now {
            break;
        }
        let ((_, seq), task) = entry.remove_entry();
        state.ready.insert((Reverse(task.priority), seq), task);
    }
}
