//! In-memory delayed task scheduler: a timer wheel over a fingerprinted
//! work queue, coalescing re-scheduled entries for the same fingerprint.
//!
//! Mirrors the teacher's per-domain sharded-state idiom
//! ([`crate::manager::retry`], itself adapted from `download::rate_limiter`):
//! state keyed by an opaque identifier, guarded so reads and writes never
//! race. Here the key is a [`Fingerprint`] instead of a domain, and state is
//! a due time instead of a last-request timestamp.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, instrument};

/// `(episode_id, download_id)` pair identifying a reconciliation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub episode_id: i64,
    pub download_id: String,
}

impl Fingerprint {
    #[must_use]
    pub fn new(episode_id: i64, download_id: impl Into<String>) -> Self {
        Self { episode_id, download_id: download_id.into() }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.episode_id, self.download_id)
    }
}

/// What caused a task to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PostGrabCheck,
    Retry,
}

/// A scheduled reconciliation check.
#[derive(Debug, Clone)]
pub struct ReconciliationTask {
    pub fingerprint: Fingerprint,
    pub due_at: Instant,
    pub trigger: Trigger,
}

/// Outcome of [`DelayedTaskScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No prior pending task for this fingerprint; a new one was inserted.
    Scheduled,
    /// A pending task already existed; its `due_at`/`trigger` were updated
    /// to the later of the two (spec.md §4.6).
    Coalesced,
}

/// Heap entry ordered so `BinaryHeap` (a max-heap) pops the earliest
/// `due_at` first, and carries a generation so a coalesced update can
/// invalidate a stale heap entry without a linear scan.
struct HeapEntry {
    due_at: Instant,
    fingerprint: Fingerprint,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at
    }
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due_at.cmp(&self.due_at)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Index {
    due_at: Instant,
    trigger: Trigger,
    generation: u64,
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    index: HashMap<Fingerprint, Index>,
    next_generation: u64,
}

/// A single-process in-memory scheduler, safe for concurrent
/// `schedule`/`cancel` calls from the webhook receiver while `run()` drives
/// the fire loop (spec.md §4.6, §5).
pub struct DelayedTaskScheduler {
    inner: Mutex<Inner>,
    wake: Notify,
}

impl Default for DelayedTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedTaskScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { heap: BinaryHeap::new(), index: HashMap::new(), next_generation: 0 }),
            wake: Notify::new(),
        }
    }

    /// Schedules `fingerprint` to fire at `due_at`. If a pending task with
    /// the same fingerprint exists, its `due_at` becomes `max(existing, due_at)`
    /// and its trigger becomes whichever of the two is passed last; the
    /// earlier heap entry is left in place but marked stale via generation
    /// and skipped when popped.
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    pub async fn schedule(
        &self,
        fingerprint: Fingerprint,
        due_at: Instant,
        trigger: Trigger,
    ) -> ScheduleOutcome {
        let mut inner = self.inner.lock().await;
        let outcome = if let Some(existing) = inner.index.get(&fingerprint) {
            let new_due = existing.due_at.max(due_at);
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner.index.insert(fingerprint.clone(), Index { due_at: new_due, trigger, generation });
            inner.heap.push(HeapEntry { due_at: new_due, fingerprint, generation });
            ScheduleOutcome::Coalesced
        } else {
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner
                .index
                .insert(fingerprint.clone(), Index { due_at, trigger, generation });
            inner.heap.push(HeapEntry { due_at, fingerprint, generation });
            ScheduleOutcome::Scheduled
        };
        drop(inner);
        self.wake.notify_one();
        debug!(?outcome, "task scheduled");
        outcome
    }

    /// Removes a pending task for `fingerprint`, returning whether one was
    /// present. Cancelling a task whose handler is currently running (it was
    /// already popped) has no effect — the spec requires removal "before its
    /// handler runs" (§4.6), so by the time a handler observes state, the
    /// entry is already gone from the index.
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    pub async fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.inner.lock().await;
        inner.index.remove(fingerprint).is_some()
    }

    /// Pops the next due task once its deadline has passed, removing it from
    /// the index before returning so a handler invoked with the result can
    /// reschedule the same fingerprint without immediately colliding with
    /// itself. Returns `None` only if the scheduler is empty and woken
    /// spuriously — callers should loop.
    ///
    /// Past-due tasks fire immediately in submission order (spec.md §4.6):
    /// since the heap order is by `due_at`, any task already due when pushed
    /// sorts to the front ahead of later-dated entries. Blocks indefinitely
    /// while the scheduler is empty, waking as soon as a task is scheduled.
    pub async fn next_due(&self) -> ReconciliationTask {
        loop {
            let wait_for = {
                let mut inner = self.inner.lock().await;
                loop {
                    let Some(top) = inner.heap.peek() else { break None };
                    let stale = match inner.index.get(&top.fingerprint) {
                        None => true,
                        Some(current) => current.generation != top.generation,
                    };
                    if stale {
                        inner.heap.pop();
                        continue;
                    }

                    let now = Instant::now();
                    if top.due_at <= now {
                        let entry = inner.heap.pop().expect("peek succeeded");
                        let index_entry =
                            inner.index.remove(&entry.fingerprint).expect("generation matched");
                        return ReconciliationTask {
                            fingerprint: entry.fingerprint,
                            due_at: entry.due_at,
                            trigger: index_entry.trigger,
                        };
                    }
                    break Some(top.due_at - now);
                }
            };

            match wait_for {
                Some(delay) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    /// Number of tasks currently pending (not yet fired). Exposed for
    /// metrics/tests.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn schedule_then_cancel_prevents_fire() {
        let scheduler = DelayedTaskScheduler::new();
        let fp = Fingerprint::new(42, "D1".to_string());
        scheduler.schedule(fp.clone(), Instant::now() + Duration::from_secs(10), Trigger::PostGrabCheck).await;

        assert!(scheduler.cancel(&fp).await);
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesce_keeps_later_due_at() {
        let scheduler = DelayedTaskScheduler::new();
        let fp = Fingerprint::new(42, "D1".to_string());
        let first_due = Instant::now() + Duration::from_secs(5);
        let second_due = Instant::now() + Duration::from_secs(20);

        let first = scheduler.schedule(fp.clone(), first_due, Trigger::PostGrabCheck).await;
        assert_eq!(first, ScheduleOutcome::Scheduled);

        let second = scheduler.schedule(fp.clone(), second_due, Trigger::Retry).await;
        assert_eq!(second, ScheduleOutcome::Coalesced);

        assert_eq!(scheduler.pending_count().await, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        // Still not due: the stale 5s entry must not fire early.
        let task = tokio::time::timeout(Duration::from_millis(50), scheduler.next_due()).await;
        assert!(task.is_err(), "coalesced task should not fire at the earlier due_at");

        tokio::time::advance(Duration::from_secs(15)).await;
        let task = scheduler.next_due().await;
        assert_eq!(task.fingerprint, fp);
        assert_eq!(task.trigger, Trigger::Retry);
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_tasks_fire_immediately() {
        let scheduler = DelayedTaskScheduler::new();
        let fp = Fingerprint::new(1, "D1".to_string());
        scheduler.schedule(fp.clone(), Instant::now(), Trigger::PostGrabCheck).await;

        let task = tokio::time::timeout(Duration::from_millis(50), scheduler.next_due()).await.unwrap();
        assert_eq!(task.fingerprint, fp);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_fingerprints_both_fire() {
        let scheduler = DelayedTaskScheduler::new();
        let fp1 = Fingerprint::new(1, "D1".to_string());
        let fp2 = Fingerprint::new(2, "D2".to_string());
        scheduler.schedule(fp1.clone(), Instant::now() + Duration::from_secs(1), Trigger::PostGrabCheck).await;
        scheduler.schedule(fp2.clone(), Instant::now() + Duration::from_secs(2), Trigger::PostGrabCheck).await;

        tokio::time::advance(Duration::from_secs(3)).await;
        let first = scheduler.next_due().await;
        let second = scheduler.next_due().await;
        assert_eq!(first.fingerprint, fp1);
        assert_eq!(second.fingerprint, fp2);
    }

    #[tokio::test]
    async fn cancel_missing_fingerprint_returns_false() {
        let scheduler = DelayedTaskScheduler::new();
        let fp = Fingerprint::new(1, "D1".to_string());
        assert!(!scheduler.cancel(&fp).await);
    }
}
