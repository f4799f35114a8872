//! Priority-based outbound message queue with admission control, batching,
//! and expiration (spec.md §4.5).
//!
//! `PriorityClass` and the processing modes are renamed from the original
//! system's `QoSLevel`/throttling split
//! (`original_source/afs_fastapi/equipment/advanced_message_prioritization.py`)
//! to this crate's vocabulary; the per-class `VecDeque`s behind one
//! `tokio::sync::Mutex` follow this crate's other single-lock registries
//! (`address::Registry`, `transport::TransportEngine`) rather than the
//! Python reference's unsynchronized dataclasses, since the queue is
//! shared across the manager's ingress and egress tasks.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::congestion::CongestionLevel;

/// Priority classes, highest first. Ord is derived from declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityClass {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl PriorityClass {
    const ALL: [PriorityClass; 5] = [
        PriorityClass::Critical,
        PriorityClass::High,
        PriorityClass::Normal,
        PriorityClass::Low,
        PriorityClass::Background,
    ];

    /// Lowest-first eviction order used by capacity-triggered admission
    /// control: BACKGROUND, then LOW, then NORMAL. CRITICAL/HIGH are
    /// never eviction targets.
    const EVICTION_ORDER: [PriorityClass; 3] =
        [PriorityClass::Background, PriorityClass::Low, PriorityClass::Normal];
}

/// Agricultural operation context, used by `congestion`/`bandwidth` to
/// scale priority and allocation (spec.md §4.6/§4.7) and by `Adaptive`
/// mode selection below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationContext {
    FieldWork,
    Transport,
    Emergency,
    Maintenance,
    Idle,
}

/// How the queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Dequeue one message at a time, strict priority order.
    RealTime,
    /// Stage non-CRITICAL messages and flush in batches; see
    /// `PriorityQueue::stage_eligible`/`try_flush_batch`.
    Batch,
    /// Picks `RealTime`/`Batch`/`Emergency` per tick from the current
    /// operation context and congestion level; see `select_adaptive_mode`.
    Adaptive,
    /// Only `Critical` and `High` are dequeued; lower classes are dropped
    /// on enqueue.
    Emergency,
}

/// Resolve the effective mode for one `Adaptive` tick.
pub fn select_adaptive_mode(context: OperationContext, congestion: CongestionLevel) -> ProcessingMode {
    if context == OperationContext::Emergency {
        return ProcessingMode::Emergency;
    }
    if congestion == CongestionLevel::Critical {
        return ProcessingMode::Batch;
    }
    if context == OperationContext::FieldWork {
        return ProcessingMode::RealTime;
    }
    ProcessingMode::Batch
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub pgn: u32,
    pub priority: PriorityClass,
    pub destination: Option<u8>,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub batch_eligible: bool,
    pub safety_critical: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedMessage {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline < now)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is at capacity and priority class {0:?} is not eligible to evict")]
    Rejected(PriorityClass),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Total depth across all priority classes.
    pub capacity: usize,
    pub mode: ProcessingMode,
    pub max_batch: usize,
    pub min_batch: usize,
    pub max_batch_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            mode: ProcessingMode::RealTime,
            max_batch: 16,
            min_batch: 4,
            max_batch_age: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub messages_rejected: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_expired: AtomicU64,
}

struct Classes {
    queues: [VecDeque<QueuedMessage>; 5],
    staging: VecDeque<QueuedMessage>,
    staging_opened_at: Option<Instant>,
}

impl Default for Classes {
    fn default() -> Self {
        Self {
            queues: std::array::from_fn(|_| VecDeque::new()),
            staging: VecDeque::new(),
            staging_opened_at: None,
        }
    }
}

pub struct PriorityQueue {
    classes: Mutex<Classes>,
    config: QueueConfig,
    pub counters: QueueCounters,
}

fn class_index(class: PriorityClass) -> usize {
    PriorityClass::ALL.iter().position(|c| *c == class).expect("PriorityClass::ALL covers all variants")
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self { classes: Mutex::new(Classes::default()), config, counters: QueueCounters::default() }
    }

    fn total_depth(classes: &Classes) -> usize {
        classes.queues.iter().map(VecDeque::len).sum::<usize>() + classes.staging.len()
    }

    /// Admission control (spec.md §4.5 step 1-2): at capacity, CRITICAL/HIGH
    /// evict the oldest message from the lowest non-empty eviction-order
    /// class; anything else is rejected outright. Under `Emergency` mode,
    /// anything below `High` is dropped unconditionally.
    pub async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError> {
        self.admit(message, false).await
    }

    /// Same admission control as [`Self::enqueue`], but inserts at the head
    /// of its priority class rather than the tail. Used to requeue a failed
    /// batch ahead of whatever was already enqueued behind it (spec.md §6).
    async fn enqueue_front(&self, message: QueuedMessage) -> Result<(), QueueError> {
        self.admit(message, true).await
    }

    async fn admit(&self, message: QueuedMessage, front: bool) -> Result<(), QueueError> {
        let mut classes = self.classes.lock().await;

        if self.config.mode == ProcessingMode::Emergency
            && !matches!(message.priority, PriorityClass::Critical | PriorityClass::High)
        {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if Self::total_depth(&classes) >= self.config.capacity {
            let can_evict = matches!(message.priority, PriorityClass::Critical | PriorityClass::High);
            if !can_evict || !evict_lowest(&mut classes) {
                self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(QueueError::Rejected(message.priority));
            }
        }

        let queue = &mut classes.queues[class_index(message.priority)];
        if front {
            queue.push_front(message);
        } else {
            queue.push_back(message);
        }
        Ok(())
    }

    /// `RealTime` drain: pull the single next eligible message, skipping
    /// (and counting) anything already past its deadline.
    pub async fn dequeue_next(&self, now: Instant) -> Option<QueuedMessage> {
        let mut classes = self.classes.lock().await;
        loop {
            let idx = PriorityClass::ALL.iter().position(|c| !classes.queues[class_index(*c)].is_empty())?;
            let message = classes.queues[idx].pop_front()?;
            if message.is_expired(now) {
                self.counters.messages_expired.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(message);
        }
    }

    /// Move batch-eligible, non-expired messages from non-CRITICAL classes
    /// into the staging buffer, opening the staging window on first move.
    /// Messages with `batch_eligible == false` are left in their class
    /// queue for `dequeue_next` to deliver individually instead.
    pub async fn stage_eligible(&self, now: Instant) {
        let mut classes = self.classes.lock().await;
        for class in [PriorityClass::High, PriorityClass::Normal, PriorityClass::Low, PriorityClass::Background] {
            let idx = class_index(class);
            let mut retained = VecDeque::new();
            while let Some(message) = classes.queues[idx].pop_front() {
                if message.is_expired(now) {
                    self.counters.messages_expired.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if !message.batch_eligible {
                    retained.push_back(message);
                    continue;
                }
                if classes.staging_opened_at.is_none() {
                    classes.staging_opened_at = Some(now);
                }
                classes.staging.push_back(message);
            }
            classes.queues[idx] = retained;
        }
    }

    /// Flush the staging buffer once it meets the size/age criteria
    /// (spec.md §4.5 `Batch` mode), returning `None` if not yet ready.
    pub async fn try_flush_batch(&self, now: Instant) -> Option<Vec<QueuedMessage>> {
        let mut classes = self.classes.lock().await;
        let Some(opened_at) = classes.staging_opened_at else {
            return None;
        };
        let size = classes.staging.len();
        let age = now.saturating_duration_since(opened_at);

        let ready = size >= self.config.max_batch
            || age >= self.config.max_batch_age
            || (size >= self.config.min_batch && age >= self.config.max_batch_age / 2);

        if !ready || size == 0 {
            return None;
        }

        let take = size.min(self.config.max_batch);
        let batch: Vec<QueuedMessage> = classes.staging.drain(..take).collect();
        classes.staging_opened_at = if classes.staging.is_empty() { None } else { Some(now) };
        Some(batch)
    }

    /// Re-enqueue a message that failed delivery from its sink. CRITICAL/HIGH
    /// messages are dropped rather than retried: by the time a resend would
    /// land, a safety-critical message is better replaced by the sender's
    /// next one than delivered late (spec.md §6). Lower classes retry, at
    /// the head of their priority class, until `max_retries` is exhausted.
    pub async fn retry_or_drop(&self, mut message: QueuedMessage) -> Result<(), QueueError> {
        if matches!(message.priority, PriorityClass::Critical | PriorityClass::High) {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if message.retry_count >= message.max_retries {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        message.retry_count += 1;
        self.enqueue_front(message).await
    }

    /// Drop any queued NORMAL/LOW/BACKGROUND backlog, including staged
    /// batch-eligible messages, counting each as dropped. Used for one
    /// `Emergency` tick (spec.md §4.5): CRITICAL/HIGH must reach the next
    /// `dequeue_next` call unobstructed by a backlog that predates the
    /// emergency.
    pub async fn drop_backlog_below_high(&self) -> usize {
        let mut classes = self.classes.lock().await;
        let mut count = 0;
        for class in [PriorityClass::Normal, PriorityClass::Low, PriorityClass::Background] {
            let idx = class_index(class);
            count += classes.queues[idx].len();
            classes.queues[idx].clear();
        }
        let staged_before = classes.staging.len();
        classes.staging.retain(|m| m.priority == PriorityClass::High);
        count += staged_before - classes.staging.len();
        if classes.staging.is_empty() {
            classes.staging_opened_at = None;
        }
        self.counters.messages_dropped.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub async fn len(&self, class: PriorityClass) -> usize {
        self.classes.lock().await.queues[class_index(class)].len()
    }

    pub async fn is_empty(&self) -> bool {
        let classes = self.classes.lock().await;
        Self::total_depth(&classes) == 0
    }

    pub fn mode(&self) -> ProcessingMode {
        self.config.mode
    }

    /// Drain every queued and staged message, counting each as dropped.
    /// Used by shutdown to account for in-flight work before closing sinks.
    pub async fn drain_all(&self) -> usize {
        let mut classes = self.classes.lock().await;
        let mut count = 0;
        for class in PriorityClass::ALL {
            count += classes.queues[class_index(class)].len();
            classes.queues[class_index(class)].clear();
        }
        count += classes.staging.len();
        classes.staging.clear();
        classes.staging_opened_at = None;
        self.counters.messages_dropped.fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}

/// Pop the single oldest message from the lowest populated eviction-order
/// class (BACKGROUND, then LOW, then NORMAL).
fn evict_lowest(classes: &mut Classes) -> bool {
    for class in PriorityClass::EVICTION_ORDER {
        let idx = class_index(class);
        if classes.queues[idx].pop_front().is_some() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(priority: PriorityClass) -> QueuedMessage {
        QueuedMessage {
            pgn: 0xF004,
            priority,
            destination: None,
            payload: vec![0; 8],
            enqueued_at: Instant::now(),
            deadline: None,
            batch_eligible: true,
            safety_critical: false,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn dequeue_respects_strict_priority_order() {
        let queue = PriorityQueue::new(QueueConfig::default());
        let now = Instant::now();
        queue.enqueue(message(PriorityClass::Low)).await.unwrap();
        queue.enqueue(message(PriorityClass::Critical)).await.unwrap();
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();

        assert_eq!(queue.dequeue_next(now).await.unwrap().priority, PriorityClass::Critical);
        assert_eq!(queue.dequeue_next(now).await.unwrap().priority, PriorityClass::Normal);
        assert_eq!(queue.dequeue_next(now).await.unwrap().priority, PriorityClass::Low);
    }

    #[tokio::test]
    async fn full_queue_evicts_background_for_critical() {
        let config = QueueConfig { capacity: 1, ..Default::default() };
        let queue = PriorityQueue::new(config);
        queue.enqueue(message(PriorityClass::Background)).await.unwrap();
        queue.enqueue(message(PriorityClass::Critical)).await.unwrap();
        assert_eq!(queue.len(PriorityClass::Background).await, 0);
        assert_eq!(queue.len(PriorityClass::Critical).await, 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_low_priority_enqueue() {
        let config = QueueConfig { capacity: 1, ..Default::default() };
        let queue = PriorityQueue::new(config);
        queue.enqueue(message(PriorityClass::Low)).await.unwrap();
        let result = queue.enqueue(message(PriorityClass::Low)).await;
        assert_eq!(result, Err(QueueError::Rejected(PriorityClass::Low)));
        assert_eq!(queue.counters.messages_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn emergency_mode_drops_messages_below_high_on_enqueue() {
        let config = QueueConfig { mode: ProcessingMode::Emergency, ..Default::default() };
        let queue = PriorityQueue::new(config);
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();
        queue.enqueue(message(PriorityClass::High)).await.unwrap();
        assert!(queue.is_empty().await == false);
        assert_eq!(queue.len(PriorityClass::Normal).await, 0);
        assert_eq!(queue.len(PriorityClass::High).await, 1);
        assert_eq!(queue.counters.messages_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expired_message_is_skipped_and_counted_on_dequeue() {
        let queue = PriorityQueue::new(QueueConfig::default());
        let now = Instant::now();
        let mut expired = message(PriorityClass::Normal);
        expired.deadline = Some(now - Duration::from_millis(1));
        queue.enqueue(expired).await.unwrap();
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();

        let delivered = queue.dequeue_next(now).await.unwrap();
        assert!(delivered.deadline.is_none());
        assert_eq!(queue.counters.messages_expired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn batch_excludes_critical_and_flushes_once_min_batch_and_half_age_elapse() {
        let config = QueueConfig {
            mode: ProcessingMode::Batch,
            max_batch: 10,
            min_batch: 2,
            max_batch_age: Duration::from_millis(100),
            ..Default::default()
        };
        let queue = PriorityQueue::new(config);
        let t0 = Instant::now();
        queue.enqueue(message(PriorityClass::Critical)).await.unwrap();
        queue.enqueue(message(PriorityClass::High)).await.unwrap();
        queue.enqueue(message(PriorityClass::Low)).await.unwrap();

        queue.stage_eligible(t0).await;
        assert!(queue.try_flush_batch(t0).await.is_none());

        let later = t0 + Duration::from_millis(60);
        let batch = queue.try_flush_batch(later).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].priority, PriorityClass::High);
        assert_eq!(queue.len(PriorityClass::Critical).await, 1);
    }

    #[tokio::test]
    async fn batch_flushes_immediately_once_max_batch_reached() {
        let config = QueueConfig { mode: ProcessingMode::Batch, max_batch: 2, ..Default::default() };
        let queue = PriorityQueue::new(config);
        let now = Instant::now();
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();
        queue.stage_eligible(now).await;
        let batch = queue.try_flush_batch(now).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn retry_or_drop_reenqueues_until_max_retries_then_drops() {
        let queue = PriorityQueue::new(QueueConfig::default());
        let mut failed = message(PriorityClass::Normal);
        failed.max_retries = 1;

        queue.retry_or_drop(failed.clone()).await.unwrap();
        assert_eq!(queue.len(PriorityClass::Normal).await, 1);

        let now = Instant::now();
        let requeued = queue.dequeue_next(now).await.unwrap();
        assert_eq!(requeued.retry_count, 1);
        queue.retry_or_drop(requeued).await.unwrap();
        assert_eq!(queue.len(PriorityClass::Normal).await, 0);
        assert_eq!(queue.counters.messages_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_or_drop_never_retries_critical_or_high() {
        let queue = PriorityQueue::new(QueueConfig::default());
        let mut failed = message(PriorityClass::High);
        failed.max_retries = 5;
        queue.retry_or_drop(failed).await.unwrap();
        assert_eq!(queue.len(PriorityClass::High).await, 0);
        assert_eq!(queue.counters.messages_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_or_drop_requeues_at_the_head_of_its_class() {
        let queue = PriorityQueue::new(QueueConfig::default());
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap(); // already-waiting message
        let mut failed = message(PriorityClass::Normal);
        failed.max_retries = 1;
        queue.retry_or_drop(failed).await.unwrap();

        let now = Instant::now();
        let first_out = queue.dequeue_next(now).await.unwrap();
        assert_eq!(first_out.retry_count, 1, "the retried message should be ahead of what was already queued");
    }

    #[tokio::test]
    async fn drop_backlog_below_high_clears_lower_classes_and_keeps_high() {
        let queue = PriorityQueue::new(QueueConfig::default());
        queue.enqueue(message(PriorityClass::Critical)).await.unwrap();
        queue.enqueue(message(PriorityClass::High)).await.unwrap();
        queue.enqueue(message(PriorityClass::Normal)).await.unwrap();
        queue.enqueue(message(PriorityClass::Low)).await.unwrap();
        queue.enqueue(message(PriorityClass::Background)).await.unwrap();

        let dropped = queue.drop_backlog_below_high().await;
        assert_eq!(dropped, 3);
        assert_eq!(queue.len(PriorityClass::Critical).await, 1);
        assert_eq!(queue.len(PriorityClass::High).await, 1);
        assert_eq!(queue.len(PriorityClass::Normal).await, 0);
        assert_eq!(queue.len(PriorityClass::Low).await, 0);
        assert_eq!(queue.len(PriorityClass::Background).await, 0);
        assert_eq!(queue.counters.messages_dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn adaptive_mode_selection_follows_context_and_congestion() {
        assert_eq!(
            select_adaptive_mode(OperationContext::Emergency, CongestionLevel::Normal),
            ProcessingMode::Emergency
        );
        assert_eq!(
            select_adaptive_mode(OperationContext::Transport, CongestionLevel::Critical),
            ProcessingMode::Batch
        );
        assert_eq!(
            select_adaptive_mode(OperationContext::FieldWork, CongestionLevel::Normal),
            ProcessingMode::RealTime
        );
        assert_eq!(select_adaptive_mode(OperationContext::Idle, CongestionLevel::Normal), ProcessingMode::Batch);
    }
}
