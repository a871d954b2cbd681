//! Bounded coalescing queue with per-lane FIFO order.
//!
//! Duplicate detection is a map lookup on the task's [`CoalesceKey`]. A
//! replacement takes over the slot of the task it replaces, so newer
//! equivalent work never jumps ahead of older unrelated work.
//!
//! The queue itself is not synchronized; the scheduler guards it with a
//! mutex.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::task::{CoalesceKey, Task, TaskId};

/// A task waiting in the queue.
#[derive(Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task: Arc<dyn Task>,
    pub lane: usize,
    pub queued_at: Instant,
    coalesce_key: Option<CoalesceKey>,
}

impl QueuedTask {
    pub fn new(id: TaskId, task: Arc<dyn Task>, lanes: usize) -> Self {
        let coalesce_key = task.coalesce_key();
        let lane = task.lane(lanes);
        Self {
            id,
            task,
            lane,
            queued_at: Instant::now(),
            coalesce_key,
        }
    }

    pub fn coalesce_key(&self) -> Option<&CoalesceKey> {
        self.coalesce_key.as_ref()
    }
}

impl std::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("kind", &self.task.kind())
            .field("key", self.task.work_key())
            .field("lane", &self.lane)
            .finish()
    }
}

/// What happened to a pushed task.
#[derive(Debug)]
pub enum PushOutcome {
    /// Appended to its lane.
    Enqueued,
    /// Took over the slot of a matching queued task.
    Replaced(QueuedTask),
    /// Appended after evicting the oldest queued task to stay within capacity.
    EnqueuedEvicting(QueuedTask),
}

/// Coalescing queue split into worker lanes.
pub struct CoalescingQueue {
    capacity: usize,
    next_seq: u64,
    /// Every queued task by arrival sequence; the first entry is the oldest.
    entries: BTreeMap<u64, QueuedTask>,
    /// Sequence numbers per lane in FIFO order.
    lanes: Vec<VecDeque<u64>>,
    /// Queued sequence number for each coalescing key.
    by_key: HashMap<CoalesceKey, u64>,
}

impl CoalescingQueue {
    pub fn new(lanes: usize, capacity: usize) -> Self {
        let lanes = lanes.max(1);
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: BTreeMap::new(),
            lanes: vec![VecDeque::new(); lanes],
            by_key: HashMap::new(),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lane_len(&self, lane: usize) -> usize {
        self.lanes.get(lane).map_or(0, VecDeque::len)
    }

    /// Insert `queued`, replacing a matching task in place if one is queued.
    pub fn push(&mut self, queued: QueuedTask) -> PushOutcome {
        if let Some(key) = queued.coalesce_key() {
            if let Some(&seq) = self.by_key.get(key) {
                if let Some(slot) = self.entries.get_mut(&seq) {
                    let replaced = std::mem::replace(slot, queued);
                    return PushOutcome::Replaced(replaced);
                }
            }
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(key) = queued.coalesce_key() {
            self.by_key.insert(key.clone(), seq);
        }
        self.lanes[queued.lane].push_back(seq);
        self.entries.insert(seq, queued);

        match evicted {
            Some(evicted) => PushOutcome::EnqueuedEvicting(evicted),
            None => PushOutcome::Enqueued,
        }
    }

    /// Take the next task of `lane`.
    pub fn pop(&mut self, lane: usize) -> Option<QueuedTask> {
        let seq = self.lanes.get_mut(lane)?.pop_front()?;
        self.remove_entry(seq)
    }

    /// Remove every queued task, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        for lane in &mut self.lanes {
            lane.clear();
        }
        self.by_key.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn evict_oldest(&mut self) -> Option<QueuedTask> {
        let (&seq, oldest) = self.entries.first_key_value()?;
        let lane = oldest.lane;
        // Lanes are in arrival order, so the globally oldest entry is the
        // front of its lane.
        debug_assert_eq!(self.lanes[lane].front(), Some(&seq));
        self.lanes[lane].retain(|s| *s != seq);
        self.remove_entry(seq)
    }

    fn remove_entry(&mut self, seq: u64) -> Option<QueuedTask> {
        let queued = self.entries.remove(&seq)?;
        if let Some(key) = queued.coalesce_key() {
            if self.by_key.get(key) == Some(&seq) {
                self.by_key.remove(key);
            }
        }
        Some(queued)
    }
}
