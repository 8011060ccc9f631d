use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::world::clock::GameTick;
use crate::world::state::WorldState;

/// A deferred unit of work run on the tick thread. An `Err` is logged by the
/// caller and, for repeating tasks, drops the repeat.
pub type TaskAction = Box<dyn FnMut(&mut WorldState) -> Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Opaque ticket returned by `schedule`, consumed by `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(TaskId);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    due: GameTick,
    seq: u64,
    id: TaskId,
}

/// Min-heap by (due, submission order); BinaryHeap is a max-heap, so the
/// ordering is reversed.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

struct TaskState {
    cancelled: bool,
    repeat: Option<u64>,
    action: Option<TaskAction>,
}

pub struct DueTask {
    pub id: TaskId,
    pub action: TaskAction,
    pub repeat: Option<u64>,
}

#[derive(Default)]
pub struct TaskScheduler {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<TaskId, TaskState>,
    next_id: u64,
    next_seq: u64,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.tasks.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task due `delay` ticks from `current`. `repeat` of `Some(n)`
    /// re-enqueues the task `n` ticks after each successful execution.
    pub fn schedule(
        &mut self,
        current: GameTick,
        delay: u64,
        repeat: Option<u64>,
        action: TaskAction,
    ) -> TaskHandle {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(
            id,
            TaskState {
                cancelled: false,
                repeat,
                action: Some(action),
            },
        );
        self.push_entry(id, GameTick(current.0.saturating_add(delay)));
        TaskHandle(id)
    }

    /// Flag a task as cancelled. Takes effect the next time the task is
    /// checked for execution; a cancelled task never runs.
    pub fn cancel(&mut self, handle: &TaskHandle) -> bool {
        match self.tasks.get_mut(&handle.0) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self, handle: &TaskHandle) -> bool {
        self.tasks
            .get(&handle.0)
            .map(|task| !task.cancelled)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pop every task due at or before `current`, in FIFO submission order
    /// for equal due-ticks. Cancelled tasks are dropped here, not executed.
    pub fn take_due(&mut self, current: GameTick) -> Vec<DueTask> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.due > current {
                break;
            }
            let entry = match self.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            let state = match self.tasks.get_mut(&entry.id) {
                Some(state) => state,
                // Stale heap entry from a resubmitted task; ignore.
                None => continue,
            };
            if state.cancelled {
                self.tasks.remove(&entry.id);
                continue;
            }
            let action = match state.action.take() {
                Some(action) => action,
                None => continue,
            };
            due.push(DueTask {
                id: entry.id,
                action,
                repeat: state.repeat,
            });
        }
        due
    }

    /// Hand a task back after execution. A repeating task that succeeded is
    /// re-enqueued for exactly `current + interval`; everything else (one
    /// shots, failures, tasks cancelled mid-execution) is dropped.
    pub fn complete(
        &mut self,
        current: GameTick,
        id: TaskId,
        action: TaskAction,
        succeeded: bool,
    ) {
        let state = match self.tasks.get_mut(&id) {
            Some(state) => state,
            None => return,
        };
        if state.cancelled || !succeeded {
            self.tasks.remove(&id);
            return;
        }
        match state.repeat {
            Some(interval) => {
                state.action = Some(action);
                let due = GameTick(current.0.saturating_add(interval.max(1)));
                self.push_entry(id, due);
            }
            None => {
                self.tasks.remove(&id);
            }
        }
    }

    fn push_entry(&mut self, id: TaskId, due: GameTick) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { due, seq, id });
    }
}
