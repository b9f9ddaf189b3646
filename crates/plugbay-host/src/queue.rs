//! Priority load queue.
//!
//! Tasks are totally ordered: priority tier first, enqueue order second, so
//! dispatch is strict priority precedence with strict FIFO inside a tier.
//! The queue is keyed by plugin name -- enqueueing a name that is already
//! queued re-prioritizes the existing task instead of duplicating it.
//!
//! Re-prioritization leaves stale nodes in the heap; each live entry carries
//! a generation counter and stale nodes are skipped on pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use plugbay_manifest::PluginManifest;

/// Load precedence tier.  Lower tiers dispatch first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl LoadPriority {
    /// One tier lower, saturating at [`LoadPriority::Background`].
    #[must_use]
    pub fn degraded(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Normal,
            Self::Normal => Self::Low,
            Self::Low => Self::Background,
            Self::Background => Self::Background,
        }
    }
}

impl std::fmt::Display for LoadPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        };
        f.write_str(s)
    }
}

/// A dequeued load request, ready for dispatch.
#[derive(Debug, Clone)]
pub struct LoadTask {
    pub manifest: Arc<PluginManifest>,
    pub path: PathBuf,
    pub priority: LoadPriority,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// Summary of one queued task, for status snapshots.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueuedTaskInfo {
    pub name: String,
    pub priority: LoadPriority,
    pub attempts: u32,
}

struct Entry {
    generation: u64,
    priority: LoadPriority,
    seq: u64,
    manifest: Arc<PluginManifest>,
    path: PathBuf,
    attempts: u32,
}

struct Node {
    priority: LoadPriority,
    seq: u64,
    generation: u64,
    name: String,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    // BinaryHeap is a max-heap; reverse so the most urgent, oldest task
    // surfaces first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Name-keyed priority queue of pending loads.
pub struct LoadQueue {
    heap: BinaryHeap<Node>,
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl LoadQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert a task, or raise the priority of the queued task of the same
    /// name.  A duplicate enqueue only ever makes the task more urgent; a
    /// lower priority leaves the queued task where it is.  Explicit demotion
    /// goes through [`LoadQueue::reprioritize`].
    ///
    /// Re-prioritization keeps the task's original enqueue order for
    /// FIFO tie-breaking within its (new) tier.
    pub fn push(&mut self, manifest: Arc<PluginManifest>, path: PathBuf, priority: LoadPriority) {
        let name = manifest.name.clone();
        if let Some(entry) = self.entries.get(&name) {
            if priority < entry.priority {
                self.reprioritize(&name, priority);
            }
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            name.clone(),
            Entry {
                generation: 0,
                priority,
                seq,
                manifest,
                path,
                attempts: 0,
            },
        );
        self.heap.push(Node {
            priority,
            seq,
            generation: 0,
            name,
        });
    }

    /// Re-insert a previously popped task (a failed attempt, or a load held
    /// back by the dispatcher), carrying its attempt count.  The task goes
    /// to the back of its tier.
    pub fn requeue(&mut self, task: LoadTask, priority: LoadPriority) {
        let name = task.manifest.name.clone();
        let seq = self.next_seq;
        self.next_seq += 1;
        let generation = self
            .entries
            .get(&name)
            .map(|e| e.generation + 1)
            .unwrap_or(0);
        self.entries.insert(
            name.clone(),
            Entry {
                generation,
                priority,
                seq,
                manifest: task.manifest,
                path: task.path,
                attempts: task.attempts,
            },
        );
        self.heap.push(Node {
            priority,
            seq,
            generation,
            name,
        });
    }

    /// Change the priority of a queued task.  Returns false if the name is
    /// not queued.
    pub fn reprioritize(&mut self, name: &str, priority: LoadPriority) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        if entry.priority == priority {
            return true;
        }
        entry.generation += 1;
        entry.priority = priority;
        self.heap.push(Node {
            priority,
            seq: entry.seq,
            generation: entry.generation,
            name: name.to_string(),
        });
        true
    }

    /// Remove a queued task by name.  Its heap nodes become stale.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Pop the most urgent, oldest task.
    pub fn pop(&mut self) -> Option<LoadTask> {
        while let Some(node) = self.heap.pop() {
            let live = self
                .entries
                .get(&node.name)
                .is_some_and(|e| e.generation == node.generation);
            if !live {
                continue;
            }
            let entry = self
                .entries
                .remove(&node.name)
                .expect("entry checked above");
            return Some(LoadTask {
                manifest: entry.manifest,
                path: entry.path,
                priority: entry.priority,
                attempts: entry.attempts,
            });
        }
        None
    }

    /// Snapshot of all queued tasks, most urgent first.
    pub fn snapshot(&self) -> Vec<QueuedTaskInfo> {
        let mut tasks: Vec<_> = self
            .entries
            .iter()
            .map(|(name, e)| (e.priority, e.seq, name.clone(), e.attempts))
            .collect();
        tasks.sort();
        tasks
            .into_iter()
            .map(|(priority, _, name, attempts)| QueuedTaskInfo {
                name,
                priority,
                attempts,
            })
            .collect()
    }
}

impl Default for LoadQueue {
    fn default() -> Self {
        Self::new()
    }
}
