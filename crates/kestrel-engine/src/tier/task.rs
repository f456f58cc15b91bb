//! Compile tasks and the priority queue
//!
//! Priority rises with hotness; OSR tasks get a fixed boost above every
//! plain tier-up because an already-running hot loop needs relief fast.
//! Tasks are cancellable: the flag is checked at pass boundaries and the
//! partial artifact is dropped.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::Tier;

/// Priority boost applied to OSR compiles.
const OSR_PRIORITY_BOOST: u32 = 1 << 20;

/// Bound on queued tasks; excess submissions are dropped (the function will
/// re-trip its threshold).
const MAX_QUEUE: usize = 1024;

/// One compilation request.
#[derive(Debug, Clone)]
pub struct CompileTask {
    /// Function to compile
    pub func_index: u32,
    /// Tier to compile for
    pub target_tier: Tier,
    /// Queue priority (higher first)
    pub priority: u32,
    /// OSR target bytecode offset, when this is an OSR compile
    pub osr_offset: Option<u32>,
    /// When the task entered the queue
    pub enqueued_at: Instant,
    cancelled: Arc<AtomicBool>,
}

impl CompileTask {
    /// A plain tier-up task; hotness becomes priority.
    pub fn tier_up(func_index: u32, target_tier: Tier, hotness: u32) -> Self {
        CompileTask {
            func_index,
            target_tier,
            priority: hotness,
            osr_offset: None,
            enqueued_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An OSR task targeting a loop header.
    pub fn osr(func_index: u32, target_tier: Tier, offset: u32) -> Self {
        CompileTask {
            func_index,
            target_tier,
            priority: OSR_PRIORITY_BOOST + offset,
            osr_offset: Some(offset),
            enqueued_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation handle (shared with the submitter).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for CompileTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for CompileTask {}
impl PartialOrd for CompileTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for CompileTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; ties go to
        // the earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

/// The shared priority queue.
pub struct CompileQueue {
    heap: Mutex<BinaryHeap<CompileTask>>,
    available: Condvar,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Condvar,
}

impl CompileQueue {
    /// Empty queue.
    pub fn new() -> Self {
        CompileQueue {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Condvar::new(),
        }
    }

    /// Submit a task. Silently dropped when the queue is full or closed.
    pub fn push(&self, task: CompileTask) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut heap = self.heap.lock();
        if heap.len() >= MAX_QUEUE {
            return;
        }
        heap.push(task);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.available.notify_one();
    }

    /// Block until a task is available or the queue closes.
    pub fn pop_blocking(&self) -> Option<CompileTask> {
        let mut heap = self.heap.lock();
        loop {
            if let Some(task) = heap.pop() {
                return Some(task);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.available.wait(&mut heap);
        }
    }

    /// Mark one popped task finished.
    pub fn task_done(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.heap.lock();
            self.idle.notify_all();
        }
    }

    /// Wait until no tasks are queued or running.
    pub fn wait_idle(&self) {
        let mut heap = self.heap.lock();
        while self.in_flight.load(Ordering::Acquire) > 0 || !heap.is_empty() {
            self.idle.wait_for(&mut heap, std::time::Duration::from_millis(50));
        }
    }

    /// Close the queue, waking all waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.heap.lock();
        self.available.notify_all();
        self.idle.notify_all();
    }

    /// Queued (not yet popped) task count.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl Default for CompileQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let q = CompileQueue::new();
        q.push(CompileTask::tier_up(1, Tier::Baseline, 100));
        q.push(CompileTask::tier_up(2, Tier::Baseline, 500));
        q.push(CompileTask::tier_up(3, Tier::Baseline, 300));

        assert_eq!(q.pop_blocking().unwrap().func_index, 2);
        assert_eq!(q.pop_blocking().unwrap().func_index, 3);
        assert_eq!(q.pop_blocking().unwrap().func_index, 1);
    }

    #[test]
    fn test_osr_outranks_tier_up() {
        let q = CompileQueue::new();
        q.push(CompileTask::tier_up(1, Tier::Optimizing, 1_000_000));
        q.push(CompileTask::osr(2, Tier::Baseline, 16));
        assert_eq!(q.pop_blocking().unwrap().func_index, 2);
    }

    #[test]
    fn test_close_unblocks() {
        let q = Arc::new(CompileQueue::new());
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.pop_blocking());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        assert!(h.join().unwrap().is_none());
    }

    #[test]
    fn test_cancellation_flag() {
        let t = CompileTask::tier_up(1, Tier::Baseline, 10);
        let flag = t.cancel_flag();
        assert!(!t.is_cancelled());
        flag.store(true, Ordering::Release);
        assert!(t.is_cancelled());
    }
}
