//! Fork-join task pool with work stealing.
//!
//! Each thread owns a locked deque of tasks. `doall` runs a range-parallel
//! task to completion: the calling thread executes chunks itself, donates
//! half of its remaining range when peers signal steal pressure, and drains
//! its own queue (stealing when empty) until the task's completion counter
//! reaches zero. There is no ordering across sub-ranges; within a sub-range
//! the body has the range exclusively.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::state::{Global, State};

/// Run once before the body chunks; its result is passed to every body call.
pub type TaskHeaderFn = unsafe fn(args: *mut u8, a: u64, b: u64, state: &mut State) -> *mut u8;

/// Run per sub-range `[a, b)`.
pub type TaskBodyFn = unsafe fn(args: *mut u8, header: *mut u8, a: u64, b: u64, state: &mut State);

#[derive(Clone)]
pub struct Task {
    pub header: Option<TaskHeaderFn>,
    pub func: TaskBodyFn,
    pub args: *mut u8,
    pub a: u64,
    pub b: u64,
    pub alignment: u64,
    pub ppt: u64,
    pub done: Arc<AtomicI64>,
}

// SAFETY: `args` points at caller-owned data that outlives the doall barrier;
// the shared counter is atomic.
unsafe impl Send for Task {}

/// The half of a thread visible to its peers: its task deque and the steal
/// pressure counter.
pub struct WorkerShared {
    pub tasks: Mutex<VecDeque<Task>>,
    pub steals: AtomicI64,
}

impl WorkerShared {
    pub fn new() -> WorkerShared {
        WorkerShared {
            tasks: Mutex::new(VecDeque::new()),
            steals: AtomicI64::new(0),
        }
    }
}

impl Default for WorkerShared {
    fn default() -> Self {
        WorkerShared::new()
    }
}

pub fn spawn_worker(global: Arc<Global>, index: usize) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("riposte-worker-{}", index))
        .spawn(move || {
            let state = State::new(global.clone(), index);
            worker_loop(state);
        })
        .expect("spawn worker")
}

fn worker_loop(mut state: Box<State>) {
    let global = state.global.clone();
    log::debug!("worker {} up", state.index);
    while global.done.load(Ordering::Acquire) == 0 {
        let task = state.dequeue().or_else(|| state.steal());
        match task {
            Some(t) => state.run_task(t),
            None => std::thread::sleep(Duration::from_micros(50)),
        }
    }
    log::debug!("worker {} down", state.index);
    // Deregister from the root set before acknowledging the done signal.
    drop(state);
    global.done.fetch_add(1, Ordering::AcqRel);
}

impl State {
    /// Execute `func` over `[a, b)` across the pool, returning only after
    /// every sub-range has run.
    pub fn doall(
        &mut self,
        header: Option<TaskHeaderFn>,
        func: TaskBodyFn,
        args: *mut u8,
        a: u64,
        b: u64,
        alignment: u64,
        ppt: u64,
    ) {
        if a >= b {
            return;
        }
        let tmp = ppt + alignment - 1;
        let ppt = 1.max(tmp - (tmp % alignment));

        let task = Task {
            header,
            func,
            args,
            a,
            b,
            alignment,
            ppt,
            done: Arc::new(AtomicI64::new(1)),
        };
        let done = task.done.clone();
        self.run_task(task);

        while done.load(Ordering::Acquire) != 0 {
            match self.dequeue().or_else(|| self.steal()) {
                Some(t) => self.run_task(t),
                None => std::thread::yield_now(),
            }
        }
    }

    pub(crate) fn run_task(&mut self, mut t: Task) {
        // SAFETY: task functions uphold the range-exclusivity contract.
        let header = match t.header {
            Some(h) => unsafe { h(t.args, t.a, t.b, self) },
            None => std::ptr::null_mut(),
        };
        while t.a < t.b {
            // Relinquish work when someone failed to steal from us.
            let pressure = self.shared.steals.swap(0, Ordering::AcqRel);
            if pressure > 0 && (t.b - t.a) > t.ppt {
                let mut n = t.clone();
                if (t.b - t.a) > t.ppt * 4 {
                    let half = split(&t);
                    t.b = half;
                    n.a = half;
                } else {
                    t.b = t.a + t.ppt;
                    n.a = t.a + t.ppt;
                }
                if n.a < n.b {
                    let mut queue = self.shared.tasks.lock();
                    t.done.fetch_add(1, Ordering::AcqRel);
                    queue.push_front(n);
                }
            }
            let end = (t.a + t.ppt).min(t.b);
            // SAFETY: [t.a, end) is held exclusively by this worker.
            unsafe { (t.func)(t.args, header, t.a, end, self) };
            t.a += t.ppt;
        }
        t.done.fetch_add(-1, Ordering::AcqRel);
    }

    pub(crate) fn dequeue(&self) -> Option<Task> {
        self.shared.tasks.lock().pop_front()
    }

    /// Scan peer queues in index order, taking from the back; bump the
    /// victim's steal counter when its queue is empty so it splits next.
    pub(crate) fn steal(&self) -> Option<Task> {
        for (i, peer) in self.global.workers.iter().enumerate() {
            if i == self.index {
                continue;
            }
            let mut queue = peer.tasks.lock();
            if let Some(t) = queue.pop_back() {
                return Some(t);
            }
            peer.steals.fetch_add(1, Ordering::AcqRel);
        }
        None
    }
}

/// Midpoint of the remaining range, rounded to the task's alignment and
/// clamped into it.
fn split(t: &Task) -> u64 {
    let mut half = (t.a + t.b) / 2;
    let r = half + t.alignment / 2;
    half = r - (r % t.alignment);
    half.clamp(t.a, t.b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicU8};

    unsafe fn accumulate(args: *mut u8, _header: *mut u8, a: u64, b: u64, state: &mut State) {
        let counts = args as *const AtomicU64;
        (*counts.add(state.index)).fetch_add(b - a, Ordering::SeqCst);
        // Enough work per chunk that peers get a chance to steal.
        std::hint::black_box(a);
    }

    #[test]
    fn per_thread_counts_cover_the_whole_range() {
        let global = Global::new(4, &[]);
        let mut state = State::new_main(global.clone());
        let counts: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();

        state.doall(
            None,
            accumulate,
            counts.as_ptr() as *mut u8,
            0,
            1_000_000,
            1,
            1024,
        );

        let total: u64 = counts.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        assert_eq!(total, 1_000_000);
        drop(state);
        global.shutdown();
    }

    unsafe fn touch_each(args: *mut u8, _header: *mut u8, a: u64, b: u64, _state: &mut State) {
        let cells = args as *const AtomicU8;
        for i in a..b {
            (*cells.add(i as usize)).fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sub_ranges_are_exclusive_and_exhaustive() {
        let global = Global::new(3, &[]);
        let mut state = State::new_main(global.clone());
        let n = 100_000usize;
        let cells: Vec<AtomicU8> = (0..n).map(|_| AtomicU8::new(0)).collect();

        state.doall(None, touch_each, cells.as_ptr() as *mut u8, 0, n as u64, 1, 512);

        assert!(cells.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        drop(state);
        global.shutdown();
    }

    unsafe fn record_starts(args: *mut u8, _header: *mut u8, a: u64, _b: u64, _state: &mut State) {
        let misaligned = args as *const AtomicU64;
        if a % 64 != 0 {
            (*misaligned).fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn chunk_starts_respect_the_alignment() {
        let global = Global::new(2, &[]);
        let mut state = State::new_main(global.clone());
        let misaligned = AtomicU64::new(0);

        // ppt is rounded up to a multiple of the alignment.
        state.doall(
            None,
            record_starts,
            &misaligned as *const AtomicU64 as *mut u8,
            0,
            1 << 16,
            64,
            100,
        );

        assert_eq!(misaligned.load(Ordering::SeqCst), 0);
        drop(state);
        global.shutdown();
    }

    unsafe fn header_then_body(args: *mut u8, a: u64, b: u64, _state: &mut State) -> *mut u8 {
        assert_eq!((a, b), (0, 1000));
        args
    }

    unsafe fn body_sees_header(args: *mut u8, header: *mut u8, a: u64, b: u64, _state: &mut State) {
        assert_eq!(args, header);
        let count = args as *const AtomicU64;
        (*count).fetch_add(b - a, Ordering::SeqCst);
    }

    #[test]
    fn header_runs_once_up_front() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let count = AtomicU64::new(0);

        state.doall(
            Some(header_then_body),
            body_sees_header,
            &count as *const AtomicU64 as *mut u8,
            0,
            1000,
            1,
            64,
        );

        assert_eq!(count.load(Ordering::SeqCst), 1000);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn empty_ranges_are_a_no_op() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let count = AtomicU64::new(0);
        state.doall(
            None,
            body_sees_header,
            &count as *const AtomicU64 as *mut u8,
            10,
            10,
            1,
            1,
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(state);
        global.shutdown();
    }
}
