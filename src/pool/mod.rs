//! Worker pool.
//!
//! A fixed set of executors runs data-parallel batches with deterministic
//! result ordering. Executor 0 is the calling thread; executors 1..N−1 are
//! OS threads pinned by the topology map, each owning its own VM and heap.
//! Tasks flow through a bounded MPMC queue that doubles when full; results
//! come back tagged with their submission id and are gathered into a LIST in
//! submission order. While a fan-out is active the calling thread switches
//! reference counting to atomic mode; workers run in atomic mode for their
//! whole life.

pub mod mpmc;
pub mod topology;

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::obj::Obj;
use crate::vm::{self, Vm};
use mpmc::Mpmc;

const DEFAULT_MPMC_SIZE: usize = 2048;
/// Inputs below one small multiple of a page are not worth splitting.
const POOL_SPLIT_THRESHOLD: i64 = 4 * PAGE_SIZE as i64;
/// Past this many groups, per-group contention dominates; stay serial.
const GROUP_SPLIT_THRESHOLD: i64 = 100_000;
pub const PAGE_SIZE: usize = 4096;

/// Chunked scan shape: `(chunk_len, offset, shared context)`.
pub type ChunkFn = fn(i64, i64, *mut ()) -> Obj;

#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub id: i64,
    pub fun: ChunkFn,
    pub len: i64,
    pub offset: i64,
    pub ctx: *mut (),
}

// Task contexts point at caller-owned state that outlives the fan-out.
unsafe impl Send for Task {}

pub struct TaskResult {
    pub id: i64,
    pub result: Obj,
}

struct PoolState {
    tasks: i64,
    done: i64,
    round: u64,
    stopped: bool,
    task_q: Arc<Mpmc<Task>>,
    result_q: Arc<Mpmc<TaskResult>>,
}

struct Shared {
    state: Mutex<PoolState>,
    run_cv: Condvar,
    done_cv: Condvar,
}

struct ExecutorSlot {
    vm: AtomicPtr<Vm>,
    handle: Option<std::thread::JoinHandle<()>>,
}

pub struct Pool {
    shared: Arc<Shared>,
    executors: Vec<ExecutorSlot>,
    /// Serialises whole fan-out sessions (prepare → run).
    fanout: Mutex<()>,
}

impl Pool {
    /// Create a pool of `count` executors (including the caller).
    pub fn create(count: usize) -> Pool {
        let count = count.max(1);
        let cpu_map = topology::build_cpu_map(count);

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: 0,
                done: 0,
                round: 0,
                stopped: false,
                task_q: Arc::new(Mpmc::new(DEFAULT_MPMC_SIZE)),
                result_q: Arc::new(Mpmc::new(DEFAULT_MPMC_SIZE)),
            }),
            run_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        if !topology::pin_current_thread(cpu_map[0]) {
            debug!(cpu = cpu_map[0], "failed to pin main thread");
        }

        let mut executors: Vec<ExecutorSlot> = Vec::with_capacity(count);
        executors.push(ExecutorSlot { vm: AtomicPtr::new(ptr::null_mut()), handle: None });

        for i in 1..count {
            let shared = Arc::clone(&shared);
            let cpu = cpu_map[i];
            let slot_vm = Arc::new(AtomicPtr::new(ptr::null_mut()));
            let publish = Arc::clone(&slot_vm);
            let handle = std::thread::Builder::new()
                .name(format!("ray-exec-{}", i))
                .spawn(move || {
                    if !topology::pin_current_thread(cpu) {
                        warn!(executor = i, cpu, "failed to pin worker");
                    }
                    let vm_ptr = vm::install_worker();
                    publish.store(vm_ptr, Ordering::Release);
                    executor_loop(&shared);
                    vm::teardown();
                })
                .expect("spawn pool executor");
            executors.push(ExecutorSlot {
                vm: AtomicPtr::new(ptr::null_mut()),
                handle: Some(handle),
            });
            // Wait for the worker to publish its VM so borrow/merge can see
            // its heap from the first run.
            let mut rounds = 0u32;
            loop {
                let p = slot_vm.load(Ordering::Acquire);
                if !p.is_null() {
                    executors[i].vm.store(p, Ordering::Release);
                    break;
                }
                mpmc::backoff_spin(&mut rounds);
            }
        }

        debug!(executors = count, "pool created");
        Pool { shared, executors, fanout: Mutex::new(()) }
    }

    pub fn executors_count(&self) -> i64 {
        self.executors.len() as i64
    }

    /// Recommended fan-out width for `input_len` rows and `groups_len`
    /// groups. Returns 1 when splitting would not pay off or when already
    /// running inside a task.
    pub fn split_by(&self, input_len: i64, groups_len: i64) -> i64 {
        if input_len < POOL_SPLIT_THRESHOLD {
            1
        } else if vm::rc_sync() {
            1
        } else if input_len <= self.executors_count() {
            1
        } else if groups_len >= GROUP_SPLIT_THRESHOLD {
            1
        } else {
            self.executors_count()
        }
    }

    /// Chunk size rounded up to whole pages of `elem_size` elements.
    pub fn chunk_aligned(total_len: i64, workers: i64, elem_size: i64) -> i64 {
        if workers <= 1 || elem_size <= 0 {
            return total_len;
        }
        let per_page = (PAGE_SIZE as i64 / elem_size).max(1);
        let pages = (total_len + per_page - 1) / per_page;
        let pages_per_chunk = (pages + workers - 1) / workers;
        pages_per_chunk * per_page
    }

    /// Reset run counters and hand workers a share of the main heap.
    pub fn prepare(&self) {
        let mut st = self.shared.state.lock();
        st.tasks = 0;
        st.done = 0;
        for slot in &self.executors[1..] {
            let wvm = slot.vm.load(Ordering::Acquire);
            if !wvm.is_null() {
                vm::with(|main| unsafe { main.heap.borrow_into(&mut (*wvm).heap) });
            }
        }
    }

    /// Enqueue one task. Doubles the queues when full.
    pub fn add_task(&self, fun: ChunkFn, len: i64, offset: i64, ctx: *mut ()) {
        let mut st = self.shared.state.lock();
        let task = Task { id: st.tasks, fun, len, offset, ctx };
        st.tasks += 1;

        if let Err(task) = st.task_q.push(task) {
            let size = (st.tasks as usize * 2).max(st.task_q.capacity() * 2);
            let grown = Mpmc::new(size);
            while let Some(t) = st.task_q.pop() {
                let _ = grown.push(t);
            }
            grown.push(task).expect("grown task queue cannot be full");
            st.task_q = Arc::new(grown);
            st.result_q = Arc::new(Mpmc::new(size));
        }
    }

    /// Wake the workers, process tasks on the calling thread too, wait for
    /// completion, gather results by submission order, merge worker heaps.
    /// Returns the LIST of results, or the first error found in it.
    pub fn run(&self) -> Obj {
        vm::set_rc_sync(true);

        let (tasks_count, task_q, result_q) = {
            let mut st = self.shared.state.lock();
            st.round += 1;
            let t = st.tasks;
            let tq = Arc::clone(&st.task_q);
            let rq = Arc::clone(&st.result_q);
            self.shared.run_cv.notify_all();
            (t, tq, rq)
        };

        // Process on self until the queue drains.
        let mut mine = 0i64;
        while let Some(task) = task_q.pop() {
            let result = (task.fun)(task.len, task.offset, task.ctx);
            let _ = result_q.push(TaskResult { id: task.id, result });
            mine += 1;
        }

        {
            let mut st = self.shared.state.lock();
            st.done += mine;
            while st.done < tasks_count {
                self.shared.done_cv.wait(&mut st);
            }
        }

        // Gather results indexed by task id.
        let mut res = Obj::list(tasks_count as usize);
        while let Some(tr) = result_q.pop() {
            assert!(
                tr.id >= 0 && tr.id < tasks_count,
                "pool: corrupted result id {}",
                tr.id
            );
            res.list_set(tr.id as usize, tr.result);
        }

        // Merge worker heaps back and drain our own foreign bin.
        for slot in &self.executors[1..] {
            let wvm = slot.vm.load(Ordering::Acquire);
            if !wvm.is_null() {
                vm::with(|main| unsafe { main.heap.merge_from(&mut (*wvm).heap) });
            }
        }
        vm::with(|main| main.heap.drain_foreign());

        vm::set_rc_sync(false);

        let first_err = res.as_list().iter().position(|item| item.is_err());
        if let Some(i) = first_err {
            let e = res.as_list()[i].clone();
            drop(res);
            return e;
        }
        res
    }

    /// Chunked parallel map: split `total_len` across the pool, run `fun`
    /// on each chunk, discard results. Serial below the split threshold.
    pub fn map(&self, total_len: i64, fun: ChunkFn, ctx: *mut ()) {
        let n = self.split_by(total_len, 0);
        if n <= 1 {
            drop((fun)(total_len, 0, ctx));
            return;
        }

        let _session = self.fanout.lock();
        let chunk = total_len / n;
        self.prepare();
        let mut offset = 0;
        for _ in 0..n - 1 {
            self.add_task(fun, chunk, offset, ctx);
            offset += chunk;
        }
        self.add_task(fun, total_len - offset, offset, ctx);
        drop(self.run());
    }

    /// Run a prepared batch under the session lock; used by callers that
    /// submit heterogeneous chunk sizes themselves.
    pub fn run_session<R>(&self, f: impl FnOnce(&Pool) -> R) -> R {
        let _session = self.fanout.lock();
        f(self)
    }
}

fn executor_loop(shared: &Shared) {
    let mut seen_round = 0u64;
    loop {
        let (task_q, result_q) = {
            let mut st = shared.state.lock();
            while !st.stopped && st.round == seen_round {
                shared.run_cv.wait(&mut st);
            }
            if st.stopped {
                return;
            }
            seen_round = st.round;
            (Arc::clone(&st.task_q), Arc::clone(&st.result_q))
        };

        let mut count = 0i64;
        while let Some(task) = task_q.pop() {
            let result = (task.fun)(task.len, task.offset, task.ctx);
            let _ = result_q.push(TaskResult { id: task.id, result });
            count += 1;
        }

        if count > 0 {
            let mut st = shared.state.lock();
            st.done += count;
            shared.done_cv.notify_one();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.stopped = true;
            self.shared.run_cv.notify_all();
        }
        for slot in &mut self.executors[1..] {
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    warn!("pool executor panicked");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Global pool
// ---------------------------------------------------------------------------

static GLOBAL: once_cell::sync::OnceCell<Pool> = once_cell::sync::OnceCell::new();

/// Create the process pool with `count` executors. First call wins.
pub fn init_global(count: usize) -> &'static Pool {
    GLOBAL.get_or_init(|| Pool::create(count))
}

/// The process pool, creating it with the hardware parallelism (capped at 8
/// executors) on first use.
pub fn global() -> &'static Pool {
    GLOBAL.get_or_init(|| {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Pool::create(n.min(8))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::TAG_I64;

    struct FillCtx {
        out: *mut i64,
    }

    fn fill_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
        let ctx = unsafe { &*(ctx as *const FillCtx) };
        for i in 0..len {
            unsafe { *ctx.out.add((offset + i) as usize) = offset + i };
        }
        Obj::null()
    }

    fn value_worker(len: i64, offset: i64, _ctx: *mut ()) -> Obj {
        Obj::i64(len + offset)
    }

    #[test]
    fn test_map_fills_every_slot() {
        let pool = global();
        let n = 100_000usize;
        let mut v = Obj::vector(TAG_I64, n);
        let ctx = FillCtx { out: v.as_i64s_mut().as_mut_ptr() };
        pool.map(n as i64, fill_worker, &ctx as *const FillCtx as *mut ());
        let data = v.as_i64s();
        for (i, &x) in data.iter().enumerate() {
            assert_eq!(x, i as i64);
        }
    }

    #[test]
    fn test_results_in_submission_order() {
        let pool = global();
        pool.run_session(|p| {
            p.prepare();
            for i in 0..32 {
                p.add_task(value_worker, i, 1000 * i, std::ptr::null_mut());
            }
            let res = p.run();
            assert_eq!(res.len(), 32);
            for (i, item) in res.as_list().iter().enumerate() {
                assert_eq!(item.i64_val(), i as i64 + 1000 * i as i64);
            }
        });
    }

    #[test]
    fn test_split_by_thresholds() {
        let pool = global();
        assert_eq!(pool.split_by(100, 0), 1);
        assert_eq!(pool.split_by(1 << 20, GROUP_SPLIT_THRESHOLD), 1);
        vm::set_rc_sync(true);
        assert_eq!(pool.split_by(1 << 20, 0), 1);
        vm::set_rc_sync(false);
    }

    #[test]
    fn test_chunk_aligned_pages() {
        let c = Pool::chunk_aligned(1_000_000, 4, 8);
        assert_eq!(c % (PAGE_SIZE as i64 / 8), 0);
        assert!(c * 4 >= 1_000_000);
        assert_eq!(Pool::chunk_aligned(500, 1, 8), 500);
    }

    #[test]
    fn test_queue_growth_keeps_tasks() {
        let pool = Pool::create(2);
        pool.run_session(|p| {
            p.prepare();
            for i in 0..5000 {
                p.add_task(value_worker, i, 0, std::ptr::null_mut());
            }
            let res = p.run();
            assert_eq!(res.len(), 5000);
            for (i, item) in res.as_list().iter().enumerate() {
                assert_eq!(item.i64_val(), i as i64);
            }
        });
    }
}
