//! Tag-bucketed worker thread pool.

use std::any::Any;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::identity::TaskTag;

/// A unit of work run on a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receives panics raised by tasks.
pub type PanicHandler = Arc<dyn Fn(TaskPanic) + Send + Sync>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool the current thread belongs to, zero for foreign threads.
    static OWNING_POOL: Cell<usize> = const { Cell::new(0) };
}

/// A panic caught while running a task.
pub struct TaskPanic {
    /// Bucket the task was scheduled under.
    pub tag: TaskTag,
    /// Worker that ran the task.
    pub thread_index: usize,
    pub payload: Box<dyn Any + Send>,
}

impl TaskPanic {
    /// The panic message, when the payload is a string.
    pub fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message
        } else {
            "<non-string panic payload>"
        }
    }
}

impl std::fmt::Debug for TaskPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPanic")
            .field("tag", &self.tag)
            .field("thread_index", &self.thread_index)
            .field("message", &self.message())
            .finish()
    }
}

/// Interface for dispatching work to encoding threads.
pub trait Scheduler: Send + Sync {
    /// Queues `task` on any worker under `tag`.
    fn schedule(&self, tag: TaskTag, task: Task);

    /// Queues `task` under `tag` to run on worker `thread_index` only.
    fn schedule_on_thread(&self, tag: TaskTag, thread_index: usize, task: Task);

    /// Blocks until `tag` has no queued and no running tasks.
    ///
    /// Must not be called from one of the pool's own threads.
    fn wait_for_empty(&self, tag: TaskTag);

    /// Number of worker threads.
    fn thread_count(&self) -> usize;

    /// Runs `f(thread_index)` once on every worker and waits for all of them.
    ///
    /// Unlike [`Scheduler::schedule`], `f` may borrow from the caller's stack.
    fn each_thread(&self, f: &(dyn Fn(usize) + Sync));

    /// Queues a job to run on the render thread at its next
    /// [`Scheduler::run_render_jobs`] call for `tag`.
    fn run_on_render_thread(&self, tag: TaskTag, job: Task);

    /// Runs the queued render-thread jobs for `tag` on the calling thread.
    ///
    /// With `close` set the queue is removed afterwards.
    fn run_render_jobs(&self, tag: TaskTag, close: bool);
}

#[derive(Default)]
struct BucketQueues {
    /// Index 0 holds tasks for any thread, index `i + 1` tasks pinned to worker `i`.
    queues: Vec<VecDeque<Task>>,
    /// Set when the bucket has been drained and removed from the pool.
    closed: bool,
}

impl BucketQueues {
    fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

struct Bucket {
    queues: Mutex<BucketQueues>,
    running: AtomicUsize,
    drained: Condvar,
}

impl Bucket {
    fn new(thread_count: usize) -> Self {
        Self {
            queues: Mutex::new(BucketQueues {
                queues: (0..=thread_count).map(|_| VecDeque::new()).collect(),
                closed: false,
            }),
            running: AtomicUsize::new(0),
            drained: Condvar::new(),
        }
    }

    /// Marks one task as finished, waking waiters once nothing is left.
    fn finish_task(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            let queues = self.queues.lock();
            if queues.is_empty() {
                self.drained.notify_all();
            }
        }
    }
}

struct Shared {
    id: usize,
    name: String,
    thread_count: usize,
    /// Default bucket for untagged tasks.
    own_tag: TaskTag,
    buckets: Mutex<BTreeMap<TaskTag, Arc<Bucket>>>,
    /// Pending task counts, indexed like [`BucketQueues::queues`].
    task_counts: Vec<AtomicUsize>,
    terminated: Mutex<bool>,
    available: Condvar,
    handler: RwLock<Option<PanicHandler>>,
    render_queues: Mutex<HashMap<TaskTag, Arc<Mutex<VecDeque<Task>>>>>,
}

fn queue_index(thread_index: Option<usize>) -> usize {
    thread_index.map_or(0, |index| index + 1)
}

impl Shared {
    fn resolve(&self, tag: TaskTag) -> TaskTag {
        if tag.is_empty() { self.own_tag } else { tag }
    }

    fn has_work(&self, thread_index: usize) -> bool {
        self.task_counts[0].load(Ordering::Acquire) > 0
            || self.task_counts[queue_index(Some(thread_index))].load(Ordering::Acquire) > 0
    }

    fn push(&self, thread_index: Option<usize>, tag: TaskTag, task: Task) {
        let tag = self.resolve(tag);
        let index = queue_index(thread_index);
        let mut task = Some(task);

        // A bucket closed between lookup and push has been removed from the
        // map, so the next lookup inserts a fresh one.
        while let Some(pending) = task.take() {
            let bucket = {
                let mut buckets = self.buckets.lock();
                Arc::clone(
                    buckets
                        .entry(tag)
                        .or_insert_with(|| Arc::new(Bucket::new(self.thread_count))),
                )
            };

            let mut queues = bucket.queues.lock();
            if queues.closed {
                task = Some(pending);
                continue;
            }
            queues.queues[index].push_back(pending);
            self.task_counts[index].fetch_add(1, Ordering::AcqRel);
        }

        // Take the worker lock so no thread can be between checking for work
        // and starting to wait.
        let _terminated = self.terminated.lock();
        if thread_index.is_some() {
            self.available.notify_all();
        } else {
            self.available.notify_one();
        }
    }

    /// Takes the next task for `thread_index` from `bucket`, pinned tasks first.
    fn pop(&self, bucket: &Bucket, thread_index: usize) -> Option<Task> {
        let thread_queue = queue_index(Some(thread_index));
        let mut queues = bucket.queues.lock();

        let (index, task) = if let Some(task) = queues.queues[thread_queue].pop_front() {
            (thread_queue, task)
        } else {
            (0, queues.queues[0].pop_front()?)
        };
        self.task_counts[index].fetch_sub(1, Ordering::AcqRel);
        bucket.running.fetch_add(1, Ordering::AcqRel);
        Some(task)
    }

    fn worker_loop(&self, thread_index: usize) {
        let mut pending: Vec<(TaskTag, Arc<Bucket>)> = Vec::new();

        loop {
            {
                let mut terminated = self.terminated.lock();
                while !*terminated && !self.has_work(thread_index) {
                    self.available.wait(&mut terminated);
                }
                if *terminated {
                    break;
                }
            }

            pending.clear();
            pending.extend(
                self.buckets
                    .lock()
                    .iter()
                    .map(|(tag, bucket)| (*tag, Arc::clone(bucket))),
            );

            for (tag, bucket) in &pending {
                let Some(task) = self.pop(bucket, thread_index) else {
                    continue;
                };

                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(()) => bucket.finish_task(),
                    Err(payload) => {
                        let handler = self.handler.read().clone();
                        let caught = TaskPanic {
                            tag: *tag,
                            thread_index,
                            payload,
                        };
                        match handler {
                            Some(handler) => {
                                handler(caught);
                                bucket.finish_task();
                            }
                            None => {
                                error!(
                                    "Task {} panicked on {}{} with no handler: {}",
                                    tag,
                                    self.name,
                                    thread_index + 1,
                                    caught.message()
                                );
                                bucket.finish_task();
                                panic::resume_unwind(caught.payload);
                            }
                        }
                    }
                }
            }
        }

        trace!("{}{} shutting down", self.name, thread_index + 1);
    }
}

/// Fixed-size pool of named worker threads.
pub struct ThreadedScheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadedScheduler {
    /// Starts `thread_count` workers named `{name}1`, `{name}2`, ...
    ///
    /// # Errors
    ///
    /// Returns an error if `thread_count` is zero or a thread fails to spawn.
    pub fn new(thread_count: usize, name: impl Into<String>) -> SchedulerResult<Self> {
        if thread_count == 0 {
            return Err(SchedulerError::NoThreads);
        }

        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            thread_count,
            own_tag: TaskTag::new(),
            buckets: Mutex::new(BTreeMap::new()),
            task_counts: (0..=thread_count).map(|_| AtomicUsize::new(0)).collect(),
            terminated: Mutex::new(false),
            available: Condvar::new(),
            handler: RwLock::new(None),
            render_queues: Mutex::new(HashMap::new()),
        });

        let mut scheduler = Self {
            shared,
            threads: Vec::with_capacity(thread_count),
        };

        for index in 0..thread_count {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!("{}{}", shared.name, index + 1))
                .spawn(move || {
                    OWNING_POOL.with(|owner| owner.set(shared.id));
                    shared.worker_loop(index);
                })
                .map_err(|source| SchedulerError::SpawnFailed { index, source })?;
            scheduler.threads.push(handle);
        }

        debug!(
            "Started scheduler '{}' with {} thread(s)",
            scheduler.shared.name, thread_count
        );

        Ok(scheduler)
    }

    /// Installs the handler that receives panics raised by tasks.
    ///
    /// Without a handler a panicking task terminates its worker thread.
    pub fn set_panic_handler(&self, handler: PanicHandler) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Tag of the bucket used for tasks scheduled with [`TaskTag::EMPTY`].
    pub fn own_tag(&self) -> TaskTag {
        self.shared.own_tag
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_current_thread_owned(&self) -> bool {
        OWNING_POOL.with(|owner| owner.get() == self.shared.id)
    }

    fn terminate(&self) {
        *self.shared.terminated.lock() = true;
        self.shared.available.notify_all();
    }
}

impl Scheduler for ThreadedScheduler {
    fn schedule(&self, tag: TaskTag, task: Task) {
        self.shared.push(None, tag, task);
    }

    fn schedule_on_thread(&self, tag: TaskTag, thread_index: usize, task: Task) {
        debug_assert!(thread_index < self.shared.thread_count);
        let thread_index = thread_index % self.shared.thread_count;
        self.shared.push(Some(thread_index), tag, task);
    }

    fn wait_for_empty(&self, tag: TaskTag) {
        // Waiting from inside the pool would deadlock.
        debug_assert!(!self.is_current_thread_owned());
        if self.is_current_thread_owned() {
            warn!("wait_for_empty called from a worker of '{}'", self.shared.name);
            return;
        }

        let tag = self.shared.resolve(tag);
        let Some(bucket) = self.shared.buckets.lock().get(&tag).cloned() else {
            // Already drained and removed.
            return;
        };

        loop {
            {
                let mut queues = bucket.queues.lock();
                while !queues.is_empty() || bucket.running.load(Ordering::Acquire) > 0 {
                    bucket.drained.wait(&mut queues);
                }
            }

            let mut buckets = self.shared.buckets.lock();
            let mut queues = bucket.queues.lock();
            if queues.is_empty() && bucket.running.load(Ordering::Acquire) == 0 {
                queues.closed = true;
                if buckets
                    .get(&tag)
                    .is_some_and(|current| Arc::ptr_eq(current, &bucket))
                {
                    buckets.remove(&tag);
                }
                return;
            }
        }
    }

    fn thread_count(&self) -> usize {
        self.shared.thread_count
    }

    fn each_thread(&self, f: &(dyn Fn(usize) + Sync)) {
        if self.is_current_thread_owned() {
            debug_assert!(false, "each_thread called from a worker thread");
            (0..self.shared.thread_count).for_each(f);
            return;
        }

        let tag = TaskTag::new();
        // SAFETY: `wait_for_empty` below does not return until every task
        // scheduled under `tag` has run to completion, so `f` outlives all of
        // its uses on the worker threads.
        let f: &'static (dyn Fn(usize) + Sync) = unsafe { std::mem::transmute(f) };
        for index in 0..self.shared.thread_count {
            self.schedule_on_thread(tag, index, Box::new(move || f(index)));
        }
        self.wait_for_empty(tag);
    }

    fn run_on_render_thread(&self, tag: TaskTag, job: Task) {
        let queue = {
            let mut queues = self.shared.render_queues.lock();
            Arc::clone(queues.entry(tag).or_default())
        };
        queue.lock().push_back(job);
    }

    fn run_render_jobs(&self, tag: TaskTag, close: bool) {
        let mut queues = self.shared.render_queues.lock();
        let Some(queue) = queues.get(&tag).cloned() else {
            return;
        };
        if close {
            queues.remove(&tag);
        } else {
            drop(queues);
        }

        let mut jobs = queue.lock();
        while let Some(job) = jobs.pop_front() {
            job();
        }
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        debug_assert!(!self.is_current_thread_owned());
        self.terminate();
        for (index, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!("{}{} exited after a panic", self.shared.name, index + 1);
            }
        }
        debug!("Stopped scheduler '{}'", self.shared.name);
    }
}

impl std::fmt::Debug for ThreadedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedScheduler")
            .field("name", &self.shared.name)
            .field("thread_count", &self.shared.thread_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            ThreadedScheduler::new(0, "Worker"),
            Err(SchedulerError::NoThreads)
        ));
    }

    #[test]
    fn test_wait_for_empty_runs_every_task_once() {
        let scheduler = ThreadedScheduler::new(4, "Worker").unwrap();
        let tag = TaskTag::new();
        let runs: Arc<Vec<AtomicU32>> = Arc::new((0..1000).map(|_| AtomicU32::new(0)).collect());

        for i in 0..1000 {
            let runs = Arc::clone(&runs);
            scheduler.schedule(
                tag,
                Box::new(move || {
                    runs[i].fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        scheduler.wait_for_empty(tag);

        assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_wait_for_empty_waits_for_running_task() {
        let scheduler = ThreadedScheduler::new(2, "Worker").unwrap();
        let tag = TaskTag::new();
        let done = Arc::new(AtomicU32::new(0));

        let flag = Arc::clone(&done);
        scheduler.schedule(
            tag,
            Box::new(move || {
                thread::sleep(Duration::from_millis(50));
                flag.store(1, Ordering::SeqCst);
            }),
        );
        scheduler.wait_for_empty(tag);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_unknown_tag_returns() {
        let scheduler = ThreadedScheduler::new(1, "Worker").unwrap();
        scheduler.wait_for_empty(TaskTag::new());
    }

    #[test]
    fn test_schedule_after_wait_uses_new_bucket() {
        let scheduler = ThreadedScheduler::new(2, "Worker").unwrap();
        let tag = TaskTag::new();
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            scheduler.schedule(
                tag,
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
            scheduler.wait_for_empty(tag);
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tasks_with_same_tag_run_in_order_on_single_thread() {
        let scheduler = ThreadedScheduler::new(1, "Worker").unwrap();
        let tag = TaskTag::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            scheduler.schedule(tag, Box::new(move || order.lock().push(i)));
        }
        scheduler.wait_for_empty(tag);

        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_pinned_tasks_run_on_their_thread() {
        let scheduler = ThreadedScheduler::new(3, "Pinned").unwrap();
        let tag = TaskTag::new();
        let names = Arc::new(Mutex::new(vec![String::new(); 3]));

        for index in 0..3 {
            let names = Arc::clone(&names);
            scheduler.schedule_on_thread(
                tag,
                index,
                Box::new(move || {
                    let name = thread::current().name().unwrap_or_default().to_string();
                    names.lock()[index] = name;
                }),
            );
        }
        scheduler.wait_for_empty(tag);

        assert_eq!(*names.lock(), vec!["Pinned1", "Pinned2", "Pinned3"]);
    }

    #[test]
    fn test_each_thread_borrows_from_stack() {
        let scheduler = ThreadedScheduler::new(4, "Worker").unwrap();
        let seen: Vec<AtomicU32> = (0..4).map(|_| AtomicU32::new(0)).collect();

        scheduler.each_thread(&|index| {
            seen[index].fetch_add(1, Ordering::SeqCst);
            assert!(OWNING_POOL.with(Cell::get) != 0);
        });

        assert!(seen.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_panic_delivered_to_handler() {
        let scheduler = ThreadedScheduler::new(2, "Worker").unwrap();
        let caught = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&caught);
        scheduler.set_panic_handler(Arc::new(move |panic: TaskPanic| {
            sink.lock().push(panic.message().to_string());
        }));

        let tag = TaskTag::new();
        scheduler.schedule(tag, Box::new(|| panic!("layer upload failed")));
        scheduler.wait_for_empty(tag);
        assert_eq!(*caught.lock(), vec!["layer upload failed".to_string()]);

        // The worker survived and keeps running tasks.
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            scheduler.schedule(
                tag,
                Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        scheduler.wait_for_empty(tag);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_render_jobs_run_on_calling_thread() {
        let scheduler = ThreadedScheduler::new(1, "Worker").unwrap();
        let tag = TaskTag::new();
        let caller = thread::current().id();
        let ran = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let ran = Arc::clone(&ran);
            scheduler.run_on_render_thread(
                tag,
                Box::new(move || {
                    assert_eq!(thread::current().id(), caller);
                    ran.lock().push(i);
                }),
            );
        }

        scheduler.run_render_jobs(tag, false);
        assert_eq!(*ran.lock(), vec![0, 1, 2]);

        scheduler.run_render_jobs(tag, true);
        assert!(scheduler.shared.render_queues.lock().is_empty());
    }

    #[test]
    fn test_scheduler_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ThreadedScheduler>();
    }
}
