// # Job Queue
//
// A fixed pool of worker threads executing submitted jobs. A job may be
// submitted many times; each submission buys one `process_job` call. A
// job with submissions outstanding is re-queued at the tail after each
// run, so one busy job cannot starve the others.

use crate::error::{IoError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Work that can be scheduled on the queue.
///
/// Implementors embed a [`JobState`] and hand it back from `job_state`;
/// the queue keeps its per-job bookkeeping there.
pub trait Job: Send + Sync {
    fn job_state(&self) -> &JobState;
    fn process_job(&self);
}

/// Queue bookkeeping embedded in every job.
///
/// Fields are only mutated while the queue lock is held.
#[derive(Debug, Default)]
pub struct JobState {
    pending_requests: AtomicU32,
    busy: AtomicBool,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submissions not yet run.
    pub fn pending_requests(&self) -> u32 {
        self.pending_requests.load(Ordering::Acquire)
    }

    /// True while a worker thread is inside `process_job`.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

struct WorkerSlot {
    job: Option<Arc<dyn Job>>,
    wake: bool,
}

/// One pool thread. Each worker sleeps on its own signal; the queue
/// hands a job directly to the worker it wakes.
struct Worker {
    id: usize,
    slot: Mutex<WorkerSlot>,
    signal: Condvar,
}

impl Worker {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            slot: Mutex::new(WorkerSlot {
                job: None,
                wake: false,
            }),
            signal: Condvar::new(),
        })
    }

    /// Assign a job (or a bare wake-up for shutdown) and signal the thread.
    fn wake(&self, job: Option<Arc<dyn Job>>) {
        let mut slot = self.slot.lock();
        if let Some(job) = job {
            slot.job = Some(job);
        }
        slot.wake = true;
        self.signal.notify_one();
    }

    fn wait_for_signal(&self) -> Option<Arc<dyn Job>> {
        let mut slot = self.slot.lock();
        while !slot.wake {
            self.signal.wait(&mut slot);
        }
        slot.wake = false;
        slot.job.take()
    }
}

struct QueueState {
    idle_jobs: VecDeque<Arc<dyn Job>>,
    /// Idle workers, most recently parked last (LIFO reuse keeps caches warm).
    idle_workers: Vec<Arc<Worker>>,
    busy_workers: usize,
    actual_threads: usize,
    desired_threads: usize,
    total_active_requests: usize,
    next_worker_id: usize,
}

/// The worker-thread pool.
pub struct JobQueue {
    state: Mutex<QueueState>,
    /// Signalled by the last worker to exit during shutdown.
    threads_gone: Condvar,
    self_ref: Weak<JobQueue>,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(QueueState {
                idle_jobs: VecDeque::new(),
                idle_workers: Vec::new(),
                busy_workers: 0,
                actual_threads: 0,
                desired_threads: 0,
                total_active_requests: 0,
                next_worker_id: 0,
            }),
            threads_gone: Condvar::new(),
            self_ref: weak.clone(),
        })
    }

    /// Create a queue and spawn `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Arc<Self>> {
        let queue = Self::new();
        for _ in 0..threads {
            queue.add_thread()?;
        }
        Ok(queue)
    }

    /// Spawn one more worker thread.
    pub fn add_thread(&self) -> Result<()> {
        let queue = self.self_ref.upgrade().ok_or(IoError::Fail)?;
        let worker;
        {
            let mut st = self.state.lock();
            worker = Worker::new(st.next_worker_id);
            st.next_worker_id += 1;
            st.actual_threads += 1;
            st.desired_threads += 1;
            st.idle_workers.push(worker.clone());
        }

        let thread_worker = Arc::clone(&worker);
        std::thread::Builder::new()
            .name(format!("io-worker-{}", worker.id))
            .spawn(move || queue.run_worker(thread_worker))
            .map_err(|e| IoError::Io(format!("failed to spawn worker: {}", e)))?;

        // A job may already be waiting for this thread.
        let mut st = self.state.lock();
        self.assign_waiting_jobs(&mut st);
        Ok(())
    }

    /// Submit a job. The job's `process_job` runs once per submission,
    /// on a pool thread, never on the submitting thread.
    pub fn submit_job(&self, job: Arc<dyn Job>) -> Result<()> {
        let mut st = self.state.lock();
        if st.desired_threads == 0 {
            return Err(IoError::Fail);
        }

        let job_state = job.job_state();
        // First outstanding submission links the job into the idle list;
        // later submissions just bump the count (the job is already
        // either queued or busy).
        if job_state.pending_requests.load(Ordering::Acquire) == 0 {
            job_state.busy.store(false, Ordering::Release);
            st.idle_jobs.push_back(Arc::clone(&job));
        }
        job_state.pending_requests.fetch_add(1, Ordering::AcqRel);
        st.total_active_requests += 1;

        self.assign_waiting_jobs(&mut st);
        Ok(())
    }

    /// Number of submissions not yet finished.
    pub fn active_request_count(&self) -> usize {
        self.state.lock().total_active_requests
    }

    /// Current worker-thread count.
    pub fn thread_count(&self) -> usize {
        self.state.lock().actual_threads
    }

    /// Stop all workers. In-flight jobs finish first; queued submissions
    /// that no thread picked up are dropped.
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        debug!(
            threads = st.actual_threads,
            pending = st.total_active_requests,
            "job queue shutting down"
        );
        st.desired_threads = 0;

        let idle: Vec<Arc<Worker>> = st.idle_workers.to_vec();
        for worker in idle {
            worker.wake(None);
        }

        while st.actual_threads > 0 {
            self.threads_gone.wait(&mut st);
        }
        st.idle_jobs.clear();
        st.total_active_requests = 0;
    }

    /// Match waiting jobs to idle workers: jobs FIFO, workers LIFO.
    fn assign_waiting_jobs(&self, st: &mut QueueState) {
        while !st.idle_jobs.is_empty() && !st.idle_workers.is_empty() {
            let (Some(job), Some(worker)) = (st.idle_jobs.pop_front(), st.idle_workers.pop())
            else {
                break;
            };
            job.job_state().busy.store(true, Ordering::Release);
            st.busy_workers += 1;
            worker.wake(Some(job));
        }
    }

    fn run_worker(self: Arc<Self>, worker: Arc<Worker>) {
        loop {
            let job = worker.wait_for_signal();
            if self.do_waiting_jobs(&worker, job) {
                break;
            }
        }

        let mut st = self.state.lock();
        st.idle_workers.retain(|w| !Arc::ptr_eq(w, &worker));
        if st.actual_threads == 0 {
            debug!(worker = worker.id, "last worker exiting");
            self.threads_gone.notify_all();
        }
    }

    /// Run the assigned job, then keep draining the idle-job list until
    /// it is empty. Returns true if this thread should exit.
    fn do_waiting_jobs(&self, worker: &Arc<Worker>, first: Option<Arc<dyn Job>>) -> bool {
        let mut current = first;

        let mut st = loop {
            let job = match current.take() {
                Some(job) => job,
                None => break self.state.lock(),
            };

            trace!(worker = worker.id, "running job");
            job.process_job();

            let mut st = self.state.lock();
            self.finish_job(&mut st, &job);

            // Told to shrink: stop looking for more work, the assigned
            // job is done.
            if st.actual_threads > st.desired_threads {
                break st;
            }

            match st.idle_jobs.pop_front() {
                Some(next) => {
                    next.job_state().busy.store(true, Ordering::Release);
                    current = Some(next);
                    drop(st);
                }
                None => break st,
            }
        };

        // Back to the idle pool, still holding the lock.
        st.busy_workers = st.busy_workers.saturating_sub(1);
        if st.actual_threads > st.desired_threads {
            st.actual_threads -= 1;
            return true;
        }
        st.idle_workers.push(worker.clone());
        false
    }

    fn finish_job(&self, st: &mut QueueState, job: &Arc<dyn Job>) {
        let job_state = job.job_state();
        job_state.busy.store(false, Ordering::Release);
        let remaining = job_state.pending_requests.fetch_sub(1, Ordering::AcqRel) - 1;

        // More submissions arrived while this one ran; requeue at the
        // tail so other jobs get a turn.
        if remaining > 0 {
            st.idle_jobs.push_back(Arc::clone(job));
        }
        st.total_active_requests -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingJob {
        state: JobState,
        runs: AtomicUsize,
    }

    impl CountingJob {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: JobState::new(),
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Job for CountingJob {
        fn job_state(&self) -> &JobState {
            &self.state
        }

        fn process_job(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for_drain(queue: &JobQueue) {
        let mut spins = 0;
        while queue.active_request_count() > 0 {
            std::thread::sleep(Duration::from_millis(1));
            spins += 1;
            assert!(spins < 5000, "job queue failed to drain");
        }
    }

    #[test]
    fn test_single_submission_runs_once() {
        let queue = JobQueue::with_threads(2).unwrap();
        let job = CountingJob::new();
        queue.submit_job(job.clone()).unwrap();
        wait_for_drain(&queue);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[test]
    fn test_each_submission_buys_one_run() {
        let queue = JobQueue::with_threads(3).unwrap();
        let job = CountingJob::new();
        for _ in 0..50 {
            queue.submit_job(job.clone()).unwrap();
        }
        wait_for_drain(&queue);
        assert_eq!(job.runs.load(Ordering::SeqCst), 50);
        assert_eq!(job.state.pending_requests(), 0);
        queue.shutdown();
    }

    #[test]
    fn test_many_jobs_share_the_pool() {
        let queue = JobQueue::with_threads(4).unwrap();
        let jobs: Vec<_> = (0..20).map(|_| CountingJob::new()).collect();
        for job in &jobs {
            for _ in 0..5 {
                queue.submit_job(job.clone()).unwrap();
            }
        }
        wait_for_drain(&queue);
        for job in &jobs {
            assert_eq!(job.runs.load(Ordering::SeqCst), 5);
        }
        queue.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let queue = JobQueue::with_threads(1).unwrap();
        queue.shutdown();
        assert_eq!(queue.thread_count(), 0);
        let job = CountingJob::new();
        assert!(queue.submit_job(job).is_err());
    }

    #[test]
    fn test_shutdown_waits_for_running_job() {
        struct SlowJob {
            state: JobState,
            done: AtomicBool,
        }
        impl Job for SlowJob {
            fn job_state(&self) -> &JobState {
                &self.state
            }
            fn process_job(&self) {
                std::thread::sleep(Duration::from_millis(50));
                self.done.store(true, Ordering::SeqCst);
            }
        }

        let queue = JobQueue::with_threads(1).unwrap();
        let job = Arc::new(SlowJob {
            state: JobState::new(),
            done: AtomicBool::new(false),
        });
        queue.submit_job(job.clone()).unwrap();
        // Give the worker a moment to pick the job up.
        std::thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        assert!(job.done.load(Ordering::SeqCst));
    }
}
