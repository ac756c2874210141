//! Job executor shared by the top-level runtime and worker contexts.
//!
//! Unlike a run-to-completion executor, [`EventLoop::run_ready`] never waits
//! for a timer. The caller sleeps on its inbox instead, using
//! [`EventLoop::time_until_next_timer`] as the timeout, so messages keep
//! flowing while timers are pending.

use boa_engine::{
    Context, JsResult,
    job::{Job, JobExecutor, NativeAsyncJob, PromiseJob, TimeoutJob},
};
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

/// A timer entry in the priority queue
struct TimerEntry {
    deadline: Instant,
    job: TimeoutJob,
    /// Tie-breaker so timers with the same deadline keep insertion order
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct EventLoop {
    microtasks: RefCell<VecDeque<PromiseJob>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    async_jobs: RefCell<VecDeque<NativeAsyncJob>>,
    generic_jobs: RefCell<VecDeque<Job>>,
    timer_counter: Cell<u64>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            microtasks: RefCell::new(VecDeque::with_capacity(64)),
            timers: RefCell::new(BinaryHeap::with_capacity(32)),
            async_jobs: RefCell::new(VecDeque::with_capacity(16)),
            generic_jobs: RefCell::new(VecDeque::with_capacity(16)),
            timer_counter: Cell::new(0),
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.has_queued_jobs() || self.time_until_next_timer().is_some()
    }

    fn has_queued_jobs(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.async_jobs.borrow().is_empty()
            || !self.generic_jobs.borrow().is_empty()
    }

    fn next_timer_id(&self) -> u64 {
        let id = self.timer_counter.get() + 1;
        self.timer_counter.set(id);
        id
    }

    /// Time until the earliest timer fires, `None` when no timer is pending.
    /// Cancelled timers are discarded first so they do not keep a context awake.
    pub fn time_until_next_timer(&self) -> Option<Duration> {
        let mut timers = self.timers.borrow_mut();
        while timers.peek().is_some_and(|entry| entry.job.is_cancelled()) {
            timers.pop();
        }
        timers
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    fn run_microtasks(&self, context: &mut Context) -> JsResult<()> {
        loop {
            let job = self.microtasks.borrow_mut().pop_front();
            match job {
                Some(job) => {
                    job.call(context)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn process_timers(&self, context: &mut Context) -> JsResult<()> {
        let now = Instant::now();
        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                if timers.peek().is_some_and(|entry| entry.deadline <= now) {
                    timers.pop()
                } else {
                    None
                }
            };
            let Some(entry) = entry else {
                return Ok(());
            };
            if !entry.job.is_cancelled() {
                // Recurring timers are re-enqueued by boa_runtime itself
                entry.job.call(context)?;
                self.run_microtasks(context)?;
            }
        }
    }

    fn process_async_jobs(&self, context: &mut Context) -> JsResult<()> {
        loop {
            let job = self.async_jobs.borrow_mut().pop_front();
            let Some(job) = job else {
                return Ok(());
            };
            {
                let context = RefCell::new(&mut *context);
                futures_lite::future::block_on(job.call(&context))?;
            }
            self.run_microtasks(context)?;
        }
    }

    fn process_generic_jobs(&self, context: &mut Context) -> JsResult<()> {
        loop {
            let job = self.generic_jobs.borrow_mut().pop_front();
            let Some(job) = job else {
                return Ok(());
            };
            match job {
                Job::PromiseJob(job) => {
                    job.call(context)?;
                }
                Job::TimeoutJob(job) => {
                    job.call(context)?;
                }
                Job::GenericJob(job) => {
                    job.call(context)?;
                }
                _ => {}
            }
            self.run_microtasks(context)?;
        }
    }

    fn run_queued(&self, context: &mut Context) -> JsResult<()> {
        while self.has_queued_jobs() {
            self.run_microtasks(context)?;
            self.process_async_jobs(context)?;
            self.process_generic_jobs(context)?;
        }
        Ok(())
    }

    /// Run everything runnable now: queued jobs, then one pass over the
    /// timers that are due. Returns as soon as only future timers remain.
    ///
    /// The first error thrown by a job is returned; jobs queued behind it
    /// stay queued for the next call.
    pub fn run_ready(&self, context: &mut Context) -> JsResult<()> {
        self.run_queued(context)?;
        self.process_timers(context)?;
        self.run_queued(context)
    }
}

impl JobExecutor for EventLoop {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(job) => {
                self.microtasks.borrow_mut().push_back(job);
            }
            Job::TimeoutJob(job) => {
                let timeout_ms = job.timeout().as_millis() as u64;
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let id = self.next_timer_id();
                self.timers.borrow_mut().push(TimerEntry { deadline, job, id });
            }
            Job::AsyncJob(job) => {
                self.async_jobs.borrow_mut().push_back(job);
            }
            other => {
                self.generic_jobs.borrow_mut().push_back(other);
            }
        }
    }

    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        self.run_ready(context)
    }
}
