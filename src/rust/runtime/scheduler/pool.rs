// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    config::{
        Config,
        DEFAULT_CAPACITY,
    },
    fail::Fail,
    scheduler::{
        context::{
            ExecutionContext,
            Resume,
        },
        job::Job,
        yielder::Suspend,
    },
};
use ::futures::FutureExt;
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of [TaskPool::submit].
#[derive(Clone, Debug)]
pub enum Dispatch {
    /// The job started right away and ran until its first suspension point (or completion).
    Running(Job),
    /// The pool was at capacity. The job runs once a busy context frees up.
    Queued(Job),
}

struct PoolState {
    /// Contexts parked waiting for a job.
    idle: Vec<ExecutionContext>,
    /// Contexts bound to a job that has not ended yet.
    busy_count: usize,
    overflow: VecDeque<Job>,
    capacity: usize,
}

/// Pool of execution contexts. There is one per thread.
pub struct TaskPool;

//======================================================================================================================
// Thread Locals
//======================================================================================================================

thread_local! {
    static THREAD_POOL: RefCell<PoolState> = RefCell::new(PoolState {
        idle: Vec::new(),
        busy_count: 0,
        overflow: VecDeque::new(),
        capacity: DEFAULT_CAPACITY,
    });
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Dispatch {
    pub fn job(&self) -> &Job {
        match self {
            Dispatch::Running(job) | Dispatch::Queued(job) => job,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Dispatch::Queued(_))
    }

    pub fn into_job(self) -> Job {
        match self {
            Dispatch::Running(job) | Dispatch::Queued(job) => job,
        }
    }
}

impl TaskPool {
    /// Starts `payload` right away, whatever the capacity. Returns once the job first suspends or ends.
    pub fn run<F>(whois: Option<&str>, payload: F) -> Result<Job, Fail>
    where
        F: Future<Output = Result<(), Fail>> + 'static,
    {
        let job: Job = Job::new(whois, payload.boxed_local());
        Self::dispatch(job.clone())?;
        Ok(job)
    }

    /// Starts `payload` if the pool is below capacity and queues it otherwise.
    pub fn submit<F>(whois: Option<&str>, payload: F) -> Result<Dispatch, Fail>
    where
        F: Future<Output = Result<(), Fail>> + 'static,
    {
        let job: Job = Job::new(whois, payload.boxed_local());
        let is_queued: bool = THREAD_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.busy_count >= pool.capacity {
                pool.overflow.push_back(job.clone());
                true
            } else {
                false
            }
        });
        if is_queued {
            trace!("submit(): pool at capacity, queued {}", job);
            return Ok(Dispatch::Queued(job));
        }
        Self::dispatch(job.clone())?;
        Ok(Dispatch::Running(job))
    }

    /// Applies the pool section of `config`.
    pub fn configure(config: &Config) -> Result<(), Fail> {
        Self::set_capacity(config.capacity()?);
        Ok(())
    }

    pub fn busy_count() -> usize {
        THREAD_POOL.with(|pool| pool.borrow().busy_count)
    }

    pub fn idle_count() -> usize {
        THREAD_POOL.with(|pool| pool.borrow().idle.len())
    }

    pub fn queued_count() -> usize {
        THREAD_POOL.with(|pool| pool.borrow().overflow.len())
    }

    pub fn capacity() -> usize {
        THREAD_POOL.with(|pool| pool.borrow().capacity)
    }

    /// Changes the soft limit used by [TaskPool::submit]. Jobs that are already queued stay queued until a busy
    /// context frees up.
    pub fn set_capacity(capacity: usize) {
        THREAD_POOL.with(|pool| pool.borrow_mut().capacity = capacity);
    }

    /// Removes a job that has not been dispatched yet from the overflow queue.
    pub(crate) fn dequeue(job: &Job) -> bool {
        THREAD_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.overflow.iter().position(|queued| queued == job) {
                Some(index) => pool.overflow.remove(index).is_some(),
                None => false,
            }
        })
    }

    fn dispatch(job: Job) -> Result<(), Fail> {
        let context: Option<ExecutionContext> = THREAD_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.busy_count += 1;
            pool.idle.pop()
        });
        let context: ExecutionContext = match context {
            Some(context) => context,
            None => ExecutionContext::create(Self::dispatch_loop),
        };
        context.dispatch(job)
    }

    /// Body of every execution context: run a job, then either take the next queued job or park as idle.
    async fn dispatch_loop(context: ExecutionContext) -> Result<(), Fail> {
        let mut job: Job = match context.take_inbox() {
            Some(Resume::Dispatch(job)) => job,
            _ => Self::wait_for_job(&context).await,
        };

        loop {
            job.bind(Some(context.clone()));
            context.bind(Some(job.clone()));
            job.start();

            let result: Result<(), Fail> = match job.take_payload() {
                Some(payload) => payload.await,
                None => Ok(()),
            };
            match result {
                Ok(()) => (),
                Err(e) if e.is_killed() => trace!("dispatch_loop(): {} killed", job),
                Err(e) if e.is_exit() => {
                    info!("dispatch_loop(): {} requested exit, retiring context {}", job, context.id());
                    Self::abandon(&context, &job);
                    return Err(e);
                },
                Err(e) => {
                    error!("dispatch_loop(): {} failed: {:?}", job, e);
                    Self::abandon(&context, &job);
                    return Err(e);
                },
            }

            // A joiner that fails runs in its own context, which retires. This one carries on.
            if let Err(e) = job.end() {
                warn!("dispatch_loop(): joiner of {} failed: {:?}", job, e);
                context.defer_failure(e);
            }

            let next: Option<Job> = THREAD_POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                let next: Option<Job> = pool.overflow.pop_front();
                if next.is_none() {
                    pool.busy_count -= 1;
                }
                next
            });
            drop(job);
            job = match next {
                Some(next) => {
                    trace!("dispatch_loop(): context {} takes queued {}", context.id(), next);
                    next
                },
                None => {
                    context.bind(None);
                    THREAD_POOL.with(|pool| pool.borrow_mut().idle.push(context.clone()));
                    Self::wait_for_job(&context).await
                },
            };
        }
    }

    /// Parks an idle context until it is handed a job.
    async fn wait_for_job(context: &ExecutionContext) -> Job {
        loop {
            match Suspend::new(context.clone()).await {
                Resume::Dispatch(job) => return job,
                Resume::Wake(wakeup) => warn!("wait_for_job(): idle context {} woken ({:?})", context.id(), wakeup),
            }
        }
    }

    /// Ends a failed job and gives up its context. Failures of its joiners or of the queued job that takes over are
    /// logged; the job's own error is the one the retiring context reports.
    fn abandon(context: &ExecutionContext, job: &Job) {
        if let Err(e) = job.end() {
            error!("abandon(): joiner of {} failed: {:?}", job, e);
            context.defer_failure(e);
        }
        if let Err(e) = Self::release(context) {
            error!("abandon(): queued job failed: {:?}", e);
            context.defer_failure(e);
        }
    }

    /// Frees the busy slot of a context that is about to retire. A queued job takes the slot over.
    fn release(context: &ExecutionContext) -> Result<(), Fail> {
        context.bind(None);
        context.retire();
        let next: Option<Job> = THREAD_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.busy_count -= 1;
            if pool.busy_count < pool.capacity {
                pool.overflow.pop_front()
            } else {
                None
            }
        });
        match next {
            Some(next) => Self::dispatch(next),
            None => Ok(()),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `payload` as a new job right away.
pub fn defer<F>(payload: F) -> Result<Job, Fail>
where
    F: Future<Output = Result<(), Fail>> + 'static,
{
    TaskPool::run(None, payload)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
