// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Jobs and their suspension state machine.
//!
//! A job is created when work is submitted, gets its identity when it actually starts running and ends exactly once.
//! While it runs it may suspend in one of several waiting states; each waiting state records why the job is waiting,
//! which is what `kill` and `wake` dispatch on.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        context::{
            ExecutionContext,
            Resume,
            Wakeup,
        },
        pool::TaskPool,
        yielder::Suspend,
    },
    sync::MutexId,
    timer::{
        self,
        TimerHandle,
    },
};
use ::futures::future::LocalBoxFuture;
use ::std::{
    any::Any,
    cell::{
        Cell,
        RefCell,
    },
    collections::{
        HashMap,
        VecDeque,
    },
    fmt,
    mem,
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identity of a job. Assigned when the job starts; the root job is always 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

/// Observable state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Submitted but not dispatched yet.
    Created,
    Running,
    /// Suspended with no timer or mutex to wake it.
    Yielded,
    AsleepTimer,
    AsleepMutex,
    JoinWaiting,
    Ended,
}

#[derive(Clone)]
pub(crate) enum State {
    Created,
    Running,
    Yielded,
    AsleepTimer(TimerHandle),
    AsleepMutex(MutexId),
    JoinWaiting(Option<JobId>),
    Ended,
}

type Payload = LocalBoxFuture<'static, Result<(), Fail>>;

struct JobInner {
    id: Option<JobId>,
    whois: Option<String>,
    payload: Option<Payload>,
    /// Context the job is bound to while it runs.
    context: Option<ExecutionContext>,
    state: State,
    /// Pending next-tick resume requested by `schedule`.
    scheduled: Option<TimerHandle>,
    /// Contexts suspended in `join` on this job.
    joiners: Vec<ExecutionContext>,
    locals: HashMap<String, Rc<dyn Any>>,
}

/// Job
#[derive(Clone)]
pub struct Job(Rc<RefCell<JobInner>>);

struct CancelOnDrop(TimerHandle);

struct JoinGuard {
    target: Job,
    context: ExecutionContext,
}

//======================================================================================================================
// Thread Locals
//======================================================================================================================

thread_local! {
    static NEXT_JOB_ID: Cell<u64> = Cell::new(1);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl JobId {
    pub const ROOT: JobId = JobId(0);
}

impl State {
    fn kind(&self) -> JobState {
        match self {
            State::Created => JobState::Created,
            State::Running => JobState::Running,
            State::Yielded => JobState::Yielded,
            State::AsleepTimer(_) => JobState::AsleepTimer,
            State::AsleepMutex(_) => JobState::AsleepMutex,
            State::JoinWaiting(_) => JobState::JoinWaiting,
            State::Ended => JobState::Ended,
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        matches!(
            self,
            State::Yielded | State::AsleepTimer(_) | State::AsleepMutex(_) | State::JoinWaiting(_)
        )
    }
}

impl Job {
    pub(crate) fn new(whois: Option<&str>, payload: Payload) -> Self {
        Self(Rc::new(RefCell::new(JobInner {
            id: None,
            whois: whois.map(str::to_string),
            payload: Some(payload),
            context: None,
            state: State::Created,
            scheduled: None,
            joiners: Vec::new(),
            locals: HashMap::new(),
        })))
    }

    /// Job owned by the root context. It is always running and can never suspend.
    pub(crate) fn root(context: &ExecutionContext) -> Self {
        Self(Rc::new(RefCell::new(JobInner {
            id: Some(JobId::ROOT),
            whois: None,
            payload: None,
            context: Some(context.clone()),
            state: State::Running,
            scheduled: None,
            joiners: Vec::new(),
            locals: HashMap::new(),
        })))
    }

    /// Returns the job bound to the active execution context.
    pub fn current() -> Job {
        match ExecutionContext::current().job() {
            Some(job) => job,
            None => panic!("current(): no job is bound to the active context"),
        }
    }

    pub fn id(&self) -> Option<JobId> {
        self.0.borrow().id
    }

    pub fn whois(&self) -> Option<String> {
        self.0.borrow().whois.clone()
    }

    pub fn state(&self) -> JobState {
        self.0.borrow().state.kind()
    }

    pub fn is_root(&self) -> bool {
        self.id() == Some(JobId::ROOT)
    }

    pub fn is_alive(&self) -> bool {
        !self.has_ended()
    }

    pub fn has_ended(&self) -> bool {
        matches!(self.0.borrow().state, State::Ended)
    }

    /// Is this job parked at a suspension point?
    pub fn is_yielded(&self) -> bool {
        self.0.borrow().state.is_suspended()
    }

    pub fn is_asleep(&self) -> bool {
        matches!(self.0.borrow().state, State::AsleepTimer(_) | State::AsleepMutex(_))
    }

    /// Job this one is blocked joining, if any.
    pub fn joined_on(&self) -> Option<JobId> {
        match self.0.borrow().state {
            State::JoinWaiting(id) => id,
            _ => None,
        }
    }

    /// Mutex this job is asleep on, if any.
    pub fn mutex_asleep(&self) -> Option<MutexId> {
        match self.0.borrow().state {
            State::AsleepMutex(id) => Some(id),
            _ => None,
        }
    }

    /// Assigns the identity and marks the job as running. Starting a job twice is a scheduler bug.
    pub fn start(&self) {
        let mut inner = self.0.borrow_mut();
        if let Some(id) = inner.id {
            panic!("start(): job {} started twice", id);
        }
        let id: JobId = JobId(NEXT_JOB_ID.with(|next| next.replace(next.get() + 1)));
        inner.id = Some(id);
        inner.state = State::Running;
        trace!("start(): job {}", id);
    }

    /// Suspends this job until its context is resumed. Fails with the cancellation signal if the job was killed.
    pub async fn suspend(&self) -> Result<Wakeup, Fail> {
        self.suspend_as(State::Yielded).await
    }

    pub(crate) async fn suspend_as(&self, waiting: State) -> Result<Wakeup, Fail> {
        let context: ExecutionContext = self.ensure_current("suspend()")?;
        {
            let mut inner = self.0.borrow_mut();
            if let State::Ended = inner.state {
                return Err(Fail::killed());
            }
            let next: State = match (waiting, inner.scheduled.clone()) {
                (State::Yielded, Some(handle)) => State::AsleepTimer(handle),
                (waiting, _) => waiting,
            };
            inner.state = next;
        }

        let resumed: Resume = Suspend::new(context).await;

        let mut inner = self.0.borrow_mut();
        if let State::Ended = inner.state {
            return Err(Fail::killed());
        }
        inner.state = State::Running;
        match resumed {
            Resume::Wake(wakeup) => Ok(wakeup),
            Resume::Dispatch(_) => {
                warn!("suspend(): job resumed with a dispatch request");
                Ok(Wakeup::Signal)
            },
        }
    }

    /// Suspends this job even if it has been killed. The cancellation is not reported here: callers that must wait
    /// for a resource before they can unwind check [Job::has_ended] themselves.
    pub(crate) async fn park(&self) -> Result<Wakeup, Fail> {
        let context: ExecutionContext = self.ensure_current("park()")?;
        {
            let mut inner = self.0.borrow_mut();
            if !matches!(inner.state, State::Ended) {
                inner.state = State::Yielded;
            }
        }

        let resumed: Resume = Suspend::new(context).await;

        let mut inner = self.0.borrow_mut();
        if !matches!(inner.state, State::Ended) {
            inner.state = State::Running;
        }
        match resumed {
            Resume::Wake(wakeup) => Ok(wakeup),
            Resume::Dispatch(_) => {
                warn!("park(): job resumed with a dispatch request");
                Ok(Wakeup::Signal)
            },
        }
    }

    /// Marks this job as ended and wakes every job joined on it. Returns the first error raised by a woken joiner.
    pub fn end(&self) -> Result<(), Fail> {
        let (old, scheduled, joiners, payload) = {
            let mut inner = self.0.borrow_mut();
            let old: State = mem::replace(&mut inner.state, State::Ended);
            inner.context = None;
            (
                old,
                inner.scheduled.take(),
                mem::take(&mut inner.joiners),
                inner.payload.take(),
            )
        };
        drop(payload);
        if let State::AsleepTimer(handle) = old {
            handle.cancel();
        }
        if let Some(handle) = scheduled {
            handle.cancel();
        }
        trace!("end(): {}", self);

        let mut result: Result<(), Fail> = Ok(());
        for context in joiners {
            let is_joining: bool = match context.job() {
                Some(joiner) => matches!(joiner.0.borrow().state, State::JoinWaiting(_)),
                None => false,
            };
            if !is_joining {
                continue;
            }
            if let Err(e) = context.resume(Wakeup::Signal) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Suspends this job for `duration`. Returns [Wakeup::Timer] when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> Result<Wakeup, Fail> {
        self.ensure_current("sleep()")?;
        let job: Job = self.clone();
        let handle: TimerHandle = timer::schedule(duration, move || {
            job.resume_if(|state: &State| matches!(state, State::AsleepTimer(_)), Wakeup::Timer)
        });
        let _guard: CancelOnDrop = CancelOnDrop(handle.clone());
        self.suspend_as(State::AsleepTimer(handle)).await
    }

    /// Resumes this job on the next tick. Calling it again before that tick has no effect.
    pub fn schedule(&self) {
        {
            let inner = self.0.borrow();
            if inner.scheduled.is_some() || matches!(inner.state, State::Ended | State::Created) {
                return;
            }
        }

        let job: Job = self.clone();
        let handle: TimerHandle = timer::next_tick(move || {
            let is_suspended: bool = {
                let mut inner = job.0.borrow_mut();
                inner.scheduled = None;
                inner.state.is_suspended()
            };
            if is_suspended {
                job.resume(Wakeup::Signal)
            } else {
                Ok(())
            }
        });

        let replaced: Option<TimerHandle> = {
            let mut inner = self.0.borrow_mut();
            inner.scheduled = Some(handle.clone());
            match inner.state.clone() {
                State::Yielded => {
                    inner.state = State::AsleepTimer(handle);
                    None
                },
                State::AsleepTimer(old) => {
                    inner.state = State::AsleepTimer(handle);
                    Some(old)
                },
                _ => None,
            }
        };
        if let Some(old) = replaced {
            old.cancel();
        }
    }

    /// Fires the timer this job is asleep on right now.
    pub fn wake(&self) -> Result<(), Fail> {
        let handle: TimerHandle = match &self.0.borrow().state {
            State::AsleepTimer(handle) => handle.clone(),
            _ => {
                let cause: String = format!("{} is not asleep on a timer", self);
                error!("wake(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        handle.fire_now()?;
        Ok(())
    }

    /// Parks the calling job in `waiters` until another job takes it out and schedules it, or until `timeout`
    /// expires. The job is no longer in `waiters` on return.
    pub async fn wait(waiters: &RefCell<VecDeque<Job>>, timeout: Option<Duration>) -> Result<Wakeup, Fail> {
        let job: Job = Job::current();
        waiters.borrow_mut().push_back(job.clone());
        let result: Result<Wakeup, Fail> = match timeout {
            Some(timeout) => job.sleep(timeout).await,
            None => job.suspend().await,
        };
        waiters.borrow_mut().retain(|waiter| *waiter != job);
        result
    }

    /// Suspends the calling job until this one ends.
    pub async fn join(&self) -> Result<(), Fail> {
        if self.has_ended() {
            return Ok(());
        }
        let caller: Job = Job::current();
        if caller == *self {
            let cause: String = format!("{} cannot join itself", self);
            error!("join(): {}", cause);
            return Err(Fail::new(libc::EDEADLK, &cause));
        }

        let context: ExecutionContext = ExecutionContext::current();
        self.0.borrow_mut().joiners.push(context.clone());
        let _guard: JoinGuard = JoinGuard {
            target: self.clone(),
            context,
        };
        caller.suspend_as(State::JoinWaiting(self.id())).await?;

        if !self.has_ended() {
            let cause: String = format!("{} resumed before {} ended", caller, self);
            error!("join(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    /// Ends this job. A suspended job is resumed and unwinds with the cancellation signal; the running job gets the
    /// cancellation signal back right away.
    pub fn kill(&self) -> Result<(), Fail> {
        if self.is_root() {
            let cause: String = "cannot kill the root job".to_string();
            error!("kill(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }

        let state: State = self.0.borrow().state.clone();
        match state {
            State::Ended => Ok(()),
            _ if *self == Job::current() => {
                debug!("kill(): {} killed itself", self);
                self.mark_killed();
                Err(Fail::killed())
            },
            State::Created => {
                debug!("kill(): {} killed before it started", self);
                TaskPool::dequeue(self);
                self.end()
            },
            State::Running => {
                let cause: String = format!("{} is running and cannot be interrupted", self);
                error!("kill(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
            State::Yielded | State::AsleepTimer(_) | State::AsleepMutex(_) | State::JoinWaiting(_) => {
                debug!("kill(): {} killed while {:?}", self, state.kind());
                match self.mark_killed() {
                    Some(context) => context.resume(Wakeup::Signal),
                    None => Ok(()),
                }
            },
        }
    }

    /// Returns a job-local variable.
    pub fn local_get<T: Any>(&self, name: &str) -> Option<Rc<T>> {
        let value: Rc<dyn Any> = self.0.borrow().locals.get(name)?.clone();
        value.downcast::<T>().ok()
    }

    /// Sets a job-local variable, replacing any previous value.
    pub fn local_set<T: Any>(&self, name: &str, value: T) {
        let old: Option<Rc<dyn Any>> = self.0.borrow_mut().locals.insert(name.to_string(), Rc::new(value));
        drop(old);
    }

    pub(crate) fn bind(&self, context: Option<ExecutionContext>) {
        let old: Option<ExecutionContext> = mem::replace(&mut self.0.borrow_mut().context, context);
        drop(old);
    }

    pub(crate) fn take_payload(&self) -> Option<Payload> {
        self.0.borrow_mut().payload.take()
    }

    pub(crate) fn timer(&self) -> Option<TimerHandle> {
        match &self.0.borrow().state {
            State::AsleepTimer(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Resumes the context of this job if it is parked.
    pub(crate) fn resume(&self, wakeup: Wakeup) -> Result<(), Fail> {
        self.resume_if(|_| true, wakeup)
    }

    /// Resumes the context of this job if it is parked and the job's state satisfies `predicate`.
    pub(crate) fn resume_if<P>(&self, predicate: P, wakeup: Wakeup) -> Result<(), Fail>
    where
        P: FnOnce(&State) -> bool,
    {
        let context: Option<ExecutionContext> = {
            let inner = self.0.borrow();
            if predicate(&inner.state) {
                inner.context.clone()
            } else {
                None
            }
        };
        match context {
            Some(context) if context.is_suspended() => context.resume(wakeup),
            _ => Ok(()),
        }
    }

    fn ensure_current(&self, caller: &str) -> Result<ExecutionContext, Fail> {
        let context: ExecutionContext = ExecutionContext::current();
        if context.is_root() {
            let cause: String = "the root job cannot suspend".to_string();
            error!("{}: {}", caller, cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        if context.job().as_ref() != Some(self) {
            let cause: String = format!("{} is not the current job", self);
            error!("{}: {}", caller, cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        Ok(context)
    }

    /// Forces the job into the ended state and cancels its timers. Returns the context to resume, if any.
    fn mark_killed(&self) -> Option<ExecutionContext> {
        let (old, scheduled, context) = {
            let mut inner = self.0.borrow_mut();
            let old: State = mem::replace(&mut inner.state, State::Ended);
            (old, inner.scheduled.take(), inner.context.clone())
        };
        if let State::AsleepTimer(handle) = old {
            handle.cancel();
        }
        if let Some(handle) = scheduled {
            handle.cancel();
        }
        context
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Job {}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        match (inner.id, inner.whois.as_deref()) {
            (Some(id), Some(whois)) => write!(f, "[Job {} {}]", id, whois),
            (Some(id), None) => write!(f, "[Job {}]", id),
            (None, Some(whois)) => write!(f, "[Job - {}]", whois),
            (None, None) => write!(f, "[Job -]"),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Job")
            .field("id", &inner.id)
            .field("whois", &inner.whois)
            .field("state", &inner.state.kind())
            .finish()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        let removed: Vec<ExecutionContext> = {
            let mut inner = self.target.0.borrow_mut();
            let (removed, kept): (Vec<ExecutionContext>, Vec<ExecutionContext>) =
                mem::take(&mut inner.joiners).into_iter().partition(|c| *c == self.context);
            inner.joiners = kept;
            removed
        };
        drop(removed);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
